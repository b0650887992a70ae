//! Finders over a [`DuelTx`] that assemble duels with their participants.
//!
//! Everything here runs inside the caller's transaction; nothing opens one on
//! its own.

use crate::error::DuelError;
use crate::models::{
    Duel, DuelAggregate, DuelId, DuelStatus, ParticipantId, ParticipantProgress,
};
use crate::services::store::DuelTx;

pub const NO_ACTIVE_PAIR: &str = "No active pair for current user";

async fn progress(tx: &mut dyn DuelTx, duel: &Duel, id: ParticipantId) -> Result<ParticipantProgress, DuelError> {
    let participant = tx.find_participant(id).await?.ok_or_else(|| {
        DuelError::internal(format!("duel {} references missing participant {}", duel.id, id))
    })?;
    let answers = tx.answers_for_participant(id).await?;
    Ok(ParticipantProgress {
        participant,
        answers,
    })
}

/// Loads both participants with their answers and the ordered question slots.
pub async fn load_aggregate(tx: &mut dyn DuelTx, duel: Duel) -> Result<DuelAggregate, DuelError> {
    let participant1 = progress(tx, &duel, duel.participant1_id).await?;
    let participant2 = match duel.participant2_id {
        Some(id) => Some(progress(tx, &duel, id).await?),
        None => None,
    };
    let questions = tx.questions_for_duel(duel.id).await?;

    Ok(DuelAggregate {
        duel,
        participant1,
        participant2,
        questions,
    })
}

pub async fn find_aggregate(
    tx: &mut dyn DuelTx,
    duel_id: DuelId,
) -> Result<Option<DuelAggregate>, DuelError> {
    match tx.find_duel(duel_id).await? {
        Some(duel) => Ok(Some(load_aggregate(tx, duel).await?)),
        None => Ok(None),
    }
}

/// All non-deleted duels the user took part in, oldest first.
pub async fn duels_for_user(tx: &mut dyn DuelTx, user_id: &str) -> Result<Vec<Duel>, DuelError> {
    let participant_ids: Vec<ParticipantId> = tx
        .participants_for_user(user_id)
        .await?
        .into_iter()
        .map(|participant| participant.id)
        .collect();
    Ok(tx.duels_for_participants(&participant_ids, None).await?)
}

/// The user's most recent duel in one of `statuses`.
pub async fn find_duel_for_user(
    tx: &mut dyn DuelTx,
    user_id: &str,
    statuses: &[DuelStatus],
) -> Result<Option<Duel>, DuelError> {
    let participant_ids: Vec<ParticipantId> = tx
        .participants_for_user(user_id)
        .await?
        .into_iter()
        .map(|participant| participant.id)
        .collect();
    let duels = tx
        .duels_for_participants(&participant_ids, Some(statuses))
        .await?;
    Ok(duels.into_iter().max_by_key(|duel| duel.created_at))
}

pub async fn active_duel_for_user_or_fail(
    tx: &mut dyn DuelTx,
    user_id: &str,
) -> Result<DuelAggregate, DuelError> {
    let duel = find_duel_for_user(tx, user_id, &[DuelStatus::Active])
        .await?
        .ok_or_else(|| DuelError::forbidden(NO_ACTIVE_PAIR))?;
    load_aggregate(tx, duel).await
}

/// Fails when more than one pending duel is visible in this transaction.
pub async fn ensure_single_pending(tx: &mut dyn DuelTx) -> Result<(), DuelError> {
    let pending = tx.count_pending_duels().await?;
    if pending > 1 {
        return Err(DuelError::internal(format!(
            "{} pending duels visible, expected at most one",
            pending
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Answer, DuelQuestion, Participant};
    use crate::services::store::{DuelStore, IsolationLevel, MemoryStore};
    use uuid::Uuid;

    #[tokio::test]
    async fn active_duel_lookup_is_forbidden_without_one() {
        let store = MemoryStore::new();
        let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();

        let err = active_duel_for_user_or_fail(&mut *tx, "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, DuelError::Forbidden(ref msg) if msg == NO_ACTIVE_PAIR));
    }

    #[tokio::test]
    async fn loads_aggregate_with_answers_and_questions() {
        let store = MemoryStore::new();
        let alice = Participant::new("alice");
        let bob = Participant::new("bob");
        let mut duel = Duel::pending(alice.id);
        let question_id = Uuid::new_v4();
        let questions: Vec<DuelQuestion> = duel.start(bob.id, &[question_id]).unwrap();
        let answer = Answer::new(bob.id, question_id, true);

        let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
        tx.insert_participant(&alice).await.unwrap();
        tx.insert_participant(&bob).await.unwrap();
        tx.insert_duel(&duel).await.unwrap();
        tx.insert_duel_questions(&questions).await.unwrap();
        tx.insert_answer(&answer).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
        let aggregate = active_duel_for_user_or_fail(&mut *tx, "bob").await.unwrap();

        assert_eq!(aggregate.duel.id, duel.id);
        assert_eq!(aggregate.questions.len(), 1);
        assert!(aggregate.participant1.answers.is_empty());
        assert_eq!(aggregate.participant2.as_ref().unwrap().answers, vec![answer]);
    }

    #[tokio::test]
    async fn dangling_participant_reference_is_internal() {
        let store = MemoryStore::new();
        let alice = Participant::new("alice");
        let mut duel = Duel::pending(alice.id);
        duel.start(Uuid::new_v4(), &[Uuid::new_v4()]).unwrap();
        let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
        tx.insert_participant(&alice).await.unwrap();
        tx.insert_duel(&duel).await.unwrap();

        let err = load_aggregate(&mut *tx, duel).await.unwrap_err();
        assert!(matches!(err, DuelError::Internal(ref msg) if msg.contains("missing participant")));
    }

    #[tokio::test]
    async fn second_pending_duel_is_rejected() {
        let store = MemoryStore::new();
        let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
        tx.insert_duel(&Duel::pending(Uuid::new_v4())).await.unwrap();
        ensure_single_pending(&mut *tx).await.unwrap();
        tx.insert_duel(&Duel::pending(Uuid::new_v4())).await.unwrap();
        assert!(matches!(
            ensure_single_pending(&mut *tx).await,
            Err(DuelError::Internal(_))
        ));
    }
}
