use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::DuelConfig;
use crate::error::DuelError;
use crate::metrics::record_duel_event;
use crate::models::{DuelId, DuelStatus};
use crate::services::duel_repository;
use crate::services::store::{DuelStore, DuelTx};
use crate::services::transaction::{run_in_transaction, TransactionPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The duel was still active and is now finished.
    Finished,
    /// Missing or no longer active; nothing changed.
    Skipped,
}

/// Forces completion of duels where one side stopped answering.
pub struct TimeoutFinisher {
    store: Arc<dyn DuelStore>,
    policy: TransactionPolicy,
    scan_policy: TransactionPolicy,
    questions_per_duel: usize,
    finish_timeout: Duration,
}

impl TimeoutFinisher {
    pub fn new(store: Arc<dyn DuelStore>, config: &DuelConfig) -> Self {
        Self {
            store,
            policy: TransactionPolicy::serializable(config),
            scan_policy: TransactionPolicy::repeatable_read(config),
            questions_per_duel: config.questions_per_duel,
            finish_timeout: config.finish_timeout(),
        }
    }

    /// Active duels where one side answered everything more than the finish
    /// timeout plus `grace` ago. Read-only.
    pub async fn overdue_duels(&self, grace: Duration) -> Result<Vec<DuelId>, DuelError> {
        let wait = chrono::Duration::from_std(self.finish_timeout + grace)
            .map_err(|e| DuelError::internal(format!("finish timeout out of range: {}", e)))?;
        let questions = self.questions_per_duel;

        run_in_transaction(
            self.store.as_ref(),
            "overdue_duels",
            &self.scan_policy,
            |mut tx| async move {
                let deadline = Utc::now() - wait;
                let mut overdue = Vec::new();
                for duel in tx.duels_with_status(DuelStatus::Active).await? {
                    let duel_id = duel.id;
                    let aggregate = match duel_repository::load_aggregate(tx.as_mut(), duel).await {
                        Ok(aggregate) => aggregate,
                        Err(DuelError::Internal(message)) => {
                            warn!(%duel_id, %message, "Skipping unreadable duel in overdue scan");
                            continue;
                        }
                        Err(err) => return Err(err),
                    };
                    if aggregate
                        .completed_at(questions)
                        .is_some_and(|done| done <= deadline)
                    {
                        overdue.push(aggregate.duel.id);
                    }
                }
                Ok::<_, DuelError>((tx, overdue))
            },
        )
        .await
    }

    /// Idempotent: only the first call while the duel is active has an effect.
    pub async fn finish_by_timeout(&self, duel_id: DuelId) -> Result<FinishOutcome, DuelError> {
        let outcome = run_in_transaction(
            self.store.as_ref(),
            "finish_by_timeout",
            &self.policy,
            |mut tx| async move {
                let outcome = finish_in(tx.as_mut(), duel_id).await?;
                Ok::<_, DuelError>((tx, outcome))
            },
        )
        .await?;

        match outcome {
            FinishOutcome::Finished => {
                record_duel_event("finished_by_timeout");
                info!(%duel_id, "Duel finished by timeout");
            }
            FinishOutcome::Skipped => {
                debug!(%duel_id, "Timeout finisher skipped inactive duel");
            }
        }
        Ok(outcome)
    }
}

async fn finish_in(tx: &mut dyn DuelTx, duel_id: DuelId) -> Result<FinishOutcome, DuelError> {
    let Some(duel) = tx.find_duel(duel_id).await? else {
        return Ok(FinishOutcome::Skipped);
    };
    if duel.status != DuelStatus::Active {
        return Ok(FinishOutcome::Skipped);
    }
    if duel.participant2_id.is_none() {
        return Err(DuelError::internal(format!(
            "active duel {} has no second participant",
            duel_id
        )));
    }

    let mut aggregate = duel_repository::load_aggregate(tx, duel).await?;
    let first = aggregate.finished_first();
    aggregate.complete(first)?;

    tx.save_duel(&aggregate.duel).await?;
    tx.save_participant(&aggregate.participant1.participant).await?;
    if let Some(second) = &aggregate.participant2 {
        tx.save_participant(&second.participant).await?;
    }
    Ok(FinishOutcome::Finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Answer, Duel, Participant};
    use crate::services::store::{IsolationLevel, MemoryStore};
    use uuid::Uuid;

    #[tokio::test]
    async fn unknown_duel_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let finisher = TimeoutFinisher::new(store, &DuelConfig::default());
        assert_eq!(
            finisher.finish_by_timeout(Uuid::new_v4()).await.unwrap(),
            FinishOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn pending_duel_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let alice = Participant::new("alice");
        let duel = Duel::pending(alice.id);
        let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
        tx.insert_participant(&alice).await.unwrap();
        tx.insert_duel(&duel).await.unwrap();
        tx.commit().await.unwrap();

        let finisher = TimeoutFinisher::new(store.clone(), &DuelConfig::default());
        assert_eq!(
            finisher.finish_by_timeout(duel.id).await.unwrap(),
            FinishOutcome::Skipped
        );

        let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
        assert_eq!(
            tx.find_duel(duel.id).await.unwrap().unwrap().status,
            DuelStatus::Pending
        );
    }

    async fn seed_active(store: &MemoryStore, p1_answers: usize, answered_ago_secs: i64) -> Duel {
        let alice = Participant::new("alice");
        let bob = Participant::new("bob");
        let mut duel = Duel::pending(alice.id);
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let slots = duel.start(bob.id, &ids).unwrap();
        let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
        tx.insert_participant(&alice).await.unwrap();
        tx.insert_participant(&bob).await.unwrap();
        tx.insert_duel(&duel).await.unwrap();
        tx.insert_duel_questions(&slots).await.unwrap();
        for (i, id) in ids.iter().take(p1_answers).enumerate() {
            let mut answer = Answer::new(alice.id, *id, true);
            answer.created_at = chrono::Utc::now()
                - chrono::Duration::seconds(answered_ago_secs)
                + chrono::Duration::milliseconds(i as i64);
            tx.insert_answer(&answer).await.unwrap();
        }
        tx.commit().await.unwrap();
        duel
    }

    #[tokio::test]
    async fn overdue_scan_picks_only_expired_completions() {
        let store = Arc::new(MemoryStore::new());
        let expired = seed_active(&store, 5, 120).await;
        let _fresh = seed_active(&store, 5, 1).await;
        let _unfinished = seed_active(&store, 4, 120).await;

        // default finish timeout is 10s
        let finisher = TimeoutFinisher::new(store, &DuelConfig::default());
        assert_eq!(
            finisher.overdue_duels(Duration::from_secs(30)).await.unwrap(),
            vec![expired.id]
        );
        assert!(finisher
            .overdue_duels(Duration::from_secs(600))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn untouched_active_duel_finishes_as_draw() {
        let store = Arc::new(MemoryStore::new());
        let alice = Participant::new("alice");
        let bob = Participant::new("bob");
        let mut duel = Duel::pending(alice.id);
        let slots = duel.start(bob.id, &[Uuid::new_v4()]).unwrap();
        let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
        tx.insert_participant(&alice).await.unwrap();
        tx.insert_participant(&bob).await.unwrap();
        tx.insert_duel(&duel).await.unwrap();
        tx.insert_duel_questions(&slots).await.unwrap();
        tx.commit().await.unwrap();

        let finisher = TimeoutFinisher::new(store.clone(), &DuelConfig::default());
        assert_eq!(
            finisher.finish_by_timeout(duel.id).await.unwrap(),
            FinishOutcome::Finished
        );
        assert_eq!(
            finisher.finish_by_timeout(duel.id).await.unwrap(),
            FinishOutcome::Skipped
        );

        let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
        let aggregate = duel_repository::find_aggregate(tx.as_mut(), duel.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(aggregate.duel.status, DuelStatus::Finished);
        assert_eq!(aggregate.participant1.participant.score, 0);
        assert_eq!(
            aggregate.participant1.participant.outcome,
            Some(crate::models::Outcome::Draw)
        );
    }
}
