use std::sync::Arc;

use tracing::info;

use crate::config::DuelConfig;
use crate::error::DuelError;
use crate::metrics::record_duel_event;
use crate::models::{Duel, DuelId, DuelStatus, Participant};
use crate::services::duel_repository;
use crate::services::question_source::QuestionSource;
use crate::services::store::{DuelStore, DuelTx};
use crate::services::transaction::{run_in_transaction, TransactionPolicy};

pub const ALREADY_PARTICIPATING: &str = "Current user is already participating in active pair";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    /// No one was waiting; the caller now waits in a new pending duel.
    Created(DuelId),
    /// The caller joined the oldest pending duel as participant2.
    Matched(DuelId),
}

impl Connection {
    pub fn duel_id(&self) -> DuelId {
        match self {
            Connection::Created(id) | Connection::Matched(id) => *id,
        }
    }
}

pub struct MatchmakingService {
    store: Arc<dyn DuelStore>,
    questions: Arc<dyn QuestionSource>,
    policy: TransactionPolicy,
    questions_per_duel: usize,
}

impl MatchmakingService {
    pub fn new(
        store: Arc<dyn DuelStore>,
        questions: Arc<dyn QuestionSource>,
        config: &DuelConfig,
    ) -> Self {
        Self {
            store,
            questions,
            policy: TransactionPolicy::serializable(config),
            questions_per_duel: config.questions_per_duel,
        }
    }

    /// Finds or creates a duel for `user_id`.
    pub async fn connect(&self, user_id: &str) -> Result<Connection, DuelError> {
        let connection = run_in_transaction(
            self.store.as_ref(),
            "connect",
            &self.policy,
            |mut tx| async move {
                let connection = self.connect_in(tx.as_mut(), user_id).await?;
                Ok::<_, DuelError>((tx, connection))
            },
        )
        .await?;

        match connection {
            Connection::Created(duel_id) => {
                record_duel_event("created");
                info!(%duel_id, user_id, "Pending duel created");
            }
            Connection::Matched(duel_id) => {
                record_duel_event("matched");
                info!(%duel_id, user_id, "Duel started");
            }
        }
        Ok(connection)
    }

    async fn connect_in(&self, tx: &mut dyn DuelTx, user_id: &str) -> Result<Connection, DuelError> {
        let current =
            duel_repository::find_duel_for_user(tx, user_id, &[DuelStatus::Pending, DuelStatus::Active])
                .await?;
        if current.is_some() {
            return Err(DuelError::forbidden(ALREADY_PARTICIPATING));
        }

        let participant = Participant::new(user_id);
        tx.insert_participant(&participant).await?;

        match tx.find_oldest_pending_duel().await? {
            None => {
                // the pending set must be empty before a new duel joins it
                if tx.count_pending_duels().await? != 0 {
                    return Err(DuelError::internal(
                        "pending duel appeared without being returned as oldest",
                    ));
                }
                let duel = Duel::pending(participant.id);
                tx.insert_duel(&duel).await?;
                duel_repository::ensure_single_pending(tx).await?;
                Ok(Connection::Created(duel.id))
            }
            Some(mut duel) => {
                let question_ids = self
                    .questions
                    .random_published_questions(self.questions_per_duel)
                    .await?;
                let slots = duel.start(participant.id, &question_ids)?;
                tx.save_duel(&duel).await?;
                tx.insert_duel_questions(&slots).await?;
                Ok(Connection::Matched(duel.id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Question;
    use crate::services::question_source::MemoryQuestionSource;
    use crate::services::store::{IsolationLevel, MemoryStore};
    use uuid::Uuid;

    fn service(published: usize) -> (MatchmakingService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let questions = (0..published)
            .map(|i| Question {
                id: Uuid::new_v4(),
                body: format!("question {}", i),
                accepted_answers: vec![format!("answer {}", i)],
                published: true,
            })
            .collect();
        let service = MatchmakingService::new(
            store.clone(),
            Arc::new(MemoryQuestionSource::new(questions)),
            &DuelConfig::default(),
        );
        (service, store)
    }

    #[tokio::test]
    async fn first_user_waits_second_user_starts_duel() {
        let (service, store) = service(5);

        let first = service.connect("alice").await.unwrap();
        let second = service.connect("bob").await.unwrap();

        assert!(matches!(first, Connection::Created(_)));
        assert_eq!(second, Connection::Matched(first.duel_id()));

        let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
        let duel = tx.find_duel(first.duel_id()).await.unwrap().unwrap();
        assert_eq!(duel.status, DuelStatus::Active);
        assert!(duel.started_at.is_some());
        let orders: Vec<u32> = tx
            .questions_for_duel(duel.id)
            .await
            .unwrap()
            .iter()
            .map(|q| q.order)
            .collect();
        assert_eq!(orders, vec![0, 1, 2, 3, 4]);
        assert_eq!(tx.count_pending_duels().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn waiting_user_cannot_connect_twice() {
        let (service, _) = service(5);
        service.connect("alice").await.unwrap();

        let err = service.connect("alice").await.unwrap_err();
        assert!(matches!(err, DuelError::Forbidden(ref msg) if msg == ALREADY_PARTICIPATING));
    }

    #[tokio::test]
    async fn question_shortage_rolls_back_the_match() {
        let (service, store) = service(2);
        let first = service.connect("alice").await.unwrap();

        let err = service.connect("bob").await.unwrap_err();
        assert!(matches!(err, DuelError::Internal(_)));

        let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
        let duel = tx.find_duel(first.duel_id()).await.unwrap().unwrap();
        assert_eq!(duel.status, DuelStatus::Pending);
        assert!(tx.participants_for_user("bob").await.unwrap().is_empty());
    }
}
