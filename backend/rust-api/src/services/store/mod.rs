pub mod memory;
pub mod mongo;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::models::{
    Answer, Duel, DuelId, DuelQuestion, DuelStatus, Participant, ParticipantId,
};
use crate::models::duel::AnswerId;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Snapshot reads, first committer wins on rows written by both sides.
    RepeatableRead,
    /// Repeatable read plus validation of everything the transaction read,
    /// including the pending-duel predicate.
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Serializable => "serializable",
        }
    }
}

/// Transactional storage for duels and their rows.
#[async_trait]
pub trait DuelStore: Send + Sync {
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn DuelTx>>;

    async fn health_check(&self) -> StoreResult<()>;
}

/// One open transaction. Dropping it without `commit` discards every write.
///
/// Conflicts may surface from any call, not only from `commit`; all of them
/// are reported as `StoreError::Conflict`.
#[async_trait]
pub trait DuelTx: Send {
    async fn insert_participant(&mut self, participant: &Participant) -> StoreResult<()>;
    async fn save_participant(&mut self, participant: &Participant) -> StoreResult<()>;
    async fn find_participant(&mut self, id: ParticipantId) -> StoreResult<Option<Participant>>;
    async fn participants_for_user(&mut self, user_id: &str) -> StoreResult<Vec<Participant>>;

    async fn insert_duel(&mut self, duel: &Duel) -> StoreResult<()>;
    async fn save_duel(&mut self, duel: &Duel) -> StoreResult<()>;
    async fn find_duel(&mut self, id: DuelId) -> StoreResult<Option<Duel>>;
    /// Oldest non-deleted pending duel by creation time.
    async fn find_oldest_pending_duel(&mut self) -> StoreResult<Option<Duel>>;
    async fn count_pending_duels(&mut self) -> StoreResult<u64>;
    /// Non-deleted duels in `status`, oldest first.
    async fn duels_with_status(&mut self, status: DuelStatus) -> StoreResult<Vec<Duel>>;
    /// Non-deleted duels where any of `participant_ids` sits in either slot.
    async fn duels_for_participants(
        &mut self,
        participant_ids: &[ParticipantId],
        statuses: Option<&[DuelStatus]>,
    ) -> StoreResult<Vec<Duel>>;

    async fn insert_duel_questions(&mut self, questions: &[DuelQuestion]) -> StoreResult<()>;
    /// Ordered by `order`.
    async fn questions_for_duel(&mut self, duel_id: DuelId) -> StoreResult<Vec<DuelQuestion>>;

    async fn insert_answer(&mut self, answer: &Answer) -> StoreResult<()>;
    /// Ordered by submission time.
    async fn answers_for_participant(&mut self, participant_id: ParticipantId)
        -> StoreResult<Vec<Answer>>;
    async fn find_answer(&mut self, id: AnswerId) -> StoreResult<Option<Answer>>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
