use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{DuelStore, DuelTx, IsolationLevel};
use crate::error::{StoreError, StoreResult};
use crate::models::duel::AnswerId;
use crate::models::{
    Answer, Duel, DuelId, DuelQuestion, DuelStatus, Participant, ParticipantId,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    duels: HashMap<DuelId, Duel>,
    participants: HashMap<ParticipantId, Participant>,
    answers: HashMap<AnswerId, Answer>,
    duel_questions: HashMap<DuelId, Vec<DuelQuestion>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Duel(DuelId),
    Participant(ParticipantId),
    Answer(AnswerId),
    DuelQuestions(DuelId),
    /// Predicate "which duels are pending". Bumped by every commit that
    /// creates a pending duel or moves one out of pending.
    PendingSet,
}

#[derive(Debug, Default)]
struct Shared {
    tables: Tables,
    versions: HashMap<RowKey, u64>,
    clock: u64,
}

impl Shared {
    fn version(&self, key: &RowKey) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }
}

/// In-process store with optimistic multi-version concurrency control.
///
/// Every transaction works on a private copy of the tables taken at `begin`.
/// At commit the first committer wins: a transaction whose written rows were
/// committed by someone else after its snapshot fails with a conflict.
/// Serializable transactions additionally fail when anything they read,
/// including the pending-duel predicate, changed after their snapshot.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock(shared: &Mutex<Shared>) -> StoreResult<MutexGuard<'_, Shared>> {
    shared
        .lock()
        .map_err(|_| StoreError::backend("memory store lock poisoned"))
}

#[async_trait]
impl DuelStore for MemoryStore {
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn DuelTx>> {
        let guard = lock(&self.shared)?;
        Ok(Box::new(MemoryTx {
            shared: self.shared.clone(),
            isolation,
            snapshot_version: guard.clock,
            view: guard.tables.clone(),
            reads: HashSet::new(),
            writes: HashSet::new(),
            touches_pending: false,
        }))
    }

    async fn health_check(&self) -> StoreResult<()> {
        lock(&self.shared).map(|_| ())
    }
}

struct MemoryTx {
    shared: Arc<Mutex<Shared>>,
    isolation: IsolationLevel,
    snapshot_version: u64,
    view: Tables,
    reads: HashSet<RowKey>,
    writes: HashSet<RowKey>,
    touches_pending: bool,
}

impl MemoryTx {
    fn pending_duels(&mut self) -> Vec<Duel> {
        self.reads.insert(RowKey::PendingSet);
        self.view
            .duels
            .values()
            .filter(|duel| duel.status == DuelStatus::Pending && duel.deleted_at.is_none())
            .cloned()
            .collect()
    }

    fn conflicting_key(&self, shared: &Shared) -> Option<RowKey> {
        let newer = |key: &RowKey| shared.version(key) > self.snapshot_version;

        if let Some(key) = self.writes.iter().find(|key| newer(key)) {
            return Some(*key);
        }
        if self.isolation == IsolationLevel::Serializable {
            return self.reads.iter().find(|key| newer(key)).copied();
        }
        None
    }
}

#[async_trait]
impl DuelTx for MemoryTx {
    async fn insert_participant(&mut self, participant: &Participant) -> StoreResult<()> {
        if self.view.participants.contains_key(&participant.id) {
            return Err(StoreError::backend(format!(
                "duplicate participant {}",
                participant.id
            )));
        }
        self.view
            .participants
            .insert(participant.id, participant.clone());
        self.writes.insert(RowKey::Participant(participant.id));
        Ok(())
    }

    async fn save_participant(&mut self, participant: &Participant) -> StoreResult<()> {
        let Some(row) = self.view.participants.get_mut(&participant.id) else {
            return Err(StoreError::backend(format!(
                "participant {} does not exist",
                participant.id
            )));
        };
        *row = participant.clone();
        self.writes.insert(RowKey::Participant(participant.id));
        Ok(())
    }

    async fn find_participant(&mut self, id: ParticipantId) -> StoreResult<Option<Participant>> {
        self.reads.insert(RowKey::Participant(id));
        Ok(self.view.participants.get(&id).cloned())
    }

    async fn participants_for_user(&mut self, user_id: &str) -> StoreResult<Vec<Participant>> {
        let mut found: Vec<Participant> = self
            .view
            .participants
            .values()
            .filter(|participant| participant.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|participant| participant.created_at);
        self.reads
            .extend(found.iter().map(|participant| RowKey::Participant(participant.id)));
        Ok(found)
    }

    async fn insert_duel(&mut self, duel: &Duel) -> StoreResult<()> {
        if self.view.duels.contains_key(&duel.id) {
            return Err(StoreError::backend(format!("duplicate duel {}", duel.id)));
        }
        if duel.status == DuelStatus::Pending {
            self.touches_pending = true;
        }
        self.view.duels.insert(duel.id, duel.clone());
        self.writes.insert(RowKey::Duel(duel.id));
        Ok(())
    }

    async fn save_duel(&mut self, duel: &Duel) -> StoreResult<()> {
        let Some(row) = self.view.duels.get_mut(&duel.id) else {
            return Err(StoreError::backend(format!("duel {} does not exist", duel.id)));
        };
        if row.status == DuelStatus::Pending || duel.status == DuelStatus::Pending {
            self.touches_pending = true;
        }
        *row = duel.clone();
        self.writes.insert(RowKey::Duel(duel.id));
        Ok(())
    }

    async fn find_duel(&mut self, id: DuelId) -> StoreResult<Option<Duel>> {
        self.reads.insert(RowKey::Duel(id));
        Ok(self
            .view
            .duels
            .get(&id)
            .filter(|duel| duel.deleted_at.is_none())
            .cloned())
    }

    async fn find_oldest_pending_duel(&mut self) -> StoreResult<Option<Duel>> {
        let oldest = self
            .pending_duels()
            .into_iter()
            .min_by_key(|duel| duel.created_at);
        if let Some(duel) = &oldest {
            self.reads.insert(RowKey::Duel(duel.id));
        }
        Ok(oldest)
    }

    async fn count_pending_duels(&mut self) -> StoreResult<u64> {
        Ok(self.pending_duels().len() as u64)
    }

    async fn duels_with_status(&mut self, status: DuelStatus) -> StoreResult<Vec<Duel>> {
        if status == DuelStatus::Pending {
            self.reads.insert(RowKey::PendingSet);
        }
        let mut found: Vec<Duel> = self
            .view
            .duels
            .values()
            .filter(|duel| duel.status == status && duel.deleted_at.is_none())
            .cloned()
            .collect();
        found.sort_by_key(|duel| duel.created_at);
        self.reads.extend(found.iter().map(|duel| RowKey::Duel(duel.id)));
        Ok(found)
    }

    async fn duels_for_participants(
        &mut self,
        participant_ids: &[ParticipantId],
        statuses: Option<&[DuelStatus]>,
    ) -> StoreResult<Vec<Duel>> {
        let ids: HashSet<&ParticipantId> = participant_ids.iter().collect();
        let mut found: Vec<Duel> = self
            .view
            .duels
            .values()
            .filter(|duel| duel.deleted_at.is_none())
            .filter(|duel| {
                ids.contains(&duel.participant1_id)
                    || duel.participant2_id.as_ref().is_some_and(|id| ids.contains(id))
            })
            .filter(|duel| statuses.is_none_or(|allowed| allowed.contains(&duel.status)))
            .cloned()
            .collect();
        found.sort_by_key(|duel| duel.created_at);
        self.reads.extend(found.iter().map(|duel| RowKey::Duel(duel.id)));
        Ok(found)
    }

    async fn insert_duel_questions(&mut self, questions: &[DuelQuestion]) -> StoreResult<()> {
        for question in questions {
            let slots = self.view.duel_questions.entry(question.duel_id).or_default();
            if slots.iter().any(|q| q.question_id == question.question_id) {
                return Err(StoreError::backend(format!(
                    "duplicate question {} in duel {}",
                    question.question_id, question.duel_id
                )));
            }
            slots.push(question.clone());
            self.writes.insert(RowKey::DuelQuestions(question.duel_id));
        }
        Ok(())
    }

    async fn questions_for_duel(&mut self, duel_id: DuelId) -> StoreResult<Vec<DuelQuestion>> {
        self.reads.insert(RowKey::DuelQuestions(duel_id));
        let mut questions = self
            .view
            .duel_questions
            .get(&duel_id)
            .cloned()
            .unwrap_or_default();
        questions.sort_by_key(|question| question.order);
        Ok(questions)
    }

    async fn insert_answer(&mut self, answer: &Answer) -> StoreResult<()> {
        if self.view.answers.contains_key(&answer.id) {
            return Err(StoreError::backend(format!("duplicate answer {}", answer.id)));
        }
        self.view.answers.insert(answer.id, answer.clone());
        self.writes.insert(RowKey::Answer(answer.id));
        Ok(())
    }

    async fn answers_for_participant(
        &mut self,
        participant_id: ParticipantId,
    ) -> StoreResult<Vec<Answer>> {
        let mut answers: Vec<Answer> = self
            .view
            .answers
            .values()
            .filter(|answer| answer.participant_id == participant_id)
            .cloned()
            .collect();
        answers.sort_by_key(|answer| answer.created_at);
        self.reads
            .extend(answers.iter().map(|answer| RowKey::Answer(answer.id)));
        Ok(answers)
    }

    async fn find_answer(&mut self, id: AnswerId) -> StoreResult<Option<Answer>> {
        self.reads.insert(RowKey::Answer(id));
        Ok(self.view.answers.get(&id).cloned())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let tx = *self;
        let mut shared = lock(&tx.shared)?;

        if let Some(key) = tx.conflicting_key(&shared) {
            debug!(?key, isolation = tx.isolation.as_str(), "memory store commit conflict");
            return Err(StoreError::Conflict(format!(
                "{:?} was modified by a concurrent transaction",
                key
            )));
        }
        if tx.writes.is_empty() {
            return Ok(());
        }

        shared.clock += 1;
        let version = shared.clock;
        for key in &tx.writes {
            match key {
                RowKey::Duel(id) => copy_row(&tx.view.duels, &mut shared.tables.duels, id),
                RowKey::Participant(id) => copy_row(
                    &tx.view.participants,
                    &mut shared.tables.participants,
                    id,
                ),
                RowKey::Answer(id) => copy_row(&tx.view.answers, &mut shared.tables.answers, id),
                RowKey::DuelQuestions(id) => copy_row(
                    &tx.view.duel_questions,
                    &mut shared.tables.duel_questions,
                    id,
                ),
                RowKey::PendingSet => {}
            }
            shared.versions.insert(*key, version);
        }
        if tx.touches_pending {
            shared.versions.insert(RowKey::PendingSet, version);
        }
        Ok(())
    }
}

fn copy_row<K, V>(from: &HashMap<K, V>, to: &mut HashMap<K, V>, key: &K)
where
    K: std::hash::Hash + Eq + Copy,
    V: Clone,
{
    if let Some(row) = from.get(key) {
        to.insert(*key, row.clone());
    }
}
