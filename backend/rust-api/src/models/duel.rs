use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DuelError;

pub type DuelId = Uuid;
pub type ParticipantId = Uuid;
pub type AnswerId = Uuid;
pub type QuestionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelStatus {
    Pending,
    Active,
    Finished,
}

impl DuelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuelStatus::Pending => "pending",
            DuelStatus::Active => "active",
            DuelStatus::Finished => "finished",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Won,
    Lost,
    Draw,
}

/// Which of the two participant slots of a duel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    First,
    Second,
}

/// One quiz match. Participants are referenced by id only; their rows live
/// in their own table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Duel {
    pub id: DuelId,
    pub status: DuelStatus,
    pub participant1_id: ParticipantId,
    pub participant2_id: Option<ParticipantId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Duel {
    pub fn pending(first: ParticipantId) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: DuelStatus::Pending,
            participant1_id: first,
            participant2_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            deleted_at: None,
        }
    }

    /// Attaches the second participant and the question slots, moving the duel
    /// from `Pending` to `Active` in one step.
    pub fn start(
        &mut self,
        second: ParticipantId,
        question_ids: &[QuestionId],
    ) -> Result<Vec<DuelQuestion>, DuelError> {
        if self.status != DuelStatus::Pending || self.participant2_id.is_some() {
            return Err(DuelError::internal(format!(
                "duel {} cannot be started from status {}",
                self.id,
                self.status.as_str()
            )));
        }
        if question_ids.is_empty() {
            return Err(DuelError::internal("duel cannot start without questions"));
        }

        self.participant2_id = Some(second);
        self.status = DuelStatus::Active;
        self.started_at = Some(Utc::now());

        Ok(question_ids
            .iter()
            .enumerate()
            .map(|(order, question_id)| DuelQuestion {
                duel_id: self.id,
                question_id: *question_id,
                order: order as u32,
            })
            .collect())
    }

    pub fn finish(&mut self) {
        self.status = DuelStatus::Finished;
        self.finished_at = Some(Utc::now());
    }
}

/// A user's per-duel state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub user_id: String,
    pub score: i32,
    pub outcome: Option<Outcome>,
    pub created_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            score: 0,
            outcome: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub id: AnswerId,
    pub participant_id: ParticipantId,
    pub question_id: QuestionId,
    pub correct: bool,
    pub created_at: DateTime<Utc>,
}

impl Answer {
    pub fn new(participant_id: ParticipantId, question_id: QuestionId, correct: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            participant_id,
            question_id,
            correct,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuelQuestion {
    pub duel_id: DuelId,
    pub question_id: QuestionId,
    pub order: u32,
}

/// Question as exposed by the question bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub body: String,
    pub accepted_answers: Vec<String>,
    pub published: bool,
}

impl Question {
    /// Exact membership: case-sensitive, no trimming.
    pub fn accepts(&self, raw_answer: &str) -> bool {
        self.accepted_answers.iter().any(|accepted| accepted == raw_answer)
    }
}

/// A participant together with its answers in submission order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantProgress {
    pub participant: Participant,
    pub answers: Vec<Answer>,
}

impl ParticipantProgress {
    pub fn answered(&self) -> usize {
        self.answers.len()
    }

    fn last_answered_at(&self) -> Option<DateTime<Utc>> {
        self.answers.last().map(|answer| answer.created_at)
    }
}

/// Everything the duel use cases need, loaded inside one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct DuelAggregate {
    pub duel: Duel,
    pub participant1: ParticipantProgress,
    pub participant2: Option<ParticipantProgress>,
    pub questions: Vec<DuelQuestion>,
}

impl DuelAggregate {
    pub fn slot_of_user(&self, user_id: &str) -> Option<Slot> {
        if self.participant1.participant.user_id == user_id {
            Some(Slot::First)
        } else if self
            .participant2
            .as_ref()
            .is_some_and(|progress| progress.participant.user_id == user_id)
        {
            Some(Slot::Second)
        } else {
            None
        }
    }

    pub fn side(&self, slot: Slot) -> Option<&ParticipantProgress> {
        match slot {
            Slot::First => Some(&self.participant1),
            Slot::Second => self.participant2.as_ref(),
        }
    }

    /// Returns `(slot, other)` as two disjoint mutable borrows.
    pub fn sides_mut(
        &mut self,
        slot: Slot,
    ) -> Result<(&mut ParticipantProgress, &mut ParticipantProgress), DuelError> {
        let duel_id = self.duel.id;
        let second = self.participant2.as_mut().ok_or_else(|| {
            DuelError::internal(format!("duel {} has no second participant", duel_id))
        })?;
        Ok(match slot {
            Slot::First => (&mut self.participant1, second),
            Slot::Second => (second, &mut self.participant1),
        })
    }

    pub fn question_at(&self, order: usize) -> Option<&DuelQuestion> {
        self.questions
            .iter()
            .find(|question| question.order as usize == order)
    }

    /// The slot that completed its answers first.
    ///
    /// More recorded answers wins. On equal counts the participant whose last
    /// answer was recorded earlier wins; a remaining tie goes to participant1.
    pub fn finished_first(&self) -> Slot {
        let Some(second) = self.participant2.as_ref() else {
            return Slot::First;
        };
        let first = &self.participant1;

        match first.answered().cmp(&second.answered()) {
            std::cmp::Ordering::Greater => Slot::First,
            std::cmp::Ordering::Less => Slot::Second,
            std::cmp::Ordering::Equal => match (first.last_answered_at(), second.last_answered_at()) {
                (Some(a), Some(b)) if b < a => Slot::Second,
                _ => Slot::First,
            },
        }
    }

    /// When the earliest side to answer all `questions` recorded its last
    /// answer. `None` while neither side is done.
    pub fn completed_at(&self, questions: usize) -> Option<DateTime<Utc>> {
        std::iter::once(&self.participant1)
            .chain(self.participant2.as_ref())
            .filter(|side| side.answered() >= questions)
            .filter_map(|side| side.last_answered_at())
            .min()
    }

    /// Applies the completion rule and marks the duel finished.
    pub fn complete(&mut self, first: Slot) -> Result<(), DuelError> {
        let (winner_candidate, other) = self.sides_mut(first)?;
        settle(&mut winner_candidate.participant, &mut other.participant);
        self.duel.finish();
        Ok(())
    }
}

/// Completion rule: `first` gets a +1 bonus when it already scored, then the
/// final scores decide the outcomes.
pub fn settle(first: &mut Participant, other: &mut Participant) {
    if first.score > 0 {
        first.score += 1;
    }

    let (first_outcome, other_outcome) = match first.score.cmp(&other.score) {
        std::cmp::Ordering::Greater => (Outcome::Won, Outcome::Lost),
        std::cmp::Ordering::Less => (Outcome::Lost, Outcome::Won),
        std::cmp::Ordering::Equal => (Outcome::Draw, Outcome::Draw),
    };
    first.outcome = Some(first_outcome);
    other.outcome = Some(other_outcome);
}
