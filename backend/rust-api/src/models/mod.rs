pub mod duel;
pub mod duel_view;

pub use duel::{
    Answer, Duel, DuelAggregate, DuelId, DuelQuestion, DuelStatus, Outcome, Participant,
    ParticipantId, ParticipantProgress, Question, QuestionId, Slot,
};
