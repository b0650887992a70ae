use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::config::DuelConfig;
use crate::error::DuelError;
use crate::metrics::{record_answer, record_duel_event, record_timeout_job};
use crate::models::duel::AnswerId;
use crate::models::{Answer, DuelId};
use crate::services::duel_repository;
use crate::services::job_queue::{FinishDuelJob, JobQueue};
use crate::services::question_source::QuestionSource;
use crate::services::store::{DuelStore, DuelTx};
use crate::services::transaction::{run_in_transaction, TransactionPolicy};
use crate::utils::retry::{retry_async_with_config, RetryConfig};

pub const ALL_QUESTIONS_ANSWERED: &str = "All questions already answered";

/// What one submitted answer did to its duel.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerOutcome {
    pub answer_id: AnswerId,
    pub duel_id: DuelId,
    pub correct: bool,
    /// The caller just answered the last question while the opponent still
    /// has questions left.
    pub timeout_scheduled: bool,
    /// Both sides are done and the duel was finished in this transaction.
    pub finished: bool,
}

pub struct DuelAnswerService {
    store: Arc<dyn DuelStore>,
    questions: Arc<dyn QuestionSource>,
    jobs: Arc<dyn JobQueue>,
    policy: TransactionPolicy,
    questions_per_duel: usize,
    finish_timeout: Duration,
}

impl DuelAnswerService {
    pub fn new(
        store: Arc<dyn DuelStore>,
        questions: Arc<dyn QuestionSource>,
        jobs: Arc<dyn JobQueue>,
        config: &DuelConfig,
    ) -> Self {
        Self {
            store,
            questions,
            jobs,
            policy: TransactionPolicy::repeatable_read(config),
            questions_per_duel: config.questions_per_duel,
            finish_timeout: config.finish_timeout(),
        }
    }

    /// Records the caller's answer to their next unanswered question.
    pub async fn answer(&self, user_id: &str, raw_answer: &str) -> Result<AnswerOutcome, DuelError> {
        let outcome = run_in_transaction(
            self.store.as_ref(),
            "answer",
            &self.policy,
            |mut tx| async move {
                let outcome = self.answer_in(tx.as_mut(), user_id, raw_answer).await?;
                Ok::<_, DuelError>((tx, outcome))
            },
        )
        .await?;

        record_answer(outcome.correct);
        info!(
            duel_id = %outcome.duel_id,
            user_id,
            correct = outcome.correct,
            "Answer recorded"
        );

        if outcome.finished {
            record_duel_event("finished_normally");
            info!(duel_id = %outcome.duel_id, "Duel finished");
        }
        // Enqueued after commit, once per committed answer.
        if outcome.timeout_scheduled {
            self.schedule_timeout(outcome.duel_id).await;
        }
        Ok(outcome)
    }

    async fn answer_in(
        &self,
        tx: &mut dyn DuelTx,
        user_id: &str,
        raw_answer: &str,
    ) -> Result<AnswerOutcome, DuelError> {
        let mut aggregate = duel_repository::active_duel_for_user_or_fail(tx, user_id).await?;
        let slot = aggregate
            .slot_of_user(user_id)
            .ok_or_else(|| DuelError::internal("active duel loaded for a non-participant"))?;

        let next = aggregate
            .side(slot)
            .map(|progress| progress.answered())
            .unwrap_or_default();
        if next >= self.questions_per_duel {
            return Err(DuelError::forbidden(ALL_QUESTIONS_ANSWERED));
        }

        let question_id = aggregate
            .question_at(next)
            .map(|slot| slot.question_id)
            .ok_or_else(|| {
                DuelError::internal(format!(
                    "duel {} has no question at position {}",
                    aggregate.duel.id, next
                ))
            })?;
        let question = self
            .questions
            .question_by_id(question_id)
            .await?
            .ok_or_else(|| DuelError::internal(format!("question {} is gone", question_id)))?;
        let correct = question.accepts(raw_answer);

        let n = self.questions_per_duel;
        let (own, opponent) = aggregate.sides_mut(slot)?;
        let answer = Answer::new(own.participant.id, question_id, correct);
        if correct {
            own.participant.score += 1;
        }
        own.answers.push(answer.clone());

        let own_done = own.answered() == n;
        let opponent_done = opponent.answered() == n;
        let timeout_scheduled = own_done && !opponent_done;
        let finished = own_done && opponent_done;

        if finished {
            let first = aggregate.finished_first();
            aggregate.complete(first)?;
        }

        tx.insert_answer(&answer).await?;
        tx.save_duel(&aggregate.duel).await?;
        tx.save_participant(&aggregate.participant1.participant).await?;
        if let Some(second) = &aggregate.participant2 {
            tx.save_participant(&second.participant).await?;
        }

        Ok(AnswerOutcome {
            answer_id: answer.id,
            duel_id: aggregate.duel.id,
            correct,
            timeout_scheduled,
            finished,
        })
    }

    /// Failures are logged, not returned; the answer is already committed and
    /// the worker's sweep finishes the duel instead.
    async fn schedule_timeout(&self, duel_id: DuelId) {
        let job = FinishDuelJob::new(duel_id);
        let jobs: &dyn JobQueue = self.jobs.as_ref();
        let delay = self.finish_timeout;
        let result =
            retry_async_with_config(RetryConfig::default(), move || jobs.schedule(job.clone(), delay))
                .await;

        match result {
            Ok(()) => {
                record_timeout_job("scheduled");
                info!(%duel_id, delay_secs = self.finish_timeout.as_secs(), "Timeout finisher scheduled");
            }
            Err(err) => {
                record_timeout_job("failed");
                error!(%duel_id, error = %err, "Failed to schedule timeout finisher, leaving it to the sweep");
            }
        }
    }
}
