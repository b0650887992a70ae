use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use validator::Validate;

use crate::config::DuelConfig;
use crate::error::DuelError;
use crate::models::duel::AnswerId;
use crate::models::duel_view::{
    AnswerView, DuelHistoryQuery, DuelSortBy, DuelView, Paginated, PlayerProgressView,
    QuestionView, SortDirection, StatisticsView,
};
use crate::models::{DuelAggregate, DuelId, DuelStatus, Outcome, QuestionId};
use crate::services::duel_repository::{self, NO_ACTIVE_PAIR};
use crate::services::question_source::QuestionSource;
use crate::services::store::DuelStore;
use crate::services::transaction::{run_in_transaction, TransactionPolicy};

/// Read side: duel snapshots, answers, statistics and history.
pub struct DuelQueryService {
    store: Arc<dyn DuelStore>,
    questions: Arc<dyn QuestionSource>,
    policy: TransactionPolicy,
}

impl DuelQueryService {
    pub fn new(
        store: Arc<dyn DuelStore>,
        questions: Arc<dyn QuestionSource>,
        config: &DuelConfig,
    ) -> Self {
        Self {
            store,
            questions,
            policy: TransactionPolicy::repeatable_read(config),
        }
    }

    pub async fn get_duel(&self, duel_id: DuelId, user_id: &str) -> Result<DuelView, DuelError> {
        let aggregate = run_in_transaction(
            self.store.as_ref(),
            "get_duel",
            &self.policy,
            |mut tx| async move {
                let aggregate = duel_repository::find_aggregate(tx.as_mut(), duel_id).await?;
                Ok::<_, DuelError>((tx, aggregate))
            },
        )
        .await?
        .ok_or_else(|| DuelError::not_found(format!("Pair {} not found", duel_id)))?;

        if aggregate.slot_of_user(user_id).is_none() {
            return Err(DuelError::forbidden("Current user is not a participant of this pair"));
        }
        self.render(&aggregate).await
    }

    /// The caller's pending or active duel.
    pub async fn current_duel(&self, user_id: &str) -> Result<DuelView, DuelError> {
        let aggregate = run_in_transaction(
            self.store.as_ref(),
            "current_duel",
            &self.policy,
            |mut tx| async move {
                let duel = duel_repository::find_duel_for_user(
                    tx.as_mut(),
                    user_id,
                    &[DuelStatus::Pending, DuelStatus::Active],
                )
                .await?;
                let aggregate = match duel {
                    Some(duel) => Some(duel_repository::load_aggregate(tx.as_mut(), duel).await?),
                    None => None,
                };
                Ok::<_, DuelError>((tx, aggregate))
            },
        )
        .await?
        .ok_or_else(|| DuelError::forbidden(NO_ACTIVE_PAIR))?;

        self.render(&aggregate).await
    }

    pub async fn answer(&self, answer_id: AnswerId) -> Result<AnswerView, DuelError> {
        let answer = run_in_transaction(
            self.store.as_ref(),
            "get_answer",
            &self.policy,
            |mut tx| async move {
                let answer = tx.find_answer(answer_id).await?;
                Ok::<_, DuelError>((tx, answer))
            },
        )
        .await?
        .ok_or_else(|| DuelError::not_found(format!("Answer {} not found", answer_id)))?;

        Ok(AnswerView::from(&answer))
    }

    /// Aggregates over every participation of the user, whatever the duel
    /// status.
    pub async fn statistics(&self, user_id: &str) -> Result<StatisticsView, DuelError> {
        let participants = run_in_transaction(
            self.store.as_ref(),
            "statistics",
            &self.policy,
            |mut tx| async move {
                let participants = tx.participants_for_user(user_id).await?;
                Ok::<_, DuelError>((tx, participants))
            },
        )
        .await?;

        let games_count = participants.len() as u64;
        let sum_score: i64 = participants.iter().map(|p| p.score as i64).sum();
        let count_outcome = |outcome: Outcome| {
            participants
                .iter()
                .filter(|p| p.outcome == Some(outcome))
                .count() as u64
        };
        let avg_scores = if games_count == 0 {
            0.0
        } else {
            (sum_score as f64 / games_count as f64 * 100.0).round() / 100.0
        };

        Ok(StatisticsView {
            sum_score,
            avg_scores,
            games_count,
            wins_count: count_outcome(Outcome::Won),
            losses_count: count_outcome(Outcome::Lost),
            draws_count: count_outcome(Outcome::Draw),
        })
    }

    pub async fn user_duels(
        &self,
        user_id: &str,
        query: &DuelHistoryQuery,
    ) -> Result<Paginated<DuelView>, DuelError> {
        query
            .validate()
            .map_err(|e| DuelError::bad_request(e.to_string()))?;

        let mut aggregates = run_in_transaction(
            self.store.as_ref(),
            "user_duels",
            &self.policy,
            |mut tx| async move {
                let duels = duel_repository::duels_for_user(tx.as_mut(), user_id).await?;
                let mut aggregates = Vec::with_capacity(duels.len());
                for duel in duels {
                    aggregates.push(duel_repository::load_aggregate(tx.as_mut(), duel).await?);
                }
                Ok::<_, DuelError>((tx, aggregates))
            },
        )
        .await?;

        aggregates.sort_by(|a, b| compare_duels(a, b, query.sort_by, query.sort_direction));
        let page = Paginated::from_sorted(aggregates, query.page_number, query.page_size);

        let mut items = Vec::with_capacity(page.items.len());
        for aggregate in &page.items {
            items.push(self.render(aggregate).await?);
        }
        Ok(Paginated {
            pages_count: page.pages_count,
            page: page.page,
            page_size: page.page_size,
            total_count: page.total_count,
            items,
        })
    }

    async fn render(&self, aggregate: &DuelAggregate) -> Result<DuelView, DuelError> {
        let questions = if aggregate.questions.is_empty() {
            None
        } else {
            let ids: Vec<QuestionId> = aggregate.questions.iter().map(|q| q.question_id).collect();
            let mut bodies: HashMap<QuestionId, String> = self
                .questions
                .questions_by_ids(&ids)
                .await?
                .into_iter()
                .map(|question| (question.id, question.body))
                .collect();
            Some(
                ids.into_iter()
                    .map(|id| QuestionView {
                        id,
                        body: bodies.remove(&id).unwrap_or_default(),
                    })
                    .collect(),
            )
        };

        Ok(DuelView {
            id: aggregate.duel.id.to_string(),
            first_player_progress: PlayerProgressView::from(&aggregate.participant1),
            second_player_progress: aggregate.participant2.as_ref().map(PlayerProgressView::from),
            questions,
            status: aggregate.duel.status.into(),
            pair_created_date: aggregate.duel.created_at,
            start_game_date: aggregate.duel.started_at,
            finish_game_date: aggregate.duel.finished_at,
        })
    }
}

/// Primary key from the query, then newest first.
fn compare_duels(
    a: &DuelAggregate,
    b: &DuelAggregate,
    sort_by: DuelSortBy,
    direction: SortDirection,
) -> Ordering {
    let (a, b) = (&a.duel, &b.duel);
    let primary = match sort_by {
        DuelSortBy::Status => a.status.as_str().cmp(b.status.as_str()),
        DuelSortBy::PairCreatedDate => a.created_at.cmp(&b.created_at),
        DuelSortBy::StartGameDate => a.started_at.cmp(&b.started_at),
        DuelSortBy::FinishGameDate => a.finished_at.cmp(&b.finished_at),
    };
    let primary = match direction {
        SortDirection::Asc => primary,
        SortDirection::Desc => primary.reverse(),
    };
    primary.then_with(|| b.created_at.cmp(&a.created_at))
}
