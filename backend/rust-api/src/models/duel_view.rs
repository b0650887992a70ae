use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::duel::{Answer, DuelStatus, ParticipantProgress, QuestionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerStatus {
    Correct,
    Incorrect,
}

/// Ответ участника в том виде, в каком его видит клиент
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerView {
    pub question_id: QuestionId,
    pub answer_status: AnswerStatus,
    pub added_at: DateTime<Utc>,
}

impl From<&Answer> for AnswerView {
    fn from(answer: &Answer) -> Self {
        Self {
            question_id: answer.question_id,
            answer_status: if answer.correct {
                AnswerStatus::Correct
            } else {
                AnswerStatus::Incorrect
            },
            added_at: answer.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerView {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProgressView {
    pub answers: Vec<AnswerView>,
    pub player: PlayerView,
    pub score: i32,
}

impl From<&ParticipantProgress> for PlayerProgressView {
    fn from(progress: &ParticipantProgress) -> Self {
        Self {
            answers: progress.answers.iter().map(AnswerView::from).collect(),
            player: PlayerView {
                id: progress.participant.user_id.clone(),
            },
            score: progress.participant.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionView {
    pub id: QuestionId,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuelStatusView {
    PendingSecondPlayer,
    Active,
    Finished,
}

impl From<DuelStatus> for DuelStatusView {
    fn from(status: DuelStatus) -> Self {
        match status {
            DuelStatus::Pending => DuelStatusView::PendingSecondPlayer,
            DuelStatus::Active => DuelStatusView::Active,
            DuelStatus::Finished => DuelStatusView::Finished,
        }
    }
}

/// Снимок дуэли
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuelView {
    pub id: String,
    pub first_player_progress: PlayerProgressView,
    pub second_player_progress: Option<PlayerProgressView>,
    pub questions: Option<Vec<QuestionView>>,
    pub status: DuelStatusView,
    pub pair_created_date: DateTime<Utc>,
    pub start_game_date: Option<DateTime<Utc>>,
    pub finish_game_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsView {
    pub sum_score: i64,
    pub avg_scores: f64,
    pub games_count: u64,
    pub wins_count: u64,
    pub losses_count: u64,
    pub draws_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paginated<T> {
    pub pages_count: u64,
    pub page: u64,
    pub page_size: u64,
    pub total_count: u64,
    pub items: Vec<T>,
}

impl<T> Paginated<T> {
    /// Cuts one page out of an already sorted list.
    pub fn from_sorted(all: Vec<T>, page: u64, page_size: u64) -> Self {
        let total_count = all.len() as u64;
        let pages_count = total_count.div_ceil(page_size.max(1));
        let skip = (page.saturating_sub(1) * page_size) as usize;
        let items = all.into_iter().skip(skip).take(page_size as usize).collect();
        Self {
            pages_count,
            page,
            page_size,
            total_count,
            items,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum DuelSortBy {
    #[serde(rename = "status")]
    Status,
    #[default]
    #[serde(rename = "pairCreatedDate")]
    PairCreatedDate,
    #[serde(rename = "startGameDate")]
    StartGameDate,
    #[serde(rename = "finishGameDate")]
    FinishGameDate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[serde(alias = "ASC")]
    Asc,
    #[default]
    #[serde(alias = "DESC")]
    Desc,
}

/// Query параметры истории дуэлей
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DuelHistoryQuery {
    #[validate(range(min = 1, message = "pageNumber must be at least 1"))]
    #[serde(default = "default_page_number")]
    pub page_number: u64,

    #[validate(range(min = 1, max = 100, message = "pageSize must be between 1 and 100"))]
    #[serde(default = "default_page_size")]
    pub page_size: u64,

    #[serde(default)]
    pub sort_by: DuelSortBy,

    #[serde(default)]
    pub sort_direction: SortDirection,
}

impl Default for DuelHistoryQuery {
    fn default() -> Self {
        Self {
            page_number: default_page_number(),
            page_size: default_page_size(),
            sort_by: DuelSortBy::default(),
            sort_direction: SortDirection::default(),
        }
    }
}

fn default_page_number() -> u64 {
    1
}

fn default_page_size() -> u64 {
    10
}
