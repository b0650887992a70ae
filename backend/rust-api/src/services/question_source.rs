use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Document},
    Database,
};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DuelError, StoreError};
use crate::models::{Question, QuestionId};

/// Published questions available to duels.
#[async_trait]
pub trait QuestionSource: Send + Sync {
    /// `n` distinct published question ids in random order. Fails when fewer
    /// than `n` are published.
    async fn random_published_questions(&self, n: usize) -> Result<Vec<QuestionId>, DuelError>;

    async fn question_by_id(&self, id: QuestionId) -> Result<Option<Question>, DuelError>;

    /// Missing ids are skipped.
    async fn questions_by_ids(&self, ids: &[QuestionId]) -> Result<Vec<Question>, DuelError>;
}

fn shortage(needed: usize, available: usize) -> DuelError {
    DuelError::internal(format!(
        "Not enough published questions: need {}, have {}",
        needed, available
    ))
}

#[derive(Debug, Serialize, Deserialize)]
struct QuestionDocument {
    #[serde(rename = "_id")]
    id: String,
    body: String,
    correct_answers: Vec<String>,
    published: bool,
}

impl TryFrom<QuestionDocument> for Question {
    type Error = StoreError;

    fn try_from(doc: QuestionDocument) -> Result<Self, StoreError> {
        Ok(Question {
            id: Uuid::parse_str(&doc.id).map_err(|e| StoreError::Corrupted {
                collection: "questions",
                message: format!("invalid id {:?}: {}", doc.id, e),
            })?,
            body: doc.body,
            accepted_answers: doc.correct_answers,
            published: doc.published,
        })
    }
}

pub struct MongoQuestionSource {
    db: Database,
}

impl MongoQuestionSource {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn questions(&self) -> mongodb::Collection<QuestionDocument> {
        self.db.collection::<QuestionDocument>("questions")
    }
}

#[async_trait]
impl QuestionSource for MongoQuestionSource {
    async fn random_published_questions(&self, n: usize) -> Result<Vec<QuestionId>, DuelError> {
        let collection = self.db.collection::<Document>("questions");
        let pipeline = vec![
            doc! { "$match": { "published": true } },
            doc! { "$sample": { "size": n as i64 } },
            doc! { "$project": { "_id": 1 } },
        ];

        let mut cursor = collection
            .aggregate(pipeline)
            .await
            .map_err(|e| StoreError::backend_with("sample questions", e))?;

        let mut ids = Vec::with_capacity(n);
        while let Some(doc) = cursor
            .try_next()
            .await
            .map_err(|e| StoreError::backend_with("sample questions", e))?
        {
            let raw = doc.get_str("_id").map_err(|e| StoreError::Corrupted {
                collection: "questions",
                message: e.to_string(),
            })?;
            let id = Uuid::parse_str(raw).map_err(|e| StoreError::Corrupted {
                collection: "questions",
                message: format!("invalid id {:?}: {}", raw, e),
            })?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        if ids.len() < n {
            return Err(shortage(n, ids.len()));
        }
        Ok(ids)
    }

    async fn question_by_id(&self, id: QuestionId) -> Result<Option<Question>, DuelError> {
        let found = self
            .questions()
            .find_one(doc! { "_id": id.to_string() })
            .await
            .map_err(|e| StoreError::backend_with("find question", e))?;
        Ok(found.map(Question::try_from).transpose()?)
    }

    async fn questions_by_ids(&self, ids: &[QuestionId]) -> Result<Vec<Question>, DuelError> {
        let raw: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let found: Vec<QuestionDocument> = self
            .questions()
            .find(doc! { "_id": { "$in": raw } })
            .await
            .map_err(|e| StoreError::backend_with("find questions", e))?
            .try_collect()
            .await
            .map_err(|e| StoreError::backend_with("find questions", e))?;

        let mut by_id = HashMap::new();
        for doc in found {
            let question = Question::try_from(doc)?;
            by_id.insert(question.id, question);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }
}

/// Entry of a JSON question bank file.
#[derive(Debug, Deserialize)]
struct SeedQuestion {
    body: String,
    correct_answers: Vec<String>,
    #[serde(default = "published_by_default")]
    published: bool,
}

fn published_by_default() -> bool {
    true
}

/// In-process question bank.
#[derive(Default)]
pub struct MemoryQuestionSource {
    questions: RwLock<Vec<Question>>,
}

impl MemoryQuestionSource {
    pub fn new(questions: Vec<Question>) -> Self {
        Self {
            questions: RwLock::new(questions),
        }
    }

    /// Parses a JSON array of `{"body", "correct_answers", "published"}`
    /// objects. Every entry gets a fresh id.
    pub fn from_json(raw: &str) -> Result<Self, DuelError> {
        let seed: Vec<SeedQuestion> = serde_json::from_str(raw)
            .map_err(|e| DuelError::internal(format!("Invalid question bank: {}", e)))?;
        Ok(Self::new(
            seed.into_iter()
                .map(|entry| Question {
                    id: Uuid::new_v4(),
                    body: entry.body,
                    accepted_answers: entry.correct_answers,
                    published: entry.published,
                })
                .collect(),
        ))
    }

    pub fn published_count(&self) -> Result<usize, DuelError> {
        Ok(self
            .snapshot()?
            .iter()
            .filter(|question| question.published)
            .count())
    }

    fn snapshot(&self) -> Result<Vec<Question>, DuelError> {
        Ok(self
            .questions
            .read()
            .map_err(|_| DuelError::internal("question bank lock poisoned"))?
            .clone())
    }
}

#[async_trait]
impl QuestionSource for MemoryQuestionSource {
    async fn random_published_questions(&self, n: usize) -> Result<Vec<QuestionId>, DuelError> {
        let mut ids: Vec<QuestionId> = self
            .snapshot()?
            .into_iter()
            .filter(|question| question.published)
            .map(|question| question.id)
            .collect();
        if ids.len() < n {
            return Err(shortage(n, ids.len()));
        }
        ids.shuffle(&mut rand::rng());
        ids.truncate(n);
        Ok(ids)
    }

    async fn question_by_id(&self, id: QuestionId) -> Result<Option<Question>, DuelError> {
        Ok(self.snapshot()?.into_iter().find(|question| question.id == id))
    }

    async fn questions_by_ids(&self, ids: &[QuestionId]) -> Result<Vec<Question>, DuelError> {
        let all = self.snapshot()?;
        Ok(ids
            .iter()
            .filter_map(|id| all.iter().find(|question| question.id == *id).cloned())
            .collect())
    }
}
