use async_trait::async_trait;
use mongodb::{
    bson::{self, doc, DateTime as BsonDateTime, Document},
    error::{Error as MongoError, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT},
    options::{IndexOptions, ReadConcern, WriteConcern},
    Client, ClientSession, Collection, Database, IndexModel,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::{DuelStore, DuelTx, IsolationLevel};
use crate::error::{StoreError, StoreResult};
use crate::models::duel::AnswerId;
use crate::models::{
    Answer, Duel, DuelId, DuelQuestion, DuelStatus, Outcome, Participant, ParticipantId,
};
use crate::utils::time::{bson_to_chrono, chrono_to_bson};

const DUELS: &str = "duels";
const PARTICIPANTS: &str = "participants";
const ANSWERS: &str = "duel_answers";
const DUEL_QUESTIONS: &str = "duel_questions";
const GUARDS: &str = "duel_guards";
const PENDING_GUARD_ID: &str = "pending";

#[derive(Debug, Serialize, Deserialize)]
struct DuelDocument {
    #[serde(rename = "_id")]
    id: String,
    status: DuelStatus,
    participant1_id: String,
    participant2_id: Option<String>,
    created_at: BsonDateTime,
    started_at: Option<BsonDateTime>,
    finished_at: Option<BsonDateTime>,
    deleted_at: Option<BsonDateTime>,
    #[serde(default)]
    revision: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ParticipantDocument {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    score: i32,
    outcome: Option<Outcome>,
    created_at: BsonDateTime,
    #[serde(default)]
    revision: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnswerDocument {
    #[serde(rename = "_id")]
    id: String,
    participant_id: String,
    question_id: String,
    correct: bool,
    created_at: BsonDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
struct DuelQuestionDocument {
    #[serde(rename = "_id")]
    id: String,
    duel_id: String,
    question_id: String,
    order: i32,
}

fn parse_id(collection: &'static str, raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupted {
        collection,
        message: format!("invalid id {:?}: {}", raw, e),
    })
}

fn parse_time(collection: &'static str, raw: BsonDateTime) -> StoreResult<chrono::DateTime<chrono::Utc>> {
    bson_to_chrono(raw).ok_or_else(|| StoreError::Corrupted {
        collection,
        message: format!("timestamp out of range: {}", raw),
    })
}

fn parse_opt_time(
    collection: &'static str,
    raw: Option<BsonDateTime>,
) -> StoreResult<Option<chrono::DateTime<chrono::Utc>>> {
    raw.map(|value| parse_time(collection, value)).transpose()
}

impl From<&Duel> for DuelDocument {
    fn from(duel: &Duel) -> Self {
        Self {
            id: duel.id.to_string(),
            status: duel.status,
            participant1_id: duel.participant1_id.to_string(),
            participant2_id: duel.participant2_id.map(|id| id.to_string()),
            created_at: chrono_to_bson(duel.created_at),
            started_at: duel.started_at.map(chrono_to_bson),
            finished_at: duel.finished_at.map(chrono_to_bson),
            deleted_at: duel.deleted_at.map(chrono_to_bson),
            revision: 0,
        }
    }
}

impl TryFrom<DuelDocument> for Duel {
    type Error = StoreError;

    fn try_from(doc: DuelDocument) -> StoreResult<Self> {
        Ok(Duel {
            id: parse_id(DUELS, &doc.id)?,
            status: doc.status,
            participant1_id: parse_id(DUELS, &doc.participant1_id)?,
            participant2_id: doc
                .participant2_id
                .as_deref()
                .map(|raw| parse_id(DUELS, raw))
                .transpose()?,
            created_at: parse_time(DUELS, doc.created_at)?,
            started_at: parse_opt_time(DUELS, doc.started_at)?,
            finished_at: parse_opt_time(DUELS, doc.finished_at)?,
            deleted_at: parse_opt_time(DUELS, doc.deleted_at)?,
        })
    }
}

impl From<&Participant> for ParticipantDocument {
    fn from(participant: &Participant) -> Self {
        Self {
            id: participant.id.to_string(),
            user_id: participant.user_id.clone(),
            score: participant.score,
            outcome: participant.outcome,
            created_at: chrono_to_bson(participant.created_at),
            revision: 0,
        }
    }
}

impl TryFrom<ParticipantDocument> for Participant {
    type Error = StoreError;

    fn try_from(doc: ParticipantDocument) -> StoreResult<Self> {
        Ok(Participant {
            id: parse_id(PARTICIPANTS, &doc.id)?,
            user_id: doc.user_id,
            score: doc.score,
            outcome: doc.outcome,
            created_at: parse_time(PARTICIPANTS, doc.created_at)?,
        })
    }
}

impl From<&Answer> for AnswerDocument {
    fn from(answer: &Answer) -> Self {
        Self {
            id: answer.id.to_string(),
            participant_id: answer.participant_id.to_string(),
            question_id: answer.question_id.to_string(),
            correct: answer.correct,
            created_at: chrono_to_bson(answer.created_at),
        }
    }
}

impl TryFrom<AnswerDocument> for Answer {
    type Error = StoreError;

    fn try_from(doc: AnswerDocument) -> StoreResult<Self> {
        Ok(Answer {
            id: parse_id(ANSWERS, &doc.id)?,
            participant_id: parse_id(ANSWERS, &doc.participant_id)?,
            question_id: parse_id(ANSWERS, &doc.question_id)?,
            correct: doc.correct,
            created_at: parse_time(ANSWERS, doc.created_at)?,
        })
    }
}

impl From<&DuelQuestion> for DuelQuestionDocument {
    fn from(question: &DuelQuestion) -> Self {
        Self {
            id: format!("{}:{}", question.duel_id, question.order),
            duel_id: question.duel_id.to_string(),
            question_id: question.question_id.to_string(),
            order: question.order as i32,
        }
    }
}

impl TryFrom<DuelQuestionDocument> for DuelQuestion {
    type Error = StoreError;

    fn try_from(doc: DuelQuestionDocument) -> StoreResult<Self> {
        Ok(DuelQuestion {
            duel_id: parse_id(DUEL_QUESTIONS, &doc.duel_id)?,
            question_id: parse_id(DUEL_QUESTIONS, &doc.question_id)?,
            order: u32::try_from(doc.order).map_err(|_| StoreError::Corrupted {
                collection: DUEL_QUESTIONS,
                message: format!("negative order {}", doc.order),
            })?,
        })
    }
}

/// Transient transaction failures (write conflicts, elections) and unknown
/// commit results are retryable; everything else is a hard failure.
fn classify(context: &str, err: MongoError) -> StoreError {
    if err.contains_label(TRANSIENT_TRANSACTION_ERROR)
        || err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
    {
        StoreError::Conflict(format!("{}: {}", context, err))
    } else {
        StoreError::backend_with(context.to_string(), err)
    }
}

/// `$set` everything except the id, and bump `revision` so an unchanged row
/// still counts as written by this transaction.
fn revision_update<T: Serialize>(collection: &'static str, row: &T) -> StoreResult<Document> {
    let mut fields = bson::to_document(row).map_err(|e| StoreError::Corrupted {
        collection,
        message: e.to_string(),
    })?;
    fields.remove("_id");
    fields.remove("revision");
    Ok(doc! { "$set": fields, "$inc": { "revision": 1_i64 } })
}

/// MongoDB-backed store. Requires a replica set (multi-document transactions).
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    pub fn new(client: Client, database: &str) -> Self {
        let db = client.database(database);
        Self { client, db }
    }

    pub async fn ensure_indexes(&self) -> StoreResult<()> {
        let unique = IndexOptions::builder().unique(true).build();

        self.db
            .collection::<Document>(DUELS)
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "status": 1, "created_at": 1 })
                    .build(),
            )
            .await
            .map_err(|e| classify("create duels index", e))?;
        self.db
            .collection::<Document>(PARTICIPANTS)
            .create_index(IndexModel::builder().keys(doc! { "user_id": 1 }).build())
            .await
            .map_err(|e| classify("create participants index", e))?;
        self.db
            .collection::<Document>(ANSWERS)
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "participant_id": 1, "created_at": 1 })
                    .build(),
            )
            .await
            .map_err(|e| classify("create answers index", e))?;
        self.db
            .collection::<Document>(DUEL_QUESTIONS)
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "duel_id": 1, "question_id": 1 })
                    .options(unique)
                    .build(),
            )
            .await
            .map_err(|e| classify("create duel questions index", e))?;

        info!("duel store indexes ensured");
        Ok(())
    }
}

#[async_trait]
impl DuelStore for MongoStore {
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn DuelTx>> {
        let mut session = self
            .client
            .start_session()
            .await
            .map_err(|e| classify("start session", e))?;
        session
            .start_transaction()
            .read_concern(ReadConcern::snapshot())
            .write_concern(WriteConcern::majority())
            .await
            .map_err(|e| classify("start transaction", e))?;

        Ok(Box::new(MongoTx {
            session,
            db: self.db.clone(),
            isolation,
            pending_guard_touched: false,
        }))
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.db
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| classify("ping", e))
    }
}

/// The driver aborts the transaction when the session is dropped uncommitted.
struct MongoTx {
    session: ClientSession,
    db: Database,
    isolation: IsolationLevel,
    pending_guard_touched: bool,
}

impl MongoTx {
    fn collection<T: Send + Sync>(&self, name: &str) -> Collection<T> {
        self.db.collection::<T>(name)
    }

    /// Writes the guard document once per transaction. Every transaction that
    /// reads or changes the pending set under serializable isolation writes
    /// it, which turns a read-write race into a write-write conflict.
    async fn touch_pending_guard(&mut self) -> StoreResult<()> {
        if self.pending_guard_touched {
            return Ok(());
        }
        let guards = self.collection::<Document>(GUARDS);
        guards
            .update_one(
                doc! { "_id": PENDING_GUARD_ID },
                doc! { "$inc": { "revision": 1_i64 } },
            )
            .upsert(true)
            .session(&mut self.session)
            .await
            .map_err(|e| classify("touch pending guard", e))?;
        self.pending_guard_touched = true;
        debug!("pending guard touched");
        Ok(())
    }

    async fn read_pending_set(&mut self) -> StoreResult<()> {
        if self.isolation == IsolationLevel::Serializable {
            self.touch_pending_guard().await?;
        }
        Ok(())
    }

    async fn collect<D, T>(&mut self, name: &'static str, filter: Document, sort: Document) -> StoreResult<Vec<T>>
    where
        D: DeserializeOwned + Send + Sync,
        T: TryFrom<D, Error = StoreError>,
    {
        let collection = self.collection::<D>(name);
        let mut cursor = collection
            .find(filter)
            .sort(sort)
            .session(&mut self.session)
            .await
            .map_err(|e| classify(name, e))?;

        let mut rows = Vec::new();
        while let Some(row) = cursor.next(&mut self.session).await {
            let row = row.map_err(|e| classify(name, e))?;
            rows.push(T::try_from(row)?);
        }
        Ok(rows)
    }

    async fn find_by_id<D, T>(&mut self, name: &'static str, id: Uuid) -> StoreResult<Option<T>>
    where
        D: DeserializeOwned + Send + Sync,
        T: TryFrom<D, Error = StoreError>,
    {
        let collection = self.collection::<D>(name);
        collection
            .find_one(doc! { "_id": id.to_string() })
            .session(&mut self.session)
            .await
            .map_err(|e| classify(name, e))?
            .map(T::try_from)
            .transpose()
    }

    async fn update_existing<D: Serialize>(
        &mut self,
        name: &'static str,
        id: Uuid,
        row: &D,
    ) -> StoreResult<()> {
        let update = revision_update(name, row)?;
        let collection = self.collection::<Document>(name);
        let result = collection
            .update_one(doc! { "_id": id.to_string() }, update)
            .session(&mut self.session)
            .await
            .map_err(|e| classify(name, e))?;
        if result.matched_count == 0 {
            return Err(StoreError::backend(format!("{} row {} does not exist", name, id)));
        }
        Ok(())
    }
}

#[async_trait]
impl DuelTx for MongoTx {
    async fn insert_participant(&mut self, participant: &Participant) -> StoreResult<()> {
        let collection = self.collection::<ParticipantDocument>(PARTICIPANTS);
        collection
            .insert_one(ParticipantDocument::from(participant))
            .session(&mut self.session)
            .await
            .map_err(|e| classify("insert participant", e))?;
        Ok(())
    }

    async fn save_participant(&mut self, participant: &Participant) -> StoreResult<()> {
        self.update_existing(
            PARTICIPANTS,
            participant.id,
            &ParticipantDocument::from(participant),
        )
        .await
    }

    async fn find_participant(&mut self, id: ParticipantId) -> StoreResult<Option<Participant>> {
        self.find_by_id::<ParticipantDocument, _>(PARTICIPANTS, id).await
    }

    async fn participants_for_user(&mut self, user_id: &str) -> StoreResult<Vec<Participant>> {
        self.collect::<ParticipantDocument, _>(
            PARTICIPANTS,
            doc! { "user_id": user_id },
            doc! { "created_at": 1 },
        )
        .await
    }

    async fn insert_duel(&mut self, duel: &Duel) -> StoreResult<()> {
        if duel.status == DuelStatus::Pending {
            self.touch_pending_guard().await?;
        }
        let collection = self.collection::<DuelDocument>(DUELS);
        collection
            .insert_one(DuelDocument::from(duel))
            .session(&mut self.session)
            .await
            .map_err(|e| classify("insert duel", e))?;
        Ok(())
    }

    async fn save_duel(&mut self, duel: &Duel) -> StoreResult<()> {
        // Moving a duel out of pending happens only after a pending-set read,
        // which already touched the guard under serializable isolation.
        if duel.status == DuelStatus::Pending {
            self.touch_pending_guard().await?;
        }
        self.update_existing(DUELS, duel.id, &DuelDocument::from(duel))
            .await
    }

    async fn find_duel(&mut self, id: DuelId) -> StoreResult<Option<Duel>> {
        let duel = self.find_by_id::<DuelDocument, Duel>(DUELS, id).await?;
        Ok(duel.filter(|duel| duel.deleted_at.is_none()))
    }

    async fn find_oldest_pending_duel(&mut self) -> StoreResult<Option<Duel>> {
        self.read_pending_set().await?;
        let collection = self.collection::<DuelDocument>(DUELS);
        collection
            .find_one(doc! { "status": DuelStatus::Pending.as_str(), "deleted_at": null })
            .sort(doc! { "created_at": 1 })
            .session(&mut self.session)
            .await
            .map_err(|e| classify("find oldest pending duel", e))?
            .map(Duel::try_from)
            .transpose()
    }

    async fn count_pending_duels(&mut self) -> StoreResult<u64> {
        self.read_pending_set().await?;
        let collection = self.collection::<Document>(DUELS);
        collection
            .count_documents(doc! { "status": DuelStatus::Pending.as_str(), "deleted_at": null })
            .session(&mut self.session)
            .await
            .map_err(|e| classify("count pending duels", e))
    }

    async fn duels_with_status(&mut self, status: DuelStatus) -> StoreResult<Vec<Duel>> {
        if status == DuelStatus::Pending {
            self.read_pending_set().await?;
        }
        self.collect::<DuelDocument, _>(
            DUELS,
            doc! { "status": status.as_str(), "deleted_at": null },
            doc! { "created_at": 1 },
        )
        .await
    }

    async fn duels_for_participants(
        &mut self,
        participant_ids: &[ParticipantId],
        statuses: Option<&[DuelStatus]>,
    ) -> StoreResult<Vec<Duel>> {
        if participant_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = participant_ids.iter().map(|id| id.to_string()).collect();
        let mut filter = doc! {
            "deleted_at": null,
            "$or": [
                { "participant1_id": { "$in": ids.clone() } },
                { "participant2_id": { "$in": ids } },
            ],
        };
        if let Some(statuses) = statuses {
            let statuses: Vec<&str> = statuses.iter().map(|status| status.as_str()).collect();
            filter.insert("status", doc! { "$in": statuses });
        }
        self.collect::<DuelDocument, _>(DUELS, filter, doc! { "created_at": 1 })
            .await
    }

    async fn insert_duel_questions(&mut self, questions: &[DuelQuestion]) -> StoreResult<()> {
        if questions.is_empty() {
            return Ok(());
        }
        let collection = self.collection::<DuelQuestionDocument>(DUEL_QUESTIONS);
        collection
            .insert_many(questions.iter().map(DuelQuestionDocument::from))
            .session(&mut self.session)
            .await
            .map_err(|e| classify("insert duel questions", e))?;
        Ok(())
    }

    async fn questions_for_duel(&mut self, duel_id: DuelId) -> StoreResult<Vec<DuelQuestion>> {
        self.collect::<DuelQuestionDocument, _>(
            DUEL_QUESTIONS,
            doc! { "duel_id": duel_id.to_string() },
            doc! { "order": 1 },
        )
        .await
    }

    async fn insert_answer(&mut self, answer: &Answer) -> StoreResult<()> {
        let collection = self.collection::<AnswerDocument>(ANSWERS);
        collection
            .insert_one(AnswerDocument::from(answer))
            .session(&mut self.session)
            .await
            .map_err(|e| classify("insert answer", e))?;
        Ok(())
    }

    async fn answers_for_participant(
        &mut self,
        participant_id: ParticipantId,
    ) -> StoreResult<Vec<Answer>> {
        self.collect::<AnswerDocument, _>(
            ANSWERS,
            doc! { "participant_id": participant_id.to_string() },
            doc! { "created_at": 1, "_id": 1 },
        )
        .await
    }

    async fn find_answer(&mut self, id: AnswerId) -> StoreResult<Option<Answer>> {
        self.find_by_id::<AnswerDocument, _>(ANSWERS, id).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut tx = *self;
        tx.session
            .commit_transaction()
            .await
            .map_err(|e| classify("commit transaction", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duel_document_round_trip_keeps_ids_and_status() {
        let mut duel = Duel::pending(Uuid::new_v4());
        duel.start(Uuid::new_v4(), &[Uuid::new_v4()]).unwrap();

        let restored = Duel::try_from(DuelDocument::from(&duel)).unwrap();

        assert_eq!(restored.id, duel.id);
        assert_eq!(restored.status, DuelStatus::Active);
        assert_eq!(restored.participant2_id, duel.participant2_id);
        assert_eq!(
            restored.started_at.map(|t| t.timestamp_millis()),
            duel.started_at.map(|t| t.timestamp_millis())
        );
    }

    #[test]
    fn corrupted_ids_are_reported_with_collection() {
        let mut doc = DuelDocument::from(&Duel::pending(Uuid::new_v4()));
        doc.participant1_id = "not-a-uuid".into();

        let err = Duel::try_from(doc).unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { collection: DUELS, .. }));
    }

    #[test]
    fn revision_update_sets_fields_and_bumps_revision() {
        let participant = Participant::new("alice");
        let update =
            revision_update(PARTICIPANTS, &ParticipantDocument::from(&participant)).unwrap();

        let set = update.get_document("$set").unwrap();
        assert!(set.get("_id").is_none());
        assert!(set.get("revision").is_none());
        assert_eq!(set.get_str("user_id").unwrap(), "alice");
        assert_eq!(
            update.get_document("$inc").unwrap().get_i64("revision").unwrap(),
            1
        );
    }

    #[test]
    fn duel_question_document_uses_order_in_key() {
        let question = DuelQuestion {
            duel_id: Uuid::new_v4(),
            question_id: Uuid::new_v4(),
            order: 3,
        };
        let doc = DuelQuestionDocument::from(&question);
        assert_eq!(doc.id, format!("{}:3", question.duel_id));
        assert_eq!(DuelQuestion::try_from(doc).unwrap(), question);
    }
}
