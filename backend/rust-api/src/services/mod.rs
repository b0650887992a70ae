use std::sync::Arc;

use anyhow::Context;
use redis::aio::ConnectionManager;

use crate::config::{Config, StorageBackend};
use crate::middlewares::auth::JwtService;

use self::duel_answer_service::DuelAnswerService;
use self::duel_query_service::DuelQueryService;
use self::job_queue::{JobQueue, LocalJobQueue, RedisJobQueue};
use self::matchmaking_service::MatchmakingService;
use self::question_source::{MemoryQuestionSource, MongoQuestionSource, QuestionSource};
use self::store::{DuelStore, MemoryStore, MongoStore};
use self::timeout_finisher::TimeoutFinisher;
use self::timeout_worker::TimeoutWorker;

pub struct AppState {
    pub config: Config,
    pub jwt: JwtService,
    pub store: Arc<dyn DuelStore>,
    pub questions: Arc<dyn QuestionSource>,
    pub jobs: Arc<dyn JobQueue>,
    pub matchmaking: MatchmakingService,
    pub answers: DuelAnswerService,
    pub finisher: Arc<TimeoutFinisher>,
    pub queries: DuelQueryService,
}

impl AppState {
    /// Wires the services over already constructed backends.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn DuelStore>,
        questions: Arc<dyn QuestionSource>,
        jobs: Arc<dyn JobQueue>,
    ) -> Self {
        let duel = &config.duel;
        let matchmaking = MatchmakingService::new(store.clone(), questions.clone(), duel);
        let answers =
            DuelAnswerService::new(store.clone(), questions.clone(), jobs.clone(), duel);
        let finisher = Arc::new(TimeoutFinisher::new(store.clone(), duel));
        let queries = DuelQueryService::new(store.clone(), questions.clone(), duel);

        Self {
            jwt: JwtService::new(&config.jwt_secret),
            config,
            store,
            questions,
            jobs,
            matchmaking,
            answers,
            finisher,
            queries,
        }
    }

    /// Connects the backends selected by `config.storage`.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        match config.storage {
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory duel storage; state is lost on restart");
                let questions = load_question_bank(&config).await?;
                Ok(Self::from_parts(
                    config,
                    Arc::new(MemoryStore::new()),
                    Arc::new(questions),
                    Arc::new(LocalJobQueue::new()),
                ))
            }
            StorageBackend::Mongo => {
                let mongo_client = mongodb::Client::with_uri_str(&config.mongo_uri)
                    .await
                    .context("Failed to connect to MongoDB")?;
                let store = MongoStore::new(mongo_client.clone(), &config.mongo_database);
                store
                    .ensure_indexes()
                    .await
                    .context("Failed to create duel indexes")?;
                let questions =
                    MongoQuestionSource::new(mongo_client.database(&config.mongo_database));

                let redis_client = redis::Client::open(config.redis_uri.clone())
                    .context("Failed to create Redis client")?;
                let redis = connect_redis(redis_client).await?;

                Ok(Self::from_parts(
                    config,
                    Arc::new(store),
                    Arc::new(questions),
                    Arc::new(RedisJobQueue::new(redis)),
                ))
            }
        }
    }

    pub fn timeout_worker(&self) -> TimeoutWorker {
        TimeoutWorker::new(
            self.finisher.clone(),
            self.jobs.clone(),
            self.config.duel.clone(),
        )
    }
}

/// Reads the question bank for the memory backend. Refuses to start with
/// fewer published questions than one duel needs.
async fn load_question_bank(config: &Config) -> anyhow::Result<MemoryQuestionSource> {
    let path = config
        .question_seed_path
        .as_deref()
        .context("Memory storage needs a question bank; set QUESTION_SEED_PATH")?;
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read question bank {}", path))?;
    let questions = MemoryQuestionSource::from_json(&raw)?;

    let published = questions.published_count()?;
    let needed = config.duel.questions_per_duel;
    if published < needed {
        anyhow::bail!(
            "Question bank {} has {} published questions, a duel needs {}",
            path,
            published,
            needed
        );
    }
    tracing::info!(path, published, "Question bank loaded");
    Ok(questions)
}

async fn connect_redis(redis_client: redis::Client) -> anyhow::Result<ConnectionManager> {
    tracing::info!("Attempting to connect to Redis...");

    let redis = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        ConnectionManager::new(redis_client),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

    let mut conn = redis.clone();
    tokio::time::timeout(
        std::time::Duration::from_secs(5),
        redis::cmd("PING").query_async::<String>(&mut conn),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

    tracing::info!("Redis connection established successfully");
    Ok(redis)
}

pub mod duel_answer_service;
pub mod duel_query_service;
pub mod duel_repository;
pub mod job_queue;
pub mod matchmaking_service;
pub mod question_source;
pub mod store;
pub mod timeout_finisher;
pub mod timeout_worker;
pub mod transaction;
