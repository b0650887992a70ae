use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// MongoDB replica set for duels, Redis for the timeout job queue.
    Mongo,
    /// Everything in process. Nothing survives a restart.
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StorageBackend::Mongo),
            "memory" | "in-memory" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown storage backend: {}", other)),
        }
    }
}

/// Duel engine tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct DuelConfig {
    pub questions_per_duel: usize,
    /// How long the opponent of a participant who answered everything has
    /// before the duel is finished for them.
    pub finish_timeout_secs: u64,
    /// Retries after the first attempt on a serialization conflict.
    pub transaction_retries: usize,
    pub retry_backoff_ms: u64,
    pub worker_poll_interval_ms: u64,
    pub worker_batch_size: usize,
    /// How long a claimed finish job stays hidden before it is handed out
    /// again unless acknowledged.
    pub job_lease_secs: u64,
    /// Period of the scan for active duels that lost their finish job.
    pub sweep_interval_secs: u64,
}

impl Default for DuelConfig {
    fn default() -> Self {
        Self {
            questions_per_duel: 5,
            finish_timeout_secs: 10,
            transaction_retries: 3,
            retry_backoff_ms: 50,
            worker_poll_interval_ms: 500,
            worker_batch_size: 20,
            job_lease_secs: 30,
            sweep_interval_secs: 30,
        }
    }
}

impl DuelConfig {
    pub fn finish_timeout(&self) -> Duration {
        Duration::from_secs(self.finish_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_secs(self.job_lease_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageBackend,
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub jwt_secret: String,
    pub bind_addr: String,
    /// JSON question bank loaded into the memory backend at startup.
    pub question_seed_path: Option<String>,
    pub duel: DuelConfig,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load environment variables from root .env file (two levels up)
        // Try root .env first, then fallback to local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        // Determine environment (defaults to dev)
        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let storage = settings
            .get_string("storage.backend")
            .or_else(|_| env::var("STORAGE_BACKEND"))
            .unwrap_or_else(|_| "mongo".to_string())
            .parse::<StorageBackend>()
            .map_err(config::ConfigError::Message)?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| match (env::var("MONGO_USER"), env::var("MONGO_PASSWORD")) {
                (Ok(user), Ok(password)) => {
                    eprintln!("WARNING: Building MongoDB URI from MONGO_USER/MONGO_PASSWORD env vars");
                    format!(
                        "mongodb://{}:{}@localhost:27017/?authSource=admin&replicaSet=rs0",
                        user, password
                    )
                }
                _ => "mongodb://localhost:27017/?replicaSet=rs0".to_string(),
            });

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| {
                let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                match env::var("REDIS_PASSWORD") {
                    Ok(password) => format!("redis://:{}@{}:{}/0", password, host, port),
                    Err(_) => format!("redis://{}:{}/0", host, port),
                }
            });

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "quiz_duel".to_string());

        let jwt_secret = match settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
        {
            Ok(secret) => secret,
            Err(_) if env == "prod" => {
                return Err(config::ConfigError::Message(
                    "JWT_SECRET must be set in production".to_string(),
                ))
            }
            Err(_) => {
                eprintln!("WARNING: Using default JWT_SECRET (dev mode only!)");
                "dev-secret-only-for-local-testing".to_string()
            }
        };

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let defaults = DuelConfig::default();
        let duel = DuelConfig {
            questions_per_duel: number(
                &settings,
                "duel.questions_per_duel",
                None,
                defaults.questions_per_duel as u64,
            )? as usize,
            finish_timeout_secs: number(
                &settings,
                "duel.finish_timeout_secs",
                Some("GAMES_FINISH_TIMEOUT_IN_SECONDS"),
                defaults.finish_timeout_secs,
            )?,
            transaction_retries: number(
                &settings,
                "duel.transaction_retries",
                None,
                defaults.transaction_retries as u64,
            )? as usize,
            retry_backoff_ms: number(
                &settings,
                "duel.retry_backoff_ms",
                None,
                defaults.retry_backoff_ms,
            )?,
            worker_poll_interval_ms: number(
                &settings,
                "duel.worker_poll_interval_ms",
                None,
                defaults.worker_poll_interval_ms,
            )?,
            worker_batch_size: number(
                &settings,
                "duel.worker_batch_size",
                None,
                defaults.worker_batch_size as u64,
            )? as usize,
            job_lease_secs: number(
                &settings,
                "duel.job_lease_secs",
                None,
                defaults.job_lease_secs,
            )?,
            sweep_interval_secs: number(
                &settings,
                "duel.sweep_interval_secs",
                None,
                defaults.sweep_interval_secs,
            )?,
        };

        if duel.questions_per_duel == 0 {
            return Err(config::ConfigError::Message(
                "duel.questions_per_duel must be positive".to_string(),
            ));
        }
        if duel.job_lease_secs == 0 {
            return Err(config::ConfigError::Message(
                "duel.job_lease_secs must be positive".to_string(),
            ));
        }

        let question_seed_path = settings
            .get_string("storage.question_seed_path")
            .or_else(|_| env::var("QUESTION_SEED_PATH"))
            .ok();

        Ok(Config {
            storage,
            mongo_uri,
            redis_uri,
            mongo_database,
            jwt_secret,
            bind_addr,
            question_seed_path,
            duel,
        })
    }

    /// Self-contained configuration: in-memory store, local job queue.
    pub fn in_memory(jwt_secret: impl Into<String>) -> Self {
        Self {
            storage: StorageBackend::Memory,
            mongo_uri: String::new(),
            redis_uri: String::new(),
            mongo_database: "quiz_duel".to_string(),
            jwt_secret: jwt_secret.into(),
            bind_addr: "127.0.0.1:0".to_string(),
            question_seed_path: None,
            duel: DuelConfig::default(),
        }
    }
}

/// Reads `key` from the layered settings, then the legacy env var, then the
/// default.
fn number(
    settings: &config::Config,
    key: &str,
    legacy_env: Option<&str>,
    default: u64,
) -> Result<u64, config::ConfigError> {
    if let Ok(value) = settings.get::<u64>(key) {
        return Ok(value);
    }
    match legacy_env.and_then(|name| env::var(name).ok().map(|raw| (name, raw))) {
        Some((name, raw)) => raw.trim().parse::<u64>().map_err(|e| {
            config::ConfigError::Message(format!("{} is not a valid number: {}", name, e))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "APP_ENV",
            "STORAGE_BACKEND",
            "GAMES_FINISH_TIMEOUT_IN_SECONDS",
            "APP__DUEL__QUESTIONS_PER_DUEL",
            "APP__DUEL__JOB_LEASE_SECS",
            "QUESTION_SEED_PATH",
            "JWT_SECRET",
        ] {
            env::remove_var(key);
        }
        env::set_var("SKIP_ROOT_ENV", "1");
    }

    #[test]
    #[serial]
    fn defaults_apply_without_overrides() {
        clear_env();
        env::set_var("APP_ENV", "test-missing");

        let config = Config::load().unwrap();

        assert_eq!(config.storage, StorageBackend::Mongo);
        assert_eq!(config.duel.questions_per_duel, 5);
        assert_eq!(config.duel.finish_timeout_secs, 10);
        assert_eq!(config.duel.transaction_retries, 3);
        assert_eq!(config.duel.retry_backoff(), Duration::from_millis(50));
        assert_eq!(config.duel.job_lease(), Duration::from_secs(30));
        assert_eq!(config.duel.sweep_interval(), Duration::from_secs(30));
        assert!(config.question_seed_path.is_none());
        clear_env();
    }

    #[test]
    #[serial]
    fn legacy_timeout_env_and_prefixed_overrides() {
        clear_env();
        env::set_var("APP_ENV", "test-missing");
        env::set_var("STORAGE_BACKEND", "memory");
        env::set_var("GAMES_FINISH_TIMEOUT_IN_SECONDS", "3");
        env::set_var("APP__DUEL__QUESTIONS_PER_DUEL", "7");

        let config = Config::load().unwrap();

        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.duel.finish_timeout(), Duration::from_secs(3));
        assert_eq!(config.duel.questions_per_duel, 7);
        clear_env();
    }

    #[test]
    #[serial]
    fn production_requires_jwt_secret() {
        clear_env();
        env::set_var("APP_ENV", "prod");

        let err = Config::load().unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
        clear_env();
    }

    #[test]
    #[serial]
    fn malformed_legacy_timeout_is_rejected() {
        clear_env();
        env::set_var("APP_ENV", "test-missing");
        env::set_var("GAMES_FINISH_TIMEOUT_IN_SECONDS", "soon");

        assert!(Config::load().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn zero_job_lease_is_rejected() {
        clear_env();
        env::set_var("APP_ENV", "test-missing");
        env::set_var("APP__DUEL__JOB_LEASE_SECS", "0");

        let err = Config::load().unwrap_err();
        assert!(err.to_string().contains("job_lease_secs"));
        clear_env();
    }
}
