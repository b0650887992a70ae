#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use quiz_duel_api::{
    config::{Config, DuelConfig},
    create_router,
    middlewares::auth::JwtClaims,
    models::Question,
    services::{
        job_queue::LocalJobQueue, question_source::MemoryQuestionSource, store::MemoryStore,
        AppState,
    },
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_SECRET: &str = "duel-test-secret";
pub const RIGHT: &str = "right";
pub const WRONG: &str = "wrong";

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub jobs: Arc<LocalJobQueue>,
}

pub fn create_test_app() -> TestApp {
    create_test_app_with(DuelConfig::default())
}

/// In-memory app whose question bank accepts [`RIGHT`] for every question.
pub fn create_test_app_with(duel: DuelConfig) -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let mut config = Config::in_memory(TEST_SECRET);
    config.duel = duel;

    let bank = (0..12)
        .map(|i| Question {
            id: Uuid::new_v4(),
            body: format!("Question #{}", i),
            accepted_answers: vec![RIGHT.to_string(), "Right answer".to_string()],
            published: true,
        })
        .collect();

    let jobs = Arc::new(LocalJobQueue::new());
    let state = Arc::new(AppState::from_parts(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryQuestionSource::new(bank)),
        jobs.clone(),
    ));

    TestApp {
        router: create_router(state.clone()),
        state,
        jobs,
    }
}

impl TestApp {
    pub fn token(&self, user_id: &str) -> String {
        self.state
            .jwt
            .generate_token(JwtClaims::for_user(user_id, chrono::Duration::hours(1)))
            .unwrap()
    }

    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        user_id: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user_id) = user_id {
            builder = builder.header("authorization", format!("Bearer {}", self.token(user_id)));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send_request(request).await
    }

    pub async fn send_request(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&body).into_owned())
            })
        };
        (status, json)
    }

    pub async fn connect(&self, user_id: &str) -> Value {
        let (status, body) = self
            .send("POST", "/pair-game-quiz/pairs/connection", Some(user_id), None)
            .await;
        assert_eq!(status, StatusCode::OK, "connect failed: {}", body);
        body
    }

    pub async fn answer(&self, user_id: &str, answer: &str) -> (StatusCode, Value) {
        self.send(
            "POST",
            "/pair-game-quiz/pairs/my-current/answers",
            Some(user_id),
            Some(serde_json::json!({ "answer": answer })),
        )
        .await
    }

    pub async fn answer_ok(&self, user_id: &str, answer: &str) -> Value {
        let (status, body) = self.answer(user_id, answer).await;
        assert_eq!(status, StatusCode::OK, "answer failed: {}", body);
        body
    }

    pub async fn pair(&self, user_id: &str, duel_id: &str) -> Value {
        let (status, body) = self
            .send(
                "GET",
                &format!("/pair-game-quiz/pairs/{}", duel_id),
                Some(user_id),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK, "get pair failed: {}", body);
        body
    }

    /// Connects two users into one active duel and returns its id.
    pub async fn start_duel(&self, first: &str, second: &str) -> String {
        let pending = self.connect(first).await;
        let active = self.connect(second).await;
        assert_eq!(pending["id"], active["id"]);
        assert_eq!(active["status"], "Active");
        active["id"].as_str().unwrap().to_string()
    }

    /// Runs the timeout worker until the queue is drained.
    pub async fn drain_timeouts(&self) {
        let worker = self.state.timeout_worker();
        while worker.run_once().await.unwrap() > 0 {}
    }
}

/// Config where timeout jobs become due immediately.
pub fn immediate_timeout() -> DuelConfig {
    DuelConfig {
        finish_timeout_secs: 0,
        ..DuelConfig::default()
    }
}
