use axum::http::StatusCode;
use quiz_duel_api::{
    config::DuelConfig,
    services::matchmaking_service::Connection,
};
use std::collections::HashSet;

mod common;

use common::{create_test_app, create_test_app_with, TestApp, RIGHT, WRONG};

async fn play_out(app: &TestApp, first: &str, second: &str, first_correct: usize) -> String {
    let duel_id = app.start_duel(first, second).await;
    for i in 0..5 {
        app.answer_ok(first, if i < first_correct { RIGHT } else { WRONG })
            .await;
    }
    for _ in 0..5 {
        app.answer_ok(second, WRONG).await;
    }
    duel_id
}

#[tokio::test]
async fn test_statistics_aggregate_all_games() {
    let app = create_test_app();
    play_out(&app, "alice", "bob", 2).await;
    play_out(&app, "bob", "alice", 0).await;
    play_out(&app, "alice", "carol", 0).await;

    let (status, stats) = app
        .send("GET", "/pair-game-quiz/users/my-statistic", Some("alice"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    // 3 (2 + bonus) + 0 + 0
    assert_eq!(stats["gamesCount"], 3);
    assert_eq!(stats["sumScore"], 3);
    assert_eq!(stats["avgScores"], 1.0);
    assert_eq!(stats["winsCount"], 1);
    assert_eq!(stats["lossesCount"], 0);
    assert_eq!(stats["drawsCount"], 2);

    let (_, nobody) = app
        .send("GET", "/pair-game-quiz/users/my-statistic", Some("dave"), None)
        .await;
    assert_eq!(nobody["gamesCount"], 0);
    assert_eq!(nobody["avgScores"], 0.0);
}

#[tokio::test]
async fn test_history_is_paginated_newest_first() {
    let app = create_test_app();
    let first = play_out(&app, "alice", "bob", 1).await;
    let second = play_out(&app, "alice", "carol", 1).await;
    let third = app.connect("alice").await["id"].as_str().unwrap().to_string();

    let (status, page) = app
        .send(
            "GET",
            "/pair-game-quiz/pairs/my?pageSize=2&pageNumber=1",
            Some("alice"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["totalCount"], 3);
    assert_eq!(page["pagesCount"], 2);
    assert_eq!(page["page"], 1);
    assert_eq!(page["pageSize"], 2);
    let items = page["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["id"], third.as_str());
    assert_eq!(items[1]["id"], second.as_str());

    let (_, last) = app
        .send(
            "GET",
            "/pair-game-quiz/pairs/my?pageSize=2&pageNumber=2",
            Some("alice"),
            None,
        )
        .await;
    let items = last["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], first.as_str());

    let (_, asc) = app
        .send(
            "GET",
            "/pair-game-quiz/pairs/my?sortBy=pairCreatedDate&sortDirection=asc",
            Some("alice"),
            None,
        )
        .await;
    assert_eq!(asc["items"][0]["id"], first.as_str());
    assert_eq!(asc["pageSize"], 10);
}

#[tokio::test]
async fn test_history_rejects_bad_paging() {
    let app = create_test_app();

    let (status, body) = app
        .send("GET", "/pair-game-quiz/pairs/my?pageSize=0", Some("alice"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);

    let (status, _) = app
        .send("GET", "/pair-game-quiz/pairs/my?pageNumber=abc", Some("alice"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_pair_everyone_exactly_once() {
    let app = create_test_app_with(DuelConfig {
        transaction_retries: 20,
        retry_backoff_ms: 5,
        ..DuelConfig::default()
    });

    let users: Vec<String> = (0..8).map(|i| format!("player-{}", i)).collect();
    let mut handles = Vec::new();
    for user in users.clone() {
        let state = app.state.clone();
        handles.push(tokio::spawn(async move {
            state.matchmaking.connect(&user).await
        }));
    }

    let mut created = 0;
    let mut duels = HashSet::new();
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Connection::Created(id) => {
                created += 1;
                duels.insert(id);
            }
            Connection::Matched(id) => {
                duels.insert(id);
            }
        }
    }
    assert_eq!(created, 4);
    assert_eq!(duels.len(), 4);

    for user in &users {
        let (status, current) = app
            .send("GET", "/pair-game-quiz/pairs/my-current", Some(user), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(current["status"], "Active", "{} is not in an active pair", user);
    }
}
