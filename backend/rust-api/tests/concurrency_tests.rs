use quiz_duel_api::{
    config::DuelConfig,
    error::DuelError,
    services::{duel_answer_service::ALL_QUESTIONS_ANSWERED, timeout_finisher::FinishOutcome},
};

mod common;

use common::{create_test_app_with, TestApp, RIGHT};

fn contended() -> DuelConfig {
    DuelConfig {
        transaction_retries: 40,
        retry_backoff_ms: 2,
        ..DuelConfig::default()
    }
}

async fn answered(app: &TestApp, user: &str, count: usize) {
    for _ in 0..count {
        app.answer_ok(user, RIGHT).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_answers_from_one_player_fill_slots_in_order() {
    let app = create_test_app_with(contended());
    let duel_id = app.start_duel("alice", "bob").await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let state = app.state.clone();
        handles.push(tokio::spawn(async move {
            state.answers.answer("alice", RIGHT).await
        }));
    }

    let mut accepted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(DuelError::Forbidden(message)) => {
                assert_eq!(message, ALL_QUESTIONS_ANSWERED);
                rejected += 1;
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(accepted, 5);
    assert_eq!(rejected, 5);

    let pair = app.pair("alice", &duel_id).await;
    let answers = pair["firstPlayerProgress"]["answers"].as_array().unwrap();
    let questions = pair["questions"].as_array().unwrap();
    assert_eq!(answers.len(), 5);
    for (answer, question) in answers.iter().zip(questions) {
        assert_eq!(answer["questionId"], question["id"]);
    }
    assert_eq!(pair["firstPlayerProgress"]["score"], 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_last_answers_finish_the_duel_once() {
    for _ in 0..10 {
        let app = create_test_app_with(contended());
        let duel_id = app.start_duel("alice", "bob").await;
        answered(&app, "alice", 4).await;
        answered(&app, "bob", 4).await;

        let alice = {
            let state = app.state.clone();
            tokio::spawn(async move { state.answers.answer("alice", RIGHT).await })
        };
        let bob = {
            let state = app.state.clone();
            tokio::spawn(async move { state.answers.answer("bob", RIGHT).await })
        };
        let alice = alice.await.unwrap().unwrap();
        let bob = bob.await.unwrap().unwrap();

        assert!(alice.finished != bob.finished, "exactly one answer closes the duel");
        assert!(alice.timeout_scheduled != bob.timeout_scheduled);
        assert_eq!(app.jobs.pending().len(), 1);

        let pair = app.pair("alice", &duel_id).await;
        assert_eq!(pair["status"], "Finished");
        let mut scores = vec![
            pair["firstPlayerProgress"]["score"].as_i64().unwrap(),
            pair["secondPlayerProgress"]["score"].as_i64().unwrap(),
        ];
        scores.sort();
        assert_eq!(scores, vec![5, 6]);
        // the player who committed first holds the bonus
        let first_finisher = if bob.finished {
            "firstPlayerProgress"
        } else {
            "secondPlayerProgress"
        };
        assert_eq!(pair[first_finisher]["score"], 6);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_racing_the_last_answer_finishes_once() {
    for _ in 0..10 {
        let app = create_test_app_with(contended());
        let duel_id = app.start_duel("alice", "bob").await;
        answered(&app, "alice", 5).await;
        answered(&app, "bob", 4).await;

        let id: uuid::Uuid = duel_id.parse().unwrap();
        let finisher = {
            let state = app.state.clone();
            tokio::spawn(async move { state.finisher.finish_by_timeout(id).await })
        };
        let last_answer = {
            let state = app.state.clone();
            tokio::spawn(async move { state.answers.answer("bob", RIGHT).await })
        };
        let finished_by_timeout = finisher.await.unwrap().unwrap();
        let last_answer = last_answer.await.unwrap();

        let pair = app.pair("alice", &duel_id).await;
        assert_eq!(pair["status"], "Finished");
        assert_eq!(pair["firstPlayerProgress"]["score"], 6);

        match last_answer {
            Ok(outcome) => {
                assert!(outcome.finished);
                assert_eq!(finished_by_timeout, FinishOutcome::Skipped);
                assert_eq!(pair["secondPlayerProgress"]["score"], 5);
            }
            Err(DuelError::Forbidden(_)) => {
                assert_eq!(finished_by_timeout, FinishOutcome::Finished);
                assert_eq!(pair["secondPlayerProgress"]["score"], 4);
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
}
