use axum::{
    extract::{FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;

use crate::handlers::ApiError;

/// Request body with a human-readable name for rejection messages.
pub trait Payload: DeserializeOwned {
    const NAME: &'static str;
}

/// JSON body extractor that rejects with the API error shape
/// (`{"message", "status": 400}`) instead of axum's plain-text rejection.
pub struct AppJson<T>(pub T);

impl<T, S> FromRequest<S> for AppJson<T>
where
    T: Payload + 'static,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| {
                let message = format!("Invalid {}: {}", T::NAME, rejection.body_text());
                tracing::warn!(status = %rejection.status(), "{}", message);
                ApiError::bad_request(message)
            })?;
        Ok(AppJson(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, response::IntoResponse};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Ping {
        text: String,
    }

    impl Payload for Ping {
        const NAME: &'static str = "ping payload";
    }

    fn json_request(body: &str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn valid_body_is_extracted() {
        let AppJson(ping) = AppJson::<Ping>::from_request(json_request(r#"{"text":"hi"}"#), &())
            .await
            .ok()
            .unwrap();
        assert_eq!(ping.text, "hi");
    }

    #[tokio::test]
    async fn rejection_names_the_payload() {
        let err = AppJson::<Ping>::from_request(json_request(r#"{"txt":"hi"}"#), &())
            .await
            .err()
            .unwrap();
        match &err {
            ApiError::BadRequest(message) => {
                assert!(message.starts_with("Invalid ping payload:"), "{}", message);
                assert!(message.contains("text"), "{}", message);
            }
            other => panic!("unexpected rejection: {:?}", other),
        }
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
