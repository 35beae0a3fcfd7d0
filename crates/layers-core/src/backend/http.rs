use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{
    ndjson::decode_stream, BackendError, ChangeFeed, ChangeStream, ItemBackend, TokenRefresher,
};
use crate::auth::Session;
use crate::models::{CreateItemPayload, Item, ItemId, ItemPatch};

/// REST + NDJSON-stream client for the items backend.
///
/// * `PATCH  /items/{id}`            update
/// * `POST   /items`                 create
/// * `DELETE /items/{id}`            delete
/// * `GET    /items/changes?userId=` change stream (newline-delimited JSON)
/// * `POST   /auth/refresh`          token refresh
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    /// Separate client without a total timeout: the change stream is long-lived
    stream_client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let stream_client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok(Self {
            client,
            stream_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(request: RequestBuilder) -> Result<Response, BackendError> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        check_status(response).await
    }

    async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, BackendError> {
        Self::send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

/// Map non-success statuses onto the error taxonomy
async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(BackendError::Unauthorized),
        StatusCode::NOT_FOUND => Err(BackendError::NotFound(response.url().path().to_string())),
        _ => {
            let message = response.text().await.unwrap_or_default();
            Err(BackendError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl ItemBackend for HttpBackend {
    async fn update_item(
        &self,
        token: &str,
        id: &ItemId,
        patch: &ItemPatch,
    ) -> Result<Item, BackendError> {
        let request = self
            .client
            .patch(self.url(&format!("/items/{}", id)))
            .bearer_auth(token)
            .json(patch);
        Self::send_json(request).await
    }

    async fn create_item(
        &self,
        token: &str,
        payload: &CreateItemPayload,
    ) -> Result<Item, BackendError> {
        let request = self
            .client
            .post(self.url("/items"))
            .bearer_auth(token)
            .json(payload);
        Self::send_json(request).await
    }

    async fn delete_item(&self, token: &str, id: &ItemId) -> Result<(), BackendError> {
        let request = self
            .client
            .delete(self.url(&format!("/items/{}", id)))
            .bearer_auth(token);
        Self::send(request).await.map(|_| ())
    }
}

#[async_trait]
impl ChangeFeed for HttpBackend {
    async fn subscribe(&self, token: &str, user_id: &str) -> Result<ChangeStream, BackendError> {
        let request = self
            .stream_client
            .get(self.url("/items/changes"))
            .query(&[("userId", user_id)])
            .header(reqwest::header::ACCEPT, "application/x-ndjson")
            .bearer_auth(token);
        let response = Self::send(request).await?;
        Ok(decode_stream(response.bytes_stream()))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

#[async_trait]
impl TokenRefresher for HttpBackend {
    async fn refresh(&self, refresh_token: &str) -> Result<Session, BackendError> {
        let request = self
            .client
            .post(self.url("/auth/refresh"))
            .json(&serde_json::json!({ "refreshToken": refresh_token }));
        let body: RefreshResponse = Self::send_json(request).await?;
        Ok(Session::expiring_in(
            body.access_token,
            body.refresh_token,
            body.expires_in,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let backend = HttpBackend::new("https://api.example.test/", Duration::from_secs(5)).unwrap();
        assert_eq!(backend.url("/items"), "https://api.example.test/items");
    }

    #[test]
    fn test_refresh_response_shape() {
        let body: RefreshResponse = serde_json::from_str(
            r#"{"accessToken":"a2","refreshToken":"r2","expiresIn":3600}"#,
        )
        .unwrap();
        assert_eq!(body.access_token, "a2");
        assert_eq!(body.expires_in, 3600);
    }
}
