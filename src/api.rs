//! Authenticated platform calls with bounded retry
//!
//! Every attempt resolves the access token again, so a token that expired
//! (or was revoked) between attempts is replaced before the next try.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::RetryPolicy;
use crate::credential::TokenManager;
use crate::error::{MpError, Result};

/// Request body of an API call
#[derive(Debug, Clone)]
pub enum ApiBody {
    Empty,
    Json(Value),
    /// Multipart upload; the form is rebuilt for every attempt
    File {
        field: String,
        file_name: String,
        data: Vec<u8>,
    },
}

/// One platform call, without the access token
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: ApiBody,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            body: ApiBody::Empty,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            query: Vec::new(),
            body: ApiBody::Json(body),
        }
    }

    pub fn upload(
        url: impl Into<String>,
        field: impl Into<String>,
        file_name: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            query: Vec::new(),
            body: ApiBody::File {
                field: field.into(),
                file_name: file_name.into(),
                data,
            },
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Error envelope present on every JSON response
#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Client for authenticated platform calls
#[derive(Clone)]
pub struct ApiClient {
    http_client: Client,
    tokens: TokenManager,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(http_client: Client, tokens: TokenManager, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            http_client,
            tokens,
            retry,
            timeout,
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Execute the call, retrying up to the configured number of attempts
    ///
    /// Returns the raw response body; after the last failed attempt its
    /// error is returned unchanged.
    pub async fn call(&self, request: &ApiRequest) -> Result<Vec<u8>> {
        let attempts = self.retry.max_attempts.max(1);
        let mut force_refresh = false;
        let mut attempt = 0;

        loop {
            match self.attempt(request, force_refresh).await {
                Ok(body) => return Ok(body),
                Err(e) if attempt + 1 >= attempts => {
                    error!(
                        "WeChat API call {} failed after {} attempts: {}",
                        request.url, attempts, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "WeChat API call {} failed (attempt {}/{}): {}",
                        request.url,
                        attempt + 1,
                        attempts,
                        e
                    );
                    force_refresh = e.is_token_rejected();

                    let delay = self.retry.backoff(attempt);
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Execute the call and decode the JSON response
    pub async fn call_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        let body = self.call(request).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn attempt(&self, request: &ApiRequest, force_refresh: bool) -> Result<Vec<u8>> {
        let token = if force_refresh {
            self.tokens.refresh().await?
        } else {
            self.tokens.fresh().await?
        };

        let mut builder = self
            .http_client
            .request(request.method.clone(), &request.url)
            .timeout(self.timeout)
            .query(&request.query)
            .query(&[("access_token", token.as_str())]);

        builder = match &request.body {
            ApiBody::Empty => builder,
            ApiBody::Json(value) => builder.json(value),
            ApiBody::File {
                field,
                file_name,
                data,
            } => {
                let part = Part::bytes(data.clone()).file_name(file_name.clone());
                builder.multipart(Form::new().part(field.clone(), part))
            }
        };

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();

        debug!(
            "WeChat API {} {} -> {} ({} bytes)",
            request.method,
            request.url,
            status,
            body.len()
        );

        if !status.is_success() {
            return Err(MpError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        // Binary bodies (media downloads) are not JSON and pass through
        if let Ok(api_status) = serde_json::from_slice::<ApiStatus>(&body)
            && api_status.errcode != 0
        {
            return Err(MpError::Api {
                code: api_status.errcode,
                message: api_status.errmsg,
            });
        }

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CachedCredential, HttpCredentialFetcher, MemoryCredentialStore, MemoryLock};
    use chrono::Utc;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn no_backoff() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Client whose cache already holds `cached`; refreshes hit `server`
    fn test_client(server: &MockServer, cached: &str) -> ApiClient {
        let store = MemoryCredentialStore::with_credential(CachedCredential::new(
            cached.to_string(),
            Utc::now().timestamp(),
            7200,
        ));
        let fetcher = HttpCredentialFetcher::new(
            "wx123".to_string(),
            "secret".to_string(),
            format!("{}/cgi-bin/", server.uri()),
            7200,
            Client::new(),
        );
        let tokens = TokenManager::new(Arc::new(store), Arc::new(MemoryLock::new()), Arc::new(fetcher));
        ApiClient::new(Client::new(), tokens, no_backoff(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_call_appends_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/user/info"))
            .and(query_param("openid", "o1"))
            .and(query_param("access_token", "TOKEN"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"openid": "o1"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, "TOKEN");
        let request = ApiRequest::get(format!("{}/cgi-bin/user/info", server.uri())).query("openid", "o1");
        let body: Value = client.call_json(&request).await.unwrap();
        assert_eq!(body["openid"], "o1");
    }

    #[tokio::test]
    async fn test_always_failing_call_attempts_exactly_bound() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/message/custom/send"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"errcode": 45015, "errmsg": "response out of time limit"})),
            )
            .expect(3)
            .mount(&server)
            .await;

        let client = test_client(&server, "TOKEN");
        let request = ApiRequest::post_json(
            format!("{}/cgi-bin/message/custom/send", server.uri()),
            serde_json::json!({}),
        );
        let err = client.call(&request).await.unwrap_err();
        match err {
            MpError::Api { code, message } => {
                assert_eq!(code, 45015);
                assert_eq!(message, "response out of time limit");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/menu/delete"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/menu/delete"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errcode": 0, "errmsg": "ok"})))
            .mount(&server)
            .await;

        let client = test_client(&server, "TOKEN");
        let request = ApiRequest::get(format!("{}/cgi-bin/menu/delete", server.uri()));
        assert!(client.call(&request).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "NEW", "expires_in": 7200})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/menu/get"))
            .and(query_param("access_token", "REVOKED"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"errcode": 40001, "errmsg": "invalid credential"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/menu/get"))
            .and(query_param("access_token", "NEW"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"menu": {"button": []}})))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, "REVOKED");
        let request = ApiRequest::get(format!("{}/cgi-bin/menu/get", server.uri()));
        assert!(client.call(&request).await.is_ok());
        assert_eq!(client.tokens().fresh().await.unwrap(), "NEW");
    }

    #[tokio::test]
    async fn test_binary_body_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/media/get"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(vec![0xff, 0xd8, 0xff, 0xe0]),
            )
            .mount(&server)
            .await;

        let client = test_client(&server, "TOKEN");
        let request = ApiRequest::get(format!("{}/cgi-bin/media/get", server.uri())).query("media_id", "m1");
        assert_eq!(client.call(&request).await.unwrap(), vec![0xff, 0xd8, 0xff, 0xe0]);
    }
}
