//! Access token issuance (`cgi-bin/token`)

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error};

use crate::error::{MpError, Result};

/// Lifetime used when the platform omits `expires_in`
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 7200;

/// Token returned by the issuance endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedCredential {
    pub access_token: String,
    /// Lifetime in seconds, already clamped
    pub expires_in: u64,
}

/// Source of new access tokens
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    async fn fetch(&self) -> Result<FetchedCredential>;
}

/// Token response from WeChat API
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    errcode: Option<i64>,
    #[serde(default)]
    errmsg: Option<String>,
}

/// Fetches tokens with `grant_type=client_credential`
#[derive(Clone)]
pub struct HttpCredentialFetcher {
    app_id: String,
    app_secret: String,
    api_base: String,
    max_lifetime_secs: u64,
    http_client: Client,
}

impl HttpCredentialFetcher {
    pub fn new(
        app_id: String,
        app_secret: String,
        api_base: String,
        max_lifetime_secs: u64,
        http_client: Client,
    ) -> Self {
        Self {
            app_id,
            app_secret,
            api_base,
            max_lifetime_secs,
            http_client,
        }
    }
}

#[async_trait]
impl CredentialFetcher for HttpCredentialFetcher {
    async fn fetch(&self) -> Result<FetchedCredential> {
        debug!("Fetching WeChat access token for app {}", self.app_id);

        let url = format!("{}token", self.api_base);
        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", self.app_id.as_str()),
                ("secret", self.app_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        // errcode wins over the HTTP status
        let token_resp: TokenResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(MpError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(errcode) = token_resp.errcode
            && errcode != 0
        {
            let errmsg = token_resp.errmsg.unwrap_or_default();
            error!("WeChat token error: {} - {}", errcode, errmsg);
            return Err(MpError::Api {
                code: errcode,
                message: errmsg,
            });
        }

        if !status.is_success() {
            return Err(MpError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let access_token = token_resp
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MpError::MalformedPayload("token response without access_token".into()))?;

        let declared = token_resp.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        Ok(FetchedCredential {
            access_token,
            expires_in: declared.min(self.max_lifetime_secs),
        })
    }
}
