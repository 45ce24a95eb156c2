//! WeChat Official Account SDK
//!
//! Server side: verify webhook signatures, parse inbound messages and events,
//! answer them with passive replies.
//!
//! Client side: access token management with a shared on-disk cache, plus
//! the customer service, QR code, menu, media and user APIs.
//!
//! # Architecture
//!
//! ```text
//! WeChat Server ──HTTP──▶ webhook (Validator ─▶ MessageHandler ─▶ Reply XML)
//!
//! Weixinmp ──▶ ApiClient (retry) ──▶ TokenManager ──▶ CredentialStore + RefreshLock
//!                                          └────────▶ CredentialFetcher (cgi-bin/token)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use weixinmp::{MpConfig, OutboundMessage, Weixinmp};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = MpConfig::new("token", "wx1234567890abcdef", "app_secret");
//! let mp = Weixinmp::new(&config)?;
//! mp.send_message("openid", &OutboundMessage::text("Hello")).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod error;
pub mod message;
pub mod types;
pub mod webhook;
pub mod wechat_api;

pub use api::{ApiBody, ApiClient, ApiRequest};
pub use config::{MpConfig, RetryPolicy};
pub use credential::TokenManager;
pub use error::{MpError, Result};
pub use message::{Article, MessageHeader, Music, OutboundMessage, Reply, Video};
pub use types::{InboundEvent, InboundMessage, InboundPayload, MsgType, SignatureParams};
pub use webhook::{MessageHandler, Rejection, Validated, Validator, WebhookState};
pub use wechat_api::{Button, MediaType, QrTicket, UploadedMedia, UserInfo, Weixinmp};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::MpConfig;
    pub use crate::error::{MpError, Result};
    pub use crate::message::{OutboundMessage, Reply};
    pub use crate::types::*;
    pub use crate::webhook::MessageHandler;
    pub use crate::wechat_api::Weixinmp;
}
