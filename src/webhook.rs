//! WeChat webhook validation and HTTP handlers
//!
//! - GET request: URL verification handshake, echoes `echostr`
//! - POST request: message delivery, answered with a passive reply

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{Method, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::crypto;
use crate::error::MpError;
use crate::message::{OutboundMessage, Reply};
use crate::types::{InboundMessage, SignatureParams};

/// WeChat drops the connection if no reply arrives within 5 seconds
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Validation
// =============================================================================

/// Outcome of a request that passed validation
#[derive(Debug, Clone)]
pub enum Validated {
    /// Verification probe; respond with this `echostr`
    Handshake(String),
    /// Message or event delivery
    Delivery(Box<InboundMessage>),
}

/// Reason a request was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Signature mismatch
    Unauthorized,
    /// Body could not be parsed
    BadRequest(String),
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
            Rejection::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
        }
    }
}

impl From<Rejection> for MpError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Unauthorized => MpError::InvalidSignature,
            Rejection::BadRequest(reason) => MpError::MalformedPayload(reason),
        }
    }
}

/// Validates inbound webhook requests against the shared token
#[derive(Debug, Clone)]
pub struct Validator {
    token: String,
}

impl Validator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Check the signature, then tell the handshake apart from a delivery
    pub fn validate(
        &self,
        method: &Method,
        params: &SignatureParams,
        body: &[u8],
    ) -> Result<Validated, Rejection> {
        if !crypto::verify(&self.token, &params.timestamp, &params.nonce, &params.signature) {
            warn!("Invalid signature in webhook request");
            return Err(Rejection::Unauthorized);
        }

        if method != Method::POST {
            return Ok(Validated::Handshake(params.echostr.clone()));
        }

        let parsed: Result<InboundMessage, _> = serde_xml_rs::from_reader(body);
        match parsed {
            Ok(message) => Ok(Validated::Delivery(Box::new(message))),
            Err(e) => {
                error!("Failed to parse message XML: {}", e);
                Err(Rejection::BadRequest(e.to_string()))
            }
        }
    }
}

// =============================================================================
// Application Hook
// =============================================================================

/// Application logic answering inbound messages
///
/// Returning `None` acknowledges the delivery with an empty body.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Option<OutboundMessage>;
}

// =============================================================================
// HTTP Server
// =============================================================================

/// Webhook server state
#[derive(Clone)]
pub struct WebhookState {
    pub validator: Validator,
    pub handler: Arc<dyn MessageHandler>,
    pub reply_timeout: Duration,
}

impl WebhookState {
    pub fn new(token: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            validator: Validator::new(token),
            handler,
            reply_timeout: REPLY_TIMEOUT,
        }
    }
}

/// Build the webhook router
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/wechat/webhook", get(handle_webhook).post(handle_webhook))
        .route("/health", get(health_check))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Run the webhook HTTP server
pub async fn run_server(addr: SocketAddr, state: WebhookState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Middleware to log all incoming HTTP requests
async fn log_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("🌐 HTTP {} {}", method, path);

    let response = next.run(req).await;

    info!("📤 Response status: {}", response.status());

    response
}

/// Verification handshake (GET) and message delivery (POST)
async fn handle_webhook(
    State(state): State<WebhookState>,
    method: Method,
    Query(params): Query<SignatureParams>,
    body: Bytes,
) -> Response {
    debug!(
        "📥 Webhook {}: timestamp={}, nonce={}, body={} bytes",
        method,
        params.timestamp,
        params.nonce,
        body.len()
    );

    let message = match state.validator.validate(&method, &params, &body) {
        Ok(Validated::Handshake(echostr)) => {
            info!("Webhook verification successful");
            return echostr.into_response();
        }
        Ok(Validated::Delivery(message)) => message,
        Err(rejection) => return rejection.into_response(),
    };

    info!(
        "Received {:?} message from user {}",
        message.msg_type, message.from_user_name
    );

    let outbound = match timeout(state.reply_timeout, state.handler.handle(&message)).await {
        Ok(outbound) => outbound,
        Err(_) => {
            warn!("Timeout waiting for message handler");
            None
        }
    };

    let Some(outbound) = outbound else {
        return StatusCode::OK.into_response();
    };

    match Reply::to(&message, outbound).to_xml() {
        Ok(xml) => ([(header::CONTENT_TYPE, "application/xml")], xml).into_response(),
        Err(e) => {
            error!("Failed to render reply: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
