//! WeChat webhook demo server
//!
//! Verifies callbacks from the WeChat Official Account platform, echoes text
//! messages back to the sender and greets new followers.

use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weixinmp::webhook::{self, WebhookState};
use weixinmp::{InboundEvent, InboundMessage, InboundPayload, MessageHandler, MpConfig, OutboundMessage};

/// Echoes text and greets subscribers
struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, message: &InboundMessage) -> Option<OutboundMessage> {
        match message.payload() {
            InboundPayload::Text { content } => Some(OutboundMessage::text(content)),
            InboundPayload::Event(InboundEvent::Subscribe { .. }) => {
                Some(OutboundMessage::text("Welcome!"))
            }
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,weixinmp=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 WeChat webhook starting...");

    // Load configuration
    let config = MpConfig::from_env()?;
    info!("📋 Configuration loaded for app {}", config.app_id);

    let addr: SocketAddr = config.webhook_addr.parse()?;
    let state = WebhookState::new(config.token.clone(), Arc::new(EchoHandler));

    let server = tokio::spawn(async move {
        if let Err(e) = webhook::run_server(addr, state).await {
            tracing::error!("Webhook server error: {}", e);
        }
    });

    info!("🌐 Webhook server listening on {}", config.webhook_addr);

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => info!("📢 Shutdown signal received"),
        Err(err) => tracing::error!("Unable to listen for shutdown signal: {}", err),
    }

    server.abort();
    info!("✅ WeChat webhook stopped");
    Ok(())
}
