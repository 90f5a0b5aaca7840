//! HTTP ingress for inbound events and the webhook transport for outbound
//! actions.

pub mod server;
pub mod webhook;

pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use webhook::{LoggingTransport, WebhookTransport};
