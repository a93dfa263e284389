//! Linear webhook bridge for LangSmith-hosted agents.
//!
//! This crate provides:
//! - Webhook payload parsing and signature verification
//! - Per-client sliding-window rate limiting
//! - Formatting of Linear events into agent prompts
//! - A LangGraph-compatible agent client (wait and streaming runs)
//! - The HTTP server tying the pieces together

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod agent;
pub mod config;
pub mod format;
pub mod rate_limit;
pub mod server;
pub mod telemetry;
pub mod webhooks;

pub use agent::{relay_event, AgentClient, AgentError, AgentReply, LangGraphClient};
pub use config::{Config, ConfigError};
pub use format::format_linear_event;
pub use rate_limit::{RateLimitError, RateLimiter};
pub use server::{build_router, AppState};
pub use webhooks::{verify_webhook_signature, WebhookPayload};
