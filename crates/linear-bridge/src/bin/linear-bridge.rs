//! linear-bridge - relays Linear webhooks to a LangSmith agent.
//!
//! # Environment Variables
//!
//! - `LANGSMITH_API_KEY` - agent API key (required)
//! - `LANGSMITH_API_URL` - agent deployment URL (required)
//! - `LANGSMITH_AGENT_ID` - assistant to run (required)
//! - `LINEAR_SIGNING_SECRET` - webhook signing secret
//! - `WEBHOOK_SECRET_TOKEN` - shared `?token=` value
//! - `LINEAR_EVENT_FILTER` - comma-separated event types to relay
//! - `LOG_LEVEL`, `LOG_FORMAT`, `PORT`
//!
//! A `.env` file in the working directory is loaded first if present.
//!
//! # Examples
//!
//! ```bash
//! # Run the webhook server
//! linear-bridge serve --port 8080
//!
//! # Verify credentials before deploying
//! linear-bridge check-agent --message "Say hello back"
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use linear_bridge::agent::AgentInput;
use linear_bridge::config::RunMode;
use linear_bridge::{build_router, relay_event, telemetry, AgentError, AppState, Config, LangGraphClient};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// Relay Linear webhooks to a LangSmith agent.
#[derive(Parser)]
#[command(name = "linear-bridge")]
#[command(about = "Relay Linear webhooks to a LangSmith agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server (default)
    Serve {
        /// Listen port (overrides `PORT`)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Invoke the agent once in wait mode and once streaming
    CheckAgent {
        /// Message to send
        #[arg(long, short, default_value = "Say 'hello' back to confirm you're working!")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A missing .env file is fine; real deployments use the environment.
    dotenvy::dotenv().ok();

    let mut config = Config::from_env().context("Configuration error")?;
    telemetry::init(&config.log_level, config.log_format)?;

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await
        }
        Commands::CheckAgent { message } => check_agent(&config, &message).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    info!(environment = %config.environment, "Starting Linear webhook bridge");

    for warning in config.startup_warnings() {
        warn!("{warning}");
    }
    if let Some(filter) = &config.event_filter {
        info!(event_types = ?filter, "Event type filter enabled");
    }

    let agent = LangGraphClient::new(&config.agent).context("Failed to initialize agent client")?;
    info!(
        api_url = %config.agent.api_url,
        agent_id = %config.agent.agent_id,
        run_mode = ?config.agent.run_mode,
        timeout_secs = config.agent.timeout.as_secs(),
        "Agent client initialized"
    );

    let port = config.port;
    let webhook_path = config.webhook_path.clone();
    let state = AppState::new(config, Arc::new(agent)).context("Invalid rate limit configuration")?;
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(port, webhook_path = %webhook_path, "Linear webhook bridge listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    info!("Linear webhook bridge stopped");
    Ok(())
}

async fn check_agent(config: &Config, message: &str) -> Result<()> {
    println!("Testing agent connection");
    println!("API URL:  {}", config.agent.api_url);
    println!("Agent ID: {}", config.agent.agent_id);

    let client = LangGraphClient::new(&config.agent).context("Failed to initialize agent client")?;
    let input = AgentInput::human(message);
    let mut failures = 0;

    for mode in [RunMode::Wait, RunMode::Stream] {
        let client = client.clone().with_run_mode(mode);
        let outcome = tokio::time::timeout(config.agent.timeout, relay_event(&client, &input))
            .await
            .unwrap_or(Err(AgentError::Timeout));

        match outcome {
            Ok(reply) => {
                let preview: String = reply.text.chars().take(100).collect();
                println!(
                    "{mode:?} invocation: PASS (thread {}) {preview}",
                    reply.thread_id
                );
            }
            Err(e) => {
                failures += 1;
                println!("{mode:?} invocation: FAIL - {e}");
            }
        }
    }

    if failures > 0 {
        bail!(
            "{failures} agent check(s) failed; verify LANGSMITH_API_KEY, LANGSMITH_API_URL and LANGSMITH_AGENT_ID"
        );
    }
    println!("All agent checks passed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
