//! Signoff server binary.
//!
//! Loads configuration from the environment (with `.env` support), wires
//! the service container, registers task handlers, and serves the REST
//! façade until Ctrl-C. Shutdown is cooperative: in-flight requests and
//! the timeout manager's current tick are allowed to finish.

mod http;
mod state;

use std::sync::Arc;

use clap::Parser;

use signoff_core::task::TaskRegistry;
use signoff_infra::config::OrchestratorConfig;

use crate::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "signoff", about = "Human-in-the-loop workflow orchestrator")]
struct Args {
    /// Address to bind.
    #[arg(long, env = "SIGNOFF_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind.
    #[arg(long, env = "SIGNOFF_PORT", default_value_t = 8080)]
    port: u16,

    /// Export spans via OpenTelemetry (stdout exporter).
    #[arg(long, default_value_t = false)]
    otel: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    signoff_observe::tracing_setup::init_tracing(args.otel)
        .map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))?;

    let config = OrchestratorConfig::from_env();

    // Task handlers are registered at startup; deployments add their own
    // here or through a build of this binary that links them in.
    let registry = Arc::new(TaskRegistry::new());
    registry.register("noop", |input| async move { Ok(input) });

    let (state, runtime) = AppState::init(config, registry).await?;
    let bus = state.bus.clone();
    let router = http::router::build_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = addr.as_str(), "signoff listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    runtime.shutdown(&bus).await;
    signoff_observe::tracing_setup::shutdown_tracing();
    Ok(())
}
