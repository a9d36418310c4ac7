use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use relay_engine::{AgentRegistry, EngineConfig, ExecutionEngine, ExecutionTracker};
use relay_server::ServerConfig;
use relay_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "relay", about = "User-isolated agent execution engine")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9290)]
    port: u16,

    /// Hard per-run ceiling in seconds.
    #[arg(long, default_value_t = 45)]
    run_timeout_secs: u64,

    /// Per-tool-invocation timeout in seconds.
    #[arg(long, default_value_t = 30)]
    tool_timeout_secs: u64,

    /// Maximum agent steps per run.
    #[arg(long, default_value_t = 50)]
    max_steps: u32,

    /// Disable the SQLite warn+ log sink.
    #[arg(long)]
    no_log_db: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_to_sqlite: !args.no_log_db,
        ..Default::default()
    });

    tracing::info!("starting relay");

    let engine_config = EngineConfig {
        run_timeout: Duration::from_secs(args.run_timeout_secs),
        tool_timeout: Duration::from_secs(args.tool_timeout_secs),
        max_steps: args.max_steps,
        ..Default::default()
    };

    let tracker = Arc::new(ExecutionTracker::new());
    let registry = Arc::new(AgentRegistry::new());

    // Agent factories and tool capabilities are registered here by the
    // embedding deployment; the engine itself ships none.
    let engine = Arc::new(
        ExecutionEngine::new(engine_config, tracker, registry, Vec::new())
            .with_metrics(telemetry.metrics()),
    );

    let server_config = ServerConfig {
        port: args.port,
        ..Default::default()
    };
    let port = server_config.port;
    let _handle = relay_server::start(server_config, engine, telemetry.logs())
        .await
        .expect("failed to start server");

    tracing::info!(port = port, "relay ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}
