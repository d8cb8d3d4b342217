//! Transit — direct file-transfer relay binary entry point.

use std::time::Duration;

use clap::Parser;

use transit::{build_router, metadata, AppState, Store, StoreConfig};

#[derive(Parser, Debug)]
#[command(name = "transit", version, about = "Direct file-transfer relay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "TRANSIT_PORT")]
    port: u16,

    /// Max chunks buffered per transfer before the sender blocks
    #[arg(long, default_value_t = 16, env = "QUEUE_DEPTH")]
    queue_depth: usize,

    /// Seconds a queue push/pop may block before failing with a timeout
    #[arg(long, default_value_t = 20, env = "QUEUE_TIMEOUT_SECS")]
    queue_timeout_secs: u64,

    /// Seconds to wait for a peer-lifecycle event (client_connected, completed)
    #[arg(long, default_value_t = 300, env = "EVENT_TIMEOUT_SECS")]
    event_timeout_secs: u64,

    /// TTL in seconds for event markers and state flags
    #[arg(long, default_value_t = 300, env = "EVENT_TTL_SECS")]
    event_ttl_secs: u64,

    /// TTL in seconds for the per-uid cleanup lock
    #[arg(long, default_value_t = 60, env = "CLEANUP_TTL_SECS")]
    cleanup_ttl_secs: u64,

    /// Interval in seconds between background TTL sweeps
    #[arg(long, default_value_t = 30, env = "CLEANUP_SWEEP_SECS")]
    cleanup_sweep_secs: u64,

    /// Maximum accepted size for an HTTP upload, in bytes
    #[arg(long, default_value_t = metadata::HTTP_MAX_SIZE, env = "MAX_HTTP_SIZE")]
    max_http_size: u64,

    /// Directory of static files served at `/`
    #[arg(long, default_value = "static", env = "STATIC_DIR")]
    static_dir: String,

    /// Disable the deprecated `/receive/<uid>` WebSocket endpoint
    #[arg(long, default_value_t = false, env = "DISABLE_LEGACY_RECEIVE")]
    disable_legacy_receive: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = StoreConfig {
        queue_depth: args.queue_depth,
        queue_timeout: Duration::from_secs(args.queue_timeout_secs),
        event_timeout: Duration::from_secs(args.event_timeout_secs),
        event_ttl: Duration::from_secs(args.event_ttl_secs),
        state_ttl: Duration::from_secs(args.event_ttl_secs),
        cleanup_ttl: Duration::from_secs(args.cleanup_ttl_secs),
    };
    let store = Store::new(config);

    let cleanup_store = store.clone();
    let sweep_interval = Duration::from_secs(args.cleanup_sweep_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            cleanup_store.sweep_expired();
            tracing::debug!("cleanup sweep ran");
        }
    });

    let state = AppState { store, max_http_size: args.max_http_size };
    let app = build_router(state, &args.static_dir, args.disable_legacy_receive);

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!(addr = %addr, "transit listening");
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}
