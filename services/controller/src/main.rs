// controller: Orchestrates long-running live broadcasts for field sites.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use controller::clock::SystemClock;
use controller::config;
use controller::device::StoreDeviceStore;
use controller::driver::TickDriver;
use controller::forward::HttpForwarder;
use controller::http::{AppState, router};
use controller::media::StoreMediaStore;
use controller::notify::LogNotifier;
use controller::platform::DisconnectedPlatform;
use controller::store::SqliteStore;
use controller::system::TickDeps;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "controller starting");

    let cfg = match config::load_config() {
        Ok(cfg) => {
            info!(bind = %cfg.server.bind, store = %cfg.store.sqlite_path, "config loaded");
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let store = match SqliteStore::open(Path::new(&cfg.store.sqlite_path)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("FATAL: failed to open store: {e}");
            std::process::exit(1);
        }
    };

    let deps = TickDeps {
        store: store.clone(),
        devices: Arc::new(StoreDeviceStore::new(store.clone())),
        media: Arc::new(StoreMediaStore::new(store.clone())),
        // Platform bindings are injected by the deployment build; the
        // default build runs disconnected.
        platform: Arc::new(DisconnectedPlatform),
        forwarder: Arc::new(HttpForwarder::new(store.clone())),
        notifier: Arc::new(LogNotifier),
        clock: Arc::new(SystemClock),
        background_start: cfg.background_start,
        hooks: Vec::new(),
    };
    let driver = Arc::new(TickDriver::new(deps));

    let state = AppState {
        store: store.clone(),
        driver,
    };
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(&cfg.server.bind).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: cannot bind {}: {e}", cfg.server.bind);
            std::process::exit(1);
        }
    };
    info!(bind = %cfg.server.bind, "listening");
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("FATAL: server error: {e}");
        std::process::exit(1);
    }
}
