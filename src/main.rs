use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{info, warn};

use lorebase::api;
use lorebase::core::config::Config;
use lorebase::AppState;

fn parse_port_from_args() -> Option<u16> {
    let mut args = std::env::args().peekable();
    while let Some(a) = args.next() {
        if a == "--port" {
            if let Some(v) = args.next() {
                if let Ok(p) = v.parse::<u16>() {
                    return Some(p);
                }
            }
        } else if let Some(rest) = a.strip_prefix("--port=") {
            if let Ok(p) = rest.parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::load();
    if let Err(e) = config.validate() {
        eprintln!("configuration error: {e:#}");
        std::process::exit(1);
    }
    let port = parse_port_from_args().unwrap_or(config.port);

    info!("starting lorebase");
    let state = match AppState::init(config).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            eprintln!("startup failed: {e:#}");
            std::process::exit(1);
        }
    };

    // Background freshness loop, opt-in.
    if state.config.auto_refresh {
        info!(
            "auto-refresh enabled (interval: {}s)",
            state.config.refresh_interval_secs
        );
        let refresher = state.refresher.clone();
        tokio::spawn(async move { refresher.run_loop().await });
    } else {
        info!("auto-refresh disabled; use POST /refresh to run a pass");
    }

    let app = api::router(state.clone());
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    let stop = state.stop.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {}", e);
                return;
            }
            info!("shutdown requested, stopping workers");
            stop.store(true, Ordering::SeqCst);
        })
        .await?;

    Ok(())
}
