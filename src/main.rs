use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crymatch::api::{self, ApiContext};
use crymatch::config::{Config, Mode};
use crymatch::director::Director;
use crymatch::matchmaker::Matchmaker;
use crymatch::plugin::PluginRegistry;
use crymatch::state::{MemoryState, RedisState, State};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Config file path comes as the first argument; without one we run
    // on defaults (standalone, in-memory state)
    let config = match env::args().nth(1) {
        Some(path) => Config::load(&path)?,
        None => {
            info!("no config file given, using defaults");
            let mut config = Config::default();
            config.validate()?;
            config
        }
    };
    let config = Arc::new(config);

    if config.certificate_path.is_some() || config.private_key_path.is_some() {
        // Termination belongs to the fronting proxy
        warn!("TLS material configured but termination is delegated, serving plain TCP");
    }

    let state: Arc<dyn State> = if config.use_redis {
        info!("connecting to redis");
        Arc::new(RedisState::connect(&config.redis_configuration_options).await?)
    } else {
        Arc::new(MemoryState::new())
    };

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // Native plugin loading lives outside this binary; pools run
    // unplugged unless a wrapper registers some
    let plugins = PluginRegistry::new();

    let director = match config.mode {
        Mode::Standalone | Mode::Director => {
            let director = Arc::new(Director::new(state.clone(), config.clone()));
            director.start().await?;
            Some(director)
        }
        Mode::Matchmaker => None,
    };

    let matchmaker = match config.mode {
        Mode::Standalone | Mode::Matchmaker => {
            let matchmaker = Arc::new(Matchmaker::new(state.clone(), config.clone(), plugins));
            matchmaker.start();
            Some(matchmaker)
        }
        Mode::Director => None,
    };

    // Only director-bearing processes expose the ticket surface
    if let Some(director) = director.clone() {
        let router = api::router(ApiContext { director });
        let listener = TcpListener::bind(&config.listen_endpoint).await?;
        info!("listening at {}", config.listen_endpoint);

        tracker.spawn({
            let token = token.clone();
            let serve = axum::serve(listener, router);
            async move {
                tokio::select! {
                    result = serve => {
                        if let Err(err) = result {
                            warn!(%err, "http server stopped");
                        }
                    },
                    () = token.cancelled() => {},
                }
            }
        });
    }

    // Wait for shutdown signal...
    tokio::signal::ctrl_c().await?;
    info!("shutting down...");

    token.cancel();
    if let Some(matchmaker) = &matchmaker {
        matchmaker.shutdown().await;
    }
    if let Some(director) = &director {
        director.shutdown().await;
    }
    tracker.close();
    tracker.wait().await;

    Ok(())
}
