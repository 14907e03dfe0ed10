use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use market_engine::config::Config;
use market_engine::engine::Engine;
use market_engine::lmsr::to_cash;
use market_engine::pg_store::PgStore;
use market_engine::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(
        default_b = config.market.default_b,
        redeem_fee = config.market.redeem_fee,
        pool = %config.market.pool_account,
        "starting market engine"
    );

    let store = PgStore::connect(
        &config.server.database_url,
        to_cash(config.market.default_balance),
    )
    .await?;
    store.migrate().await?;

    let engine = Arc::new(Engine::new(store, config.market.clone()));
    let state = AppState {
        engine,
        admin_token: config.server.admin_token.clone(),
    };
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(addr = %config.server.bind, "market engine listening");
    axum::serve(listener, app).await?;

    Ok(())
}
