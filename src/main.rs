use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use escrow_core::config::{Config, PaymentMode};
use escrow_core::ports::{ChargeAuthority, IdentityProvider, MarketplaceHooks};
use escrow_core::services::EscrowCoordinator;
use escrow_core::store::SqliteTransactionStore;
use escrow_core::upstream::{
    HttpChargeAuthority, HttpIdentityProvider, HttpMarketplaceHooks, NoopMarketplaceHooks,
    SandboxChargeAuthority, StaticIdentityProvider,
};
use escrow_core::{AppState, create_app};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = Arc::new(SqliteTransactionStore::connect(&config.database_url).await?);
    tracing::info!(database_url = %config.database_url, "transaction store ready");

    let (charges, identity): (Arc<dyn ChargeAuthority>, Arc<dyn IdentityProvider>) =
        match config.payment_mode {
            PaymentMode::Live => {
                let charge_url = config
                    .charge_authority_url
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("CHARGE_AUTHORITY_URL is required in live mode"))?;
                let secret = config
                    .charge_authority_secret
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("CHARGE_AUTHORITY_SECRET is required in live mode"))?;
                let identity_url = config
                    .identity_url
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("IDENTITY_URL is required in live mode"))?;
                tracing::info!(charge_authority_url = %charge_url, "live payment mode");
                (
                    Arc::new(HttpChargeAuthority::new(
                        charge_url,
                        secret,
                        config.upstream_timeout_secs,
                    )),
                    Arc::new(HttpIdentityProvider::new(
                        identity_url,
                        config.upstream_timeout_secs,
                    )),
                )
            }
            PaymentMode::Sandbox => {
                tracing::warn!("sandbox payment mode: charges are simulated, no funds move");
                let mut directory = StaticIdentityProvider::new();
                for user in &config.sandbox_users {
                    directory = directory
                        .with_token(&user.token, &user.subject_id)
                        .with_user(&user.subject_id, Some(&user.school_domain), None);
                }
                (Arc::new(SandboxChargeAuthority::new()), Arc::new(directory))
            }
        };

    let hooks: Arc<dyn MarketplaceHooks> = match &config.marketplace_url {
        Some(url) => Arc::new(HttpMarketplaceHooks::new(
            url.clone(),
            config.upstream_timeout_secs,
        )),
        None => Arc::new(NoopMarketplaceHooks),
    };

    let coordinator = Arc::new(EscrowCoordinator::new(
        store.clone(),
        charges,
        identity.clone(),
        hooks,
        config.currency.clone(),
    ));

    let state = AppState {
        coordinator,
        identity,
        store,
    };
    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
