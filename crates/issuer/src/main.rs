use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ads_confirmations::tokens::Base64Encoding;
use issuer::{IssuerConfig, IssuerState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "issuer=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting token issuer");

    dotenvy::dotenv().ok();
    let config = IssuerConfig::from_env()?;

    info!("Issuer name: {}", config.name);
    info!("Listening on: {}:{}", config.host, config.port);

    let state = Arc::new(IssuerState::new(config)?);
    info!(
        "Public key: {} (valid until {})",
        state.signer.public_key().encode_base64(),
        state.signer.issuer().valid_until
    );

    issuer::run(state).await?;
    Ok(())
}
