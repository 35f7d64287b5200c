use anyhow::Context;
use keel_core::config::Config;
use keel_core::{init_core, shutdown};
use keel_net::{build_client, WalletSigner};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // File-based logging, since the TUI owns stdout.
    let file_appender = tracing_appender::rolling::daily("logs", "keel.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt().with_writer(non_blocking).init();

    tracing::info!("booting keel");

    let config_path =
        std::env::var("KEEL_CONFIG").unwrap_or_else(|_| "keel.toml".to_string());
    let config = Config::load_or_default(Path::new(&config_path));

    // The wallet daemon holds the keys; without it there is nothing to
    // sign with and no identity to orchestrate.
    let wallet_client = build_client(None, Duration::from_secs(10))?;
    let signer = Arc::new(
        WalletSigner::connect(wallet_client, &config.wallet_url)
            .await
            .with_context(|| format!("wallet daemon unreachable at {}", config.wallet_url))?,
    );

    let ctx = init_core(config, signer).await?;

    // Run TUI (blocking until 'q')
    keel_tui::run_tui(ctx.clone()).await?;

    shutdown(&ctx).await;
    tracing::info!("shutdown complete");
    Ok(())
}
