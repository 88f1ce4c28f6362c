use payouts::bootstrap;
use payouts::config::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: payouts <stats | rehearse <intent.json>>";

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,payouts=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    info!(
        mechanism = %config.mechanism,
        ledger = %config.ledger_path().display(),
        "🚀 Starting payout pipeline"
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("stats") => {
            let stats = bootstrap::stats(&config).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Some("rehearse") => {
            let intent = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("missing intent file\n{}", USAGE))?;

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("⚠️ Interrupt received, stopping after the current step");
                    interrupt.cancel();
                }
            });

            let report = bootstrap::rehearse(&config, intent, cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                anyhow::bail!("audit found discrepancies");
            }
        }
        _ => anyhow::bail!(USAGE),
    }

    Ok(())
}
