use pr_metrics::config::AppConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // A missing .env file is fine; the environment may already be populated.
    dotenvy::dotenv().ok();

    // Initialize tracing (logging)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pr_metrics=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {:#}. Exiting.", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Analyzing {} repositories, time range: last {} days",
        config.repositories.len(),
        config.time_range_days
    );

    match pr_metrics::run(&config).await {
        Ok(summary) => {
            if !summary.failed_repositories.is_empty() {
                tracing::warn!(
                    failed = ?summary.failed_repositories,
                    "Some repositories could not be collected"
                );
            }
            tracing::info!(
                "Results saved to: {} ({} PRs collected, {} rows total)",
                config.metrics_file_path.display(),
                summary.collected,
                summary.stored
            );
        }
        Err(e) => {
            tracing::error!("Fatal error: {:#}", e);
            std::process::exit(1);
        }
    }
}
