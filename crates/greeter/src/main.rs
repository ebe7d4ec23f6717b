use std::sync::Arc;

use anyhow::{Context, Result};
use hammond_durable::{InMemoryJournalStore, InvocationOutcome, JournalStore, PostgresJournalStore};
use hammond_greeter::{
    init_telemetry, GreeterConfig, GreeterRunner, Notifier, SimulatedNotifier, TelemetryConfig,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Optional .env file; real environment variables win
    dotenvy::dotenv().ok();

    // Configure via RUST_LOG or LOG_LEVEL (default: "hammond_greeter=debug,hammond_durable=info")
    let telemetry_config = TelemetryConfig::from_env();
    init_telemetry(&telemetry_config).context("Failed to initialize logging")?;

    info!("hammond-greeter starting...");

    let config = GreeterConfig::from_env().context("Invalid configuration")?;

    let mut names: Vec<String> = std::env::args().skip(1).collect();
    if names.is_empty() {
        names = vec!["Alice".to_string(), "Bob".to_string()];
    }

    info!(
        names = ?names,
        failure_rate = config.failure_rate,
        flaky_names = ?config.flaky_names,
        reminder_delay = ?config.reminder_delay,
        max_attempts = config.driver.retry_policy.max_attempts,
        "Starting greetings"
    );

    let notifier: Arc<dyn Notifier> = Arc::new(SimulatedNotifier::new(
        config.failure_rate,
        config.flaky_names.clone(),
    ));

    match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresJournalStore::connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            store
                .migrate()
                .await
                .context("Failed to run journal migrations")?;
            info!("Using PostgreSQL journal");
            run(store, &config, notifier, &names).await
        }
        None => {
            info!("Using in-memory journal; greetings will not survive a restart");
            run(InMemoryJournalStore::new(), &config, notifier, &names).await
        }
    }
}

async fn run<S: JournalStore>(
    store: S,
    config: &GreeterConfig,
    notifier: Arc<dyn Notifier>,
    names: &[String],
) -> Result<()> {
    let runner = GreeterRunner::start(store, config, notifier);

    let recovered = runner
        .recover()
        .await
        .context("Failed to recover unfinished greetings")?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "Picked up unfinished greetings");
    }

    tokio::select! {
        results = runner.greet_all(names) => {
            for result in results? {
                match &result.outcome {
                    InvocationOutcome::Completed { output } => {
                        info!(name = %result.name, invocation_id = %result.invocation_id, %output, "Greeting completed");
                    }
                    InvocationOutcome::Failed { error } => {
                        error!(name = %result.name, invocation_id = %result.invocation_id, %error, "Greeting failed");
                    }
                    InvocationOutcome::Cancelled { reason } => {
                        warn!(name = %result.name, invocation_id = %result.invocation_id, %reason, "Greeting cancelled");
                    }
                    InvocationOutcome::Suspended { .. } => {}
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    runner.shutdown().await?;
    info!("Greeter shutdown complete");
    Ok(())
}
