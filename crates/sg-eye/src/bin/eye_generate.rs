use std::sync::Arc;

use anyhow::Context;
use sg_compute::ProcessLauncher;
use sg_data::ParameterTableLoader;
use sg_engine::{CancelFlag, DataGenerator, LogSink, Notifier};
use sg_eye::Experiment;
use sg_types::{secs_to_duration, HarnessConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SG_CONFIG").ok())
        .context("usage: eye-generate <config.json> (or set SG_CONFIG)")?;
    let config = HarnessConfig::from_file(&path).with_context(|| format!("loading {path}"))?;
    let experiment: Experiment = config.experiment.parse()?;
    let catalog = ParameterTableLoader::new()
        .load(&config.generator.parameter_table)
        .with_context(|| format!("loading {}", config.generator.parameter_table.display()))?;
    tracing::info!("Loaded {} parameters for {}", catalog.len(), experiment);

    let cancel = CancelFlag::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping after the current samples");
            interrupt.cancel();
        }
    });

    // the webhook client is blocking and must not be built on a runtime thread
    let summary = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
        let interval = config.generator.notification_interval_secs;
        let mut notifier = Notifier::from_config(&config.notifications, interval)?;
        if !notifier.is_enabled() && interval > 0.0 {
            notifier = Notifier::new(secs_to_duration(interval)).with_sink(Box::new(LogSink));
        }

        let mut generator = DataGenerator::new(config, Arc::new(catalog))?
            .with_launcher(Arc::new(ProcessLauncher::new()))
            .with_notifier(notifier)
            .with_cancel_flag(cancel);
        experiment.register(&mut generator)?;

        let data = generator.generate_training_data()?;
        let stats = generator.store().stats()?;
        Ok(format!(
            "{} rows in {} datasets (key {}, {}); {} failed samples, {} rows removed; {} files, {:.2} MB in {}",
            data.num_rows(),
            data.tables.len(),
            data.key,
            if data.from_cache { "cached" } else { "generated" },
            data.error_count,
            data.removed_rows,
            stats.total_files,
            stats.total_size_mb(),
            stats.data_root.display()
        ))
    })
    .await??;

    tracing::info!("Done: {}", summary);
    Ok(())
}
