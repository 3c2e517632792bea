use std::sync::Arc;

use anyhow::Context;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{error, info, warn};

use textile_draft::{
    config::Config,
    observability::Telemetry,
    pipeline::{
        DraftPipeline,
        cluster::KMeansAssigner,
        normalize::Normalizer,
        persist::{CsvDirectorySink, LoomPayload, MatrixSink},
    },
    runner::{block_on_detached, build_runtime, run_blocking},
    table::FeatureTable,
};

fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(String::as_str)
            })
            .unwrap_or("unknown panic payload");

        match panic_info.location() {
            Some(location) => error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                message,
                "panic occurred"
            ),
            None => error!(thread = thread_name, message, "panic occurred"),
        }
    }));

    let runtime = build_runtime().context("failed to create tokio runtime")?;
    // A pipeline abandoned at its deadline is still running; exit without joining it.
    block_on_detached(runtime, async {
        let telemetry = Telemetry::new().context("failed to initialize telemetry")?;
        let result = run(&telemetry).await;
        if let Err(e) = &result {
            error!(error = %format!("{e:#}"), "textile-draft run failed");
        }
        telemetry.shutdown();
        result
    })
}

async fn run(telemetry: &Telemetry) -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    info!(input = %config.input_path().display(), "configuration loaded");

    let table = FeatureTable::from_csv_path(config.input_path(), config.table())
        .with_context(|| format!("failed to load {}", config.input_path().display()))?;
    let request = config.request();
    if request.is_randomized() {
        warn!("run uses randomized parameters; resolved values are logged for replay");
    }
    let params = request.resolve(&mut StdRng::from_os_rng(), chrono::Utc::now());

    let pipeline = DraftPipeline::builder()
        .normalizer(Normalizer::new(config.normalize_epsilon()))
        .assigner(Arc::new(KMeansAssigner::new(*config.kmeans())))
        .metrics(telemetry.metrics())
        .build();

    let output = run_blocking(config.run_timeout(), move || pipeline.run(&table, &params))
        .await
        .context("draft pipeline did not complete")?
        .context("draft pipeline failed")?;

    match config.output_dir() {
        Some(dir) => {
            let receipt = CsvDirectorySink::new(dir)
                .write(&output.matrices, output.clusters)
                .context("failed to persist matrices")?;
            info!(directory = %receipt.directory.display(), "draft written");
        }
        None => {
            let payload = LoomPayload::from(&output.matrices);
            let json = serde_json::to_string(&payload).context("failed to encode payload")?;
            println!("{json}");
        }
    }

    if let Some(path) = config.metrics_path() {
        std::fs::write(path, telemetry.render_prometheus())
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
    }
    Ok(())
}
