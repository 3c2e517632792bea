use anyhow::{Context, Error, Result};
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use super::structured_log::StructuredLogLayer;

const SERVICE_NAME: &str = "textile-draft";

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

/// Tracing サブスクライバを一度だけ初期化する。
///
/// ログは stderr に JSON で出力する（stdout は行列ペイロード用）。
/// `OTEL_EXPORTER_OTLP_ENDPOINT` があれば OTLP レイヤーを、なければ
/// [`StructuredLogLayer`] を追加する。OTLP の初期化失敗は警告のみで続行する。
///
/// # Errors
/// サブスクライバの初期化に失敗した場合はエラーを返す。
pub fn init() -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .json();

        let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
        let (otel_layer, otel_error) = match endpoint.as_deref().map(init_provider) {
            Some(Ok(provider)) => {
                let tracer = provider.tracer(SERVICE_NAME);
                let _ = TRACER_PROVIDER.set(provider);
                (Some(tracing_opentelemetry::layer().with_tracer(tracer)), None)
            }
            Some(Err(e)) => (None, Some(e)),
            None => (None, None),
        };
        let otel_enabled = otel_layer.is_some();
        let structured_layer = (!otel_enabled).then_some(StructuredLogLayer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .with(structured_layer)
            .try_init()
            .map_err(|e| Error::msg(e.to_string()))?;

        if let Some(e) = otel_error {
            warn!(error = %e, "OTLP exporter unavailable, tracing without it");
        }
        info!(otel_enabled, endpoint = ?endpoint, "tracing initialized");
        Ok::<(), Error>(())
    })?;
    Ok(())
}

/// サンプリング比率は `OTEL_SAMPLING_RATIO`（デフォルト 1.0）。
fn init_provider(endpoint: &str) -> Result<SdkTracerProvider> {
    let sampling_ratio = std::env::var("OTEL_SAMPLING_RATIO")
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(1.0);

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("failed to build OTLP span exporter")?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(sampling_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

/// 未送信のスパンをフラッシュしてエクスポーターを停止する。OTLP 無効時は何もしない。
pub fn shutdown() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to shut down tracer provider: {e}");
        }
    }
}
