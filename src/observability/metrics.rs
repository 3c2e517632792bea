/// Prometheusメトリクス定義。
use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    Gauge, HistogramVec, IntCounter, IntCounterVec, Registry, register_gauge_with_registry,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry,
};

use crate::error::Stage;

/// ドラフト生成パイプラインのメトリクス。
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    // カウンター
    pub runs_completed: IntCounter,
    pub runs_failed: IntCounterVec,
    pub rows_dropped: IntCounter,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,

    // ヒストグラム
    pub stage_duration: HistogramVec,

    // ゲージ
    pub last_draft_cells: Gauge,
}

impl PipelineMetrics {
    /// レジストリにメトリクスを登録する。
    ///
    /// # Errors
    /// 同名のメトリクスが既に登録されている場合。
    pub fn new(registry: &Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            runs_completed: register_int_counter_with_registry!(
                "textile_runs_completed_total",
                "Draft pipeline runs that produced a matrix set",
                registry
            )?,
            runs_failed: register_int_counter_vec_with_registry!(
                "textile_runs_failed_total",
                "Draft pipeline runs that failed, by stage",
                &["stage"],
                registry
            )?,
            rows_dropped: register_int_counter_with_registry!(
                "textile_rows_dropped_total",
                "Input rows dropped for a null region id",
                registry
            )?,
            cache_hits: register_int_counter_with_registry!(
                "textile_cache_hits_total",
                "Draft requests served from the cache",
                registry
            )?,
            cache_misses: register_int_counter_with_registry!(
                "textile_cache_misses_total",
                "Draft requests that ran the pipeline",
                registry
            )?,
            stage_duration: register_histogram_vec_with_registry!(
                "textile_stage_duration_seconds",
                "Wall time spent in each pipeline stage",
                &["stage"],
                registry
            )?,
            last_draft_cells: register_gauge_with_registry!(
                "textile_last_draft_cells",
                "Cell count of the most recent draft matrix",
                registry
            )?,
        })
    }

    pub fn observe_stage(&self, stage: Stage, elapsed: Duration) {
        self.stage_duration
            .with_label_values(&[stage.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_failure(&self, stage: Stage) {
        self.runs_failed.with_label_values(&[stage.as_str()]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn registering_twice_on_one_registry_fails() {
        let registry = Arc::new(Registry::new());
        PipelineMetrics::new(&registry).expect("first registration");
        assert!(PipelineMetrics::new(&registry).is_err());
    }

    #[test]
    fn stage_observations_are_labelled() {
        let registry = Arc::new(Registry::new());
        let metrics = PipelineMetrics::new(&registry).expect("metrics");
        metrics.observe_stage(Stage::Cluster, Duration::from_millis(5));
        metrics.record_failure(Stage::Persist);

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .expect("encode");
        let text = String::from_utf8(buffer).expect("utf8");
        assert!(text.contains("textile_stage_duration_seconds_count{stage=\"cluster\"} 1"));
        assert_eq!(metrics.runs_failed.with_label_values(&["persist"]).get(), 1);
    }
}
