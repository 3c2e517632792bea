use std::{env, num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

use crate::params::{RadiusChoice, RunRequest, SeedChoice, TreadlingChoice};
use crate::pipeline::normalize::DEFAULT_EPSILON;
use crate::pipeline::smooth::SmoothingShape;
use crate::pipeline::types::ThreadingSource;
use crate::table::TableSpec;
use crate::util::kmeans::KMeansConfig;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

const DEFAULT_RENAMES: &str = "4_colonias_id=coloniaid,4_alcaldias_id=alcaldiaid";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    input_path: PathBuf,
    output_dir: Option<PathBuf>,
    table: TableSpec,
    request: RunRequest,
    normalize_epsilon: Option<f64>,
    kmeans: KMeansConfig,
    run_timeout: Option<Duration>,
    metrics_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// 環境変数からドラフト生成バッチの設定値を読み込み、検証する。
    ///
    /// # Errors
    /// `TEXTILE_INPUT_PATH` が未設定、もしくは各種値のパースに失敗した場合は [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        let input_path = PathBuf::from(env_var("TEXTILE_INPUT_PATH")?);
        let output_dir = optional("TEXTILE_OUTPUT_DIR").map(PathBuf::from);

        // Table preprocessing
        let table = TableSpec {
            region_column: env::var("TEXTILE_REGION_COLUMN")
                .unwrap_or_else(|_| "alcaldiaid".to_string()),
            renames: parse_renames("TEXTILE_COLUMN_RENAMES", DEFAULT_RENAMES)?,
            exclude_columns: parse_csv("TEXTILE_EXCLUDE_COLUMNS", "coloniaid"),
            max_region_code: parse_optional::<i64>("TEXTILE_MAX_REGION_CODE")?,
        };

        // Run parameters
        let request = RunRequest {
            clusters: parse_optional_non_zero_usize("TEXTILE_CLUSTERS")?,
            treadling: parse_with::<TreadlingChoice>("TEXTILE_TREADLING_CLUSTERS", "same")?,
            seed: parse_with::<SeedChoice>("TEXTILE_SEED", "0")?,
            random_tieup: parse_bool("TEXTILE_RANDOM_TIEUP", false)?,
            smoothing_radius: parse_with::<RadiusChoice>("TEXTILE_SMOOTHING_RADIUS", "off")?,
            smoothing_shape: parse_with::<SmoothingShape>("TEXTILE_SMOOTHING_SHAPE", "square")?,
            include_draft: parse_bool("TEXTILE_INCLUDE_DRAFT", true)?,
            threading_source: parse_threading_source("TEXTILE_THREADING_SOURCE")?,
        };

        // Stage tuning
        let normalize_epsilon = parse_epsilon("TEXTILE_NORMALIZE_EPSILON")?;
        let kmeans = KMeansConfig {
            n_init: parse_non_zero_usize("TEXTILE_KMEANS_N_INIT", 10)?.get(),
            max_iterations: parse_non_zero_usize("TEXTILE_KMEANS_MAX_ITER", 300)?.get(),
            tolerance: parse_tolerance("TEXTILE_KMEANS_TOL", 1e-4)?,
        };

        let run_timeout = parse_optional::<u64>("TEXTILE_RUN_TIMEOUT_SECS")?.map(Duration::from_secs);
        let metrics_path = optional("TEXTILE_METRICS_PATH").map(PathBuf::from);

        Ok(Self {
            input_path,
            output_dir,
            table,
            request,
            normalize_epsilon,
            kmeans,
            run_timeout,
            metrics_path,
        })
    }

    #[must_use]
    pub fn input_path(&self) -> &PathBuf {
        &self.input_path
    }

    /// `None` prints the payload instead of writing files.
    #[must_use]
    pub fn output_dir(&self) -> Option<&PathBuf> {
        self.output_dir.as_ref()
    }

    #[must_use]
    pub fn table(&self) -> &TableSpec {
        &self.table
    }

    #[must_use]
    pub fn request(&self) -> &RunRequest {
        &self.request
    }

    #[must_use]
    pub fn normalize_epsilon(&self) -> Option<f64> {
        self.normalize_epsilon
    }

    #[must_use]
    pub fn kmeans(&self) -> &KMeansConfig {
        &self.kmeans
    }

    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout
    }

    #[must_use]
    pub fn metrics_path(&self) -> Option<&PathBuf> {
        self.metrics_path.as_ref()
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

/// Unset and blank values are both absent.
fn optional(name: &'static str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_with<T>(name: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Into<anyhow::Error>,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>().map_err(|error| ConfigError::Invalid {
        name,
        source: error.into(),
    })
}

fn parse_optional<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    optional(name)
        .map(|raw| {
            raw.parse::<T>().map_err(|error| ConfigError::Invalid {
                name,
                source: anyhow::Error::new(error),
            })
        })
        .transpose()
}

fn parse_optional_non_zero_usize(name: &'static str) -> Result<Option<NonZeroUsize>, ConfigError> {
    parse_optional::<usize>(name)?
        .map(|value| {
            NonZeroUsize::new(value).ok_or_else(|| ConfigError::Invalid {
                name,
                source: anyhow::anyhow!("must be greater than zero"),
            })
        })
        .transpose()
}

fn parse_non_zero_usize(name: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let parsed = raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    NonZeroUsize::new(parsed).ok_or_else(|| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!("must be greater than zero"),
    })
}

fn parse_tolerance(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let value = raw.parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("tolerance must be a finite non-negative number, got {value}"),
        })
    }
}

fn parse_epsilon(name: &'static str) -> Result<Option<f64>, ConfigError> {
    match optional(name).as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(Some(DEFAULT_EPSILON)),
        Some("none" | "off") => Ok(None),
        Some(raw) => match raw.parse::<f64>() {
            Ok(value) if value.is_finite() && value > 0.0 => Ok(Some(value)),
            Ok(value) => Err(ConfigError::Invalid {
                name,
                source: anyhow::anyhow!(
                    "epsilon must be a finite positive number (or `none`), got {value}"
                ),
            }),
            Err(error) => Err(ConfigError::Invalid {
                name,
                source: anyhow::Error::new(error),
            }),
        },
    }
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}

fn parse_threading_source(name: &'static str) -> Result<ThreadingSource, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| "labels".to_string());
    match raw.trim().to_lowercase().as_str() {
        "labels" => Ok(ThreadingSource::Labels),
        "regions" => Ok(ThreadingSource::Regions),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("expected `labels` or `regions`, got {raw}"),
        }),
    }
}

fn parse_csv(name: &'static str, default: &str) -> Vec<String> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `from=to` pairs separated by commas.
fn parse_renames(name: &'static str, default: &str) -> Result<Vec<(String, String)>, ConfigError> {
    parse_csv(name, default)
        .into_iter()
        .map(|pair| match pair.split_once('=') {
            Some((from, to)) if !from.trim().is_empty() && !to.trim().is_empty() => {
                Ok((from.trim().to_string(), to.trim().to_string()))
            }
            _ => Err(ConfigError::Invalid {
                name,
                source: anyhow::anyhow!("expected `from=to`, got {pair:?}"),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &[&str] = &[
        "TEXTILE_INPUT_PATH",
        "TEXTILE_OUTPUT_DIR",
        "TEXTILE_REGION_COLUMN",
        "TEXTILE_COLUMN_RENAMES",
        "TEXTILE_EXCLUDE_COLUMNS",
        "TEXTILE_MAX_REGION_CODE",
        "TEXTILE_CLUSTERS",
        "TEXTILE_TREADLING_CLUSTERS",
        "TEXTILE_SEED",
        "TEXTILE_RANDOM_TIEUP",
        "TEXTILE_SMOOTHING_RADIUS",
        "TEXTILE_SMOOTHING_SHAPE",
        "TEXTILE_INCLUDE_DRAFT",
        "TEXTILE_THREADING_SOURCE",
        "TEXTILE_NORMALIZE_EPSILON",
        "TEXTILE_KMEANS_N_INIT",
        "TEXTILE_KMEANS_MAX_ITER",
        "TEXTILE_KMEANS_TOL",
        "TEXTILE_RUN_TIMEOUT_SECS",
        "TEXTILE_METRICS_PATH",
    ];

    fn set_env(name: &str, value: &str) {
        // SAFETY: tests hold ENV_MUTEX and assign valid UTF-8 values.
        unsafe {
            env::set_var(name, value);
        }
    }

    fn remove_env(name: &str) {
        // SAFETY: tests hold ENV_MUTEX and clean up deterministic keys.
        unsafe {
            env::remove_var(name);
        }
    }

    fn reset_env() {
        for name in VARS {
            remove_env(name);
        }
    }

    #[test]
    fn defaults_apply_when_only_input_is_set() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        set_env("TEXTILE_INPUT_PATH", "data/regions.csv");

        let config = Config::from_env().expect("config");
        assert_eq!(config.input_path(), &PathBuf::from("data/regions.csv"));
        assert!(config.output_dir().is_none());
        assert_eq!(config.table(), &TableSpec::default());
        assert_eq!(config.request(), &RunRequest::deterministic());
        assert_eq!(config.normalize_epsilon(), Some(DEFAULT_EPSILON));
        assert_eq!(config.kmeans(), &KMeansConfig::default());
        assert!(config.run_timeout().is_none());
        assert!(config.metrics_path().is_none());

        reset_env();
    }

    #[test]
    fn missing_input_path_is_reported() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();

        let error = Config::from_env().expect_err("input path is required");
        assert!(matches!(error, ConfigError::Missing("TEXTILE_INPUT_PATH")));
    }

    #[test]
    fn overrides_are_parsed() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        set_env("TEXTILE_INPUT_PATH", "in.csv");
        set_env("TEXTILE_OUTPUT_DIR", "out");
        set_env("TEXTILE_COLUMN_RENAMES", "a=b, c = d");
        set_env("TEXTILE_EXCLUDE_COLUMNS", "x,,y");
        set_env("TEXTILE_MAX_REGION_CODE", "16");
        set_env("TEXTILE_CLUSTERS", "8");
        set_env("TEXTILE_TREADLING_CLUSTERS", "random");
        set_env("TEXTILE_SEED", "clock");
        set_env("TEXTILE_RANDOM_TIEUP", "yes");
        set_env("TEXTILE_SMOOTHING_RADIUS", "120");
        set_env("TEXTILE_SMOOTHING_SHAPE", "disk");
        set_env("TEXTILE_INCLUDE_DRAFT", "off");
        set_env("TEXTILE_THREADING_SOURCE", "regions");
        set_env("TEXTILE_NORMALIZE_EPSILON", "none");
        set_env("TEXTILE_KMEANS_N_INIT", "3");
        set_env("TEXTILE_RUN_TIMEOUT_SECS", "30");

        let config = Config::from_env().expect("config");
        assert_eq!(config.output_dir(), Some(&PathBuf::from("out")));
        assert_eq!(
            config.table().renames,
            vec![
                ("a".to_string(), "b".to_string()),
                ("c".to_string(), "d".to_string())
            ]
        );
        assert_eq!(config.table().exclude_columns, vec!["x", "y"]);
        assert_eq!(config.table().max_region_code, Some(16));

        let request = config.request();
        assert_eq!(request.clusters, NonZeroUsize::new(8));
        assert_eq!(request.treadling, TreadlingChoice::Random);
        assert_eq!(request.seed, SeedChoice::Clock);
        assert!(request.random_tieup);
        assert_eq!(request.smoothing_radius, RadiusChoice::Fixed(120));
        assert_eq!(request.smoothing_shape, SmoothingShape::Disk);
        assert!(!request.include_draft);
        assert_eq!(request.threading_source, ThreadingSource::Regions);

        assert_eq!(config.normalize_epsilon(), None);
        assert_eq!(config.kmeans().n_init, 3);
        assert_eq!(config.run_timeout(), Some(Duration::from_secs(30)));

        reset_env();
    }

    #[test]
    fn malformed_values_are_invalid() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        for (name, value) in [
            ("TEXTILE_CLUSTERS", "0"),
            ("TEXTILE_SEED", "soon"),
            ("TEXTILE_RANDOM_TIEUP", "maybe"),
            ("TEXTILE_SMOOTHING_SHAPE", "hexagon"),
            ("TEXTILE_THREADING_SOURCE", "colours"),
            ("TEXTILE_COLUMN_RENAMES", "lonely"),
            ("TEXTILE_NORMALIZE_EPSILON", "-1"),
            ("TEXTILE_NORMALIZE_EPSILON", "0"),
            ("TEXTILE_KMEANS_MAX_ITER", "0"),
            ("TEXTILE_KMEANS_TOL", "-0.5"),
            ("TEXTILE_KMEANS_TOL", "NaN"),
            ("TEXTILE_KMEANS_TOL", "inf"),
        ] {
            reset_env();
            set_env("TEXTILE_INPUT_PATH", "in.csv");
            set_env(name, value);
            match Config::from_env() {
                Err(ConfigError::Invalid { name: reported, .. }) => assert_eq!(reported, name),
                other => panic!("{name}={value} should be invalid, got {other:?}"),
            }
        }
        reset_env();
    }
}
