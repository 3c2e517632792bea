//! Config → run request → params, as the batch binary wires them.

use std::env;
use std::sync::Mutex;

use chrono::{TimeZone, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;

use textile_draft::config::{Config, ConfigError};
use textile_draft::params::{RANDOM_SMOOTHING_RADIUS, RANDOM_TREADLING_CLUSTERS};
use textile_draft::pipeline::matrix::TieUpSpec;
use textile_draft::pipeline::smooth::SmoothingShape;
use textile_draft::pipeline::{DraftParams, TreadlingClusters};

static ENV_LOCK: Mutex<()> = Mutex::new(());

const KEYS: &[&str] = &[
    "TEXTILE_INPUT_PATH",
    "TEXTILE_TREADLING_CLUSTERS",
    "TEXTILE_SEED",
    "TEXTILE_RANDOM_TIEUP",
    "TEXTILE_SMOOTHING_RADIUS",
    "TEXTILE_SMOOTHING_SHAPE",
    "TEXTILE_KMEANS_TOL",
];

fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
    let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    // SAFETY: every test in this binary holds ENV_LOCK while touching the environment.
    unsafe {
        for key in KEYS {
            env::remove_var(key);
        }
        for (key, value) in vars {
            env::set_var(key, value);
        }
    }
    let result = f();
    // SAFETY: as above.
    unsafe {
        for key in KEYS {
            env::remove_var(key);
        }
    }
    result
}

#[test]
fn default_environment_resolves_to_default_params() {
    let config = with_env(&[("TEXTILE_INPUT_PATH", "table.csv")], Config::from_env)
        .expect("config");
    let params = config
        .request()
        .resolve(&mut StdRng::seed_from_u64(0), Utc::now());
    assert_eq!(params, DraftParams::default());
}

#[test]
fn randomized_environment_resolves_within_ranges() {
    let config = with_env(
        &[
            ("TEXTILE_INPUT_PATH", "table.csv"),
            ("TEXTILE_TREADLING_CLUSTERS", "random"),
            ("TEXTILE_SEED", "clock"),
            ("TEXTILE_RANDOM_TIEUP", "true"),
            ("TEXTILE_SMOOTHING_RADIUS", "random"),
            ("TEXTILE_SMOOTHING_SHAPE", "disk"),
        ],
        Config::from_env,
    )
    .expect("config");
    assert!(config.request().is_randomized());

    let now = Utc
        .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .expect("timestamp");
    let params = config
        .request()
        .resolve(&mut StdRng::seed_from_u64(5), now);

    assert_eq!(params.seed, 1_735_689_600);
    assert_eq!(params.tieup, TieUpSpec::Random);
    match params.treadling {
        TreadlingClusters::Count(n) => assert!(RANDOM_TREADLING_CLUSTERS.contains(&n.get())),
        TreadlingClusters::Reuse => panic!("random treadling must resolve to a count"),
    }
    let smoothing = params.smoothing.expect("smoothing radius drawn");
    assert_eq!(smoothing.shape, SmoothingShape::Disk);
    assert!(RANDOM_SMOOTHING_RADIUS.contains(&smoothing.radius));
}

#[test]
fn malformed_tolerance_names_the_variable() {
    let result = with_env(
        &[
            ("TEXTILE_INPUT_PATH", "table.csv"),
            ("TEXTILE_KMEANS_TOL", "tight"),
        ],
        Config::from_env,
    );
    match result {
        Err(ConfigError::Invalid { name, .. }) => assert_eq!(name, "TEXTILE_KMEANS_TOL"),
        other => panic!("expected an invalid tolerance, got {other:?}"),
    }
}
