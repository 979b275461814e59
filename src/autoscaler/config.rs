//! Glue / Config (§4, "Glue/Config" row).
//! Mission: CLI + env-var driven configuration, validated once at startup so
//! a bad config is a `ConfigurationError` (fatal, exit 2) rather than a
//! runtime surprise (§7).

use crate::error::ControlPlaneError;
use clap::{Parser, ValueEnum};
use std::collections::HashSet;

use super::types::{AcceleratorCatalogue, AcceleratorSpec};

/// Which Decision Engine the control plane drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum Policy {
    RateThreshold,
    Heterogeneous,
}

/// Process-level configuration. Every field is also settable by env var
/// (`clap`'s `env` feature), matching the established `Config::from_env`
/// convention but gaining `--help` and CLI overrides for free.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "autoscaler-control-plane",
    about = "Autoscaling control plane for GPU-backed inference replica pools"
)]
pub struct Cli {
    #[arg(long, env = "AUTOSCALER_POLICY", value_enum, default_value = "rate-threshold")]
    pub policy: Policy,

    #[arg(long, env = "AUTOSCALER_SERVICE_NAME", default_value = "default")]
    pub service_name: String,

    #[arg(long, env = "AUTOSCALER_MIN_REPLICAS", default_value_t = 1)]
    pub min_replicas: u64,

    #[arg(long, env = "AUTOSCALER_MAX_REPLICAS", default_value_t = 10)]
    pub max_replicas: u64,

    /// Requests/sec/replica above which the rate-threshold policy scales up.
    #[arg(long, env = "AUTOSCALER_UPPER_THRESHOLD")]
    pub upper_threshold: Option<f64>,

    /// Requests/sec/replica below which the rate-threshold policy scales down.
    #[arg(long, env = "AUTOSCALER_LOWER_THRESHOLD")]
    pub lower_threshold: Option<f64>,

    #[arg(long, env = "AUTOSCALER_COOLDOWN_SECS", default_value_t = 120.0)]
    pub cooldown_secs: f64,

    #[arg(long, env = "AUTOSCALER_WINDOW_SECS", default_value_t = 60.0)]
    pub window_secs: f64,

    /// How often the Control Loop ticks.
    #[arg(long, env = "AUTOSCALER_FREQUENCY_SECS", default_value_t = 20)]
    pub frequency_secs: u64,

    /// Advisory interval the Request Aggregator is told to push on (§6
    /// `/control_plane/query_interval`); also used to warn when the Control
    /// Loop runs less often than the aggregator pushes (§4.6).
    #[arg(long, env = "AUTOSCALER_AGGREGATOR_SYNC_SECS", default_value_t = 10)]
    pub aggregator_sync_secs: u64,

    /// Refresh period of the background `ReplicaStateFetcher` (§4.6 supplement).
    #[arg(long, env = "AUTOSCALER_REPLICA_FETCH_SECS", default_value_t = 15)]
    pub replica_fetch_secs: u64,

    /// Single accelerator class name, required for the rate-threshold policy.
    #[arg(long, env = "AUTOSCALER_ACCELERATOR")]
    pub accelerator: Option<String>,

    /// JSON-encoded `Vec<AcceleratorSpec>`, required for the heterogeneous
    /// policy. E.g. `[{"name":"A10","throughput_rps":5,"cost_per_hour":1,"fallback":null},
    /// {"name":"A100","throughput_rps":20,"cost_per_hour":8,"fallback":{"class":"A10","count":4}}]`.
    #[arg(long, env = "AUTOSCALER_CATALOGUE_JSON")]
    pub catalogue_json: Option<String>,

    #[arg(long, env = "AUTOSCALER_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: String,

    /// Path for the on-disk state-store fake (best-effort recovery across
    /// control-plane restarts, per module's Non-goals — not strong
    /// consistency). Falls back to a pure in-memory fake when unset.
    #[arg(long, env = "AUTOSCALER_STATE_STORE_PATH")]
    pub state_store_path: Option<String>,

    #[arg(long, env = "AUTOSCALER_QUERY_INTERVAL_SECS")]
    pub query_interval_secs: Option<u64>,

    /// Bounded deadline the `/terminate` handler waits for in-flight
    /// Replica Manager calls before exiting (§5).
    #[arg(long, env = "AUTOSCALER_SHUTDOWN_DEADLINE_SECS", default_value_t = 30)]
    pub shutdown_deadline_secs: u64,
}

impl Cli {
    /// Validates cross-field invariants the type system can't express, and
    /// builds the accelerator catalogue for the heterogeneous policy. Called
    /// once at startup; any `Err` is a `ConfigurationError` (fatal, exit 2).
    pub fn validate_and_build(&self) -> Result<ValidatedConfig, ControlPlaneError> {
        if self.min_replicas > self.max_replicas {
            return Err(ControlPlaneError::ConfigurationError(format!(
                "min_replicas ({}) > max_replicas ({})",
                self.min_replicas, self.max_replicas
            )));
        }
        if let (Some(lower), Some(upper)) = (self.lower_threshold, self.upper_threshold) {
            if lower > upper {
                return Err(ControlPlaneError::ConfigurationError(format!(
                    "lower_threshold ({lower}) > upper_threshold ({upper}): inverted deadband"
                )));
            }
        }
        if self.frequency_secs == 0 {
            return Err(ControlPlaneError::ConfigurationError(
                "frequency_secs must be > 0".to_string(),
            ));
        }

        match self.policy {
            Policy::RateThreshold => {
                let accelerator = self.accelerator.clone().ok_or_else(|| {
                    ControlPlaneError::ConfigurationError(
                        "rate-threshold policy requires --accelerator".to_string(),
                    )
                })?;
                Ok(ValidatedConfig::RateThreshold { accelerator })
            }
            Policy::Heterogeneous => {
                let raw = self.catalogue_json.clone().ok_or_else(|| {
                    ControlPlaneError::ConfigurationError(
                        "heterogeneous policy requires --catalogue-json".to_string(),
                    )
                })?;
                let catalogue = parse_catalogue(&raw)?;
                Ok(ValidatedConfig::Heterogeneous { catalogue })
            }
        }
    }
}

/// The policy-specific piece of configuration left over after validation.
pub enum ValidatedConfig {
    RateThreshold { accelerator: String },
    Heterogeneous { catalogue: AcceleratorCatalogue },
}

fn parse_catalogue(raw: &str) -> Result<AcceleratorCatalogue, ControlPlaneError> {
    let specs: Vec<AcceleratorSpec> = serde_json::from_str(raw)
        .map_err(|e| ControlPlaneError::ConfigurationError(format!("invalid catalogue JSON: {e}")))?;

    if specs.is_empty() {
        return Err(ControlPlaneError::ConfigurationError(
            "accelerator catalogue must not be empty".to_string(),
        ));
    }

    let names: HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
    if names.len() != specs.len() {
        return Err(ControlPlaneError::ConfigurationError(
            "accelerator catalogue has duplicate class names".to_string(),
        ));
    }

    let mut has_root = false;
    for spec in &specs {
        match spec.fallback.as_ref() {
            None => has_root = true,
            Some(fb) => {
                if fb.class == spec.name {
                    return Err(ControlPlaneError::ConfigurationError(format!(
                        "accelerator class {:?} cannot fall back to itself",
                        spec.name
                    )));
                }
                if !names.contains(fb.class.as_str()) {
                    return Err(ControlPlaneError::ConfigurationError(format!(
                        "accelerator class {:?} falls back to unknown class {:?}",
                        spec.name, fb.class
                    )));
                }
            }
        }
    }
    if !has_root {
        return Err(ControlPlaneError::ConfigurationError(
            "accelerator catalogue has no root class (every class has a fallback)".to_string(),
        ));
    }

    Ok(AcceleratorCatalogue::new(specs))
}
