//! Autoscaling control plane: sliding-window request-rate accounting, a
//! multi-class allocation solver, two Decision Engine policies, the Control
//! Loop that drives them, and the Telemetry API that feeds and observes
//! them.

pub mod api;
pub mod config;
pub mod control_loop;
pub mod engine;
pub mod engine_hetero;
pub mod engine_rate;
pub mod replica_manager;
pub mod selection;
pub mod solver;
pub mod state_store;
pub mod types;
pub mod window;

pub use config::{Cli, Policy, ValidatedConfig};
pub use engine::Autoscaler;
pub use engine_hetero::{HeteroConfig, HeteroEngine};
pub use engine_rate::{RateThresholdConfig, RateThresholdEngine};
pub use types::{
    AcceleratorCatalogue, AcceleratorSpec, AutoscalerDecision, DecisionBatch, DecisionItem,
    FallbackSpec, ReplicaInfo, ReplicaStatus, RequestBatch,
};
