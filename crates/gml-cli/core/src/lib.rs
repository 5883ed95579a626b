//! Deployment core for gml training runs: resolve a config, pick the
//! framework's manifests, merge resources into them and roll them out in
//! stages, undoing everything if a stage fails.

pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod framework;
pub mod inject;
pub mod manifest;
pub mod plan;
pub mod plugin;
pub mod registry;
pub mod strategy;

pub use cluster::{ClusterClient, MemoryCluster, ResourceRef};
pub use config::{ConfigResolver, JobDescriptor, JobRequest, ResolvedJob};
pub use error::{GmlError, Result};
pub use executor::DeploymentExecutor;
pub use framework::{Framework, TrainingType};
pub use inject::ResourceSpec;
pub use plan::{DeploymentPlan, DeploymentResult, TeardownReport, UnitStatus};
pub use registry::FrameworkRegistry;
pub use strategy::{DeploymentStrategy, PlanMode};
