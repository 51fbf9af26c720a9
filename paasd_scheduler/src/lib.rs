//! Typed capability surface over the cluster API (spec.md §4.1, C1).
//!
//! This crate knows nothing about Releases, Deploys, or Apps - it exposes
//! only the primitive cluster operations the rest of the control plane is
//! built from, grounded on `shipcat_cli::kubeapi`/`kubectl`'s async `kube`
//! usage.

#[macro_use]
extern crate log;
extern crate async_trait;
extern crate chrono;
extern crate k8s_openapi;
extern crate kube;
extern crate paasd_definitions;
extern crate serde;
extern crate serde_json;
extern crate tokio;

pub mod client;
pub mod fake;
pub mod kube_backend;

pub use client::{
    drain_to_terminal, DeployPlan, DeploymentInfo, PlanVolume, PlanVolumeMount, PodInfo, PodState,
    PodWatch, Probes, ResourceLimits, Scheduler, SchedulerError, SchedulerResult,
};
