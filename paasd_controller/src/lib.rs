//! Release/deploy pipeline and reconciliation machinery (C2-C9).
//!
//! Builds on `paasd_scheduler`'s typed cluster capability (C1) to implement
//! locking, the entity store, release resolution, the deploy orchestrator,
//! app lifecycle management, background workers, resource orchestration and
//! the abstract HTTP surface.

#[macro_use]
extern crate log;
extern crate async_trait;
extern crate chrono;
extern crate futures;
extern crate paasd_definitions;
extern crate paasd_scheduler;
extern crate rand;
extern crate reqwest;
extern crate serde;
extern crate serde_json;
extern crate tokio;
extern crate uuid;

pub mod config;
pub mod deploy;
pub mod health;
pub mod interfaces;
pub mod lifecycle;
pub mod lock;
pub mod release;
pub mod resource;
pub mod store;
pub mod tasks;
pub mod workers;

pub use config::ControllerConfig;
pub use deploy::{DeployOrchestrator, GlobalDefaults};
pub use health::{HealthChecker, ReqwestHealthChecker};
pub use interfaces::ControlPlaneApi;
pub use lifecycle::AppLifecycle;
pub use lock::{CacheLock, DeployLock, InMemoryKv, KvStore};
pub use release::ReleaseEngine;
pub use resource::ResourceManager;
pub use store::{EntityStore, InMemoryStore, StoredBuild};
pub use tasks::{TaskOutcome, TaskRunner};
pub use workers::{Backoff, MetricsSink};
