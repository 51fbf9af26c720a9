//! Entity structs for the application control plane (spec.md §3).
//!
//! Each submodule owns one entity and, where the entity has non-trivial
//! invariants, a `verify(&self) -> Result<()>` method in the style of
//! `shipcat_definitions::structs::*`.

pub mod app;
pub mod appsettings;
pub mod build;
pub mod certificate;
pub mod config;
pub mod domain;
pub mod gateway;
pub mod limitplan;
pub mod release;
pub mod resource;
pub mod service;
pub mod tls;
pub mod token;
pub mod volume;

/// Reserved process-type name; `run` denotes an ephemeral one-off job and
/// can never be part of `App.structure` or targeted by `scale`/`autoscale`.
pub const RESERVED_PTYPE_RUN: &str = "run";

/// Reserved app ids that can never be auto-generated or claimed.
pub const RESERVED_APP_IDS: &[&str] = &["app", "api", "deis", "drycc", "controller"];
