#![recursion_limit = "1024"]
#![allow(non_snake_case)]

//! Data model and error taxonomy for the application control plane.
//!
//! This crate has no knowledge of Kubernetes or of any persistence engine -
//! it only describes the entities of the system (App, Config, Build,
//! Release, ...), their validation rules, and the merge semantics that the
//! release/config pipeline depends on.

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;

#[macro_use]
extern crate log;

extern crate chrono;
extern crate regex;
extern crate base64;
extern crate uuid;

#[macro_use]
extern crate error_chain;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {}
    foreign_links {
        SerdeJ(serde_json::Error);
        Time(::std::time::SystemTimeError);
    }
    errors {
        /// Caller input violates a validation constraint (HTTP 400)
        Validation(msg: String) {
            description("validation failure")
            display("validation failure: {}", msg)
        }
        /// Unique or in-progress conflict (HTTP 409)
        AlreadyExists(what: String) {
            description("already exists")
            display("{} already exists", what)
        }
        /// Entity or cluster object missing where required (HTTP 404)
        NotFound(what: String) {
            description("not found")
            display("{} not found", what)
        }
        /// Merge unset a key that was never set (HTTP 422)
        Unprocessable(msg: String) {
            description("unprocessable entity")
            display("{}", msg)
        }
        /// Transient cluster-side failure, triggers worker retries (HTTP 503)
        ServiceUnavailable(msg: String) {
            description("service unavailable")
            display("service unavailable: {}", msg)
        }
        /// Permission check failed (HTTP 403)
        Forbidden(msg: String) {
            description("forbidden")
            display("forbidden: {}", msg)
        }
        /// Generic business-rule violation (HTTP 400)
        Drycc(msg: String) {
            description("business rule violation")
            display("{}", msg)
        }
    }
}

impl ErrorKind {
    /// The HTTP status code this error kind would be surfaced as, were an
    /// HTTP layer bound to this crate. Not used internally - documents the
    /// §7 contract for whoever writes that layer.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation(_) => 400,
            ErrorKind::AlreadyExists(_) => 409,
            ErrorKind::NotFound(_) => 404,
            ErrorKind::Unprocessable(_) => 422,
            ErrorKind::ServiceUnavailable(_) => 503,
            ErrorKind::Forbidden(_) => 403,
            ErrorKind::Drycc(_) => 400,
            _ => 500,
        }
    }

    /// True for errors a background worker should retry on, per spec.md §4.9.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ServiceUnavailable(_))
    }
}

pub mod model;

pub use model::{
    app::{random_lowercase, App},
    appsettings::{AppSettings, AutoscaleSpec, ScalingMetric, ScalingMetricKind},
    build::{Build, BuildStep, DeployStep, DryccFile, PipelinePtype, RunStep, Stack},
    certificate::Certificate,
    config::{Config, ConfigPatch, ConfigValue, HealthcheckEntry, LifecycleHook, Patch, Probe, RegistryEntry},
    domain::Domain,
    gateway::{BackendRef, Gateway, Listener, Route, RouteRule},
    limitplan::{LimitPlan, PodVolume, SecurityContext, VolumeMount},
    release::{Condition, Release, ReleaseState},
    resource::{BindingStatus, InstanceStatus, Resource},
    service::{Protocol, Service, ServicePort},
    tls::TLS,
    token::{OAuthBlob, Token},
    volume::{Volume, VolumeType},
};
