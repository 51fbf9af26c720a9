//! Abstract HTTP surface (spec.md §6, C9).
//!
//! No concrete HTTP server is part of this crate - wiring the trait below
//! to an actual router (actix-web, axum, warp) is left to the binary that
//! embeds it. The trait exists so the resource -> operation mapping is
//! typed and testable independent of any specific web framework, mirroring
//! the route table shape in `raftcat/src/main.rs` (one method per
//! resource/verb pair) without depending on actix-web's 0.7-era API.

use async_trait::async_trait;

use paasd_definitions::{
    App, AppSettings, AutoscaleSpec, Build, Certificate, Config, ConfigPatch, Domain, Gateway,
    Release, Resource, Result, Route, Service, Volume, TLS,
};
use paasd_scheduler::{DeploymentInfo, PodInfo};

/// One method per resource/verb pair in the URL map. Implementors wire each
/// to a concrete path + method in whatever web framework they embed this
/// crate with.
#[async_trait]
pub trait ControlPlaneApi: Send + Sync {
    async fn create_app(&self, id: Option<String>, owner: &str) -> Result<App>;
    async fn get_app(&self, id: &str) -> Result<App>;
    async fn list_apps(&self) -> Result<Vec<App>>;
    /// `POST /v2/apps/{id}` with an `owner` body field transfers ownership.
    async fn transfer_app(&self, id: &str, new_owner: &str) -> Result<()>;
    async fn delete_app(&self, id: &str) -> Result<()>;

    async fn get_build(&self, app_id: &str) -> Result<Build>;
    async fn create_build(&self, app_id: &str, build: Build) -> Result<Release>;

    async fn get_config(&self, app_id: &str) -> Result<Config>;
    async fn update_config(&self, app_id: &str, patch: ConfigPatch) -> Result<Release>;

    async fn list_releases(&self, app_id: &str) -> Result<Vec<Release>>;
    async fn get_release(&self, app_id: &str, version: u32) -> Result<Release>;
    async fn deploy_release(&self, app_id: &str, ptypes: Option<Vec<String>>, force: bool) -> Result<()>;
    async fn rollback_release(&self, app_id: &str, version: Option<u32>) -> Result<Release>;

    async fn list_ptypes(&self, app_id: &str) -> Result<std::collections::BTreeMap<String, u32>>;
    async fn scale_ptypes(&self, app_id: &str, structure: std::collections::BTreeMap<String, u32>) -> Result<()>;
    async fn restart_ptype(&self, app_id: &str, ptype: &str, pod_name: Option<&str>) -> Result<()>;
    async fn clean_ptype(&self, app_id: &str, ptype: &str) -> Result<()>;
    async fn describe_ptype(&self, app_id: &str, ptype: &str) -> Result<DeploymentInfo>;
    async fn autoscale_ptype(&self, app_id: &str, ptype: &str, spec: Option<AutoscaleSpec>) -> Result<()>;

    async fn list_pods(&self, app_id: &str, ptype: Option<&str>) -> Result<Vec<PodInfo>>;
    async fn delete_pod(&self, app_id: &str, name: &str) -> Result<()>;
    async fn describe_pod(&self, app_id: &str, name: &str) -> Result<PodInfo>;

    async fn list_domains(&self, app_id: &str) -> Result<Vec<Domain>>;
    async fn add_domain(&self, app_id: &str, domain: &str) -> Result<Domain>;
    async fn delete_domain(&self, app_id: &str, domain: &str) -> Result<()>;

    async fn get_service(&self, app_id: &str, ptype: &str) -> Result<Service>;
    async fn save_service(&self, app_id: &str, service: Service) -> Result<Service>;

    async fn get_tls(&self, app_id: &str) -> Result<Option<TLS>>;
    async fn update_tls(&self, app_id: &str, tls: TLS) -> Result<TLS>;

    async fn list_certificates(&self, app_id: &str) -> Result<Vec<Certificate>>;
    async fn add_certificate(&self, app_id: &str, cert: Certificate) -> Result<Certificate>;
    async fn delete_certificate(&self, app_id: &str, name: &str) -> Result<()>;

    async fn get_gateway(&self, app_id: &str) -> Result<Option<Gateway>>;
    async fn get_route(&self, app_id: &str) -> Result<Option<Route>>;

    async fn list_volumes(&self, app_id: &str) -> Result<Vec<Volume>>;
    async fn create_volume(&self, app_id: &str, volume: Volume) -> Result<Volume>;
    async fn delete_volume(&self, app_id: &str, name: &str) -> Result<()>;
    async fn update_volume_path(
        &self,
        app_id: &str,
        name: &str,
        path: std::collections::BTreeMap<String, Option<String>>,
    ) -> Result<()>;
    async fn resize_volume(&self, app_id: &str, name: &str, size: &str) -> Result<Volume>;
    async fn mount_volume_client(&self, app_id: &str, name: &str, command: Vec<String>) -> Result<String>;

    async fn list_resources(&self, app_id: &str) -> Result<Vec<Resource>>;
    async fn create_resource(&self, app_id: &str, resource: Resource) -> Result<Resource>;
    async fn bind_resource(&self, app_id: &str, name: &str) -> Result<()>;
    async fn unbind_resource(&self, app_id: &str, name: &str) -> Result<()>;
    async fn delete_resource(&self, app_id: &str, name: &str) -> Result<()>;

    async fn app_settings(&self, app_id: &str) -> Result<AppSettings>;
    async fn update_app_settings(&self, app_id: &str, settings: AppSettings) -> Result<AppSettings>;

    /// `hooks/build`, `hooks/config`: internal-trust callbacks gated by a
    /// shared service key rather than a user token. Left to the embedding
    /// binary to authenticate before dispatching here.
    async fn hook_build(&self, app_id: &str, build: Build) -> Result<Release>;
    async fn hook_config(&self, app_id: &str, patch: ConfigPatch) -> Result<Release>;
}
