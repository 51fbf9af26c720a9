//! Durable records for every entity in the data model (spec.md §3, C4).
//!
//! The teacher has no database layer of its own - `shipcat` reads its state
//! from git-checked-out manifests, not a store with CRUD semantics - so this
//! module has no single file behind it. It is shaped after
//! `shipcat_definitions::Config`'s accessor pattern (typed getters over a
//! struct, verify-before-persist) generalized to a trait boundary so the
//! rest of the crate never depends on a concrete backend.
//!
//! `save_app_cas`/`save_release_cas` implement optimistic concurrency on the
//! `updated` timestamp (Design Note "Mutable lifetimes across orchestrator
//! calls"): a caller that read an entity, did work, and is now writing it
//! back must prove nothing else wrote it in between.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use paasd_definitions::{
    App, AppSettings, Build, Certificate, Config, Domain, ErrorKind, Gateway, LimitPlan, Release,
    Resource, Result, Route, Service, Token, Volume, TLS,
};

/// `Build` carries no identity of its own in the data model - the store
/// stamps one on so a `Release` can reference it by id.
#[derive(Clone, Debug)]
pub struct StoredBuild {
    pub id: Uuid,
    pub app_id: String,
    pub created: DateTime<Utc>,
    pub build: Build,
}

fn conflict(what: &str) -> paasd_definitions::Error {
    ErrorKind::AlreadyExists(format!("{} was concurrently modified", what)).into()
}

fn not_found(what: &str, key: &str) -> paasd_definitions::Error {
    ErrorKind::NotFound(format!("{} '{}' not found", what, key)).into()
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn create_app(&self, app: App) -> Result<App>;
    async fn get_app(&self, id: &str) -> Result<App>;
    async fn list_apps(&self) -> Result<Vec<App>>;
    async fn save_app_cas(&self, app: App, expected_updated: DateTime<Utc>) -> Result<App>;
    async fn delete_app(&self, id: &str) -> Result<()>;
    /// Update owner on the App row and every per-app record atomically.
    async fn transfer_owner(&self, app_id: &str, new_owner: &str) -> Result<()>;

    async fn save_build(&self, app_id: &str, build: Build) -> Result<StoredBuild>;
    async fn get_build(&self, id: Uuid) -> Result<StoredBuild>;
    async fn latest_build(&self, app_id: &str) -> Result<Option<StoredBuild>>;

    async fn save_config(&self, config: Config) -> Result<Config>;
    async fn latest_config(&self, app_id: &str) -> Result<Option<Config>>;
    async fn get_config(&self, id: Uuid) -> Result<Config>;

    async fn save_release(&self, release: Release) -> Result<Release>;
    async fn save_release_cas(
        &self,
        release: Release,
        expected_updated: DateTime<Utc>,
    ) -> Result<Release>;
    async fn get_release(&self, app_id: &str, version: u32) -> Result<Release>;
    async fn list_releases(&self, app_id: &str) -> Result<Vec<Release>>;
    async fn next_release_version(&self, app_id: &str) -> Result<u32>;

    async fn save_app_settings(&self, settings: AppSettings) -> Result<AppSettings>;
    async fn latest_app_settings(&self, app_id: &str) -> Result<Option<AppSettings>>;

    async fn save_service(&self, service: Service) -> Result<Service>;
    async fn get_service(&self, app_id: &str, ptype: &str) -> Result<Service>;
    async fn list_services(&self, app_id: &str) -> Result<Vec<Service>>;
    async fn delete_service(&self, app_id: &str, ptype: &str) -> Result<()>;

    async fn save_domain(&self, domain: Domain) -> Result<Domain>;
    async fn list_domains(&self, app_id: &str) -> Result<Vec<Domain>>;
    async fn delete_domain(&self, id: Uuid) -> Result<()>;

    async fn save_tls(&self, tls: TLS) -> Result<TLS>;
    async fn get_tls(&self, app_id: &str) -> Result<Option<TLS>>;

    async fn save_certificate(&self, cert: Certificate) -> Result<Certificate>;
    async fn list_certificates(&self, app_id: &str) -> Result<Vec<Certificate>>;
    async fn delete_certificate(&self, id: Uuid) -> Result<()>;

    async fn save_gateway(&self, gw: Gateway) -> Result<Gateway>;
    async fn get_gateway(&self, app_id: &str, name: &str) -> Result<Option<Gateway>>;

    async fn save_route(&self, route: Route) -> Result<Route>;
    async fn get_route(&self, app_id: &str, name: &str) -> Result<Option<Route>>;

    async fn save_volume(&self, volume: Volume) -> Result<Volume>;
    async fn list_volumes(&self, app_id: &str) -> Result<Vec<Volume>>;
    async fn delete_volume(&self, app_id: &str, name: &str) -> Result<()>;

    async fn save_resource(&self, resource: Resource) -> Result<Resource>;
    async fn get_resource(&self, app_id: &str, name: &str) -> Result<Resource>;
    async fn list_resources(&self, app_id: &str) -> Result<Vec<Resource>>;
    async fn delete_resource(&self, app_id: &str, name: &str) -> Result<()>;

    async fn save_token(&self, token: Token) -> Result<Token>;
    async fn get_token(&self, key: &str) -> Result<Token>;

    async fn save_limit_plan(&self, plan: LimitPlan) -> Result<LimitPlan>;
    async fn get_limit_plan(&self, name: &str) -> Result<LimitPlan>;
}

#[derive(Default)]
struct State {
    apps: BTreeMap<String, App>,
    builds: BTreeMap<Uuid, StoredBuild>,
    configs: BTreeMap<Uuid, Config>,
    config_order: BTreeMap<String, Vec<Uuid>>,
    releases: BTreeMap<(String, u32), Release>,
    app_settings: BTreeMap<Uuid, AppSettings>,
    app_settings_order: BTreeMap<String, Vec<Uuid>>,
    services: BTreeMap<(String, String), Service>,
    domains: BTreeMap<Uuid, Domain>,
    tls: BTreeMap<String, TLS>,
    certificates: BTreeMap<Uuid, Certificate>,
    gateways: BTreeMap<(String, String), Gateway>,
    routes: BTreeMap<(String, String), Route>,
    volumes: BTreeMap<(String, String), Volume>,
    resources: BTreeMap<(String, String), Resource>,
    tokens: BTreeMap<String, Token>,
    limit_plans: BTreeMap<String, LimitPlan>,
}

/// In-process `EntityStore`, sufficient for a single-replica controller and
/// for tests. A real deployment backs this with the relational layout of
/// spec.md §6 ("Persisted state layout").
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn create_app(&self, app: App) -> Result<App> {
        let mut state = self.state.lock().unwrap();
        if state.apps.contains_key(&app.id) {
            return Err(ErrorKind::AlreadyExists(format!("app '{}' already exists", app.id)).into());
        }
        state.apps.insert(app.id.clone(), app.clone());
        Ok(app)
    }

    async fn get_app(&self, id: &str) -> Result<App> {
        let state = self.state.lock().unwrap();
        state.apps.get(id).cloned().ok_or_else(|| not_found("app", id))
    }

    async fn list_apps(&self) -> Result<Vec<App>> {
        let state = self.state.lock().unwrap();
        Ok(state.apps.values().cloned().collect())
    }

    async fn save_app_cas(&self, mut app: App, expected_updated: DateTime<Utc>) -> Result<App> {
        let mut state = self.state.lock().unwrap();
        let current = state.apps.get(&app.id).ok_or_else(|| not_found("app", &app.id))?;
        if current.updated != expected_updated {
            return Err(conflict(&format!("app '{}'", app.id)));
        }
        app.updated = Utc::now();
        state.apps.insert(app.id.clone(), app.clone());
        Ok(app)
    }

    async fn delete_app(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.apps.remove(id).is_none() {
            return Err(not_found("app", id));
        }
        state.builds.retain(|_, b| b.app_id != id);
        state.config_order.remove(id);
        state.configs.retain(|_, c| c.app_id != id);
        state.releases.retain(|(app_id, _), _| app_id != id);
        state.app_settings_order.remove(id);
        state.app_settings.retain(|_, s| s.app_id != id);
        state.services.retain(|(app_id, _), _| app_id != id);
        state.domains.retain(|_, d| d.app_id != id);
        state.tls.remove(id);
        state.certificates.retain(|_, c| c.app_id != id);
        state.gateways.retain(|(app_id, _), _| app_id != id);
        state.routes.retain(|(app_id, _), _| app_id != id);
        state.volumes.retain(|(app_id, _), _| app_id != id);
        state.resources.retain(|(app_id, _), _| app_id != id);
        Ok(())
    }

    async fn transfer_owner(&self, app_id: &str, new_owner: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let old_owner = state
            .apps
            .get(app_id)
            .ok_or_else(|| not_found("app", app_id))?
            .owner
            .clone();
        if let Some(app) = state.apps.get_mut(app_id) {
            if app.owner == old_owner {
                app.owner = new_owner.to_string();
                app.updated = Utc::now();
            }
        }
        for cfg_id in state.config_order.get(app_id).cloned().unwrap_or_default() {
            if let Some(cfg) = state.configs.get_mut(&cfg_id) {
                if cfg.owner == old_owner {
                    cfg.owner = new_owner.to_string();
                }
            }
        }
        Ok(())
    }

    async fn save_build(&self, app_id: &str, build: Build) -> Result<StoredBuild> {
        build.verify()?;
        let stored = StoredBuild {
            id: Uuid::new_v4(),
            app_id: app_id.to_string(),
            created: Utc::now(),
            build,
        };
        let mut state = self.state.lock().unwrap();
        state.builds.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_build(&self, id: Uuid) -> Result<StoredBuild> {
        let state = self.state.lock().unwrap();
        state
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("build", &id.to_string()))
    }

    async fn latest_build(&self, app_id: &str) -> Result<Option<StoredBuild>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .builds
            .values()
            .filter(|b| b.app_id == app_id)
            .max_by_key(|b| b.created)
            .cloned())
    }

    async fn save_config(&self, config: Config) -> Result<Config> {
        config.verify()?;
        let mut state = self.state.lock().unwrap();
        state.configs.insert(config.id, config.clone());
        state
            .config_order
            .entry(config.app_id.clone())
            .or_default()
            .push(config.id);
        Ok(config)
    }

    async fn latest_config(&self, app_id: &str) -> Result<Option<Config>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .config_order
            .get(app_id)
            .and_then(|ids| ids.last())
            .and_then(|id| state.configs.get(id))
            .cloned())
    }

    async fn get_config(&self, id: Uuid) -> Result<Config> {
        let state = self.state.lock().unwrap();
        state
            .configs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("config", &id.to_string()))
    }

    async fn save_release(&self, release: Release) -> Result<Release> {
        let mut state = self.state.lock().unwrap();
        let key = (release.app_id.clone(), release.version);
        if state.releases.contains_key(&key) {
            return Err(ErrorKind::AlreadyExists(format!(
                "release {} v{} already exists",
                release.app_id, release.version
            ))
            .into());
        }
        state.releases.insert(key, release.clone());
        Ok(release)
    }

    async fn save_release_cas(
        &self,
        mut release: Release,
        expected_updated: DateTime<Utc>,
    ) -> Result<Release> {
        let mut state = self.state.lock().unwrap();
        let key = (release.app_id.clone(), release.version);
        let current = state
            .releases
            .get(&key)
            .ok_or_else(|| not_found("release", &format!("{}/v{}", release.app_id, release.version)))?;
        if current.updated != expected_updated {
            return Err(conflict(&format!("release {} v{}", release.app_id, release.version)));
        }
        release.updated = Utc::now();
        state.releases.insert(key, release.clone());
        Ok(release)
    }

    async fn get_release(&self, app_id: &str, version: u32) -> Result<Release> {
        let state = self.state.lock().unwrap();
        state
            .releases
            .get(&(app_id.to_string(), version))
            .cloned()
            .ok_or_else(|| not_found("release", &format!("{}/v{}", app_id, version)))
    }

    async fn list_releases(&self, app_id: &str) -> Result<Vec<Release>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .releases
            .iter()
            .filter(|((a, _), _)| a == app_id)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn next_release_version(&self, app_id: &str) -> Result<u32> {
        let state = self.state.lock().unwrap();
        let max = state
            .releases
            .keys()
            .filter(|(a, _)| a == app_id)
            .map(|(_, v)| *v)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    async fn save_app_settings(&self, settings: AppSettings) -> Result<AppSettings> {
        let mut state = self.state.lock().unwrap();
        state.app_settings.insert(settings.id, settings.clone());
        state
            .app_settings_order
            .entry(settings.app_id.clone())
            .or_default()
            .push(settings.id);
        Ok(settings)
    }

    async fn latest_app_settings(&self, app_id: &str) -> Result<Option<AppSettings>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .app_settings_order
            .get(app_id)
            .and_then(|ids| ids.last())
            .and_then(|id| state.app_settings.get(id))
            .cloned())
    }

    async fn save_service(&self, service: Service) -> Result<Service> {
        service.verify()?;
        let mut state = self.state.lock().unwrap();
        state
            .services
            .insert((service.app_id.clone(), service.ptype.clone()), service.clone());
        Ok(service)
    }

    async fn get_service(&self, app_id: &str, ptype: &str) -> Result<Service> {
        let state = self.state.lock().unwrap();
        state
            .services
            .get(&(app_id.to_string(), ptype.to_string()))
            .cloned()
            .ok_or_else(|| not_found("service", &format!("{}/{}", app_id, ptype)))
    }

    async fn list_services(&self, app_id: &str) -> Result<Vec<Service>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .services
            .iter()
            .filter(|((a, _), _)| a == app_id)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn delete_service(&self, app_id: &str, ptype: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .services
            .remove(&(app_id.to_string(), ptype.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found("service", &format!("{}/{}", app_id, ptype)))
    }

    async fn save_domain(&self, domain: Domain) -> Result<Domain> {
        let mut state = self.state.lock().unwrap();
        state.domains.insert(domain.id, domain.clone());
        Ok(domain)
    }

    async fn list_domains(&self, app_id: &str) -> Result<Vec<Domain>> {
        let state = self.state.lock().unwrap();
        Ok(state.domains.values().filter(|d| d.app_id == app_id).cloned().collect())
    }

    async fn delete_domain(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .domains
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("domain", &id.to_string()))
    }

    async fn save_tls(&self, tls: TLS) -> Result<TLS> {
        let mut state = self.state.lock().unwrap();
        state.tls.insert(tls.app_id.clone(), tls.clone());
        Ok(tls)
    }

    async fn get_tls(&self, app_id: &str) -> Result<Option<TLS>> {
        let state = self.state.lock().unwrap();
        Ok(state.tls.get(app_id).cloned())
    }

    async fn save_certificate(&self, cert: Certificate) -> Result<Certificate> {
        let mut state = self.state.lock().unwrap();
        state.certificates.insert(cert.id, cert.clone());
        Ok(cert)
    }

    async fn list_certificates(&self, app_id: &str) -> Result<Vec<Certificate>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .certificates
            .values()
            .filter(|c| c.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn delete_certificate(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .certificates
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("certificate", &id.to_string()))
    }

    async fn save_gateway(&self, gw: Gateway) -> Result<Gateway> {
        let mut state = self.state.lock().unwrap();
        state
            .gateways
            .insert((gw.app_id.clone(), gw.name.clone()), gw.clone());
        Ok(gw)
    }

    async fn get_gateway(&self, app_id: &str, name: &str) -> Result<Option<Gateway>> {
        let state = self.state.lock().unwrap();
        Ok(state.gateways.get(&(app_id.to_string(), name.to_string())).cloned())
    }

    async fn save_route(&self, route: Route) -> Result<Route> {
        let mut state = self.state.lock().unwrap();
        state
            .routes
            .insert((route.app_id.clone(), route.name.clone()), route.clone());
        Ok(route)
    }

    async fn get_route(&self, app_id: &str, name: &str) -> Result<Option<Route>> {
        let state = self.state.lock().unwrap();
        Ok(state.routes.get(&(app_id.to_string(), name.to_string())).cloned())
    }

    async fn save_volume(&self, volume: Volume) -> Result<Volume> {
        volume.verify()?;
        let mut state = self.state.lock().unwrap();
        for existing in state.volumes.values() {
            if existing.name != volume.name && existing.conflicts_with(&volume) {
                return Err(ErrorKind::Drycc(format!(
                    "volume '{}' conflicts with existing volume '{}' on a shared (ptype, path)",
                    volume.name, existing.name
                ))
                .into());
            }
        }
        state
            .volumes
            .insert((volume.app_id.clone(), volume.name.clone()), volume.clone());
        Ok(volume)
    }

    async fn list_volumes(&self, app_id: &str) -> Result<Vec<Volume>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .volumes
            .iter()
            .filter(|((a, _), _)| a == app_id)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn delete_volume(&self, app_id: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .volumes
            .remove(&(app_id.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found("volume", &format!("{}/{}", app_id, name)))
    }

    async fn save_resource(&self, resource: Resource) -> Result<Resource> {
        let mut state = self.state.lock().unwrap();
        state
            .resources
            .insert((resource.app_id.clone(), resource.name.clone()), resource.clone());
        Ok(resource)
    }

    async fn get_resource(&self, app_id: &str, name: &str) -> Result<Resource> {
        let state = self.state.lock().unwrap();
        state
            .resources
            .get(&(app_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("resource", &format!("{}/{}", app_id, name)))
    }

    async fn list_resources(&self, app_id: &str) -> Result<Vec<Resource>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .resources
            .iter()
            .filter(|((a, _), _)| a == app_id)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn delete_resource(&self, app_id: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .resources
            .remove(&(app_id.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found("resource", &format!("{}/{}", app_id, name)))
    }

    async fn save_token(&self, token: Token) -> Result<Token> {
        let mut state = self.state.lock().unwrap();
        state.tokens.insert(token.key.clone(), token.clone());
        Ok(token)
    }

    async fn get_token(&self, key: &str) -> Result<Token> {
        let state = self.state.lock().unwrap();
        state.tokens.get(key).cloned().ok_or_else(|| not_found("token", key))
    }

    async fn save_limit_plan(&self, plan: LimitPlan) -> Result<LimitPlan> {
        let mut state = self.state.lock().unwrap();
        state.limit_plans.insert(plan.name.clone(), plan.clone());
        Ok(plan)
    }

    async fn get_limit_plan(&self, name: &str) -> Result<LimitPlan> {
        let state = self.state.lock().unwrap();
        state
            .limit_plans
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("limit plan", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn app_cas_rejects_stale_write() {
        let store = InMemoryStore::new();
        let app = App::new("alpha", "user1").unwrap();
        store.create_app(app.clone()).await.unwrap();

        let stale_updated = app.updated;
        let mut edit = app.clone();
        edit.structure.insert("web".into(), 1);
        let saved = store.save_app_cas(edit, stale_updated).await.unwrap();

        // a second writer using the now-stale `updated` loses the race
        let mut other_edit = app;
        other_edit.structure.insert("worker".into(), 1);
        let err = store.save_app_cas(other_edit, stale_updated).await.unwrap_err();
        assert!(format!("{}", err).contains("concurrently modified"));
        assert_eq!(saved.structure.get("web"), Some(&1));
    }

    #[tokio::test]
    async fn release_version_allocation_is_monotonic() {
        let store = InMemoryStore::new();
        let cfg = Config::new("alpha", "user1");
        assert_eq!(store.next_release_version("alpha").await.unwrap(), 1);
        let r1 = Release::new("alpha", 1, cfg.id, None, "initial");
        store.save_release(r1).await.unwrap();
        assert_eq!(store.next_release_version("alpha").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn volume_path_conflict_is_rejected() {
        let store = InMemoryStore::new();
        let mut a = Volume {
            id: Uuid::new_v4(),
            app_id: "alpha".into(),
            name: "data".into(),
            vtype: paasd_definitions::VolumeType::Csi,
            size: "1G".into(),
            path: Default::default(),
        };
        a.path.insert("web".into(), "/mnt/data".into());
        store.save_volume(a.clone()).await.unwrap();

        let mut b = a.clone();
        b.name = "logs".into();
        let err = store.save_volume(b).await.unwrap_err();
        assert!(format!("{}", err).contains("conflicts"));
    }

    #[tokio::test]
    async fn delete_app_cascades_to_per_app_records() {
        let store = InMemoryStore::new();
        let app = App::new("alpha", "user1").unwrap();
        store.create_app(app).await.unwrap();
        let cfg = Config::new("alpha", "user1");
        store.save_config(cfg).await.unwrap();
        store.delete_app("alpha").await.unwrap();
        assert!(store.latest_config("alpha").await.unwrap().is_none());
        assert!(store.get_app("alpha").await.is_err());
    }
}
