//! Creates immutable releases from (Build, Config) tuples and resolves
//! per-ptype deploy arguments (spec.md §4.4, C5).
//!
//! Version allocation and the condition log are grounded on
//! `paasd_definitions::model::release` directly; the per-app critical
//! section and `NoBuild` rollback guard are grounded on spec.md §4.4/§5
//! since the teacher has no release concept of its own (shipcat deploys
//! straight from checked-out manifests, with no persisted version history).

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use paasd_definitions::{Build, Config, ErrorKind, Release, ReleaseState, Result};

use crate::lock::{CacheLock, KvStore};
use crate::store::EntityStore;

const APP_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ReleaseEngine<'a> {
    store: &'a dyn EntityStore,
    kv: &'a dyn KvStore,
}

impl<'a> ReleaseEngine<'a> {
    pub fn new(store: &'a dyn EntityStore, kv: &'a dyn KvStore) -> Self {
        ReleaseEngine { store, kv }
    }

    async fn with_app_lock<T, F>(&self, app_id: &str, f: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let app_lock = CacheLock::new(self.kv, format!("app:lock:{}", app_id));
        if !app_lock.acquire(APP_LOCK_TIMEOUT).await {
            return Err(ErrorKind::ServiceUnavailable(format!(
                "could not acquire app lock for {}",
                app_id
            ))
            .into());
        }
        let result = f.await;
        app_lock.release().await;
        result
    }

    /// `version = max(existing)+1` inside a per-app critical section;
    /// copies forward the side (`build` or `config`) that didn't change.
    async fn create(
        &self,
        app_id: &str,
        user: &str,
        build_id: Option<Uuid>,
        config_id: Uuid,
        summary: String,
    ) -> Result<Release> {
        self.with_app_lock(app_id, async {
            let version = self.store.next_release_version(app_id).await?;
            let release = Release::new(app_id, version, config_id, build_id, format!("{}: {}", user, summary));
            self.store.save_release(release).await
        })
        .await
    }

    pub async fn create_from_build(&self, app_id: &str, user: &str, build: Build) -> Result<Release> {
        build.verify()?;
        let stored_build = self.store.save_build(app_id, build).await?;
        let config_id = match self.store.latest_config(app_id).await? {
            Some(c) => c.id,
            None => self.store.save_config(Config::new(app_id, user)).await?.id,
        };
        self.create(
            app_id,
            user,
            Some(stored_build.id),
            config_id,
            "deploy new build".to_string(),
        )
        .await
    }

    pub async fn create_from_config(&self, app_id: &str, user: &str, config: Config) -> Result<Release> {
        let saved = self.store.save_config(config).await?;
        let build_id = self.store.latest_build(app_id).await?.map(|b| b.id);
        self.create(app_id, user, build_id, saved.id, "config change".to_string())
            .await
    }

    pub async fn latest(&self, app_id: &str) -> Result<Option<Release>> {
        let mut releases = self.store.list_releases(app_id).await?;
        releases.sort_by_key(|r| r.created);
        Ok(releases.pop())
    }

    /// Last release with `failed=false` strictly before `before` (or before
    /// the current latest when `before` is absent).
    pub async fn previous(&self, app_id: &str, before: Option<u32>) -> Result<Option<Release>> {
        let mut releases = self.store.list_releases(app_id).await?;
        let boundary = match before {
            Some(v) => v,
            None => match self.latest(app_id).await? {
                Some(r) => r.version,
                None => return Ok(None),
            },
        };
        releases.retain(|r| r.version < boundary && !r.failed);
        releases.sort_by_key(|r| r.version);
        Ok(releases.pop())
    }

    /// Equivalent to `create_from_build` using the target version's
    /// build+config. Fails with `Drycc("no build")` if the target had none.
    pub async fn rollback_to(&self, app_id: &str, user: &str, version: u32) -> Result<Release> {
        let target = self.store.get_release(app_id, version).await?;
        let build_id = target
            .build_id
            .ok_or_else(|| ErrorKind::Drycc("no build available to roll back to".into()))?;
        self.create(
            app_id,
            user,
            Some(build_id),
            target.config_id,
            format!("rollback to v{}", version),
        )
        .await
    }

    async fn resolve(&self, release: &Release) -> Result<Option<(Build, Config)>> {
        let build_id = match release.build_id {
            Some(id) => id,
            None => return Ok(None),
        };
        let build = self.store.get_build(build_id).await?.build;
        let config = self.store.get_config(release.config_id).await?;
        Ok(Some((build, config)))
    }

    /// All ptypes the release's build declares, or `None` if it has no build.
    pub async fn resolve_declared_ptypes(&self, release: &Release) -> Result<Option<std::collections::BTreeSet<String>>> {
        Ok(self.resolve(release).await?.map(|(b, _)| b.declared_ptypes()))
    }

    pub async fn get_deploy_image(&self, release: &Release, ptype: &str) -> Result<Option<String>> {
        Ok(self
            .resolve(release)
            .await?
            .and_then(|(b, _)| b.deploy_image(ptype)))
    }

    pub async fn get_deploy_command(&self, release: &Release, ptype: &str) -> Result<Option<Vec<String>>> {
        Ok(self
            .resolve(release)
            .await?
            .and_then(|(b, _)| b.deploy_command(ptype)))
    }

    pub async fn get_deploy_args(&self, release: &Release, ptype: &str) -> Result<Vec<String>> {
        Ok(self
            .resolve(release)
            .await?
            .map(|(b, _)| b.deploy_args(ptype))
            .unwrap_or_default())
    }

    pub async fn get_port(&self, release: &Release, ptype: &str) -> Result<Option<u16>> {
        Ok(self
            .resolve(release)
            .await?
            .and_then(|(_, c)| c.port_for_ptype(ptype)))
    }

    pub async fn get_runners(&self, release: &Release, ptypes: &[String]) -> Result<Vec<(String, paasd_definitions::RunStep)>> {
        Ok(self
            .resolve(release)
            .await?
            .map(|(b, _)| b.runners(ptypes))
            .unwrap_or_default())
    }

    pub async fn add_condition(
        &self,
        release: &mut Release,
        state: ReleaseState,
        action: impl Into<String>,
        ptypes: Vec<String>,
        exception: Option<String>,
    ) -> Result<()> {
        let expected = release.updated;
        release.add_condition(state, action, ptypes, exception);
        *release = self.store.save_release_cas(release.clone(), expected).await?;
        Ok(())
    }

    /// Removes ptypes from `deployed_ptypes` that the build no longer
    /// declares.
    pub async fn clean(&self, release: &mut Release) -> Result<()> {
        let declared = match self.resolve(release).await? {
            Some((b, _)) => b.declared_ptypes(),
            None => Default::default(),
        };
        let expected = release.updated;
        release.clean(&declared);
        release.updated = Utc::now();
        *release = self.store.save_release_cas(release.clone(), expected).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryKv;
    use crate::store::InMemoryStore;
    use paasd_definitions::App;
    use std::collections::BTreeMap;

    fn sample_build() -> Build {
        let mut procfile = BTreeMap::new();
        procfile.insert("web".to_string(), "gunicorn app:app".to_string());
        Build {
            image: "autotest/example".into(),
            stack: paasd_definitions::Stack::Container,
            sha: "abc123".into(),
            procfile,
            dryccfile: None,
        }
    }

    #[tokio::test]
    async fn version_allocation_is_monotonic_and_copies_forward_config() {
        let store = InMemoryStore::new();
        let kv = InMemoryKv::new();
        store.create_app(App::new("alpha", "user1").unwrap()).await.unwrap();
        let engine = ReleaseEngine::new(&store, &kv);

        let r1 = engine.create_from_build("alpha", "user1", sample_build()).await.unwrap();
        assert_eq!(r1.version, 1);

        let r2 = engine
            .create_from_config("alpha", "user1", {
                let mut c = Config::new("alpha", "user1");
                c.values.insert(
                    "DEBUG".into(),
                    paasd_definitions::ConfigValue {
                        value: "0".into(),
                        group: "global".into(),
                    },
                );
                c
            })
            .await
            .unwrap();
        assert_eq!(r2.version, 2);
        assert_eq!(r2.build_id, r1.build_id);
    }

    #[tokio::test]
    async fn rollback_without_build_fails() {
        let store = InMemoryStore::new();
        let kv = InMemoryKv::new();
        store.create_app(App::new("alpha", "user1").unwrap()).await.unwrap();
        let engine = ReleaseEngine::new(&store, &kv);
        let cfg = store.save_config(Config::new("alpha", "user1")).await.unwrap();
        store
            .save_release(Release::new("alpha", 1, cfg.id, None, "initial"))
            .await
            .unwrap();

        let err = engine.rollback_to("alpha", "user1", 1).await.unwrap_err();
        assert!(format!("{}", err).contains("no build"));
    }

    #[tokio::test]
    async fn deploy_image_resolves_from_build() {
        let store = InMemoryStore::new();
        let kv = InMemoryKv::new();
        store.create_app(App::new("alpha", "user1").unwrap()).await.unwrap();
        let engine = ReleaseEngine::new(&store, &kv);
        let release = engine.create_from_build("alpha", "user1", sample_build()).await.unwrap();

        assert_eq!(
            engine.get_deploy_image(&release, "web").await.unwrap(),
            Some("autotest/example".to_string())
        );
        assert_eq!(engine.get_deploy_image(&release, "worker").await.unwrap(), None);
    }
}
