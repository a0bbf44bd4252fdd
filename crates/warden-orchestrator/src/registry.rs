//! Repo registry
//!
//! Maps a repo id to a memoized [`RepoDriver`], built lazily on first access.
//! Concurrent `get` calls for the same id block until the first build
//! finishes. Drivers for repos that disappear on config reload are torn down
//! by dropping their last reference.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use warden_core::{Repo, Result, WardenError};
use warden_restic::{RepoDriver, ResticCli};

/// Builds a driver for a configured repo.
pub type DriverFactory = Box<dyn Fn(&Repo) -> Arc<dyn RepoDriver> + Send + Sync>;

pub struct RepoRegistry {
    /// Guards both the repo set and the memoized drivers, so a build in
    /// progress holds back every other caller.
    inner: tokio::sync::Mutex<Inner>,
    factory: DriverFactory,
}

struct Inner {
    repos: HashMap<String, Repo>,
    drivers: HashMap<String, Arc<dyn RepoDriver>>,
}

impl RepoRegistry {
    /// Registry backed by the production restic CLI driver.
    pub fn new(repos: Vec<Repo>) -> Self {
        Self::with_factory(
            repos,
            Box::new(|repo| Arc::new(ResticCli::new(repo.clone()))),
        )
    }

    /// Registry with an injected driver factory (used by tests).
    pub fn with_factory(repos: Vec<Repo>, factory: DriverFactory) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(Inner {
                repos: repos.into_iter().map(|r| (r.id.clone(), r)).collect(),
                drivers: HashMap::new(),
            }),
            factory,
        }
    }

    /// Cached driver for `repo_id`, building it on first access.
    pub async fn get(&self, repo_id: &str) -> Result<Arc<dyn RepoDriver>> {
        let mut inner = self.inner.lock().await;
        if let Some(driver) = inner.drivers.get(repo_id) {
            return Ok(driver.clone());
        }
        let repo = inner
            .repos
            .get(repo_id)
            .cloned()
            .ok_or_else(|| WardenError::NotFound(format!("repo {}", repo_id)))?;
        debug!(repo = repo_id, "building repo driver");
        let driver = (self.factory)(&repo);
        inner.drivers.insert(repo_id.to_string(), driver.clone());
        Ok(driver)
    }

    /// Replace the repo set on config reload, dropping drivers whose repo
    /// disappeared or changed.
    pub async fn update(&self, repos: Vec<Repo>) {
        let mut inner = self.inner.lock().await;
        let fresh: HashMap<String, Repo> = repos.into_iter().map(|r| (r.id.clone(), r)).collect();
        let stale: Vec<String> = inner
            .drivers
            .keys()
            .filter(|id| fresh.get(*id) != inner.repos.get(*id))
            .cloned()
            .collect();
        for id in stale {
            info!(repo = %id, "tearing down driver for removed or changed repo");
            inner.drivers.remove(&id);
        }
        inner.repos = fresh;
    }

    /// Ids of currently configured repos.
    pub async fn repo_ids(&self) -> Vec<String> {
        self.inner.lock().await.repos.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warden_restic::MockDriver;

    fn repo(id: &str) -> Repo {
        Repo {
            id: id.to_string(),
            uri: format!("/tmp/{}", id),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_memoizes_driver_builds() {
        let builds = Arc::new(AtomicUsize::new(0));
        let builds2 = builds.clone();
        let registry = RepoRegistry::with_factory(
            vec![repo("r1")],
            Box::new(move |_| {
                builds2.fetch_add(1, Ordering::SeqCst);
                Arc::new(MockDriver::new())
            }),
        );

        let a = registry.get("r1").await.unwrap();
        let b = registry.get("r1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_repo() {
        let registry = RepoRegistry::with_factory(vec![], Box::new(|_| Arc::new(MockDriver::new())));
        assert!(matches!(
            registry.get("missing").await,
            Err(WardenError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_tears_down_removed_repos() {
        let registry = RepoRegistry::with_factory(
            vec![repo("r1"), repo("r2")],
            Box::new(|_| Arc::new(MockDriver::new())),
        );
        registry.get("r1").await.unwrap();
        registry.get("r2").await.unwrap();

        registry.update(vec![repo("r1")]).await;
        assert!(registry.get("r1").await.is_ok());
        assert!(registry.get("r2").await.is_err());
    }
}
