//! Daemon lifecycle
//!
//! Wires the persistent pieces (operation log, log blobs, signing secret)
//! to the runtime pieces (broker, registry, orchestrator) and runs the
//! scheduler until shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use warden_core::{Config, Result};
use warden_oplog::{Broker, LogStore, OpLog};
use warden_orchestrator::{
    DownloadSigner, Orchestrator, OrchestratorConfig, RepoRegistry,
};

use crate::secret::load_or_generate_secret;
use crate::service::Service;

pub struct Daemon {
    service: Arc<Service>,
    orchestrator: Arc<Orchestrator>,
    loop_handle: JoinHandle<Result<()>>,
}

impl Daemon {
    /// Open all persistent state under `data_dir`, seed the scheduler from
    /// `config`, and start the loop.
    pub async fn start(data_dir: &Path, config_path: PathBuf, config: Config) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(data_dir)?;

        let oplog = Arc::new(OpLog::open(&data_dir.join("oplog.redb"))?);
        let logs = Arc::new(LogStore::open(&data_dir.join("logs"))?);
        let secret = load_or_generate_secret(&data_dir.join("download.secret"))?;
        let broker = Broker::new();
        let bridge = broker.attach(&oplog);
        let registry = Arc::new(RepoRegistry::new(config.repos.clone()));

        let orchestrator = Orchestrator::new(
            config,
            oplog.clone(),
            logs,
            registry,
            broker,
            OrchestratorConfig::default(),
        );
        orchestrator.start().await?;
        let loop_handle = tokio::spawn(orchestrator.clone().run());

        // The bridge subscription lives as long as the oplog; the handle is
        // only needed for explicit teardown, which the daemon never does.
        let _ = bridge;

        let service = Arc::new(Service::new(
            orchestrator.clone(),
            DownloadSigner::new(secret),
            config_path,
            data_dir.join("restores"),
        ));

        info!(data_dir = %data_dir.display(), "daemon started");
        Ok(Self {
            service,
            orchestrator,
            loop_handle,
        })
    }

    pub fn service(&self) -> Arc<Service> {
        self.service.clone()
    }

    /// Request shutdown and wait for the scheduler to drain.
    pub async fn stop(self) -> Result<()> {
        info!("stopping daemon");
        self.orchestrator.stop();
        match self.loop_handle.await {
            Ok(result) => result,
            Err(join_error) => {
                tracing::error!("scheduler loop panicked: {}", join_error);
                Ok(())
            }
        }
    }
}
