//! Hub assembly: registry, local components, and background tasks.
//!
//! Construction order matters: the engines register their components
//! first, then the server component registers last so its change-broadcast
//! wiring sees every local parameter.

use crate::config::HubConfig;
use crate::net_actions::NetActions;
use crate::scheduler::Scheduler;
use crate::server;
use crate::session::{self, SessionConfig};
use crate::state::{DeviceTable, Nicknames};
use crate::watcher::Watcher;
use pb_core::Registry;
use pb_protocol::ParamUpdate;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("failed to bind server port: {0}")]
    Bind(#[from] std::io::Error),
}

/// The assembled hub: local components plus shared state handles.
pub struct Hub {
    pub cfg: HubConfig,
    pub registry: Arc<Registry>,
    pub devices: Arc<DeviceTable>,
    pub nicknames: Nicknames,
    pub updates_tx: broadcast::Sender<ParamUpdate>,
    pub scheduler: Arc<Scheduler>,
    pub watcher: Arc<Watcher>,
    pub net_actions: Arc<NetActions>,
}

impl Hub {
    /// Build the registry and all local components.  Must run inside a
    /// tokio runtime: component callbacks capture the current handle.
    pub fn new(cfg: HubConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let devices = Arc::new(DeviceTable::new());
        let nicknames = Nicknames::new();
        let (updates_tx, _) = broadcast::channel(1024);

        let net_actions = NetActions::new(&registry, nicknames.clone());
        let scheduler = Scheduler::new(registry.clone(), devices.clone(), nicknames.clone());
        let watcher = Watcher::new(registry.clone(), devices.clone(), nicknames.clone(), &scheduler);

        Self {
            cfg,
            registry,
            devices,
            nicknames,
            updates_tx,
            scheduler,
            watcher,
            net_actions,
        }
    }

    /// Bind the protocol server and spawn every background task: server,
    /// scheduler, watcher, and one session supervisor per configured
    /// device.  Returns the server's bound address.
    ///
    /// A bind failure is the one fatal startup error.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<SocketAddr, HubError> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.cfg.server_port)).await?;
        let addr = listener.local_addr()?;

        let server_state = server::build(
            self.registry.clone(),
            self.updates_tx.clone(),
            addr.port(),
            shutdown.clone(),
        );
        tokio::spawn(server::serve(listener, server_state));
        info!(addr = %addr, "protocol server listening");

        tokio::spawn(self.scheduler.clone().run(shutdown.clone()));
        tokio::spawn(self.watcher.clone().run(shutdown.clone()));

        let session_cfg = SessionConfig::from(&self.cfg);
        for endpoint in &self.cfg.devices {
            let device = self.devices.insert(endpoint);
            tokio::spawn(session::run_device_supervisor(
                device,
                session_cfg.clone(),
                shutdown.clone(),
            ));
        }

        Ok(addr)
    }

    /// Complete snapshot of every remote device's mirrored state.
    pub fn snapshot(&self) -> serde_json::Value {
        self.devices.snapshot()
    }
}
