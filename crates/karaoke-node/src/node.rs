//! Wiring of the node's components.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use karaoke_core::clock::SharedClock;
use karaoke_core::config::Config;

use crate::history::HistoryRelay;
use crate::license::LicenseReconciler;
use crate::player::PlayerSession;
use crate::queue::PlayQueue;
use crate::remote::RemoteStore;
use crate::server::AppState;
use crate::storage::LocalStore;
use crate::sync::{SyncEngine, spawn_sync_scheduler};

/// All node components sharing one store, remote and clock.
#[derive(Clone)]
pub struct Node {
    pub config: Config,
    pub store: LocalStore,
    pub license: Arc<LicenseReconciler>,
    pub sync: Arc<SyncEngine>,
    pub history: Arc<HistoryRelay>,
    pub queue: Arc<PlayQueue>,
    pub player: Arc<PlayerSession>,
}

impl Node {
    pub fn new(
        config: Config,
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        clock: SharedClock,
        device_id: String,
        media_root: PathBuf,
    ) -> Self {
        let license = Arc::new(LicenseReconciler::new(
            store.clone(),
            remote.clone(),
            clock.clone(),
            device_id.clone(),
            config.license.clone(),
        ));
        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            remote.clone(),
            clock.clone(),
            media_root,
            config.sync.clone(),
        ));
        let history = Arc::new(HistoryRelay::new(
            store.clone(),
            remote,
            clock.clone(),
            device_id,
        ));
        let queue = Arc::new(PlayQueue::new());
        let player = Arc::new(PlayerSession::new(
            queue.clone(),
            history.clone(),
            sync.clone(),
            clock,
            config.history.record_policy,
        ));

        Self {
            config,
            store,
            license,
            sync,
            history,
            queue,
            player,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            license: self.license.clone(),
            sync: self.sync.clone(),
            history: self.history.clone(),
            queue: self.queue.clone(),
            player: self.player.clone(),
        }
    }

    /// Start lease revalidation, the sync scheduler and the periodic
    /// history push.
    pub fn spawn_background(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.license.clone().spawn_revalidation(shutdown.clone()),
            spawn_sync_scheduler(self.sync.clone(), shutdown.clone()),
            self.history
                .clone()
                .spawn_periodic(self.config.history.push_interval(), shutdown.clone()),
        ]
    }
}
