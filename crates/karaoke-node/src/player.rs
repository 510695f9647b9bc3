//! Playback session.
//!
//! Ties the queue to history and sync: while a song plays, downloads are
//! blocked; when the player goes idle they resume and a sync pass is
//! requested.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use karaoke_core::catalog::CatalogCode;
use karaoke_core::clock::SharedClock;
use karaoke_core::config::HistoryRecordPolicy;

use crate::history::HistoryRelay;
use crate::queue::{PlayQueue, QueueItem};
use crate::sync::SyncEngine;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlayerState {
    #[default]
    Idle,
    #[serde(rename_all = "camelCase")]
    Playing {
        codigo: CatalogCode,
        started_at: i64,
    },
}

/// What `finish` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishOutcome {
    /// History id written for the finished song, if any.
    pub recorded: Option<String>,
    /// Queue item now playing.
    pub next: Option<QueueItem>,
    pub state: PlayerState,
}

pub struct PlayerSession {
    queue: Arc<PlayQueue>,
    history: Arc<HistoryRelay>,
    sync: Arc<SyncEngine>,
    clock: SharedClock,
    policy: HistoryRecordPolicy,
    state: Mutex<PlayerState>,
}

impl PlayerSession {
    pub fn new(
        queue: Arc<PlayQueue>,
        history: Arc<HistoryRelay>,
        sync: Arc<SyncEngine>,
        clock: SharedClock,
        policy: HistoryRecordPolicy,
    ) -> Self {
        Self {
            queue,
            history,
            sync,
            clock,
            policy,
            state: Mutex::new(PlayerState::Idle),
        }
    }

    pub async fn state(&self) -> PlayerState {
        self.state.lock().await.clone()
    }

    /// Start playing `codigo`. Blocks downloads for the session.
    pub async fn start(&self, codigo: CatalogCode) -> PlayerState {
        let mut state = self.state.lock().await;
        self.begin(&mut state, codigo).await;
        state.clone()
    }

    /// Enter `Playing`. A failed history write is logged; the song plays
    /// regardless.
    async fn begin(&self, state: &mut PlayerState, codigo: CatalogCode) {
        self.sync.block_downloads();
        if self.policy == HistoryRecordPolicy::TrackStart
            && let Err(e) = self.history.record_play(&codigo).await
        {
            error!(%codigo, error = %e, "Failed to record play");
        }
        info!(%codigo, "Playback started");
        *state = PlayerState::Playing {
            codigo,
            started_at: self.clock.now(),
        };
    }

    /// Finish the current song and move to the next queued one.
    ///
    /// With nothing playing this does nothing. Otherwise the queue is popped
    /// exactly once; an empty queue leaves the player idle, unblocks
    /// downloads and requests a sync pass.
    pub async fn finish(&self, completed: bool) -> FinishOutcome {
        let mut state = self.state.lock().await;
        let PlayerState::Playing { codigo, .. } = state.clone() else {
            return FinishOutcome {
                recorded: None,
                next: None,
                state: PlayerState::Idle,
            };
        };

        let mut recorded = None;
        if self.policy == HistoryRecordPolicy::TrackCompletion && completed {
            match self.history.record_play(&codigo).await {
                Ok(id) => recorded = Some(id),
                Err(e) => error!(%codigo, error = %e, "Failed to record play"),
            }
        }
        info!(%codigo, completed, "Playback finished");

        let next = self.queue.pop();
        match &next {
            Some(item) => self.begin(&mut state, item.codigo.clone()).await,
            None => {
                *state = PlayerState::Idle;
                self.sync.unblock_downloads();
                self.sync.request_sync();
            }
        }

        FinishOutcome {
            recorded,
            next,
            state: state.clone(),
        }
    }
}
