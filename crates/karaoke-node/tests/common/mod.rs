#![allow(dead_code)]

use std::sync::Arc;

use karaoke_core::clock::ManualClock;
use karaoke_core::config::Config;
use karaoke_node::Node;
use karaoke_node::remote::fake::FakeRemote;
use karaoke_node::storage::LocalStore;

pub const T0: i64 = 1_760_000_000;
pub const DEVICE: &str = "device-one";

pub struct Harness {
    pub node: Node,
    pub remote: Arc<FakeRemote>,
    pub clock: Arc<ManualClock>,
    pub media: tempfile::TempDir,
}

pub async fn harness() -> Harness {
    harness_with(Config::default()).await
}

pub async fn harness_with(config: Config) -> Harness {
    let store = LocalStore::open_in_memory().await.unwrap();
    let clock = ManualClock::new(T0);
    let remote = Arc::new(FakeRemote::new(clock.clone()));
    let media = tempfile::tempdir().unwrap();
    let node = Node::new(
        config,
        store,
        remote.clone(),
        clock.clone(),
        DEVICE.to_string(),
        media.path().to_path_buf(),
    );
    Harness {
        node,
        remote,
        clock,
        media,
    }
}

/// Deterministic media body for `code`.
pub fn body(code: &str, len: usize) -> Vec<u8> {
    code.bytes().cycle().take(len).collect()
}
