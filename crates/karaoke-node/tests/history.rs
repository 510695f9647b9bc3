#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

mod common;

use karaoke_core::catalog::CatalogCode;
use karaoke_core::license::KeyKind;

use common::{Harness, body, harness};

fn code(text: &str) -> CatalogCode {
    CatalogCode::parse(text).unwrap()
}

async fn activated() -> Harness {
    let h = harness().await;
    let key = h.remote.add_key(KeyKind::Subscription, None, None);
    h.node.license.validate_key(key.as_str()).await.unwrap();
    h.remote.add_entry("00001", "A", "T", body("00001", 4));
    h
}

#[tokio::test]
async fn push_without_lease_is_skipped() {
    let h = harness().await;
    h.node.history.record_play(&code("00001")).await.unwrap();

    let report = h.node.history.push_unsynced().await.unwrap();
    assert!(report.skipped);
    assert_eq!(report.pending, 1);
    assert_eq!(h.remote.history_pushes(), 0);
}

#[tokio::test]
async fn pushed_rows_are_marked_synced() {
    let h = activated().await;
    for _ in 0..3 {
        h.node.history.record_play(&code("00001")).await.unwrap();
    }

    let report = h.node.history.push_unsynced().await.unwrap();
    assert_eq!(report.pushed, 3);
    assert_eq!(report.errors, 0);
    assert_eq!(report.pending, 0);
    assert_eq!(h.remote.accepted_history().len(), 3);

    let again = h.node.history.push_unsynced().await.unwrap();
    assert_eq!(again.pushed, 0);
    assert_eq!(h.remote.history_pushes(), 1);
}

#[tokio::test]
async fn unknown_code_gets_a_placeholder_and_one_retry() {
    let h = activated().await;
    h.node.history.record_play(&code("00001")).await.unwrap();
    h.node.history.record_play(&code("00099")).await.unwrap();

    let report = h.node.history.push_unsynced().await.unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(report.pending, 0);
    assert_eq!(h.remote.placeholders(), vec!["00099".to_string()]);
    assert_eq!(h.remote.history_pushes(), 2);
}

#[tokio::test]
async fn large_backlogs_go_in_chunks() {
    let h = activated().await;
    for _ in 0..250 {
        h.node.history.record_play(&code("00001")).await.unwrap();
    }

    let report = h.node.history.push_unsynced().await.unwrap();
    assert_eq!(report.pushed, 250);
    assert_eq!(h.remote.history_pushes(), 3);
    assert_eq!(h.node.store.count_unsynced_history().await.unwrap(), 0);
}

#[tokio::test]
async fn offline_push_keeps_rows_for_later() {
    let h = activated().await;
    h.node.history.record_play(&code("00001")).await.unwrap();
    h.node.history.record_play(&code("00001")).await.unwrap();

    h.remote.set_offline(true);
    let report = h.node.history.push_unsynced().await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.errors, 2);
    assert_eq!(report.pending, 2);

    h.remote.set_offline(false);
    let report = h.node.history.push_unsynced().await.unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(report.pending, 0);
}

#[tokio::test]
async fn plays_recorded_during_a_push_are_never_lost() {
    let h = activated().await;
    for _ in 0..20 {
        h.node.history.record_play(&code("00001")).await.unwrap();
    }

    let recorder = async {
        for _ in 0..20 {
            h.node.history.record_play(&code("00001")).await.unwrap();
            tokio::task::yield_now().await;
        }
    };
    let (first, ()) = tokio::join!(h.node.history.push_unsynced(), recorder);
    let first = first.unwrap();
    assert!(first.pushed >= 20);

    let second = h.node.history.push_unsynced().await.unwrap();
    assert_eq!(first.pushed + second.pushed, 40);
    assert_eq!(second.pending, 0);
    assert_eq!(h.remote.accepted_history().len(), 40);
    assert_eq!(h.node.store.count_history().await.unwrap(), 40);
}

#[tokio::test]
async fn unreadable_row_does_not_block_the_rest() {
    let h = activated().await;
    h.node.store.insert_play("bad-row", "abc", common::T0).await.unwrap();
    h.node.history.record_play(&code("00001")).await.unwrap();

    let report = h.node.history.push_unsynced().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(report.pending, 1);
    assert_eq!(h.remote.accepted_history().len(), 1);
}

#[tokio::test]
async fn failed_placeholder_keeps_rows_already_accepted() {
    let h = activated().await;
    h.node.history.record_play(&code("00001")).await.unwrap();
    h.node.history.record_play(&code("00099")).await.unwrap();
    h.remote.set_fail_placeholders(true);

    let report = h.node.history.push_unsynced().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(report.pending, 1);

    h.remote.set_fail_placeholders(false);
    let report = h.node.history.push_unsynced().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(report.pending, 0);
    assert_eq!(h.remote.placeholders(), vec!["00099".to_string()]);
}
