//! Resource-pool behavior under contention: cache slots and API credentials.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use verifier::io::cache_pool::{CachePool, SlotKind};
use verifier::io::config::{CredentialConfig, OverflowPolicy};
use verifier::io::credentials::{CredentialPool, Quota, QuotaClass};
use verifier::workers::parallel_map;

#[test]
fn capacity_two_pool_overflows_to_ephemeral_and_recycles() {
    let temp = tempfile::tempdir().expect("tempdir");
    let pool = CachePool::new(temp.path(), 2, OverflowPolicy::Ephemeral).expect("pool");

    let first = pool.acquire().expect("first");
    let second = pool.acquire().expect("second");
    let third = pool.acquire().expect("third");

    let kinds: HashSet<SlotKind> = [first.kind(), second.kind()].into_iter().collect();
    assert_eq!(kinds.len(), 2);
    assert!(kinds.iter().all(|kind| matches!(kind, SlotKind::Pool(_))));
    assert_eq!(third.kind(), SlotKind::Ephemeral);
    assert_eq!(pool.leased(), 2);

    let ephemeral = third.path().to_path_buf();
    assert!(ephemeral.is_dir());
    drop(third);
    assert!(!ephemeral.exists());

    let released = first.kind();
    let released_path = first.path().to_path_buf();
    drop(first);
    let next = pool.acquire().expect("next");
    assert_eq!(next.kind(), released);
    assert_eq!(next.path(), released_path);
    drop(second);
    drop(next);
    assert_eq!(pool.leased(), 0);
}

#[test]
fn concurrent_leases_never_share_a_pool_slot() {
    let temp = tempfile::tempdir().expect("tempdir");
    let pool = CachePool::new(temp.path(), 2, OverflowPolicy::Ephemeral).expect("pool");
    let held = Mutex::new(HashSet::new());

    let results = parallel_map((0..24).collect::<Vec<u32>>(), 6, |_| {
        let lease = pool.acquire().expect("acquire");
        if let SlotKind::Pool(index) = lease.kind() {
            assert!(
                held.lock().expect("held").insert(index),
                "slot {index} leased twice"
            );
            thread::sleep(Duration::from_millis(2));
            held.lock().expect("held").remove(&index);
        }
        lease.kind()
    });

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(pool.leased(), 0);
    let leftovers: Vec<_> = std::fs::read_dir(temp.path())
        .expect("read cache root")
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("ephemeral-"))
        .collect();
    assert!(leftovers.is_empty());
}

fn starved() -> Quota {
    Quota {
        remaining: 10,
        limit: 5000,
        reset_at: Utc::now() + TimeDelta::hours(1),
    }
}

#[test]
fn acquire_always_returns_the_token_with_headroom() {
    for starved_index in 0..2 {
        let pool = Arc::new(
            CredentialPool::new(
                vec!["first".to_string(), "second".to_string()],
                &CredentialConfig::default(),
            )
            .expect("pool"),
        );
        pool.tokens()[starved_index].set_quota(QuotaClass::Core, starved());
        let expected = pool.tokens()[1 - starved_index].label().to_string();

        for _ in 0..6 {
            let token = pool.acquire(QuotaClass::Core).expect("headroom");
            assert_eq!(token.label(), expected);
        }
    }
}

#[test]
fn search_quota_is_tracked_separately_from_core() {
    let pool = CredentialPool::new(vec!["only".to_string()], &CredentialConfig::default())
        .expect("pool");
    pool.tokens()[0].set_quota(QuotaClass::Core, starved());
    assert!(pool.try_acquire(QuotaClass::Core).is_none());
    assert!(pool.try_acquire(QuotaClass::Search).is_some());
}
