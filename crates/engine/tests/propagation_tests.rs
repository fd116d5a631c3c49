//! Propagation tests for txscope-engine
//!
//! These tests drive the coordinator the way a DAO layer would and check the
//! physical effects on the in-memory provider:
//!
//! 1. **Reentrancy** - nested begins share one physical transaction
//! 2. **Rollback dominance** - any nested rollback rolls the whole thing back
//! 3. **State restoration** - auto-commit and isolation come back after every outcome
//! 4. **Thread confinement** - threads never share a transaction
//! 5. **Escape hatch** - running outside the current transaction, and leaks
//! 6. **Host interop** - borrowing and suppressing host-managed connections

use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use txscope_concurrency::{EndOutcome, TransactionRegistry};
use txscope_core::memory::{MemoryConnection, MemoryConnectionProvider, MemoryHostManager};
use txscope_core::{Connection, IsolationLevel, Resource, TransactionStatus, TxError, TxResult};
use txscope_engine::{CoordinatorConfig, ScopeState, TransactionCoordinator};

// ============================================================================
// Test Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn coordinator() -> TransactionCoordinator {
    init_tracing();
    TransactionCoordinator::new().with_registry(Arc::new(TransactionRegistry::new()))
}

fn setup() -> (TransactionCoordinator, Arc<MemoryConnectionProvider>, Resource) {
    let coordinator = coordinator();
    let provider = MemoryConnectionProvider::new();
    let resource = coordinator.register_resource("orders", provider.clone());
    (coordinator, provider, resource)
}

fn only_connection(provider: &MemoryConnectionProvider) -> Arc<Mutex<MemoryConnection>> {
    let connections = provider.connections();
    assert_eq!(connections.len(), 1, "expected exactly one physical connection");
    Arc::clone(&connections[0])
}

fn assert_reset(provider: &MemoryConnectionProvider) {
    for conn in provider.connections() {
        let conn = conn.lock();
        assert!(conn.is_auto_commit(), "connection {} left in manual commit", conn.id());
        assert_eq!(conn.current_isolation(), IsolationLevel::ReadCommitted);
    }
}

// ============================================================================
// Reentrancy
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn nested_commits_commit_once(depth in 1usize..12) {
        let (coordinator, provider, resource) = setup();
        let mut scopes = Vec::with_capacity(depth);
        for _ in 0..depth {
            scopes.push(coordinator.begin_default(&resource).unwrap());
        }
        let first = scopes[0].instance_id().clone();
        prop_assert!(scopes.iter().all(|s| *s.instance_id() == first));

        while let Some(mut scope) = scopes.pop() {
            let outcome = scope.commit().unwrap();
            prop_assert_eq!(outcome.is_final(), scopes.is_empty());
        }

        let stats = provider.stats();
        prop_assert_eq!(stats.acquired, 1);
        prop_assert_eq!(stats.commits, 1);
        prop_assert_eq!(stats.rollbacks, 0);
        prop_assert_eq!(stats.released, 1);
        prop_assert!(coordinator.current_transaction(&resource).is_none());
    }

    #[test]
    fn any_rollback_rolls_back_everything(depth in 1usize..10, position in 0usize..10) {
        let position = position % depth;
        let (coordinator, provider, resource) = setup();
        let mut scopes = Vec::with_capacity(depth);
        for _ in 0..depth {
            scopes.push(coordinator.begin_default(&resource).unwrap());
        }

        let mut last = None;
        while let Some(mut scope) = scopes.pop() {
            let outcome = if scopes.len() == position {
                scope.rollback().unwrap()
            } else {
                scope.commit().unwrap()
            };
            last = Some(outcome);
        }

        let forced = position != 0;
        prop_assert_eq!(last, Some(EndOutcome::RolledBack { forced }));
        let stats = provider.stats();
        prop_assert_eq!(stats.commits, 0);
        prop_assert_eq!(stats.rollbacks, 1);
        prop_assert_eq!(stats.released, 1);
        assert_reset(&provider);
    }
}

#[test]
fn inner_rollback_then_outer_commit_is_silent_rollback() {
    let (coordinator, provider, resource) = setup();
    let mut outer = coordinator.begin_default(&resource).unwrap();
    let mut inner = coordinator.begin_default(&resource).unwrap();

    assert_eq!(inner.rollback().unwrap(), EndOutcome::Nested { remaining: 1 });
    assert_eq!(outer.status(), TransactionStatus::MarkedRollback);

    assert_eq!(outer.commit().unwrap(), EndOutcome::RolledBack { forced: true });
    assert_eq!(outer.status(), TransactionStatus::RolledBack);
    assert_eq!(provider.stats().commits, 0);
    assert_eq!(provider.stats().rollbacks, 1);
}

#[test]
fn rollback_poisons_siblings_that_already_committed() {
    let (coordinator, provider, resource) = setup();
    let mut outer = coordinator.begin_default(&resource).unwrap();

    let mut first = coordinator.begin_default(&resource).unwrap();
    first.commit().unwrap();
    let mut second = coordinator.begin_default(&resource).unwrap();
    second.rollback().unwrap();
    let mut third = coordinator.begin_default(&resource).unwrap();
    third.commit().unwrap();

    // The first sibling's work is rolled back too
    assert_eq!(outer.commit().unwrap(), EndOutcome::RolledBack { forced: true });
    assert_eq!(provider.stats().commits, 0);
}

#[test]
fn nested_call_in_transaction_joins_outer() {
    let (coordinator, provider, resource) = setup();
    let total = coordinator
        .call_in_transaction(&resource, |outer| {
            let inner_id = coordinator.call_in_transaction(&resource, |inner| {
                assert!(inner.is_nested());
                Ok(inner.instance_id().clone())
            })?;
            assert_eq!(&inner_id, outer.instance_id());
            Ok(40 + 2)
        })
        .unwrap();

    assert_eq!(total, 42);
    assert_eq!(provider.stats().commits, 1);
    assert_eq!(coordinator.metrics().reused, 1);
}

// ============================================================================
// Scope handling
// ============================================================================

#[test]
fn rollback_if_not_committed_after_commit_is_noop() {
    let (coordinator, provider, resource) = setup();
    let mut scope = coordinator.begin_default(&resource).unwrap();
    scope.commit().unwrap();
    scope.rollback_if_not_committed().unwrap();

    assert_eq!(scope.state(), ScopeState::CommitAttempted);
    assert_eq!(provider.stats().rollbacks, 0);
    assert_eq!(scope.status(), TransactionStatus::Committed);
}

#[test]
fn rollback_if_not_committed_after_failed_commit_is_noop() {
    let (coordinator, provider, resource) = setup();
    let mut scope = coordinator.begin_default(&resource).unwrap();
    provider.fail_next_commit();

    assert!(matches!(scope.commit(), Err(TxError::CommitFailed { .. })));
    scope.rollback_if_not_committed().unwrap();
    assert_eq!(provider.stats().rollbacks, 1);
}

#[test]
fn scope_cannot_end_twice() {
    let (coordinator, _provider, resource) = setup();
    let mut scope = coordinator.begin_default(&resource).unwrap();
    scope.rollback().unwrap();

    assert!(matches!(scope.commit(), Err(TxError::ScopeEnded { .. })));
    assert!(matches!(scope.rollback(), Err(TxError::ScopeEnded { .. })));
    assert!(scope.with_connection(|conn| conn.auto_commit()).is_err());
}

#[test]
fn dropped_scope_rolls_back() {
    let (coordinator, provider, resource) = setup();
    {
        let _scope = coordinator.begin_default(&resource).unwrap();
    }
    assert_eq!(provider.stats().rollbacks, 1);
    assert_eq!(provider.stats().released, 1);
    assert!(!coordinator.is_in_transaction(&resource).unwrap());
}

#[test]
fn action_error_rolls_back_and_is_returned() {
    let (coordinator, provider, resource) = setup();
    let err = coordinator
        .run_in_transaction(&resource, |_| Err(TxError::action_message("order rejected")))
        .unwrap_err();

    assert!(matches!(err, TxError::Action { .. }));
    assert_eq!(provider.stats().commits, 0);
    assert_eq!(provider.stats().rollbacks, 1);
    assert_eq!(coordinator.metrics().rolled_back, 1);
}

#[test]
fn panic_inside_action_rolls_back() {
    let (coordinator, provider, resource) = setup();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        coordinator.run_in_transaction(&resource, |_| -> TxResult<()> { panic!("dao bug") })
    }));

    assert!(outcome.is_err());
    assert_eq!(provider.stats().rollbacks, 1);
    assert_eq!(provider.stats().outstanding(), 0);
    assert!(coordinator.current_transaction(&resource).is_none());
}

#[test]
fn connection_is_reachable_through_scope() {
    let (coordinator, _provider, resource) = setup();
    coordinator
        .run_in_transaction(&resource, |scope| {
            let auto_commit = scope.with_connection(|conn| conn.auto_commit())?;
            assert!(!auto_commit);
            Ok(())
        })
        .unwrap();
}

// ============================================================================
// State restoration
// ============================================================================

#[test]
fn nested_serializable_restores_read_committed() {
    let (coordinator, provider, resource) = setup();
    let mut outer = coordinator
        .begin(&resource, IsolationLevel::ReadCommitted, false)
        .unwrap();
    let mut inner = coordinator
        .begin(&resource, IsolationLevel::Serializable, true)
        .unwrap();
    let conn = only_connection(&provider);
    assert_eq!(conn.lock().current_isolation(), IsolationLevel::Serializable);
    assert!(inner.transaction().is_for_update_only());

    inner.commit().unwrap();
    assert_eq!(conn.lock().current_isolation(), IsolationLevel::ReadCommitted);
    assert_eq!(outer.isolation_level(), IsolationLevel::ReadCommitted);
    assert!(!outer.transaction().is_for_update_only());

    outer.commit().unwrap();
}

#[test]
fn nested_default_under_configured_default_keeps_outer_level() {
    init_tracing();
    let config = CoordinatorConfig::default().with_default_isolation(IsolationLevel::Serializable);
    let coordinator = TransactionCoordinator::with_config(config)
        .unwrap()
        .with_registry(Arc::new(TransactionRegistry::new()));
    let provider = MemoryConnectionProvider::new();
    let resource = coordinator.register_resource("orders", provider.clone());

    coordinator
        .call_in_transaction_with(&resource, IsolationLevel::ReadUncommitted, false, |_| {
            coordinator.run_in_transaction(&resource, |inner| {
                assert_eq!(inner.isolation_level(), IsolationLevel::ReadUncommitted);
                Ok(())
            })
        })
        .unwrap();

    let conn = only_connection(&provider);
    assert_eq!(
        conn.lock().isolation_history(),
        &[IsolationLevel::ReadUncommitted, IsolationLevel::ReadCommitted]
    );
}

#[test]
fn settings_restored_after_every_outcome() {
    let (coordinator, provider, resource) = setup();

    let mut committed = coordinator
        .begin(&resource, IsolationLevel::Serializable, false)
        .unwrap();
    committed.commit().unwrap();
    assert_reset(&provider);

    let mut rolled_back = coordinator
        .begin(&resource, IsolationLevel::RepeatableRead, false)
        .unwrap();
    rolled_back.rollback().unwrap();
    assert_reset(&provider);

    let mut failed = coordinator
        .begin(&resource, IsolationLevel::ReadUncommitted, false)
        .unwrap();
    provider.fail_next_commit();
    assert!(failed.commit().is_err());
    assert_reset(&provider);

    let mut failed_twice = coordinator
        .begin(&resource, IsolationLevel::Serializable, false)
        .unwrap();
    provider.fail_next_commit();
    provider.fail_next_rollback();
    match failed_twice.commit() {
        Err(TxError::CommitFailed { rollback, .. }) => assert!(rollback.is_some()),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(failed_twice.status(), TransactionStatus::FailedRollback);
    assert_reset(&provider);
    assert_eq!(provider.stats().outstanding(), 0);

    let metrics = coordinator.metrics();
    assert_eq!(metrics.committed, 1);
    assert_eq!(metrics.rolled_back, 1);
    assert_eq!(metrics.failed, 2);
    assert_eq!(metrics.active(), 0);
}

#[test]
fn manual_commit_connection_is_left_manual() {
    let coordinator = coordinator();
    let provider = MemoryConnectionProvider::with_initial(false, IsolationLevel::RepeatableRead);
    let resource = coordinator.register_resource("ledger", provider.clone());

    let mut scope = coordinator
        .begin(&resource, IsolationLevel::Serializable, false)
        .unwrap();
    assert!(!scope.transaction().original_auto_commit());
    scope.commit().unwrap();

    let conn = only_connection(&provider);
    let conn = conn.lock();
    assert!(!conn.is_auto_commit());
    assert_eq!(conn.current_isolation(), IsolationLevel::RepeatableRead);
}

#[test]
fn release_failure_surfaces_after_commit() {
    let (coordinator, provider, resource) = setup();
    let mut scope = coordinator.begin_default(&resource).unwrap();
    provider.fail_next_release();

    assert!(matches!(scope.commit(), Err(TxError::ConnectionRelease { .. })));
    assert_eq!(provider.stats().commits, 1);
    assert_eq!(scope.status(), TransactionStatus::Committed);
    assert!(coordinator.current_transaction(&resource).is_none());
    assert_eq!(coordinator.metrics().committed, 1);
    assert_eq!(coordinator.metrics().failed, 0);
}

// ============================================================================
// Thread confinement
// ============================================================================

#[test]
fn threads_get_distinct_transactions() {
    let (coordinator, provider, resource) = setup();
    let coordinator = Arc::new(coordinator);
    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));
    let seen = Arc::new(Mutex::new(HashSet::new()));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let resource = resource.clone();
            let barrier = Arc::clone(&barrier);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                let mut outer = coordinator.begin_default(&resource).unwrap();
                let mut inner = coordinator.begin_default(&resource).unwrap();
                assert_eq!(outer.instance_id(), inner.instance_id());
                seen.lock().insert(outer.instance_id().clone());

                // Everyone holds an open transaction at the same time
                barrier.wait();
                inner.commit().unwrap();
                outer.commit().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(seen.lock().len(), threads);
    let stats = provider.stats();
    assert_eq!(stats.acquired, threads as u64);
    assert_eq!(stats.commits, threads as u64);
    assert_eq!(stats.outstanding(), 0);
    assert!(coordinator.registry().is_empty());
}

#[test]
fn other_thread_does_not_see_transaction() {
    let (coordinator, _provider, resource) = setup();
    let coordinator = Arc::new(coordinator);
    let mut scope = coordinator.begin_default(&resource).unwrap();

    let remote = Arc::clone(&coordinator);
    let remote_resource = resource.clone();
    let visible = thread::spawn(move || remote.is_in_transaction(&remote_resource).unwrap())
        .join()
        .unwrap();

    assert!(!visible);
    assert!(coordinator.is_in_transaction(&resource).unwrap());
    scope.commit().unwrap();
}

#[test]
fn resources_do_not_share_transactions() {
    let coordinator = coordinator();
    let orders = coordinator.register_resource("orders", MemoryConnectionProvider::new());
    let billing = coordinator.register_resource("billing", MemoryConnectionProvider::new());

    let mut a = coordinator.begin_default(&orders).unwrap();
    let mut b = coordinator.begin_default(&billing).unwrap();
    assert!(!b.is_nested());
    assert_ne!(a.instance_id(), b.instance_id());
    b.rollback().unwrap();
    assert_eq!(a.status(), TransactionStatus::Active);
    a.commit().unwrap();
}

// ============================================================================
// Escape hatch
// ============================================================================

#[test]
fn work_outside_started_transaction_resumes_outer() {
    let (coordinator, provider, resource) = setup();
    let mut outer = coordinator.begin_default(&resource).unwrap();
    let outer_id = outer.instance_id().clone();

    let inner_id = coordinator
        .call_not_in_started_transaction(&resource, || {
            assert!(!coordinator.is_in_transaction(&resource)?);
            coordinator.call_in_transaction(&resource, |scope| {
                assert!(!scope.is_nested());
                Ok(scope.instance_id().clone())
            })
        })
        .unwrap();

    assert_ne!(inner_id, outer_id);
    assert_eq!(
        coordinator.current_transaction(&resource).unwrap().instance_id(),
        &outer_id
    );
    assert_eq!(provider.stats().commits, 1);

    outer.commit().unwrap();
    let stats = provider.stats();
    assert_eq!(stats.commits, 2);
    assert_eq!(stats.acquired, 2);
    assert_eq!(stats.outstanding(), 0);
}

#[test]
fn leak_inside_escape_hatch_is_reported() {
    let (coordinator, provider, resource) = setup();
    let mut outer = coordinator.begin_default(&resource).unwrap();

    let err = coordinator
        .run_not_in_started_transaction(&resource, || {
            let leaked = coordinator.begin_default(&resource)?;
            std::mem::forget(leaked);
            Ok(())
        })
        .unwrap_err();

    match &err {
        TxError::TransactionLeaked { leaked, .. } => assert_ne!(leaked, outer.instance_id()),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_usage_error());
    assert_eq!(
        coordinator.current_transaction(&resource).unwrap().instance_id(),
        outer.instance_id()
    );

    outer.commit().unwrap();
    let stats = provider.stats();
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.outstanding(), 0);
}

#[test]
fn escape_hatch_without_transaction_runs_directly() {
    let (coordinator, provider, resource) = setup();
    let value = coordinator
        .call_not_in_started_transaction(&resource, || Ok("direct"))
        .unwrap();
    assert_eq!(value, "direct");
    assert_eq!(provider.stats().acquired, 0);
}

#[test]
fn scope_escape_hatch_detaches_transaction() {
    let (coordinator, _provider, resource) = setup();
    let mut scope = coordinator.begin_default(&resource).unwrap();
    scope
        .run_not_in_me(|| {
            assert!(coordinator.current_transaction(&resource).is_none());
            Ok(())
        })
        .unwrap();
    assert!(coordinator.current_transaction(&resource).is_some());
    scope.commit().unwrap();
}

// ============================================================================
// Host interop
// ============================================================================

fn host_setup() -> (
    TransactionCoordinator,
    Arc<MemoryHostManager>,
    Arc<MemoryConnectionProvider>,
    Resource,
) {
    init_tracing();
    let host = MemoryHostManager::new();
    let coordinator = TransactionCoordinator::new()
        .with_registry(Arc::new(TransactionRegistry::new()))
        .with_host_manager(host.clone());
    let provider = MemoryConnectionProvider::new();
    let resource = coordinator.register_resource("orders", provider.clone());
    (coordinator, host, provider, resource)
}

#[test]
fn host_rollback_requests_rollback_only() {
    let (coordinator, host, provider, resource) = host_setup();
    let host_conn = provider.open_unpooled();
    host_conn.lock().set_auto_commit(false).unwrap();
    host.bind(&resource, host_conn.clone(), true);

    coordinator
        .run_in_transaction(&resource, |_| Err(TxError::action_message("validation failed")))
        .unwrap_err();

    assert_eq!(host.rollback_only_requests(), vec![resource.id()]);
    assert_eq!(host_conn.lock().rollback_count(), 0);
    assert!(!host_conn.lock().is_auto_commit());
    assert_eq!(provider.stats().released, 0);
}

#[test]
fn host_isolation_override_is_restored() {
    let (coordinator, host, provider, resource) = host_setup();
    let host_conn = provider.open_unpooled();
    host_conn.lock().set_auto_commit(false).unwrap();
    host.bind(&resource, host_conn.clone(), true);

    coordinator
        .call_in_transaction_with(&resource, IsolationLevel::Serializable, false, |scope| {
            assert_eq!(scope.isolation_level(), IsolationLevel::Serializable);
            Ok(())
        })
        .unwrap();

    assert_eq!(
        host_conn.lock().isolation_history(),
        &[IsolationLevel::Serializable, IsolationLevel::ReadCommitted]
    );
}

#[test]
fn suppression_forces_fresh_connection() {
    let (coordinator, host, provider, resource) = host_setup();
    let host_conn = provider.open_unpooled();
    host_conn.lock().set_auto_commit(false).unwrap();
    host.bind(&resource, host_conn.clone(), true);
    assert!(coordinator.is_in_transaction(&resource).unwrap());

    coordinator
        .run_not_in_started_transaction(&resource, || {
            assert!(!coordinator.is_in_transaction(&resource)?);
            coordinator.run_in_transaction(&resource, |scope| {
                assert!(scope.transaction().close_connection_on_finish());
                Ok(())
            })
        })
        .unwrap();

    let stats = provider.stats();
    assert_eq!(stats.acquired, 1);
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.released, 1);
    assert_eq!(host_conn.lock().commit_count(), 0);
    assert!(coordinator.is_in_transaction(&resource).unwrap());
}

#[test]
fn configuration_loaded_from_toml_applies() {
    init_tracing();
    let config = CoordinatorConfig::from_toml_str(
        "creator_tag = \"billing\"\ndefault_isolation = \"repeatable_read\"\nstrict_end_calls = true",
    )
    .unwrap();
    let coordinator = TransactionCoordinator::with_config(config)
        .unwrap()
        .with_registry(Arc::new(TransactionRegistry::new()));
    let provider = MemoryConnectionProvider::new();
    let resource = coordinator.register_resource("orders", provider.clone());

    assert!(coordinator.config().strict_end_calls);
    let mut scope = coordinator.begin_default(&resource).unwrap();
    assert_eq!(scope.transaction().context_key().creator().as_str(), "billing");
    assert_eq!(scope.isolation_level(), IsolationLevel::RepeatableRead);

    let txn = Arc::clone(scope.transaction());
    txn.rollback().unwrap();
    assert!(matches!(scope.commit(), Err(TxError::InvalidState { .. })));
    assert_eq!(provider.stats().rollbacks, 1);
}
