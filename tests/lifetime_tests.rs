mod common;

use common::{captured_warnings, router, Backend, MockRouter, MockTemplate};
use fxpool::animation::{reclaim, TimedSubEffect};
use std::rc::Rc;
use std::sync::Arc;

#[test]
fn end_to_end_warmup_dispatch_and_expiry() {
    let backend = Backend::new();
    let router = router();
    let t = MockTemplate::new(&backend, 1, "t");

    router.warmup(Arc::clone(&t), None, 5);
    let pool = router.pool_by_template(t.id()).unwrap();
    assert_eq!(pool.count_all(), 5);
    assert_eq!(pool.count_active(), 0);

    // One instance with a short explicit lifetime, two on the 2s fallback
    router.dispatch_with(Some(Arc::clone(&t)), None, Some(0.5)).unwrap();
    router.dispatch(Some(Arc::clone(&t)), None).unwrap();
    router.dispatch(Some(Arc::clone(&t)), None).unwrap();
    assert_eq!(pool.count_active(), 3);
    assert_eq!(pool.count_inactive(), 2);

    assert_eq!(router.tick(500), 1);
    assert_eq!(pool.count_active(), 2);
    assert_eq!(pool.count_inactive(), 3);
    assert_eq!(backend.instantiated(), 5);
}

#[test]
fn lifetime_follows_longest_sub_effect() {
    let backend = Backend::new();
    let router = router();
    let t = MockTemplate::with_sub_effects(
        &backend,
        1,
        "burst",
        vec![TimedSubEffect::new(2.0, 1.5), TimedSubEffect::new(0.5, 0.5)],
    );

    let fx = router.dispatch(Some(t), None).unwrap();
    assert_eq!(router.next_deadline(), Some(3500));

    assert_eq!(router.tick(3499), 0);
    assert!(fx.instance.is_active());
    assert_eq!(router.tick(3500), 1);
    assert!(!fx.instance.is_active());
}

#[test]
fn instance_without_sub_effects_uses_fallback_lifetime() {
    let backend = Backend::new();
    let router = router();
    let fx = router.dispatch(Some(MockTemplate::new(&backend, 1, "plain")), None).unwrap();

    assert_eq!(router.next_deadline(), Some(2000));
    assert_eq!(router.tick(1999), 0);
    assert_eq!(router.tick(2000), 1);
    assert!(!router.is_active(&fx.handle));
}

#[test]
fn timers_start_at_the_current_router_time() {
    let backend = Backend::new();
    let router = router();
    let t = MockTemplate::new(&backend, 1, "plain");

    router.tick(10_000);
    router.dispatch(Some(t), None).unwrap();

    assert_eq!(router.next_deadline(), Some(12_000));
}

#[test]
fn explicit_release_cancels_the_timer() {
    let backend = Backend::new();
    let router = router();
    let t = MockTemplate::new(&backend, 1, "plain");

    let fx = router.dispatch(Some(Arc::clone(&t)), None).unwrap();
    router.release(fx.handle).unwrap();

    assert_eq!(router.tick(5000), 0);
    let pool = router.pool_by_template(t.id()).unwrap();
    assert_eq!(pool.count_inactive(), 1);
    assert_eq!(pool.count_active(), 0);
}

#[test]
fn stale_timer_does_not_reclaim_a_redispatched_instance() {
    let backend = Backend::new();
    let router = router();
    let t = MockTemplate::new(&backend, 1, "plain");

    let first = router.dispatch_with(Some(Arc::clone(&t)), None, Some(1.0)).unwrap();
    router.release(first.handle).unwrap();
    router.tick(500);
    let second = router.dispatch_with(Some(Arc::clone(&t)), None, Some(3.0)).unwrap();
    assert_eq!(first.instance.id(), second.instance.id());

    // The first dispatch's deadline passes without effect
    assert_eq!(router.tick(1000), 0);
    assert!(second.instance.is_active());
    assert!(router.is_active(&second.handle));

    assert_eq!(router.tick(3500), 1);
    assert!(!second.instance.is_active());
}

#[test]
fn external_deactivation_reclaims_once() {
    let backend = Backend::new();
    let router = router();
    let t = MockTemplate::new(&backend, 1, "plain");

    let fx = router.dispatch(Some(Arc::clone(&t)), None).unwrap();

    assert!(router.notify_deactivated(fx.instance.id()));
    assert!(!router.notify_deactivated(fx.instance.id()));
    assert_eq!(router.tick(10_000), 0);

    let pool = router.pool_by_template(t.id()).unwrap();
    assert_eq!(pool.count_active(), 0);
    assert_eq!(pool.count_inactive(), 1);
}

#[test]
fn reentrant_deactivation_during_release_is_absorbed() {
    let backend = Backend::new();
    let router = Rc::new(router());
    let t = MockTemplate::new(&backend, 1, "plain");

    let weak = Rc::downgrade(&router);
    let reentered = Rc::new(std::cell::Cell::new(0));
    let counter = Rc::clone(&reentered);
    backend.on_deactivate(move |id| {
        if let Some(router) = weak.upgrade() {
            if router.notify_deactivated(id) {
                counter.set(counter.get() + 1);
            }
        }
    });

    let fx = router.dispatch(Some(Arc::clone(&t)), None).unwrap();
    assert_eq!(router.tick(2000), 1);

    // The nested notification found the release already under way
    assert_eq!(reentered.get(), 0);
    let pool = router.pool_by_template(t.id()).unwrap();
    assert_eq!(pool.count_active(), 0);
    assert_eq!(pool.count_inactive(), 1);
    assert!(!fx.instance.is_active());
}

#[test]
fn reclaim_without_router_destroys_instance() {
    let backend = Backend::new();
    let stray = backend.stray();

    reclaim::<MockTemplate>(None::<&MockRouter>, stray.clone());

    assert!(backend.was_destroyed(stray.id()));
}

#[test]
fn reclaim_with_router_returns_instance_to_pool() {
    let backend = Backend::new();
    let router = router();
    let t = MockTemplate::new(&backend, 1, "plain");
    let fx = router.dispatch(Some(Arc::clone(&t)), None).unwrap();

    reclaim(Some(&router), fx.instance.clone());

    assert!(!backend.was_destroyed(fx.instance.id()));
    assert_eq!(router.pool_by_template(t.id()).unwrap().count_inactive(), 1);
}

#[test]
fn clear_all_drops_pending_timers() {
    let backend = Backend::new();
    let router = router();
    let fx = router.dispatch(Some(MockTemplate::new(&backend, 1, "plain")), None).unwrap();

    router.clear_all(false);
    assert_eq!(router.tick(5000), 0);
    assert!(fx.instance.is_active());
}

#[test]
fn cancelled_timers_do_not_accumulate() {
    let backend = Backend::new();
    let router = router();
    let t = MockTemplate::new(&backend, 1, "plain");

    for _ in 0..10_000 {
        let fx = router.dispatch_with(Some(Arc::clone(&t)), None, Some(3600.0)).unwrap();
        router.release(fx.handle).unwrap();
    }

    assert!(router.pending_timers() <= 64, "pending_timers={}", router.pending_timers());
    assert_eq!(router.tick(1000), 0);
    assert_eq!(router.pool_by_template(t.id()).unwrap().count_active(), 0);
}

#[test]
fn pending_timer_survives_queue_compaction() {
    let backend = Backend::new();
    let router = router();
    let long = MockTemplate::new(&backend, 1, "long");
    let churn = MockTemplate::new(&backend, 2, "churn");

    let kept = router.dispatch_with(Some(long), None, Some(5.0)).unwrap();
    for _ in 0..500 {
        let fx = router.dispatch_with(Some(Arc::clone(&churn)), None, Some(60.0)).unwrap();
        assert!(router.notify_deactivated(fx.instance.id()));
    }

    assert!(router.pending_timers() <= 64);
    assert_eq!(router.next_deadline(), Some(5000));
    assert_eq!(router.tick(5000), 1);
    assert!(!kept.instance.is_active());
}

#[test]
fn reclaim_reports_a_rejected_release() {
    let backend = Backend::new();
    let router = router();
    let fx = router.dispatch(Some(MockTemplate::new(&backend, 1, "plain")), None).unwrap();
    router.release(fx.handle).unwrap();

    let ((), warnings) = captured_warnings(|| reclaim(Some(&router), fx.instance.clone()));

    assert!(warnings.iter().any(|line| line.contains("Reclaim failed")), "{:?}", warnings);
    assert!(!backend.was_destroyed(fx.instance.id()));
}
