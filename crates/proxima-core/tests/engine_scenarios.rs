//! End-to-end scenarios: events in, actions and reports out.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{beacon, layout_with, rule, t, Harness, GROUP};
use proxima_core::{
    Config, FlushOutcome, LayoutSource, MemoryStorage, ProximaError, ProximityEvent, ReportStatus,
    ResetPolicy, Timeframe, TriggerKind,
};

#[tokio::test(start_paused = true)]
async fn suppression_window_allows_one_firing() {
    let mut suppressed = rule("A", TriggerKind::OnEnter);
    suppressed.suppression_seconds = 60;
    let mut h = Harness::with_layout(layout_with(vec![suppressed])).await;

    for secs in [0, 30, 70] {
        h.engine
            .handle_proximity(ProximityEvent::enter(beacon(1), t(secs)))
            .await
            .unwrap();
    }

    let fired = h.drain_actions();
    let times: Vec<_> = fired.iter().map(|a| a.record.deliver_at).collect();
    assert_eq!(times, [t(0), t(70)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_events_for_one_key_fire_once() {
    let mut suppressed = rule("window", TriggerKind::OnEnter);
    suppressed.suppression_seconds = 60;
    let mut once = rule("once", TriggerKind::OnEnter);
    once.send_only_once = true;
    let mut h = Harness::with_layout(layout_with(vec![suppressed, once])).await;

    let events: Vec<_> = (0..16)
        .map(|_| {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move {
                engine
                    .handle_proximity(ProximityEvent::enter(beacon(1), t(0)))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut delivered = 0;
    let mut suppressed = 0;
    for event in events {
        let outcome = event.await.unwrap();
        assert_eq!(outcome.matched, 2);
        delivered += outcome.delivered.len();
        suppressed += outcome.suppressed;
    }
    assert_eq!(delivered, 2);
    assert_eq!(suppressed, 30);

    let mut fired: Vec<_> = h
        .drain_actions()
        .into_iter()
        .map(|a| a.record.rule_id)
        .collect();
    fired.sort();
    assert_eq!(fired, ["once", "window"]);
}

#[tokio::test]
async fn out_of_range_rule_timing_keeps_cached_layout() {
    let mut h = Harness::with_layout(layout_with(vec![rule("r", TriggerKind::OnEnter)])).await;

    let mut far = rule("far", TriggerKind::OnEnter);
    far.delay_seconds = 10_000_000_000_000;
    let mut forever = rule("forever", TriggerKind::OnEnter);
    forever.suppression_seconds = 10_000_000_000_000_000;
    *h.resolver.layout.lock().unwrap() = Some(layout_with(vec![far, forever]));

    let outcome = h.engine.request_layout().await.unwrap();
    assert_eq!(outcome.source, LayoutSource::Cache);

    let ingest = h
        .engine
        .handle_proximity(ProximityEvent::enter(beacon(1), t(0)))
        .await
        .unwrap();
    assert_eq!(ingest.delivered.len(), 1);
    assert_eq!(h.drain_actions()[0].record.rule_id, "r");
}

#[tokio::test(start_paused = true)]
async fn once_only_delayed_rule_is_admitted_once() {
    let mut once = rule("B", TriggerKind::OnEnter);
    once.send_only_once = true;
    once.delay_seconds = 5;
    let mut h = Harness::with_layout(layout_with(vec![once])).await;

    let first = h
        .engine
        .handle_proximity(ProximityEvent::enter(beacon(1), t(0)))
        .await
        .unwrap();
    assert_eq!(first.scheduled, 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let second = h
        .engine
        .handle_proximity(ProximityEvent::enter(beacon(1), t(3)))
        .await
        .unwrap();
    assert_eq!(second.suppressed, 1);
    assert_eq!(second.scheduled, 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let fired = h.drain_actions();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].record.deliver_at, t(5));
}

#[tokio::test]
async fn once_only_survives_restart() {
    let storage = Arc::new(MemoryStorage::new());
    let mut once = rule("welcome", TriggerKind::OnEnter);
    once.send_only_once = true;
    let layout = layout_with(vec![once]);

    let mut first = Harness::start(Config::default(), Arc::clone(&storage), layout.clone()).await;
    first
        .engine
        .handle_proximity(ProximityEvent::enter(beacon(1), t(0)))
        .await
        .unwrap();
    assert_eq!(first.drain_actions().len(), 1);
    drop(first);

    let mut restarted = Harness::start(Config::default(), storage, layout).await;
    let outcome = restarted
        .engine
        .handle_proximity(ProximityEvent::enter(beacon(1), t(86_400)))
        .await
        .unwrap();
    assert_eq!(outcome.suppressed, 1);
    assert!(restarted.drain_actions().is_empty());
}

#[tokio::test]
async fn timeframe_excludes_events_outside_window() {
    let mut windowed = rule("lunch", TriggerKind::OnEnterOrExit);
    windowed.timeframes.push(Timeframe::between(t(100), t(200)));
    let mut h = Harness::with_layout(layout_with(vec![windowed])).await;

    for (secs, enter) in [(99, true), (100, true), (150, false), (200, true), (250, false)] {
        let event = if enter {
            ProximityEvent::enter(beacon(1), t(secs))
        } else {
            ProximityEvent::exit(beacon(1), t(secs))
        };
        h.engine.handle_proximity(event).await.unwrap();
    }

    let times: Vec<_> = h.drain_actions().iter().map(|a| a.record.deliver_at).collect();
    assert_eq!(times, [t(100), t(150)]);
}

#[tokio::test(start_paused = true)]
async fn delayed_rule_past_its_window_is_reported_expired() {
    let mut closing = rule("closing", TriggerKind::OnEnter);
    closing.delay_seconds = 120;
    closing.timeframes.push(Timeframe::between(t(0), t(60)));
    let mut h = Harness::with_layout(layout_with(vec![closing])).await;

    h.engine
        .handle_proximity(ProximityEvent::enter(beacon(1), t(10)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(121)).await;

    assert!(h.drain_actions().is_empty());
    let reports = h.engine.pending_reports().action_reports;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, ReportStatus::Expired);
    assert_eq!(reports[0].rule_id, "closing");
}

#[tokio::test]
async fn failed_flush_keeps_firings_for_the_next_one() {
    let mut h = Harness::with_layout(layout_with(vec![rule("r", TriggerKind::OnEnter)])).await;
    h.resolver.fail_uploads.store(true, Ordering::SeqCst);

    h.engine
        .handle_proximity(ProximityEvent::enter(beacon(1), t(0)).with_location("u33dc0"))
        .await
        .unwrap();
    let action_id = h.drain_actions()[0].record.action_id;

    let err = h.engine.flush_reports(true).await.unwrap_err();
    assert!(matches!(err, ProximaError::ReportSendFailed(_)));

    h.resolver.fail_uploads.store(false, Ordering::SeqCst);
    let outcome = h.engine.flush_reports(true).await.unwrap();
    assert_eq!(
        outcome,
        FlushOutcome::Sent {
            monitor_events: 1,
            action_reports: 1
        }
    );

    let uploads = h.resolver.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].action_reports[0].action_id, action_id);
    assert_eq!(uploads[0].monitor_events[0].location.as_deref(), Some("u33dc0"));
    assert!(h.engine.pending_reports().is_empty());
}

#[tokio::test]
async fn fetched_layout_round_trips_through_current() {
    let mut full = rule("full", TriggerKind::OnExit);
    full.suppression_seconds = 10;
    full.content.subject = Some("Bye".into());
    full.content.payload = Some(serde_json::json!({"coupon": "X1"}));
    let layout = layout_with(vec![full]);

    let h = Harness::with_layout(layout.clone()).await;
    assert_eq!(*h.engine.current_layout().unwrap(), layout);
    assert_eq!(h.registry.monitored_groups(), [GROUP]);
}

#[tokio::test]
async fn cached_layout_serves_after_restart_when_offline() {
    let storage = Arc::new(MemoryStorage::new());
    let layout = layout_with(vec![rule("cached", TriggerKind::OnEnter)]);
    drop(Harness::start(Config::default(), Arc::clone(&storage), layout.clone()).await);

    let h = Harness::start(Config::default(), storage, layout).await;
    *h.resolver.layout.lock().unwrap() = None;

    let outcome = h.engine.request_layout().await.unwrap();
    assert_eq!(outcome.source, proxima_core::LayoutSource::Cache);
    assert_eq!(h.engine.status().await.degraded_fetches, 1);
}

#[tokio::test]
async fn report_immediately_flushes_in_background() {
    let mut urgent = rule("urgent", TriggerKind::OnEnter);
    urgent.report_immediately = true;
    let h = Harness::with_layout(layout_with(vec![urgent])).await;
    let background = h.engine.spawn_background();

    h.engine
        .handle_proximity(ProximityEvent::enter(beacon(1), t(0)))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.resolver.uploads().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("report should be uploaded without an explicit flush");

    h.engine.shutdown();
    background.join().await;
}

#[tokio::test(start_paused = true)]
async fn reset_cancels_pending_and_clears_state() {
    let mut delayed = rule("later", TriggerKind::OnEnter);
    delayed.delay_seconds = 30;
    delayed.send_only_once = true;
    let mut config = Config::default();
    config.reports.reset_policy = ResetPolicy::Discard;
    let layout = layout_with(vec![delayed]);
    let mut h = Harness::start(config, Arc::new(MemoryStorage::new()), layout).await;

    h.engine
        .handle_proximity(ProximityEvent::enter(beacon(1), t(0)))
        .await
        .unwrap();
    let summary = h.engine.reset().await.unwrap();
    assert_eq!(summary.cancelled_deliveries, 1);
    assert_eq!(summary.discarded_records, 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.drain_actions().is_empty());
    assert!(h.engine.current_layout().is_none());
    assert!(!h.registry.is_monitoring());

    // The ledger was cleared, so the once-only rule may fire again.
    h.engine.request_layout().await.unwrap();
    let outcome = h
        .engine
        .handle_proximity(ProximityEvent::enter(beacon(1), t(100)))
        .await
        .unwrap();
    assert_eq!(outcome.scheduled, 1);
}

#[tokio::test]
async fn reset_with_flush_policy_uploads_queue() {
    let mut h = Harness::with_layout(layout_with(vec![rule("r", TriggerKind::OnEnter)])).await;
    h.engine
        .handle_proximity(ProximityEvent::enter(beacon(1), t(0)))
        .await
        .unwrap();
    h.drain_actions();

    let summary = h.engine.reset().await.unwrap();
    assert_eq!(summary.flushed_records, 2);
    assert_eq!(h.resolver.uploads().len(), 1);
}
