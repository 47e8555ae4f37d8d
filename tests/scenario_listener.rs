mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use odds_feed_rust::adapter::Adapter;
use odds_feed_rust::domain::{EpochChangeReason, MatchStatus, SuspensionReason};
use odds_feed_rust::facade::FacadeError;
use odds_feed_rust::listener::{spawn_listener, HealthCheck, ListenerMsg, ListenerState};
use odds_feed_rust::store::MemoryStore;
use odds_feed_rust::supervisor::spawn_supervisor;

use common::*;

fn start(sub: &Subscriber, plugin: Arc<RecordingPlugin>) -> Adapter {
    Adapter::start(
        listener_cfg(),
        supervisor_cfg(),
        Arc::new(MemoryStore::new()),
        sub.hub.clone(),
        plugin,
    )
}

#[tokio::test]
async fn setup_snapshot_then_in_running_update_pushes_sport_once() {
    let mut sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let mut adapter = start(&sub, plugin.clone());
    let facade = ScriptedFacade::new(fixture("F1", 1, 1, MatchStatus::Setup));
    assert!(adapter.add_fixture(facade.clone()));
    let sup = adapter.supervisor().clone();

    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;
    let sports = sup.get_sports().await;
    assert_eq!(sports.len(), 1);
    assert_eq!((sports[0].total, sports[0].in_setup, sports[0].in_play), (1, 1, 0));
    let initial = sub.drain_sports();
    assert_eq!(initial.len(), 1);

    let mut upd = fixture("F1", 2, 1, MatchStatus::InRunning);
    upd.markets.clear();
    facade.push(upd);

    wait_for_fixture(&sup, "F1", |f| f.match_status == Some(MatchStatus::InRunning)).await;
    let pushed = sub.drain_sports();
    assert_eq!(pushed.len(), 1, "exactly one sport push for the status change");
    assert_eq!((pushed[0].total, pushed[0].in_setup, pushed[0].in_play), (1, 0, 1));
    assert!(plugin.calls().contains(&PluginCall::MatchStatus(Some(MatchStatus::InRunning))));

    adapter.shutdown().await;
}

#[tokio::test]
async fn stale_sequence_is_rejected_without_touching_state() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let mut adapter = start(&sub, plugin.clone());
    let facade = ScriptedFacade::new(fixture("F1", 5, 1, MatchStatus::PreMatch));
    adapter.add_fixture(facade.clone());
    let sup = adapter.supervisor().clone();
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;
    let history_before = sup.get_fixture_history("F1").await.len();

    let mut stale = fixture("F1", 2, 1, MatchStatus::PreMatch);
    stale.markets = vec![market("m1", 9.0)];
    facade.push(stale);

    let mut rejections = 0;
    for _ in 0..400 {
        rejections = adapter.fixture_status("F1").await.map_or(0, |s| s.rejections);
        if rejections == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(rejections, 1);

    let markets = adapter.fixture_markets("F1").await.unwrap();
    let home = markets.get("m1").unwrap().selection("m1-home").unwrap();
    assert_eq!(home.price, Some(2.0));
    let status = adapter.fixture_status("F1").await.unwrap();
    assert_eq!(status.baseline.map(|b| b.sequence), Some(5));
    assert!(!plugin.calls().iter().any(|c| matches!(c, PluginCall::Update { .. })));
    assert_eq!(sup.get_fixture_history("F1").await.len(), history_before);

    adapter.shutdown().await;
}

#[tokio::test]
async fn epoch_change_fetches_snapshot_before_further_updates() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let mut adapter = start(&sub, plugin.clone());
    let facade = ScriptedFacade::new(fixture("F1", 1, 1, MatchStatus::PreMatch));
    adapter.add_fixture(facade.clone());
    let sup = adapter.supervisor().clone();
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;

    let mut snap = fixture("F1", 10, 2, MatchStatus::InRunning);
    snap.markets = vec![market("m1", 4.0)];
    facade.set_snapshot(snap);

    let mut bump = fixture("F1", 3, 2, MatchStatus::InRunning);
    bump.last_epoch_change_reasons = vec![EpochChangeReason::MatchStatus];
    facade.push(bump);

    wait_until("epoch snapshot", || {
        plugin
            .calls()
            .contains(&PluginCall::Snapshot { sequence: 10, epoch_changed: true })
    })
    .await;
    assert_eq!(facade.snapshots(), 2);

    let mut next = fixture("F1", 11, 2, MatchStatus::InRunning);
    next.markets = vec![market("m1", 5.0)];
    facade.push(next);
    wait_until("update after epoch snapshot", || {
        plugin.calls().iter().any(|c| matches!(c, PluginCall::Update { sequence: 11, .. }))
    })
    .await;

    let calls = plugin.calls();
    let status_at = calls
        .iter()
        .position(|c| *c == PluginCall::MatchStatus(Some(MatchStatus::InRunning)))
        .unwrap();
    let snap_at = calls
        .iter()
        .position(|c| *c == PluginCall::Snapshot { sequence: 10, epoch_changed: true })
        .unwrap();
    assert!(status_at < snap_at);

    adapter.shutdown().await;
}

#[tokio::test]
async fn identical_redelivery_is_silent() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let mut adapter = start(&sub, plugin.clone());
    let facade = ScriptedFacade::new(fixture("F1", 1, 1, MatchStatus::PreMatch));
    adapter.add_fixture(facade.clone());
    let sup = adapter.supervisor().clone();
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;
    let history_before = sup.get_fixture_history("F1").await.len();

    facade.push(fixture("F1", 2, 1, MatchStatus::PreMatch));

    let mut seq = 0;
    for _ in 0..400 {
        seq = adapter
            .fixture_status("F1")
            .await
            .and_then(|s| s.baseline)
            .map_or(0, |b| b.sequence);
        if seq == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(seq, 2);
    assert!(!plugin.calls().iter().any(|c| matches!(c, PluginCall::Update { .. })));
    assert_eq!(sup.get_fixture_history("F1").await.len(), history_before);

    adapter.shutdown().await;
}

#[tokio::test]
async fn only_changed_markets_reach_the_plugin() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let mut adapter = start(&sub, plugin.clone());
    let mut initial = fixture("F1", 1, 1, MatchStatus::InRunning);
    initial.markets = vec![market("m1", 2.0), market("m2", 3.0)];
    let facade = ScriptedFacade::new(initial);
    adapter.add_fixture(facade.clone());
    let sup = adapter.supervisor().clone();
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;

    let mut upd = fixture("F1", 2, 1, MatchStatus::InRunning);
    upd.markets = vec![market("m1", 2.0), market("m2", 3.25)];
    facade.push(upd);

    wait_until("delta", || {
        plugin.calls().iter().any(|c| matches!(c, PluginCall::Update { .. }))
    })
    .await;
    assert!(plugin.calls().contains(&PluginCall::Update { sequence: 2, markets: vec!["m2".into()] }));

    adapter.shutdown().await;
}

#[tokio::test]
async fn ordering_faults_beyond_tolerance_error_then_recover() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let mut adapter = start(&sub, plugin.clone());
    let facade = ScriptedFacade::new(fixture("F1", 5, 1, MatchStatus::InRunning));
    adapter.add_fixture(facade.clone());
    let sup = adapter.supervisor().clone();
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;

    facade.set_snapshot(fixture("F1", 20, 1, MatchStatus::InRunning));
    for seq in 1..=4 {
        facade.push(fixture("F1", seq, 1, MatchStatus::InRunning));
    }

    wait_until("recovery snapshot", || {
        plugin.calls().contains(&PluginCall::Snapshot { sequence: 20, epoch_changed: false })
    })
    .await;
    wait_for_fixture(&sup, "F1", |f| f.is_streaming && f.sequence == 20).await;

    let calls = plugin.calls();
    assert!(calls.contains(&PluginCall::Suspend(SuspensionReason::FixtureErrored)));
    assert!(calls.contains(&PluginCall::UnSuspend));
    let history = sup.get_fixture_history("F1").await;
    assert!(history.iter().any(|h| h.listener_state == ListenerState::Errored && h.is_in_error_state));
    assert_eq!(facade.subscribes(), 1, "stream kept while resyncing");

    adapter.shutdown().await;
}

#[tokio::test]
async fn dropped_stream_reconnects_and_resyncs_on_gap() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let mut adapter = start(&sub, plugin.clone());
    let facade = ScriptedFacade::new(fixture("F1", 1, 1, MatchStatus::InRunning));
    adapter.add_fixture(facade.clone());
    let sup = adapter.supervisor().clone();
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;

    facade.drop_stream();
    wait_until("resubscribe", || facade.subscribes() == 2).await;
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;

    let calls = plugin.calls();
    assert!(calls.contains(&PluginCall::Suspend(SuspensionReason::Disconnected)));
    assert!(calls.contains(&PluginCall::UnSuspend));

    // 1 -> 5 skips sequences: continuity lost, fresh snapshot
    facade.set_snapshot(fixture("F1", 6, 1, MatchStatus::InRunning));
    facade.push(fixture("F1", 5, 1, MatchStatus::InRunning));
    wait_until("resync snapshot", || facade.snapshots() == 2).await;
    wait_until("snapshot applied", || {
        plugin.calls().contains(&PluginCall::Snapshot { sequence: 6, epoch_changed: false })
    })
    .await;
    assert!(facade.disconnect_calls.load(Ordering::SeqCst) >= 1);

    adapter.shutdown().await;
}

#[tokio::test]
async fn reconnect_exhaustion_marks_errored() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let mut adapter = start(&sub, plugin.clone());
    let facade = ScriptedFacade::new(fixture("F1", 1, 1, MatchStatus::InRunning));
    adapter.add_fixture(facade.clone());
    let sup = adapter.supervisor().clone();
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;

    facade.fail_subscribe(Some(FacadeError::ConnectionLost("refused".into())));
    facade.drop_stream();

    let ov = wait_for_fixture(&sup, "F1", |f| f.is_in_error_state).await;
    assert_eq!(ov.listener_state, ListenerState::Errored);
    assert!(ov.last_exception.is_some());

    // transport heals: errored listener comes back through a snapshot
    facade.fail_subscribe(None);
    wait_for_fixture(&sup, "F1", |f| f.is_streaming && !f.is_in_error_state).await;

    adapter.shutdown().await;
}

#[tokio::test]
async fn unauthorized_facade_stops_only_that_listener() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let mut adapter = start(&sub, plugin.clone());

    let denied = ScriptedFacade::new(fixture("F1", 1, 1, MatchStatus::PreMatch));
    denied.queue_snapshot_result(Err(FacadeError::Unauthorized("401".into())));
    let fine = ScriptedFacade::new(fixture("F2", 1, 1, MatchStatus::PreMatch));
    adapter.add_fixture(denied.clone());
    adapter.add_fixture(fine.clone());
    let sup = adapter.supervisor().clone();

    let stopped = wait_for_fixture(&sup, "F1", |f| f.listener_state == ListenerState::Stopped).await;
    assert!(stopped.last_exception.unwrap().contains("401"));
    wait_for_fixture(&sup, "F2", |f| f.is_streaming).await;
    assert_eq!(denied.subscribes(), 0);

    adapter.shutdown().await;
}

#[tokio::test]
async fn failing_plugin_does_not_stall_the_listener() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    plugin.fail.store(true, Ordering::SeqCst);
    let mut adapter = start(&sub, plugin.clone());
    let facade = ScriptedFacade::new(fixture("F1", 1, 1, MatchStatus::InRunning));
    adapter.add_fixture(facade.clone());
    let sup = adapter.supervisor().clone();
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;

    let mut upd = fixture("F1", 2, 1, MatchStatus::InRunning);
    upd.markets = vec![market("m1", 7.0)];
    facade.push(upd);

    wait_until("update attempted", || {
        plugin.calls().iter().any(|c| matches!(c, PluginCall::Update { .. }))
    })
    .await;
    let markets = adapter.fixture_markets("F1").await.unwrap();
    assert_eq!(markets.get("m1").unwrap().selection("m1-home").unwrap().price, Some(7.0));
    assert_eq!(adapter.fixture_status("F1").await.unwrap().state, ListenerState::Streaming);

    adapter.shutdown().await;
}

#[tokio::test]
async fn deleted_fixture_retires_and_leaves_sport_counts() {
    let mut sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let mut adapter = start(&sub, plugin.clone());
    let facade = ScriptedFacade::new(fixture("F1", 1, 1, MatchStatus::PreMatch));
    adapter.add_fixture(facade.clone());
    let sup = adapter.supervisor().clone();
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;

    let mut gone = fixture("F1", 2, 2, MatchStatus::Deleted);
    gone.last_epoch_change_reasons = vec![EpochChangeReason::Deleted];
    facade.push(gone);

    let ov = wait_for_fixture(&sup, "F1", |f| f.listener_state == ListenerState::Stopped).await;
    assert!(ov.is_deleted);
    let calls = plugin.calls();
    assert!(calls.contains(&PluginCall::Deletion));
    assert!(calls.contains(&PluginCall::Suspend(SuspensionReason::FixtureDeleted)));

    let last = sub.drain_sports().pop().unwrap();
    assert_eq!(last.total, 0);

    adapter.shutdown().await;
}

#[tokio::test]
async fn admin_suspend_forces_every_market() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let mut adapter = start(&sub, plugin.clone());
    let mut initial = fixture("F1", 1, 1, MatchStatus::InRunning);
    initial.markets = vec![market("m1", 2.0), market("m2", 3.0)];
    let facade = ScriptedFacade::new(initial);
    adapter.add_fixture(facade.clone());
    let sup = adapter.supervisor().clone();
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;

    assert!(adapter.suspend_fixture("F1", SuspensionReason::Administrative));
    let ov = wait_for_fixture(&sup, "F1", |f| f.is_suspended).await;
    assert!(ov.is_streaming);
    let markets = adapter.fixture_markets("F1").await.unwrap();
    assert!(markets.iter().all(|m| m.is_force_suspended()));
    assert!(markets.iter().all(|m| !m.is_suspended()), "data-driven flag untouched");

    assert!(adapter.unsuspend_fixture("F1"));
    wait_for_fixture(&sup, "F1", |f| !f.is_suspended).await;
    let calls = plugin.calls();
    assert!(calls.contains(&PluginCall::Suspend(SuspensionReason::Administrative)));
    assert!(calls.contains(&PluginCall::UnSuspend));
    assert!(!adapter.suspend_fixture("nope", SuspensionReason::Administrative));

    adapter.shutdown().await;
}

#[tokio::test]
async fn stale_health_check_disconnects_and_reconnects() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let (sup, _join) = spawn_supervisor(supervisor_cfg(), Arc::new(MemoryStore::new()), sub.hub.clone());
    let facade = ScriptedFacade::new(fixture("F1", 4, 1, MatchStatus::InRunning));
    let handle = spawn_listener(facade.clone(), plugin.clone(), sup.mailbox(), listener_cfg());
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;

    // upstream at our own sequence: quiet feed, nothing happens
    handle.send(ListenerMsg::HealthCheck(HealthCheck {
        fixture_id: "F1".into(),
        last_sequence: Some(4),
        received_at: tokio::time::Instant::now() + Duration::from_secs(7_200),
    }));
    // upstream moved on while we heard nothing
    handle.send(ListenerMsg::HealthCheck(HealthCheck {
        fixture_id: "F1".into(),
        last_sequence: Some(9),
        received_at: tokio::time::Instant::now() + Duration::from_secs(7_200),
    }));

    wait_until("health suspend", || {
        plugin
            .calls()
            .contains(&PluginCall::Suspend(SuspensionReason::HealthCheckFailure))
    })
    .await;
    wait_until("resubscribe", || facade.subscribes() == 2).await;
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;
    let suspends = plugin
        .calls()
        .iter()
        .filter(|c| matches!(c, PluginCall::Suspend(SuspensionReason::HealthCheckFailure)))
        .count();
    assert_eq!(suspends, 1);

    handle.stop();
    handle.join().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_terminal() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let (sup, _join) = spawn_supervisor(supervisor_cfg(), Arc::new(MemoryStore::new()), sub.hub.clone());
    let facade = ScriptedFacade::new(fixture("F1", 1, 1, MatchStatus::InRunning));
    let handle = spawn_listener(facade.clone(), plugin.clone(), sup.mailbox(), listener_cfg());
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;

    let mailbox = handle.mailbox();
    handle.stop();
    handle.stop();
    handle.join().await;

    assert!(mailbox.send(ListenerMsg::TakeSnapshot).is_err());
    let disposing = plugin
        .calls()
        .iter()
        .filter(|c| matches!(c, PluginCall::Suspend(SuspensionReason::Disposing)))
        .count();
    assert_eq!(disposing, 1);
    wait_for_fixture(&sup, "F1", |f| f.listener_state == ListenerState::Stopped).await;
}

#[tokio::test]
async fn backlog_covered_by_epoch_snapshot_is_not_an_ordering_fault() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let mut adapter = start(&sub, plugin.clone());
    let facade = ScriptedFacade::new(fixture("F1", 1, 1, MatchStatus::PreMatch));
    adapter.add_fixture(facade.clone());
    let sup = adapter.supervisor().clone();
    wait_for_fixture(&sup, "F1", |f| f.is_streaming).await;

    facade.set_snapshot(fixture("F1", 10, 2, MatchStatus::InRunning));
    let mut bump = fixture("F1", 2, 2, MatchStatus::InRunning);
    bump.last_epoch_change_reasons = vec![EpochChangeReason::MatchStatus];
    facade.push(bump);
    // stream keeps delivering what the snapshot already contains
    for seq in 3..=7 {
        facade.push(fixture("F1", seq, 2, MatchStatus::InRunning));
    }
    let mut next = fixture("F1", 11, 2, MatchStatus::InRunning);
    next.markets = vec![market("m1", 3.5)];
    facade.push(next);

    wait_until("update past the snapshot", || {
        plugin.calls().iter().any(|c| matches!(c, PluginCall::Update { sequence: 11, .. }))
    })
    .await;
    assert!(!plugin
        .calls()
        .contains(&PluginCall::Suspend(SuspensionReason::FixtureErrored)));
    assert_eq!(facade.snapshots(), 2);
    let status = adapter.fixture_status("F1").await.unwrap();
    assert_eq!(status.rejections, 0);
    assert_eq!(status.state, ListenerState::Streaming);
    let history = sup.get_fixture_history("F1").await;
    assert!(history.iter().all(|h| !h.is_in_error_state));

    // once the stream moved past the snapshot, going backwards counts again
    facade.push(fixture("F1", 5, 2, MatchStatus::InRunning));
    let mut rejections = 0;
    for _ in 0..400 {
        rejections = adapter.fixture_status("F1").await.map_or(0, |s| s.rejections);
        if rejections == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(rejections, 1);

    adapter.shutdown().await;
}

#[tokio::test]
async fn lower_snapshot_resets_baseline_for_following_updates() {
    let sub = Subscriber::football().await;
    let plugin = RecordingPlugin::new();
    let mut adapter = start(&sub, plugin.clone());
    let facade = ScriptedFacade::new(fixture("F1", 20, 1, MatchStatus::InRunning));
    adapter.add_fixture(facade.clone());
    let sup = adapter.supervisor().clone();
    wait_for_fixture(&sup, "F1", |f| f.is_streaming && f.sequence == 20).await;

    facade.set_snapshot(fixture("F1", 3, 1, MatchStatus::InRunning));
    sup.take_snapshot("F1");
    wait_until("lower snapshot applied", || {
        plugin.calls().contains(&PluginCall::Snapshot { sequence: 3, epoch_changed: false })
    })
    .await;

    // 4 sits between the new and the old baseline
    let mut upd = fixture("F1", 4, 1, MatchStatus::InRunning);
    upd.markets = vec![market("m1", 6.0)];
    facade.push(upd);

    wait_until("update after lower snapshot", || {
        plugin.calls().contains(&PluginCall::Update { sequence: 4, markets: vec!["m1".into()] })
    })
    .await;
    let status = adapter.fixture_status("F1").await.unwrap();
    assert_eq!(status.baseline.map(|b| b.sequence), Some(4));
    assert_eq!(status.rejections, 0);
    let markets = adapter.fixture_markets("F1").await.unwrap();
    assert_eq!(markets.get("m1").unwrap().selection("m1-home").unwrap().price, Some(6.0));

    adapter.shutdown().await;
}
