use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::Config;
use crate::test_support::{RecordingNotifier, StaticQueryService};
use crate::tsdb::{QueryError, Response};

const T0: i64 = 1_700_000_000;

fn at(offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(T0 + offset, 0).unwrap()
}

const MIN: i64 = 60;

struct Harness {
    backend: Arc<StaticQueryService>,
    notifier: Arc<RecordingNotifier>,
    schedule: Arc<Schedule>,
}

fn harness(toml: &str) -> Harness {
    harness_with(toml, RecordingNotifier::new())
}

fn harness_with(toml: &str, notifier: RecordingNotifier) -> Harness {
    let conf = Config::from_toml(toml).unwrap().into_conf().unwrap();
    let backend = Arc::new(StaticQueryService::new());
    let notifier = Arc::new(notifier);
    let schedule = Arc::new(Schedule::new(
        Arc::new(conf),
        backend.clone(),
        notifier.clone(),
        Duration::from_secs(5),
    ));
    Harness {
        backend,
        notifier,
        schedule,
    }
}

fn series(metric: &str, hosts: &[(&str, f64)]) -> Vec<Response> {
    hosts
        .iter()
        .map(|(host, v)| Response {
            metric: metric.into(),
            tags: format!("host={host}").parse().unwrap(),
            dps: [(0, *v)].into_iter().collect(),
        })
        .collect()
}

fn host_tag(pattern: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("host".to_string(), pattern.to_string())])
}

fn key(s: &str) -> AlertKey {
    s.parse().unwrap()
}

const SIMPLE: &str = r#"
    [notifications.ops]
    print = true

    [alerts.a]
    crit = 'avg(q("avg:m{host=x}", "5m", "")) > 0'
    crit_notification = ["ops"]
"#;

#[tokio::test]
async fn test_critical_needs_ack() {
    let h = harness(SIMPLE);
    h.backend.respond("m", series("m", &[("x", 1.0)]));

    let summary = h.schedule.check_at(at(0)).await;

    assert_eq!(summary.keys, 1);
    assert_eq!(summary.notifications, 1);
    assert!(summary.failed.is_empty());
    let state = h.schedule.state(&key("a{host=x}")).unwrap();
    assert_eq!(state.last(), Status::Critical);
    assert!(state.need_ack);
    assert_eq!(state.subject, "critical: a{host=x}");

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].notification, "ops");
    assert_eq!(sent[0].keys, vec![key("a{host=x}")]);
}

#[tokio::test]
async fn test_unacknowledged_recovery_notifies_once() {
    let h = harness(SIMPLE);
    h.backend.respond("m", series("m", &[("x", 1.0)]));
    h.schedule.check_at(at(0)).await;

    h.backend.respond("m", series("m", &[("x", 0.0)]));
    h.schedule.check_at(at(5 * MIN)).await;
    h.schedule.check_at(at(10 * MIN)).await;

    let k = key("a{host=x}");
    let state = h.schedule.state(&k).unwrap();
    assert_eq!(state.last(), Status::Normal);
    assert!(state.need_ack);
    assert_eq!(state.abnormal_status(), Status::Critical);
    assert_eq!(h.notifier.names(), vec!["ops", "ops"]);
    assert_eq!(h.notifier.sent()[1].subject, "normal: a{host=x}");

    h.schedule.acknowledge(&k).await.unwrap();
    let state = h.schedule.state(&k).unwrap();
    assert!(!state.need_ack);
    assert!(h.schedule.snapshot(at(10 * MIN)).alerts[0].notifications.is_empty());
}

#[tokio::test]
async fn test_acknowledged_recovery_is_quiet() {
    let h = harness(SIMPLE);
    h.backend.respond("m", series("m", &[("x", 1.0)]));
    h.schedule.check_at(at(0)).await;
    h.schedule.acknowledge(&key("a{host=x}")).await.unwrap();

    h.backend.respond("m", series("m", &[("x", 0.0)]));
    h.schedule.check_at(at(5 * MIN)).await;

    assert_eq!(h.notifier.names(), vec!["ops"]);
}

#[tokio::test]
async fn test_steady_state_does_not_renotify() {
    let h = harness(SIMPLE);
    h.backend.respond("m", series("m", &[("x", 1.0)]));
    for i in 0..4 {
        h.schedule.check_at(at(i * 5 * MIN)).await;
    }

    let state = h.schedule.state(&key("a{host=x}")).unwrap();
    assert_eq!(state.history.len(), 4);
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn test_silence_suppresses_until_it_ends() {
    let h = harness(SIMPLE);
    h.backend.respond("m", series("m", &[("x", 1.0)]));
    h.schedule
        .add_silence(Silence::new(at(0), at(60 * MIN), "a", host_tag("x")).unwrap())
        .await
        .unwrap();

    h.schedule.check_at(at(MIN)).await;
    h.schedule.check_at(at(6 * MIN)).await;

    let k = key("a{host=x}");
    let state = h.schedule.state(&k).unwrap();
    assert_eq!(state.history.len(), 2);
    assert!(state.need_ack);
    assert!(h.notifier.sent().is_empty());
    assert!(h.schedule.snapshot(at(6 * MIN)).alerts[0].silenced);

    h.schedule.check_at(at(120 * MIN)).await;
    h.schedule.check_at(at(125 * MIN)).await;

    assert_eq!(h.notifier.names(), vec!["ops"]);
    assert_eq!(h.schedule.state(&k).unwrap().history.len(), 4);
}

#[tokio::test]
async fn test_expired_silences_are_dropped_by_the_cycle() {
    let h = harness(SIMPLE);
    h.backend.respond("m", series("m", &[("x", 0.0)]));
    h.schedule
        .add_silence(Silence::new(at(0), at(MIN), "a", host_tag("x")).unwrap())
        .await
        .unwrap();
    h.schedule
        .add_silence(Silence::new(at(0), at(24 * 60 * MIN), "a", host_tag("y")).unwrap())
        .await
        .unwrap();

    h.schedule.check_at(at(30 * MIN)).await;
    assert_eq!(h.schedule.silences().len(), 2);

    h.schedule.check_at(at(2 * 60 * MIN)).await;
    let left = h.schedule.silences();
    assert_eq!(left.len(), 1);
    assert!(left.values().all(|s| s.end == at(24 * 60 * MIN)));
}

#[tokio::test]
async fn test_missing_keys_go_unknown_and_coalesce() {
    let h = harness(
        r#"
        [schedule]
        unknown = "1h"

        [notifications.ops]
        print = true

        [alerts.a]
        crit = 'avg(q("avg:m{host=*}", "5m")) > 0'
        crit_notification = ["ops"]
        "#,
    );
    h.backend.respond("m", series("m", &[("x", 1.0), ("y", 1.0), ("z", 1.0)]));
    h.schedule.check_at(at(0)).await;
    assert_eq!(h.notifier.sent().len(), 3);
    h.notifier.clear();

    h.backend.respond("m", series("m", &[("x", 1.0)]));
    let summary = h.schedule.check_at(at(30 * MIN)).await;
    assert_eq!(summary.unknown, 0);
    assert!(h.notifier.sent().is_empty());

    let summary = h.schedule.check_at(at(61 * MIN)).await;
    assert_eq!(summary.unknown, 2);
    assert_eq!(h.schedule.state(&key("a{host=y}")).unwrap().last(), Status::Unknown);
    assert_eq!(h.schedule.state(&key("a{host=z}")).unwrap().last(), Status::Unknown);
    assert_eq!(h.schedule.state(&key("a{host=x}")).unwrap().last(), Status::Critical);

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "unknown: 2 keys of a");
    assert_eq!(sent[0].keys, vec![key("a{host=y}"), key("a{host=z}")]);
}

#[tokio::test]
async fn test_per_alert_unknown_overrides_schedule_default() {
    let h = harness(
        r#"
        [schedule]
        unknown = "1h"

        [notifications.ops]
        print = true

        [alerts.a]
        crit = 'avg(q("avg:m{host=*}", "5m")) > 0'
        crit_notification = ["ops"]
        unknown = "10m"
        "#,
    );
    h.backend.respond("m", series("m", &[("x", 1.0), ("y", 1.0)]));
    h.schedule.check_at(at(0)).await;
    h.notifier.clear();

    h.backend.respond("m", series("m", &[("x", 1.0)]));
    let summary = h.schedule.check_at(at(5 * MIN)).await;
    assert_eq!(summary.unknown, 0);

    let summary = h.schedule.check_at(at(11 * MIN)).await;
    assert_eq!(summary.unknown, 1);
    assert_eq!(h.schedule.state(&key("a{host=y}")).unwrap().last(), Status::Unknown);
    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "unknown: a{host=y}");
}

const CHAIN: &str = r#"
    [notifications.oncall]
    print = true
    next = "manager"
    timeout = "5m"

    [notifications.manager]
    print = true

    [alerts.a]
    crit = 'avg(q("avg:m{host=x}", "5m")) > 0'
    crit_notification = ["oncall"]
"#;

#[tokio::test]
async fn test_escalation_fires_exactly_once() {
    let h = harness(CHAIN);
    h.backend.respond("m", series("m", &[("x", 1.0)]));
    h.schedule.check_at(at(0)).await;

    let wait = h.schedule.check_notifications_at(at(4 * MIN)).await;
    assert_eq!(wait, Duration::from_secs(60));
    assert_eq!(h.notifier.names(), vec!["oncall"]);

    h.schedule.check_notifications_at(at(5 * MIN)).await;
    h.schedule.check_notifications_at(at(6 * MIN)).await;
    h.schedule.check_notifications_at(at(60 * MIN)).await;

    assert_eq!(h.notifier.names(), vec!["oncall", "manager"]);
    let view = &h.schedule.snapshot(at(60 * MIN)).alerts[0];
    assert_eq!(view.notifications, vec!["manager"]);
}

#[tokio::test]
async fn test_acknowledge_stops_escalation() {
    let h = harness(CHAIN);
    h.backend.respond("m", series("m", &[("x", 1.0)]));
    h.schedule.check_at(at(0)).await;
    h.schedule.acknowledge(&key("a{host=x}")).await.unwrap();

    let wait = h.schedule.check_notifications_at(at(10 * MIN)).await;

    assert_eq!(h.notifier.names(), vec!["oncall"]);
    assert_eq!(wait, Duration::from_secs(3600));
}

#[tokio::test]
async fn test_silence_holds_escalation() {
    let h = harness(CHAIN);
    h.backend.respond("m", series("m", &[("x", 1.0)]));
    h.schedule.check_at(at(0)).await;
    h.schedule
        .add_silence(Silence::new(at(MIN), at(30 * MIN), "a", BTreeMap::new()).unwrap())
        .await
        .unwrap();

    h.schedule.check_notifications_at(at(10 * MIN)).await;
    assert_eq!(h.notifier.names(), vec!["oncall"]);

    h.schedule.check_notifications_at(at(31 * MIN)).await;
    assert_eq!(h.notifier.names(), vec!["oncall", "manager"]);
}

#[tokio::test]
async fn test_crit_takes_precedence_over_warn() {
    let h = harness(
        r#"
        [notifications.page]
        print = true
        [notifications.mail]
        print = true

        [alerts.a]
        crit = 'avg(q("avg:m{host=*}", "5m")) > 5'
        warn = 'avg(q("avg:m{host=*}", "5m")) > 1'
        crit_notification = ["page"]
        warn_notification = ["mail"]
        "#,
    );
    h.backend.respond("m", series("m", &[("x", 10.0), ("y", 3.0), ("z", 0.0)]));

    h.schedule.check_at(at(0)).await;

    let status = |k: &str| h.schedule.state(&key(k)).unwrap().last();
    assert_eq!(status("a{host=x}"), Status::Critical);
    assert_eq!(status("a{host=y}"), Status::Warning);
    assert_eq!(status("a{host=z}"), Status::Normal);
    // crit and warn share one backend fetch
    assert_eq!(h.backend.calls(), 1);

    let mut names = h.notifier.names();
    names.sort();
    assert_eq!(names, vec!["mail", "page"]);
}

#[tokio::test]
async fn test_unacknowledged_deescalation_notifies_warn_set() {
    let h = harness(
        r#"
        [notifications.page]
        print = true
        [notifications.mail]
        print = true

        [alerts.a]
        crit = 'avg(q("avg:m{host=*}", "5m")) > 5'
        warn = 'avg(q("avg:m{host=*}", "5m")) > 1'
        crit_notification = ["page"]
        warn_notification = ["mail"]
        "#,
    );
    h.backend.respond("m", series("m", &[("x", 10.0)]));
    h.schedule.check_at(at(0)).await;
    assert_eq!(h.notifier.names(), vec!["page"]);

    h.backend.respond("m", series("m", &[("x", 3.0)]));
    h.schedule.check_at(at(5 * MIN)).await;

    let k = key("a{host=x}");
    let state = h.schedule.state(&k).unwrap();
    assert_eq!(state.last(), Status::Warning);
    assert!(state.need_ack);
    assert_eq!(h.notifier.names(), vec!["page", "mail"]);
    assert_eq!(h.notifier.sent()[1].subject, "warning: a{host=x}");

    // once acknowledged, a further drop is quiet
    h.schedule.acknowledge(&k).await.unwrap();
    h.backend.respond("m", series("m", &[("x", 0.0)]));
    h.schedule.check_at(at(10 * MIN)).await;
    assert_eq!(h.notifier.names(), vec!["page", "mail"]);
}

#[tokio::test]
async fn test_failed_alert_is_skipped() {
    let h = harness(
        r#"
        [alerts.broken]
        crit = 'avg(q("avg:down", "5m")) > 0'

        [alerts.fine]
        crit = 'avg(q("avg:m{host=x}", "5m")) > 0'
        "#,
    );
    h.backend.fail("down", QueryError::Timeout(Duration::from_secs(5)));
    h.backend.respond("m", series("m", &[("x", 1.0)]));

    let summary = h.schedule.check_at(at(0)).await;

    assert_eq!(summary.failed, vec!["broken"]);
    assert_eq!(summary.keys, 1);
    assert_eq!(h.schedule.state(&key("fine{host=x}")).unwrap().last(), Status::Critical);
}

#[tokio::test]
async fn test_nan_is_error_status() {
    let h = harness(
        r#"
        [alerts.a]
        crit = 'avg(q("avg:m{host=x}", "5m")) * 0 / 0'
        "#,
    );
    h.backend.respond("m", series("m", &[("x", 1.0)]));

    h.schedule.check_at(at(0)).await;

    assert_eq!(h.schedule.state(&key("a{host=x}")).unwrap().last(), Status::Error);
}

#[tokio::test]
async fn test_purge_forgets_key() {
    let h = harness(SIMPLE);
    h.backend.respond("m", series("m", &[("x", 1.0)]));
    h.schedule.check_at(at(0)).await;

    let k = key("a{host=x}");
    h.schedule.purge(&k).await.unwrap();
    assert!(h.schedule.state(&k).is_none());
    assert!(matches!(
        h.schedule.purge(&k).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_state_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let toml = format!("[schedule]\nstate_file = {:?}\n{CHAIN}", path.display().to_string());

    let h = harness(&toml);
    h.backend.respond("m", series("m", &[("x", 1.0)]));
    h.schedule.check_at(at(0)).await;
    h.schedule
        .add_silence(Silence::new(at(0), at(60 * MIN), "", host_tag("y*")).unwrap())
        .await
        .unwrap();
    h.schedule.check_at(at(5 * MIN)).await;
    let before = h.schedule.snapshot(at(5 * MIN));
    assert!(before.last_save_error.is_none());

    let reloaded = harness(&toml);
    reloaded.schedule.restore().await.unwrap();
    let after = reloaded.schedule.snapshot(at(5 * MIN));

    assert_eq!(
        serde_json::to_value(&after).unwrap(),
        serde_json::to_value(&before).unwrap()
    );
    assert_eq!(after.alerts[0].history.len(), 2);
    assert_eq!(after.alerts[0].notifications, vec!["oncall"]);

    // the restored pending notification still escalates on time
    reloaded.schedule.check_notifications_at(at(5 * MIN)).await;
    assert_eq!(reloaded.notifier.names(), vec!["manager"]);
}

#[tokio::test]
async fn test_save_failure_is_visible() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();
    let path = blocker.join("state.json");
    let toml = format!("[schedule]\nstate_file = {:?}\n{SIMPLE}", path.display().to_string());

    let h = harness(&toml);
    h.backend.respond("m", series("m", &[("x", 1.0)]));
    h.schedule.check_at(at(0)).await;

    let snapshot = h.schedule.snapshot(at(0));
    assert!(snapshot.last_save_error.is_some());
    // in-memory state is unaffected
    assert_eq!(snapshot.alerts.len(), 1);
}

#[tokio::test]
async fn test_run_checks_until_cancelled() {
    let h = harness(SIMPLE);
    h.backend.respond("m", series("m", &[("x", 1.0)]));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(h.schedule.clone().run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.notifier.sent().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    task.await.unwrap();
    assert!(h.schedule.snapshot(Utc::now()).last_check.is_some());
    assert_eq!(h.notifier.names(), vec!["ops"]);
}

#[tokio::test]
async fn test_slow_delivery_does_not_block_next_cycle() {
    let h = harness_with(SIMPLE, RecordingNotifier::new().with_delay(Duration::from_secs(3)));
    h.backend.respond("m", series("m", &[("x", 1.0)]));

    let schedule = h.schedule.clone();
    let first = tokio::spawn(async move { schedule.check_at(at(0)).await });
    tokio::time::timeout(Duration::from_secs(1), async {
        while h.notifier.sent().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let second = tokio::time::timeout(Duration::from_secs(1), h.schedule.check_at(at(5 * MIN)))
        .await
        .expect("second cycle waited on delivery");
    assert_eq!(second.keys, 1);
    assert_eq!(h.schedule.state(&key("a{host=x}")).unwrap().history.len(), 2);

    assert_eq!(first.await.unwrap().notifications, 1);
}

#[tokio::test]
async fn test_failed_deliveries_are_not_counted() {
    let h = harness_with(SIMPLE, RecordingNotifier::new().failing());
    h.backend.respond("m", series("m", &[("x", 1.0)]));

    let summary = h.schedule.check_at(at(0)).await;

    assert_eq!(h.notifier.sent().len(), 1);
    assert_eq!(summary.notifications, 0);
}
