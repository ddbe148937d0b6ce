//! End-to-end policy behavior driven through the session registry with a
//! recording fleet. Sample feeds use explicit timestamps so the derived
//! rates are exact.

mod common;

use common::{cluster, harness, rate_changes};
use tideway_qos::ConsoleSink;

#[tokio::test]
async fn independent_deadband() {
    let mut h = harness("independent", &[("oss0", &["OST0000"])]);
    let (sink, _rx) = ConsoleSink::channel();
    h.session.watch("dd.0", sink).await;
    h.session.on_metric("OST0000", "dd.0", 0.0, 0.0);

    h.session
        .update_config(&cluster("independent", false, &[("dd.0", 1000)]))
        .await
        .unwrap();
    h.session.tick().await;
    assert_eq!(
        rate_changes(&h.fleet, "dd_0"),
        vec![("oss0".to_string(), 1000)]
    );

    // On the setpoint: no actuator traffic.
    h.session
        .on_metric("OST0000", "dd.0", 1.0, 1_000_000_000.0);
    h.fleet.take_commands();
    h.session.tick().await;
    assert!(rate_changes(&h.fleet, "dd_0").is_empty());

    // 15% over: pull the excess back from the highest-limit host.
    h.session
        .on_metric("OST0000", "dd.0", 2.0, 2_150_000_000.0);
    h.session.tick().await;
    assert_eq!(
        rate_changes(&h.fleet, "dd_0"),
        vec![("oss0".to_string(), 850)]
    );

    // 15% under: hand the deficit to the lowest-limit host.
    h.session
        .on_metric("OST0000", "dd.0", 3.0, 3_000_000_000.0);
    h.session.tick().await;
    assert_eq!(
        rate_changes(&h.fleet, "dd_0"),
        vec![("oss0".to_string(), 850), ("oss0".to_string(), 1000)]
    );
}

#[tokio::test]
async fn priority_config_change_redistributes_only_changed_jobs() {
    let mut h = harness(
        "priority",
        &[("oss0", &["OST0000"]), ("oss1", &["OST0001"])],
    );
    let (sink_a, _rx_a) = ConsoleSink::channel();
    let (sink_b, _rx_b) = ConsoleSink::channel();
    h.session.watch("dd.0", sink_a).await;
    h.session.watch("dd.1", sink_b).await;

    // Both jobs live on both hosts.
    for (service, t) in [("OST0000", 0.0), ("OST0001", 0.0)] {
        h.session.on_metric(service, "dd.0", t, 0.0);
        h.session.on_metric(service, "dd.1", t, 0.0);
    }

    h.session
        .update_config(&cluster("priority", false, &[("dd.0", 2000), ("dd.1", 500)]))
        .await
        .unwrap();
    h.session.tick().await;
    h.session.tick().await; // step: operator takeover for both jobs
    assert_eq!(
        rate_changes(&h.fleet, "dd_0"),
        vec![("oss0".to_string(), 1000), ("oss1".to_string(), 1000)]
    );
    assert_eq!(
        rate_changes(&h.fleet, "dd_1"),
        vec![("oss0".to_string(), 250), ("oss1".to_string(), 250)]
    );

    // Only dd.0 changes: exactly its two hosts are re-programmed.
    h.fleet.take_commands();
    h.session
        .update_config(&cluster("priority", false, &[("dd.0", 1000), ("dd.1", 500)]))
        .await
        .unwrap();
    h.session.tick().await;
    h.session.tick().await;
    assert_eq!(
        rate_changes(&h.fleet, "dd_0"),
        vec![("oss0".to_string(), 500), ("oss1".to_string(), 500)]
    );
    assert!(rate_changes(&h.fleet, "dd_1").is_empty());
}

#[tokio::test]
async fn priority_successful_increase_keeps_increasing() {
    let mut h = harness(
        "priority",
        &[("oss0", &["OST0000"]), ("oss1", &["OST0001"])],
    );
    let (sink_a, _rx_a) = ConsoleSink::channel();
    let (sink_b, _rx_b) = ConsoleSink::channel();
    h.session.watch("dd.0", sink_a).await;
    h.session.watch("dd.1", sink_b).await;
    h.session.on_metric("OST0000", "dd.0", 0.0, 0.0);
    h.session.on_metric("OST0001", "dd.1", 0.0, 0.0);

    h.session
        .update_config(&cluster("priority", false, &[("dd.0", 1000), ("dd.1", 1000)]))
        .await
        .unwrap();

    let mut bytes_a: f64 = 0.0;
    let mut feed = |h: &mut common::Harness, t: f64, mb: f64| {
        bytes_a += mb * 1_000_000.0;
        h.session.on_metric("OST0000", "dd.0", t, bytes_a);
    };

    feed(&mut h, 1.0, 400.0);
    h.session.tick().await;
    h.session.tick().await; // step: takeover fans out both targets
    assert_eq!(
        rate_changes(&h.fleet, "dd_0"),
        vec![("oss0".to_string(), 1000)]
    );

    feed(&mut h, 2.0, 400.0);
    h.session.tick().await;
    feed(&mut h, 3.0, 400.0);
    h.session.tick().await; // step: dd.0 under target, increase-self 1000 -> 1020
    assert_eq!(
        rate_changes(&h.fleet, "dd_0").last().unwrap(),
        &("oss0".to_string(), 1020)
    );

    // The raise shows up in throughput; the evaluation approves and the
    // policy keeps climbing on the same subject.
    feed(&mut h, 4.0, 430.0);
    h.session.tick().await;
    feed(&mut h, 5.0, 430.0);
    h.session.tick().await; // step: action good, next increase 1020 -> 1040
    assert_eq!(
        rate_changes(&h.fleet, "dd_0"),
        vec![
            ("oss0".to_string(), 1000),
            ("oss0".to_string(), 1020),
            ("oss0".to_string(), 1040),
        ]
    );
}

#[tokio::test]
async fn priority_regret_restores_the_squeezed_job() {
    let mut h = harness("priority", &[("oss0", &["OST0000", "OST0001"])]);
    let (sink_a, _rx_a) = ConsoleSink::channel();
    let (sink_b, _rx_b) = ConsoleSink::channel();
    // Insertion order defines priority: dd.0 over dd.1.
    h.session.watch("dd.0", sink_a).await;
    h.session.watch("dd.1", sink_b).await;
    h.session.on_metric("OST0000", "dd.0", 0.0, 0.0);
    h.session.on_metric("OST0001", "dd.1", 0.0, 0.0);

    let mut bytes_b: f64 = 0.0;
    let mut feed = |h: &mut common::Harness, t: f64, mb_b: f64| {
        h.session.on_metric("OST0000", "dd.0", t, 0.0);
        bytes_b += mb_b * 1_000_000.0;
        h.session.on_metric("OST0001", "dd.1", t, bytes_b);
    };

    feed(&mut h, 1.0, 300.0);
    h.session.tick().await;
    h.session.tick().await;
    // Step: dd.0 has no target and sits at zero; its own limits are already
    // at the default, so the busiest lower-priority job gets squeezed.
    assert_eq!(
        rate_changes(&h.fleet, "dd_1"),
        vec![("oss0".to_string(), 10)]
    );
    assert!(rate_changes(&h.fleet, "dd_0").is_empty());

    // dd.0 does not rise and dd.1 collapses: the action is regretted.
    feed(&mut h, 2.0, 10.0);
    h.session.tick().await;
    feed(&mut h, 3.0, 10.0);
    h.session.tick().await;
    assert_eq!(
        rate_changes(&h.fleet, "dd_1"),
        vec![("oss0".to_string(), 10), ("oss0".to_string(), 10000)]
    );

    // One more step closes the evaluation (dd.1 recovered) and the search
    // resumes; with nothing else to try the same squeeze starts again.
    feed(&mut h, 4.0, 300.0);
    h.session.tick().await;
    feed(&mut h, 5.0, 300.0);
    h.session.tick().await;
    assert_eq!(
        rate_changes(&h.fleet, "dd_1"),
        vec![
            ("oss0".to_string(), 10),
            ("oss0".to_string(), 10000),
            ("oss0".to_string(), 10),
        ]
    );
}

#[tokio::test]
async fn priority_gives_up_after_max_failures_then_retries_fresh() {
    let mut h = harness("priority", &[("oss0", &["OST0000"])]);
    let (sink, _rx) = ConsoleSink::channel();
    h.session.watch("dd.0", sink).await;
    h.session.on_metric("OST0000", "dd.0", 0.0, 0.0);
    h.session
        .update_config(&cluster("priority", false, &[("dd.0", 1000)]))
        .await
        .unwrap();

    // The job never moves; every increase fails its evaluation. Steps run
    // every other tick: takeover, then one action per step carrying the
    // failure count, then the give-up step, then a fresh start.
    for t in 1..=12 {
        h.session.on_metric("OST0000", "dd.0", t as f64, 0.0);
        h.session.tick().await;
    }
    let limits: Vec<u64> = rate_changes(&h.fleet, "dd_0")
        .into_iter()
        .map(|(_, rate)| rate)
        .collect();
    // Takeover to 1000, then four climbing attempts; the fourth failure
    // crosses max_failures, so the step after 1080 starts nothing.
    assert_eq!(limits, vec![1000, 1020, 1040, 1060, 1080]);

    // The next search round begins from the head with a clean slate.
    h.session.on_metric("OST0000", "dd.0", 13.0, 0.0);
    h.session.tick().await;
    h.session.on_metric("OST0000", "dd.0", 14.0, 0.0);
    h.session.tick().await;
    let limits: Vec<u64> = rate_changes(&h.fleet, "dd_0")
        .into_iter()
        .map(|(_, rate)| rate)
        .collect();
    assert_eq!(limits, vec![1000, 1020, 1040, 1060, 1080, 1100]);
}
