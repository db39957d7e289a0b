//! Sweeper-driven scenarios: deadlines, discard policy, fault stack order
//! and admission balance.

mod common;

use std::sync::Arc;
use std::time::Duration;

use conduit_core::{error_codes, EndpointTopology, FaultHandler, FaultInfo};
use conduit_engine::correlation::FaultRouter;
use conduit_engine::{EngineConfig, EngineState, FaultOutcome, ResponseOutcome, TimeoutPolicy};

use common::{harness, harness_with, outbound_with_handlers, reply, Event, RecordingMediation};

#[tokio::test]
async fn discard_policy_clears_handlers_and_releases_admission() {
    let h = harness();
    let handle = h
        .engine
        .dispatch_and_register(
            outbound_with_handlers(&["h1", "h2"]),
            TimeoutPolicy::discard_after(2),
        )
        .await
        .unwrap();
    assert_eq!(handle.deadline_ms, 2);
    let before = h.engine.admission().in_flight();

    h.clock.set(3);
    let report = h.engine.sweep_now().await;

    assert_eq!(report.expired, 1);
    assert_eq!(report.discarded, 1);
    assert!(h.mediation.events().is_empty());
    assert_eq!(h.engine.admission().in_flight(), before - 1);
    assert!(!h.engine.registry().contains(&handle.correlation_id));
}

#[tokio::test]
async fn call_is_not_claimed_before_its_deadline() {
    let h = harness();
    let handle = h
        .engine
        .dispatch_and_register(
            outbound_with_handlers(&["on-timeout"]),
            TimeoutPolicy::fault_after(100),
        )
        .await
        .unwrap();

    h.clock.set(99);
    assert_eq!(h.engine.sweep_now().await.expired, 0);
    assert!(h.engine.registry().contains(&handle.correlation_id));

    h.clock.set(100);
    assert_eq!(h.engine.sweep_now().await.expired, 1);
    assert_eq!(
        h.mediation.events(),
        vec![Event::Fault {
            handler: "on-timeout".to_string(),
            code: error_codes::CALLBACK_TIMEOUT
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn running_sweeper_claims_within_one_interval() {
    let h = harness_with(EngineConfig {
        sweep_interval_ms: 10,
        ..EngineConfig::default()
    });
    h.engine.start();
    let handle = h
        .engine
        .dispatch_and_register(
            outbound_with_handlers(&["on-timeout"]),
            TimeoutPolicy::fault_after(40),
        )
        .await
        .unwrap();

    h.clock.set(40);
    tokio::time::sleep(Duration::from_millis(11)).await;

    assert!(!h.engine.registry().contains(&handle.correlation_id));
    assert_eq!(h.mediation.fault_handlers(), vec!["on-timeout".to_string()]);
    h.engine.stop().await;
}

#[tokio::test]
async fn global_scope_uses_configured_default_timeout() {
    let h = harness_with(EngineConfig {
        default_timeout_ms: 500,
        ..EngineConfig::default()
    });
    let handle = h
        .engine
        .dispatch_and_register(outbound_with_handlers(&[]), TimeoutPolicy::default())
        .await
        .unwrap();
    assert_eq!(handle.deadline_ms, 500);
}

#[tokio::test]
async fn fault_stack_runs_handlers_last_pushed_first() {
    let mediation = Arc::new(RecordingMediation::default());
    let router = FaultRouter::new(mediation.clone());
    let mut msg = outbound_with_handlers(&["h1", "h2"]);

    let cause = || FaultInfo::sending(error_codes::SENDING_FAILURE, "boom");
    let first = router.handle_fault(&mut msg, cause()).await;
    let second = router.handle_fault(&mut msg, cause()).await;
    let third = router.handle_fault(&mut msg, cause()).await;

    assert_eq!(
        first,
        FaultOutcome::Handled {
            handler: FaultHandler::sequence("h2")
        }
    );
    assert_eq!(
        second,
        FaultOutcome::Handled {
            handler: FaultHandler::sequence("h1")
        }
    );
    assert_eq!(third, FaultOutcome::Undeliverable);
    assert_eq!(mediation.fault_handlers(), vec!["h2", "h1"]);
}

#[tokio::test]
async fn successful_group_member_handler_is_skipped_on_timeout() {
    let h = harness();
    let mut msg = outbound_with_handlers(&["group-fallback"]);
    msg.fault_stack.push(FaultHandler::endpoint(
        "backend-a",
        EndpointTopology::LoadBalance,
    ));
    msg.successful_endpoint = Some("backend-a".to_string());
    h.engine
        .dispatch_and_register(msg, TimeoutPolicy::fault_after(5))
        .await
        .unwrap();

    h.clock.set(5);
    h.engine.sweep_now().await;

    assert_eq!(h.mediation.fault_handlers(), vec!["group-fallback"]);
}

#[tokio::test]
async fn admission_counter_returns_to_zero_after_mixed_completion() {
    let h = harness_with(EngineConfig {
        admission_limit: 10,
        ..EngineConfig::default()
    });
    let mut handles = Vec::new();
    for _ in 0..40 {
        handles.push(
            h.engine
                .dispatch_and_register(
                    outbound_with_handlers(&["h"]),
                    TimeoutPolicy::fault_after(20),
                )
                .await
                .unwrap(),
        );
    }
    assert_eq!(h.engine.admission().in_flight(), 40);
    assert!(h.engine.admission().state().is_over_limit());

    for handle in handles.iter().step_by(2) {
        let outcome = h
            .engine
            .on_response_received(&handle.correlation_id, reply())
            .await;
        assert!(matches!(outcome, ResponseOutcome::Injected { .. }));
    }
    h.clock.set(20);
    let report = h.engine.sweep_now().await;

    assert_eq!(report.expired, 20);
    assert_eq!(h.engine.admission().in_flight(), 0);
    let states = h.replication.states.lock();
    assert_eq!(states.len(), 80);
    assert_eq!(states.last().map(|(_, s)| s.in_flight), Some(0));
}

#[tokio::test]
async fn failed_dispatch_leaves_nothing_pending() {
    let h = harness();
    h.transport
        .fail_outbound
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let result = h
        .engine
        .dispatch_and_register(
            outbound_with_handlers(&["on-send-failure"]),
            TimeoutPolicy::fault_after(5),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(h.engine.registry().size(), 0);
    assert_eq!(h.engine.admission().in_flight(), 0);
    assert_eq!(
        h.mediation.events(),
        vec![Event::Fault {
            handler: "on-send-failure".to_string(),
            code: error_codes::SENDING_FAILURE
        }]
    );

    h.clock.set(10);
    assert_eq!(h.engine.sweep_now().await.expired, 0);
}

#[tokio::test(start_paused = true)]
async fn panicking_fault_handler_does_not_stop_the_running_sweeper() {
    let h = harness_with(EngineConfig {
        sweep_interval_ms: 10,
        ..EngineConfig::default()
    });
    *h.mediation.panic_on.lock() = Some("boom".to_string());
    h.engine.start();

    let boom = h
        .engine
        .dispatch_and_register(outbound_with_handlers(&["boom"]), TimeoutPolicy::fault_after(5))
        .await
        .unwrap();
    h.clock.set(5);
    tokio::time::sleep(Duration::from_millis(11)).await;
    assert!(!h.engine.registry().contains(&boom.correlation_id));

    let ok = h
        .engine
        .dispatch_and_register(outbound_with_handlers(&["ok"]), TimeoutPolicy::fault_after(50))
        .await
        .unwrap();
    h.clock.set(100);
    tokio::time::sleep(Duration::from_millis(11)).await;

    assert_eq!(h.engine.state(), EngineState::Running);
    assert!(!h.engine.registry().contains(&ok.correlation_id));
    assert_eq!(h.engine.admission().in_flight(), 0);
    assert_eq!(h.mediation.fault_handlers(), vec!["boom", "ok"]);
    h.engine.request_sweep().await.unwrap();
    h.engine.stop().await;
}
