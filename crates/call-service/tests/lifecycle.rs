//! Start-up failures, registration handling and teardown

mod common;

use std::time::Duration;

use common::{Setup, TestService};
use dialtone_call_service::account::RegistrationState;
use dialtone_call_service::engine::EngineCallback;
use dialtone_call_service::events::StatusNotification;
use dialtone_call_service::service::{DialRequest, StopReason};
use dialtone_call_service::{EngineError, ServiceConfig, ServiceError};

fn ops(list: &[&str]) -> Vec<String> {
    list.iter().map(|op| op.to_string()).collect()
}

#[tokio::test]
async fn missing_account_stops_immediately() {
    let service = Setup::new().without_account().spawn();
    let engine = service.engine.clone();

    let (reason, statuses) = service.finish().await;
    assert_eq!(reason, StopReason::NoAccount);
    assert_eq!(
        statuses,
        vec![StatusNotification::SipServiceHasNoAccount, StatusNotification::ServiceStopped]
    );
    assert_eq!(engine.ops(), ops(&["load", "shutdown"]));
}

#[tokio::test]
async fn engine_that_cannot_load_is_reported() {
    let setup = Setup::new();
    setup.engine.fail(
        "load",
        EngineError::LibraryUnavailable {
            message: "libpj not found".into(),
        },
    );
    let service = setup.spawn();
    let engine = service.engine.clone();

    let (reason, statuses) = service.finish().await;
    assert_eq!(reason, StopReason::EngineLoadFailed);
    assert_eq!(
        statuses,
        vec![StatusNotification::SipServiceCanNotLoadEngine, StatusNotification::ServiceStopped]
    );
    assert_eq!(engine.ops(), ops(&["load"]));
}

#[tokio::test]
async fn engine_that_cannot_start_is_reported_and_released() {
    let setup = Setup::new();
    setup.engine.fail(
        "start",
        EngineError::StartFailed {
            message: "port 5060 in use".into(),
        },
    );
    let service = setup.spawn();
    let engine = service.engine.clone();

    let (reason, statuses) = service.finish().await;
    assert_eq!(reason, StopReason::EngineStartFailed);
    assert_eq!(
        statuses,
        vec![StatusNotification::SipServiceCanNotStartEngine, StatusNotification::ServiceStopped]
    );
    assert_eq!(engine.ops(), ops(&["load", "start 5060", "shutdown"]));
}

#[tokio::test]
async fn rejected_register_request_is_fatal() {
    let setup = Setup::new();
    setup
        .engine
        .fail("register", EngineError::Transport { message: "unreachable".into() });
    let service = setup.spawn();
    let engine = service.engine.clone();

    let (reason, statuses) = service.finish().await;
    assert_eq!(reason, StopReason::RegistrationFailed);
    assert_eq!(
        statuses,
        vec![
            StatusNotification::SipServiceAccountRegistrationFailed,
            StatusNotification::ServiceStopped
        ]
    );
    assert_eq!(
        engine.ops(),
        ops(&["load", "start 5060", "register sip:129700042@sip.example.com", "shutdown"])
    );
}

#[tokio::test]
async fn registration_failure_callbacks_are_only_logged_by_default() {
    let mut service = TestService::registered().await;

    service.engine.emit(EngineCallback::RegistrationChanged {
        status: 403,
        reason: "Forbidden".into(),
        expires: 0,
    });
    service.engine.emit(EngineCallback::AccountFault {
        reason: "account object deleted".into(),
    });

    let snapshot = service.snapshot().await;
    assert_eq!(snapshot.registration, Some(RegistrationState::Failed));
    assert!(service.handle.is_running());
    assert!(service.statuses().is_empty());

    let err = service
        .handle
        .place_call(DialRequest::new("+3199999999"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotRegistered));
}

#[tokio::test]
async fn registration_failure_can_be_made_fatal() {
    let service = Setup::new()
        .config(ServiceConfig::new("sip.example.com").with_terminate_on_registration_failure(true))
        .spawn()
        .wait_registered()
        .await;

    service.engine.emit(EngineCallback::RegistrationChanged {
        status: 401,
        reason: "Unauthorized".into(),
        expires: 0,
    });

    let (reason, statuses) = service.finish().await;
    assert_eq!(reason, StopReason::RegistrationFailed);
    assert_eq!(
        statuses,
        vec![
            StatusNotification::SipServiceAccountRegistrationFailed,
            StatusNotification::ServiceStopped
        ]
    );
}

#[tokio::test]
async fn dialing_before_registration_is_refused() {
    let setup = Setup::new();
    setup.engine.without_auto_register();
    let service = setup.spawn();

    let snapshot = service.snapshot().await;
    assert_eq!(snapshot.registration, Some(RegistrationState::Registering));

    let err = service
        .handle
        .place_call(DialRequest::new("+3199999999"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotRegistered));
    assert_eq!(service.engine.count("make_call"), 0);
}

#[tokio::test]
async fn engine_failure_while_dialing_is_fatal() {
    let service = TestService::registered().await;
    service.engine.fail("make_call", EngineError::Busy);

    let err = service
        .handle
        .place_call(DialRequest::new("+3199999999"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Engine(EngineError::Busy)));

    let (reason, statuses) = service.finish().await;
    assert_eq!(reason, StopReason::InvalidCallState);
    assert_eq!(
        statuses,
        vec![StatusNotification::CallInvalidState, StatusNotification::ServiceStopped]
    );
}

#[tokio::test]
async fn stop_releases_call_account_and_engine_in_order() {
    let mut service = TestService::registered().await;
    let handle = service.connected_outgoing().await;

    service.handle.stop().unwrap();

    let engine = service.engine.clone();
    let (reason, statuses) = service.finish().await;
    assert_eq!(reason, StopReason::Requested);
    assert_eq!(
        statuses,
        vec![StatusNotification::CallDisconnected, StatusNotification::ServiceStopped]
    );

    let ops = engine.ops();
    let tail = &ops[ops.len() - 3..];
    assert_eq!(
        tail,
        [format!("hangup {} 603", handle), "unregister".to_string(), "shutdown".to_string()]
    );
}

#[tokio::test]
async fn teardown_continues_past_failing_steps() {
    let mut service = TestService::registered().await;
    service.connected_outgoing().await;
    service
        .engine
        .fail("hangup", EngineError::native("hangup", "gone"));
    service
        .engine
        .fail("unregister", EngineError::native("unregister", "gone"));

    service.handle.stop().unwrap();

    let engine = service.engine.clone();
    let (reason, statuses) = service.finish().await;
    assert_eq!(reason, StopReason::Requested);
    assert_eq!(statuses, vec![StatusNotification::ServiceStopped]);
    assert_eq!(engine.ops().last().map(String::as_str), Some("shutdown"));
    assert_eq!(engine.count("unregister"), 1);
}

#[tokio::test]
async fn dropping_every_handle_stops_the_engine() {
    let service = TestService::registered().await;
    let (engine, mut notifications) = service.detach();

    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(status) = notifications.next_status().await {
            if status == StatusNotification::ServiceStopped {
                return true;
            }
        }
        false
    })
    .await
    .expect("engine stops");
    assert!(stopped);
    assert_eq!(engine.ops().last().map(String::as_str), Some("shutdown"));
}

#[tokio::test]
async fn handles_fail_once_the_engine_is_gone() {
    let service = Setup::new().without_account().spawn();
    let handle = service.handle.clone();
    service.finish().await;

    assert!(!handle.is_running());
    assert!(matches!(handle.hold_toggle(), Err(ServiceError::ChannelClosed)));
    assert!(matches!(handle.snapshot().await, Err(ServiceError::ChannelClosed)));
}
