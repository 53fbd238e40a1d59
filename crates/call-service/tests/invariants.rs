//! Property tests over random interleavings of engine callbacks and user commands

mod common;

use std::time::Duration;

use common::{active_audio, TestService};
use dialtone_call_service::call::{CallDirection, CallState};
use dialtone_call_service::engine::{CallHandle, InviteState};
use dialtone_call_service::service::{CallSnapshot, DialRequest};
use dialtone_call_service::ServiceError;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Step {
    Offer(i32),
    Dial,
    Provisional { early_media: bool },
    Confirmed,
    Disconnected,
    MediaOn,
    MediaOff,
    StrayCallback(i32),
    HoldToggle,
    Answer,
    Dtmf,
    Wait(u64),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (100..110i32).prop_map(Step::Offer),
        Just(Step::Dial),
        any::<bool>().prop_map(|early_media| Step::Provisional { early_media }),
        Just(Step::Confirmed),
        Just(Step::Disconnected),
        Just(Step::MediaOn),
        Just(Step::MediaOff),
        (500..510i32).prop_map(Step::StrayCallback),
        Just(Step::HoldToggle),
        Just(Step::Answer),
        Just(Step::Dtmf),
        (0..6000u64).prop_map(Step::Wait),
    ]
}

fn wants_ringback(call: &CallSnapshot) -> bool {
    call.direction == CallDirection::Outgoing && call.state == CallState::Early && !call.media_bound
}

/// Apply one step; returns `false` once the service has terminated
async fn apply(service: &TestService, current: Option<&CallSnapshot>, step: &Step) -> bool {
    let engine = &service.engine;
    match step {
        Step::Offer(id) => {
            let handle = CallHandle(*id);
            if current.is_some_and(|call| call.handle == handle) {
                return true;
            }
            engine.offer_incoming(handle, "sip:+3100012345@sip.example.com", None);
            let after = service.handle.snapshot().await;
            if let (Some(active), Ok(after)) = (current, &after) {
                let call = after.call.as_ref().expect("busy offer keeps the call");
                assert_eq!(call.handle, active.handle);
                assert!(engine.has_op(&format!("answer {} 486", handle)));
            }
            after.is_ok()
        }
        Step::Dial => match service.handle.place_call(DialRequest::new("+3199999999")).await {
            Ok(_) => {
                assert!(current.is_none(), "dial accepted while a call exists");
                true
            }
            Err(ServiceError::Busy { active }) => {
                assert_eq!(Some(active), current.map(|call| call.handle));
                true
            }
            Err(ServiceError::ChannelClosed) => false,
            Err(other) => panic!("unexpected dial error {:?}", other),
        },
        Step::Provisional { early_media } => {
            if let Some(call) = current {
                let status = if *early_media { 183 } else { 180 };
                engine.set_call_state(call.handle, InviteState::Early, status);
            }
            true
        }
        Step::Confirmed => {
            if let Some(call) = current {
                engine.set_call_state(call.handle, InviteState::Confirmed, 200);
            }
            true
        }
        Step::Disconnected => {
            if let Some(call) = current {
                engine.set_call_state(call.handle, InviteState::Disconnected, 200);
            }
            true
        }
        Step::MediaOn => {
            if let Some(call) = current {
                engine.set_media(call.handle, vec![active_audio(0)]);
            }
            true
        }
        Step::MediaOff => {
            if let Some(call) = current {
                engine.set_media(call.handle, Vec::new());
            }
            true
        }
        Step::StrayCallback(id) => {
            engine.set_call_state(CallHandle(*id), InviteState::Disconnected, 487);
            true
        }
        Step::HoldToggle => service.handle.hold_toggle().is_ok(),
        Step::Answer => service.handle.answer().is_ok(),
        Step::Dtmf => service.handle.dial_dtmf("7").is_ok(),
        Step::Wait(millis) => {
            tokio::time::sleep(Duration::from_millis(*millis)).await;
            true
        }
    }
}

async fn run_trace(steps: Vec<Step>) {
    let service = TestService::registered().await;
    let mut current: Option<CallSnapshot> = None;

    for step in &steps {
        if !apply(&service, current.as_ref(), step).await {
            break;
        }
        let snapshot = match service.handle.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(_) => break,
        };

        if let Some(call) = &snapshot.call {
            assert_eq!(
                call.ringback_active,
                wants_ringback(call),
                "ringback out of sync after {:?}: {:?}",
                step,
                call
            );
            if let Some(previous) = &current {
                // a call is only ever replaced by itself
                assert_eq!(call.handle, previous.handle, "second call admitted by {:?}", step);
            }
        }
        current = snapshot.call;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn one_call_and_ringback_invariants_hold(steps in prop::collection::vec(step(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(run_trace(steps));
    }
}
