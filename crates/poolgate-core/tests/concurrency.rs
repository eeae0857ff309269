use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use poolgate_core::emit::ClientEmitter;
use poolgate_core::{Scope, SlotController, SlotError};
use poolgate_protocol::Dialect;
use tokio::time::timeout;

fn emitter() -> (
    ClientEmitter,
    tokio::sync::oneshot::Receiver<poolgate_core::ResponseDecision>,
    tokio::sync::mpsc::Receiver<bytes::Bytes>,
) {
    ClientEmitter::channel(Dialect::OpenAI)
}

#[tokio::test]
async fn active_never_exceeds_max_under_contention() {
    const MAX_ACTIVE: u32 = 3;
    const TASKS: usize = 24;

    let controller = Arc::new(SlotController::new());
    let scope = Scope::User(1);
    let in_flight = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..TASKS {
        let controller = controller.clone();
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            let (mut emitter, _decision, _body) = emitter();
            let permit = controller
                .acquire_with_wait(scope, MAX_ACTIVE, Duration::from_secs(5), None, &mut emitter)
                .await
                .unwrap();
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            permit.release();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= MAX_ACTIVE);
    assert_eq!(controller.load(scope), (0, 0));
}

#[tokio::test]
async fn waiters_wake_in_fifo_order() {
    let controller = Arc::new(SlotController::new());
    let scope = Scope::Account(1);

    let holder = controller.try_acquire(scope, 1).unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..4 {
        let controller = controller.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let (mut emitter, _decision, _body) = emitter();
            let permit = controller
                .acquire_with_wait(scope, 1, Duration::from_secs(5), None, &mut emitter)
                .await
                .unwrap();
            order.lock().unwrap().push(i);
            permit.release();
        }));
        // Ensure each waiter enqueues before the next arrives.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    holder.release();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn wait_times_out_without_leaking() {
    let controller = SlotController::new();
    let scope = Scope::User(2);
    let _held = controller.try_acquire(scope, 1).unwrap();

    let (mut em, _decision, _body) = emitter();
    let err = controller
        .acquire_with_wait(scope, 1, Duration::from_millis(50), None, &mut em)
        .await
        .unwrap_err();
    assert_eq!(err, SlotError::Timeout);
    assert_eq!(controller.load(scope).0, 1);
}

#[tokio::test]
async fn client_disconnect_cancels_the_wait() {
    let controller = Arc::new(SlotController::new());
    let scope = Scope::User(3);
    let _held = controller.try_acquire(scope, 1).unwrap();

    let (mut em, decision_rx, body_rx) = emitter();
    let waiter = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .acquire_with_wait(scope, 1, Duration::from_secs(5), None, &mut em)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(decision_rx);
    drop(body_rx);

    let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), SlotError::Cancelled);
    assert_eq!(controller.load(scope).0, 1);
}

#[tokio::test]
async fn released_slot_returns_active_to_baseline() {
    let controller = Arc::new(SlotController::new());
    let scope = Scope::Account(9);

    let permit = controller.try_acquire(scope, 2).unwrap();
    assert_eq!(controller.load(scope).0, 1);

    // Dropping the task that owns the permit must release it exactly once.
    let handle = tokio::spawn(async move {
        let _permit = permit;
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.abort();
    let _ = handle.await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(controller.load(scope).0, 0);
}

#[tokio::test]
async fn streaming_waiters_get_heartbeats() {
    let controller = Arc::new(SlotController::new());
    let scope = Scope::User(4);
    let holder = controller.try_acquire(scope, 1).unwrap();

    let (mut em, decision_rx, mut body_rx) = emitter();
    em.set_stream_capable(true);

    let waiter = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .acquire_with_wait(
                    scope,
                    1,
                    Duration::from_secs(5),
                    Some(Duration::from_millis(25)),
                    &mut em,
                )
                .await
                .map(|permit| permit.release())
        })
    };

    // First heartbeat opens the SSE stream.
    match timeout(Duration::from_secs(1), decision_rx).await.unwrap() {
        Ok(poolgate_core::ResponseDecision::Stream { .. }) => {}
        other => panic!("expected stream decision, got {other:?}"),
    }
    let frame = timeout(Duration::from_secs(1), body_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.as_ref(), b": ping\n\n");

    holder.release();
    timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(controller.load(scope).0, 0);
}

#[tokio::test]
async fn unary_waiters_never_see_heartbeats() {
    let controller = Arc::new(SlotController::new());
    let scope = Scope::User(5);
    let holder = controller.try_acquire(scope, 1).unwrap();

    let (mut em, decision_rx, _body_rx) = emitter();
    // stream_capable stays false: pings are suppressed.

    let waiter = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .acquire_with_wait(
                    scope,
                    1,
                    Duration::from_secs(5),
                    Some(Duration::from_millis(10)),
                    &mut em,
                )
                .await
                .map(|permit| permit.release())
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    holder.release();
    timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    // The decision channel was never used for a stream.
    assert!(decision_rx.await.is_err());
}
