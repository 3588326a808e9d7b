use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use taskscope::{
    retry, sleep, Backoff, CancelController, CancelReason, CanceledError, Limiter, RetryOptions,
};

#[tokio::test]
async fn sleep_rejects_without_scheduling_when_already_aborted() {
    let controller = CancelController::new();
    controller.abort(CancelReason::UserAbort);

    let start = Instant::now();
    let err = sleep(Duration::from_secs(60), &controller.signal()).await.unwrap_err();
    assert_eq!(err.reason, CancelReason::UserAbort);
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn sleep_rejects_with_abort_reason_mid_flight() {
    let controller = CancelController::new();
    let signal = controller.signal();
    let sleeper = tokio::spawn(async move { sleep(Duration::from_secs(60), &signal).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    controller.abort(CancelReason::Custom("shutdown".into()));

    let err = sleeper.await.unwrap().unwrap_err();
    assert_eq!(err.reason, CancelReason::Custom("shutdown".into()));
}

#[tokio::test]
async fn retry_aborts_during_backoff_wait() {
    let controller = CancelController::new();
    let signal = controller.signal();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let retrying = tokio::spawn(async move {
        retry::<(), _, _>(
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("always failing"))
                }
            },
            RetryOptions {
                retries: 5,
                backoff: Backoff::Fixed,
                initial_delay: Duration::from_millis(100),
                max_delay: None,
            },
            &signal,
        )
        .await
    });

    // Abort while the first backoff wait is pending.
    tokio::time::sleep(Duration::from_millis(20)).await;
    controller.abort(CancelReason::UserAbort);

    let err = retrying.await.unwrap().unwrap_err();
    let canceled = err.downcast_ref::<CanceledError>().unwrap();
    assert_eq!(canceled.reason, CancelReason::UserAbort);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retry_exponential_waits_grow() {
    let controller = CancelController::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let start = Instant::now();

    let value = retry(
        move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow::anyhow!("transient"))
                } else {
                    Ok("done")
                }
            }
        },
        RetryOptions {
            retries: 3,
            backoff: Backoff::Exponential,
            initial_delay: Duration::from_millis(10),
            max_delay: None,
        },
        &controller.signal(),
    )
    .await
    .unwrap();

    assert_eq!(value, "done");
    // Two waits: 10 ms then 20 ms.
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn limiter_runs_fifo() {
    let controller = CancelController::new();
    let limiter = Arc::new(Limiter::new(1, controller.signal()));
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..3 {
        let limiter = limiter.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            // Stagger submissions so the queue order is deterministic.
            tokio::time::sleep(Duration::from_millis(i as u64 * 10)).await;
            limiter
                .run(move |_| async move {
                    order.lock().unwrap().push(i);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Ok(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn limiter_keeps_queue_when_drain_disabled() {
    use taskscope::LimitOptions;

    let controller = CancelController::new();
    let limiter = Arc::new(Limiter::with_options(
        1,
        controller.signal(),
        LimitOptions { cancel_queued_on_abort: false },
    ));

    // Fill the slot with cooperative work.
    let slot = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter
                .run(|signal| async move {
                    let reason = signal.aborted().await;
                    Err::<(), _>(anyhow::anyhow!("stopped: {reason}"))
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Queue another entry, then abort: the queued entry still runs once the
    // slot frees up, because draining is disabled.
    let queued = {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.run(|_| async { Ok(3) }).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    controller.abort(CancelReason::UserAbort);

    assert!(slot.await.unwrap().is_err());
    assert_eq!(queued.await.unwrap().unwrap(), 3);
}
