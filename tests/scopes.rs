use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskscope::{
    current_scope, run_in_scope, run_task, scope_deadline_remaining, with_strict_cancellation,
    CancelReason, StrictCancellationOptions, Task, TaskOptions, TaskStatus,
};

#[tokio::test]
async fn scope_exit_cancels_scope_bound_tasks() {
    let task_slot: Arc<Mutex<Option<Task<()>>>> = Arc::new(Mutex::new(None));
    let slot = task_slot.clone();

    run_in_scope(
        |scope| async move {
            let bound = run_task(
                |signal| async move {
                    signal.aborted().await;
                    Err(anyhow::anyhow!("never settles on its own"))
                },
                TaskOptions::new().with_signal(scope.signal()),
            );
            *slot.lock().unwrap() = Some(bound);
            Ok(())
        },
        None,
    )
    .await
    .unwrap();

    let bound = task_slot.lock().unwrap().take().unwrap();
    assert_eq!(bound.status(), TaskStatus::Canceled);
    let err = bound.join().await.unwrap_err();
    assert_eq!(err.cancel_reason(), Some(&CancelReason::ScopeClosed));
}

#[tokio::test]
async fn scope_close_preserves_earlier_abort_reason() {
    let task_slot: Arc<Mutex<Option<Task<()>>>> = Arc::new(Mutex::new(None));
    let slot = task_slot.clone();

    run_in_scope(
        |scope| async move {
            let bound = run_task(
                |signal| async move {
                    signal.aborted().await;
                    Err(anyhow::anyhow!("never settles on its own"))
                },
                TaskOptions::new().with_signal(scope.signal()),
            );
            *slot.lock().unwrap() = Some(bound);
            scope.abort(CancelReason::UserAbort);
            Ok(())
        },
        None,
    )
    .await
    .unwrap();

    let bound = task_slot.lock().unwrap().take().unwrap();
    let err = bound.join().await.unwrap_err();
    // The user abort came first; closing the scope must not overwrite it.
    assert_eq!(err.cancel_reason(), Some(&CancelReason::UserAbort));
}

#[tokio::test]
async fn parent_scope_abort_reaches_child_scope() {
    run_in_scope(
        |outer| async move {
            let trigger = outer.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                trigger.abort(CancelReason::Custom("halt".into()));
            });
            let child_result = run_in_scope(
                |child| async move {
                    let reason = child.signal().aborted().await;
                    assert_eq!(reason, CancelReason::Custom("halt".into()));
                    Ok(())
                },
                Some(outer.clone()),
            )
            .await;
            child_result.map_err(anyhow::Error::new)
        },
        None,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn ambient_scope_is_visible_inside_and_gone_outside() {
    assert!(current_scope().is_none());
    run_in_scope(
        |scope| async move {
            let ambient = current_scope().expect("inside a scope");
            assert!(Arc::ptr_eq(&ambient, &scope));
            Ok(())
        },
        None,
    )
    .await
    .unwrap();
    assert!(current_scope().is_none());
}

#[tokio::test]
async fn deadline_is_unset_outside_timeout() {
    assert!(scope_deadline_remaining().is_none());
    run_in_scope(
        |_scope| async move {
            assert!(scope_deadline_remaining().is_none());
            Ok(())
        },
        None,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn run_in_scope_propagates_callback_error() {
    let err = run_in_scope::<(), _, _>(
        |_scope| async move { Err(anyhow::anyhow!("body failed")) },
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.to_string(), "body failed");
}

#[tokio::test]
async fn strict_cancellation_resolves_and_watches_laggards() {
    let value = with_strict_cancellation(
        |scope| async move {
            // Work that ignores its signal for a while after the abort.
            let _laggard: Task<()> = run_task(
                |_| async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                },
                TaskOptions::named("laggard").with_signal(scope.signal()),
            );
            scope.abort(CancelReason::UserAbort);
            Ok(17)
        },
        StrictCancellationOptions { warn_after: Duration::from_millis(10) },
    )
    .await
    .unwrap();
    assert_eq!(value, 17);

    // Let the watchdog observe the laggard and stand down.
    tokio::time::sleep(Duration::from_millis(60)).await;
}

#[tokio::test]
async fn strict_cancellation_watchdog_stands_down_when_work_settles() {
    let value = with_strict_cancellation(
        |scope| async move {
            let _prompt: Task<()> = run_task(
                |signal| async move {
                    signal.aborted().await;
                    Err(anyhow::anyhow!("stopping"))
                },
                TaskOptions::named("prompt").with_signal(scope.signal()),
            );
            scope.abort(CancelReason::UserAbort);
            Ok(1)
        },
        StrictCancellationOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(value, 1);
}
