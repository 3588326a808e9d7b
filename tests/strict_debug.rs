//! Strict-mode and debug-event behavior. These mutate process-wide state,
//! so every test runs serially and resets the globals up front.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serial_test::serial;
use taskscope::{
    branch, disable_strict_mode, disable_task_debug, enable_strict_mode, enable_task_debug,
    run_in_scope, run_task, subscribe_task_debug, sync, MetricsSubscriber, ScopeKind,
    StrictOptions, StrictPolicy, Task, TaskEvent, TaskOptions,
};

fn reset() {
    disable_strict_mode();
    disable_task_debug();
}

#[tokio::test]
#[serial]
async fn debug_events_flow_when_enabled() {
    reset();
    enable_task_debug(None);
    let metrics = MetricsSubscriber::new();
    let subscription = metrics.attach();

    let value = sync(|ctx| async move {
        let observed = ctx.spawn_named("observed", |_| async { Ok(1) });
        Ok(observed.join().await?)
    })
    .await
    .unwrap();
    assert_eq!(value, 1);

    assert!(metrics.scopes_opened() >= 1);
    assert!(metrics.scopes_closed() >= 1);
    assert!(metrics.tasks_registered() >= 1);
    assert!(metrics.task_updates() >= 1);

    subscription.unsubscribe();
    reset();
}

#[tokio::test]
#[serial]
async fn no_events_or_ids_while_disabled() {
    reset();
    let metrics = MetricsSubscriber::new();
    let subscription = metrics.attach();

    sync::<i32, (), _, _>(|ctx| async move {
        ctx.spawn(|_| async { Ok(1) });
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(metrics.scopes_opened(), 0);
    assert_eq!(metrics.tasks_registered(), 0);
    assert_eq!(metrics.task_updates(), 0);

    subscription.unsubscribe();
}

#[tokio::test]
#[serial]
async fn events_carry_names_kinds_and_parent_scope() {
    reset();
    enable_task_debug(None);
    let events: Arc<Mutex<Vec<TaskEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let subscription = subscribe_task_debug(move |event| {
        sink.lock().unwrap().push(event.clone());
    });

    sync(|ctx| async move {
        let named = ctx.spawn_named("observed", |_| async { Ok(1) });
        Ok(named.join().await?)
    })
    .await
    .unwrap();

    let events = events.lock().unwrap();
    let opened_sync = events.iter().any(|event| {
        matches!(event, TaskEvent::ScopeOpened { kind: ScopeKind::Sync, .. })
    });
    assert!(opened_sync, "expected a sync ScopeOpened event");

    let registered = events.iter().find_map(|event| match event {
        TaskEvent::TaskRegistered { name, parent_scope_id, .. } => {
            Some((name.clone(), *parent_scope_id))
        }
        _ => None,
    });
    let (name, parent_scope_id) = registered.expect("expected a TaskRegistered event");
    assert_eq!(name.as_deref(), Some("observed"));
    assert!(parent_scope_id.is_some(), "scope-bound task carries its scope id");

    drop(events);
    subscription.unsubscribe();
    reset();
}

#[tokio::test]
#[serial]
async fn panicking_subscriber_does_not_alter_outcomes() {
    reset();
    let logged: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log_sink = logged.clone();
    enable_task_debug(Some(Arc::new(move |message: &str| {
        log_sink.lock().unwrap().push(message.to_string());
    })));
    let subscription = subscribe_task_debug(|_event| panic!("misbehaving subscriber"));

    let value = sync(|ctx| async move {
        let fine = ctx.spawn(|_| async { Ok(9) });
        Ok(fine.join().await?)
    })
    .await
    .unwrap();
    assert_eq!(value, 9);
    assert!(!logged.lock().unwrap().is_empty(), "panic was routed to the logger");

    subscription.unsubscribe();
    reset();
}

#[tokio::test]
#[serial]
async fn strict_mode_reports_unstructured_orphaned_and_ignored() {
    reset();
    let warnings: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = warnings.clone();
    enable_strict_mode(StrictOptions {
        policy: StrictPolicy::Warn,
        on_warn: Some(Arc::new(move |error| {
            sink.lock().unwrap().push(error.message.clone());
        })),
    });

    // Unstructured: no signal, no ambient scope.
    let free: Task<i32> = run_task(|_| async { Ok(1) }, TaskOptions::new());
    free.join().await.unwrap();

    // Orphan at scope exit, then ignored cancellation on close.
    run_in_scope(
        |scope| async move {
            let _bound: Task<()> = run_task(
                |signal| async move {
                    signal.aborted().await;
                    Err(anyhow::anyhow!("stopping"))
                },
                TaskOptions::new().with_signal(scope.signal()),
            );
            Ok(())
        },
        None,
    )
    .await
    .unwrap();

    let warnings = warnings.lock().unwrap();
    assert!(warnings.iter().any(|w| w.contains("unstructured")), "{warnings:?}");
    assert!(warnings.iter().any(|w| w.contains("non-terminal")), "{warnings:?}");
    assert!(warnings.iter().any(|w| w.contains("on_cancel")), "{warnings:?}");
    drop(warnings);
    reset();
}

#[tokio::test]
#[serial]
async fn strict_mode_reports_branch_without_parent() {
    reset();
    let warnings: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = warnings.clone();
    enable_strict_mode(StrictOptions {
        policy: StrictPolicy::Warn,
        on_warn: Some(Arc::new(move |error| {
            sink.lock().unwrap().push(error.message.clone());
        })),
    });

    branch::<(), _, _>(|_ctx| async { Ok(()) });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(warnings.lock().unwrap().iter().any(|w| w.contains("branch")));
    reset();
}

#[tokio::test]
#[serial]
#[should_panic(expected = "strict mode violation")]
async fn strict_deny_policy_panics() {
    reset();
    enable_strict_mode(StrictOptions { policy: StrictPolicy::Deny, on_warn: None });
    let _: Task<i32> = run_task(|_| async { Ok(1) }, TaskOptions::new());
}

#[tokio::test]
#[serial]
async fn tasks_without_handlers_are_quiet_when_strict_disabled() {
    reset();
    // No strict mode: cancelling a task with no handlers must not panic or
    // warn through the callback path.
    run_in_scope(
        |scope| async move {
            let _bound: Task<()> = run_task(
                |signal| async move {
                    signal.aborted().await;
                    Err(anyhow::anyhow!("stopping"))
                },
                TaskOptions::new().with_signal(scope.signal()),
            );
            Ok(())
        },
        None,
    )
    .await
    .unwrap();
}
