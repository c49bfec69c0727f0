//! Session lifecycle against the scripted kernel provider.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use kernel_session::{
    CommRegistry, ExecuteOptions, KernelError, KernelPreference, KernelStatus, Session,
};

fn session(provider: Arc<FakeProvider>) -> Session {
    Session::new(
        "demo.ipynb",
        KernelPreference::default(),
        provider,
        test_config(),
        CommRegistry::new(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent() {
    let provider = FakeProvider::new();
    let session = session(provider.clone());
    assert!(session.connection().is_none());
    assert_eq!(session.status(), KernelStatus::Unknown);

    let first = session.start().await.unwrap();
    session.ready().await.unwrap();
    flush().await;
    assert_eq!(session.status(), KernelStatus::Idle);
    assert!(first.kernel_info().is_some());

    let second = session.start().await.unwrap();
    assert_eq!(first.kernel_id(), second.kernel_id());
    assert_eq!(provider.started(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_execute_through_session() {
    let session = session(FakeProvider::new());
    let connection = session.start().await.unwrap();

    let reply = connection
        .request_execute("1+1", ExecuteOptions::default())
        .done()
        .await
        .unwrap();
    assert_eq!(reply.msg_type(), "execute_reply");
    assert_eq!(connection.execution_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_pending_and_releases_connection() {
    let provider = FakeProvider::new();
    let session = session(provider.clone());
    let connection = session.start().await.unwrap();

    let pending = connection.request_execute("sleep", ExecuteOptions::default());
    flush().await;
    session.shutdown().await.unwrap();

    assert_eq!(pending.done().await, Err(KernelError::SessionShutdown));
    assert!(session.connection().is_none());
    assert_eq!(session.status(), KernelStatus::Dead);
    assert_eq!(*provider.shutdowns.lock().unwrap(), vec!["python3-1"]);
    assert_eq!(session.ready().await, Err(KernelError::SessionShutdown));

    // shutting down with no kernel is a no-op
    session.shutdown().await.unwrap();
    assert_eq!(provider.shutdowns.lock().unwrap().len(), 1);

    let restarted = session.start().await.unwrap();
    assert_eq!(restarted.kernel_id(), "python3-2");
    session.ready().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_restart_starts_new_generation() {
    let provider = FakeProvider::new();
    let session = session(provider.clone());
    let connection = session.start().await.unwrap();
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let _subscription = {
        let statuses = statuses.clone();
        session.subscribe_status(move |s| statuses.lock().unwrap().push(*s))
    };

    let pending = connection.request_execute("sleep", ExecuteOptions::default());
    flush().await;
    session.restart().await.unwrap();

    assert_eq!(pending.done().await, Err(KernelError::KernelRestarted));
    assert_eq!(connection.generation(), 1);
    assert_eq!(provider.restarts(), 1);
    session.ready().await.unwrap();
    assert!(statuses
        .lock()
        .unwrap()
        .contains(&KernelStatus::Restarting));

    let reply = connection
        .request_execute("1+1", ExecuteOptions::default())
        .done()
        .await;
    assert!(reply.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_failed_restart_leaves_kernel_dead() {
    let provider = FakeProvider::new();
    let session = session(provider.clone());
    let connection = session.start().await.unwrap();

    provider.fail_restart.store(true, Ordering::SeqCst);
    let result = session.restart().await;
    assert!(matches!(result, Err(KernelError::Provider(_))));
    assert_eq!(session.status(), KernelStatus::Dead);
    assert!(matches!(session.ready().await, Err(KernelError::Provider(_))));

    let refused = connection.request_execute("1+1", ExecuteOptions::default());
    assert_eq!(refused.result(), Some(Err(KernelError::KernelDead)));

    // starting again replaces the dead kernel
    provider.fail_restart.store(false, Ordering::SeqCst);
    let replacement = session.start().await.unwrap();
    assert_ne!(replacement.kernel_id(), connection.kernel_id());
    assert_eq!(provider.started(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_start_replaces_connection_out_of_retries() {
    let provider = FakeProvider::new();
    let session = session(provider.clone());
    let first = session.start().await.unwrap();
    session.ready().await.unwrap();

    let transport = provider.last_transport();
    transport.refuse_connects(true);
    transport.hang_up();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(first.is_closed());
    assert!(!first.is_usable());
    assert_eq!(session.status(), KernelStatus::Disconnected);
    let refused = first.request_kernel_info();
    assert_eq!(refused.result(), Some(Err(KernelError::NotConnected)));

    // a closed channel cannot be restarted in place
    assert_eq!(session.restart().await, Err(KernelError::NotConnected));
    assert_eq!(provider.restarts(), 0);

    let second = session.start().await.unwrap();
    assert_eq!(provider.started(), 2);
    assert_ne!(second.kernel_id(), first.kernel_id());
    session.ready().await.unwrap();
    assert!(second.is_usable());

    let reply = second
        .request_execute("1+1", ExecuteOptions::default())
        .done()
        .await;
    assert!(reply.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_restart_without_kernel() {
    let session = session(FakeProvider::new());
    assert_eq!(session.restart().await, Err(KernelError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_failed_start() {
    let provider = FakeProvider::new();
    provider.fail_start.store(true, Ordering::SeqCst);
    let session = session(provider);

    assert!(matches!(
        session.start().await,
        Err(KernelError::Provider(_))
    ));
    assert!(session.connection().is_none());
    assert!(matches!(session.ready().await, Err(KernelError::Provider(_))));
}

#[tokio::test(start_paused = true)]
async fn test_rename_keeps_kernel() {
    let session = session(FakeProvider::new());
    let connection = session.start().await.unwrap();

    session.rename("renamed.ipynb");
    assert_eq!(session.path(), "renamed.ipynb");
    assert_eq!(
        session.connection().map(|c| c.kernel_id().to_string()),
        Some(connection.kernel_id().to_string())
    );
}
