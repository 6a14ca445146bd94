mod common;

use std::time::Duration;

use tokio::sync::broadcast;
use vbricks_engine::{Engine, EngineError, Notification};

use common::Sandbox;

async fn accomplished(rx: &mut broadcast::Receiver<Notification>, event: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(Notification::EventAccomplished { name }) if name == event => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("notification channel closed: {e}"),
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_rearmed_event_fires_once() {
    let sandbox = Sandbox::new();
    let out = sandbox.dir.path().join("fired.log");
    let engine = Engine::start(sandbox.settings()).await.unwrap();
    let mut rx = engine.subscribe();

    engine.exec("new event ev").await.unwrap();
    engine
        .exec(&format!("event ev config delay=0.1 addsh echo x >> {}", out.display()))
        .await
        .unwrap();
    engine.exec("event ev on").await.unwrap();
    engine.exec("event ev on").await.unwrap();
    assert!(engine.snapshot().event("ev").unwrap().active);

    accomplished(&mut rx, "ev").await;
    // Let the detached shell finish writing
    tokio::time::sleep(Duration::from_millis(300)).await;

    let written = std::fs::read_to_string(&out).unwrap();
    assert_eq!(written.lines().count(), 1);
    assert!(!engine.snapshot().event("ev").unwrap().active);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_topology_action_runs_through_dispatcher() {
    let sandbox = Sandbox::new();
    let engine = Engine::start(sandbox.settings()).await.unwrap();
    let mut rx = engine.subscribe();

    engine.exec("new event ev").await.unwrap();
    engine.exec("ev config delay=0.1 add bogus command").await.unwrap();
    engine.exec("ev config add new switch sw9").await.unwrap();
    engine.exec("ev on").await.unwrap();

    accomplished(&mut rx, "ev").await;
    // The failing action is logged and does not stop the others
    assert!(engine.snapshot().brick("sw9").is_some());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_event_never_fires() {
    let sandbox = Sandbox::new();
    let out = sandbox.dir.path().join("cancelled.log");
    let engine = Engine::start(sandbox.settings()).await.unwrap();

    engine.exec("new event ev").await.unwrap();
    engine
        .exec(&format!("ev config delay=0.1 addsh touch {}", out.display()))
        .await
        .unwrap();
    engine.exec("ev on").await.unwrap();
    engine.exec("ev off").await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!out.exists());
    assert!(!engine.snapshot().event("ev").unwrap().active);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_unconfigured_event_refuses_to_arm() {
    let sandbox = Sandbox::new();
    let engine = Engine::start(sandbox.settings()).await.unwrap();

    engine.exec("new event ev").await.unwrap();
    assert!(matches!(
        engine.exec("ev on").await,
        Err(EngineError::BadConfig(_))
    ));
    engine.exec("ev config delay=1").await.unwrap();
    assert!(matches!(
        engine.exec("ev on").await,
        Err(EngineError::BadConfig(_))
    ));
    engine.shutdown().await;
}
