mod common;

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use vbricks_engine::process::is_process_alive;
use vbricks_engine::{Engine, EngineError, Notification, ProcessState, Registry};

use common::{PIDFILE_WRITER, Sandbox, fake_bin};

#[tokio::test]
async fn test_wire_starts_its_switches_first() {
    let sandbox = Sandbox::new();
    let (mut reg, _rx) = Registry::new(sandbox.settings());
    let mut notifications = reg.subscribe();

    reg.exec("new switch sw1").await.unwrap();
    reg.exec("new switch sw2").await.unwrap();
    reg.exec("new wire w1").await.unwrap();
    reg.exec("w1 connect sw1_port").await.unwrap();
    reg.exec("w1 connect sw2_port").await.unwrap();

    reg.exec("w1 on").await.unwrap();
    for name in ["sw1", "sw2", "w1"] {
        let brick = reg.brick(name).unwrap();
        assert_eq!(brick.state(), ProcessState::Running, "{name}");
        assert!(is_process_alive(brick.pid().unwrap()));
    }

    let mut started = Vec::new();
    while let Ok(n) = notifications.try_recv() {
        if let Notification::BrickStarted { name, .. } = n {
            started.push(name);
        }
    }
    assert_eq!(started, vec!["sw1", "sw2", "w1"]);

    let pid = reg.brick("w1").unwrap().pid().unwrap();
    reg.exec("w1 off").await.unwrap();
    assert_eq!(reg.brick("w1").unwrap().state(), ProcessState::Stopped);
    assert!(reg.brick("w1").unwrap().pid().is_none());
    assert!(!is_process_alive(pid));
    // Stopping a stopped brick is a no-op
    reg.exec("w1 off").await.unwrap();

    reg.shutdown().await;
    assert!(reg.bricks().iter().all(|b| !b.is_running()));
}

#[tokio::test]
async fn test_failed_preconditions_spawn_nothing() {
    let sandbox = Sandbox::new();
    let (mut reg, _rx) = Registry::new(sandbox.settings());

    reg.exec("new tap tap0").await.unwrap();
    assert!(matches!(
        reg.power_on("tap0").await,
        Err(EngineError::NotConnected(_))
    ));
    assert!(reg.brick("tap0").unwrap().pid().is_none());

    reg.exec("new switch sw1").await.unwrap();
    reg.exec("new wire w1").await.unwrap();
    reg.exec("w1 connect sw1_port").await.unwrap();
    assert!(matches!(
        reg.power_on("w1").await,
        Err(EngineError::NotConnected(_))
    ));
    assert!(reg.brick("w1").unwrap().pid().is_none());

    reg.exec("new tunnelc tc1").await.unwrap();
    reg.exec("tc1 connect sw1_port").await.unwrap();
    assert!(matches!(reg.power_on("tc1").await, Err(EngineError::BadConfig(_))));
    // Dependencies are untouched when the brick itself is not ready
    assert!(!reg.brick("sw1").unwrap().is_running());
}

#[tokio::test]
async fn test_switch_ring_refuses_to_start() {
    let sandbox = Sandbox::new();
    let (mut reg, _rx) = Registry::new(sandbox.settings());

    for name in ["a", "b", "c"] {
        reg.exec(&format!("new switch {name}")).await.unwrap();
    }
    reg.exec("a connect b_port").await.unwrap();
    reg.exec("b connect c_port").await.unwrap();
    reg.exec("c connect a_port").await.unwrap();

    assert!(matches!(reg.power_on("a").await, Err(EngineError::LinkLoop(_))));
    assert!(reg.bricks().iter().all(|b| b.pid().is_none()));
}

#[tokio::test]
async fn test_missing_binary_leaves_brick_stopped() {
    let sandbox = Sandbox::new();
    let mut settings = sandbox.settings();
    settings.vde_dir = sandbox.dir.path().join("nowhere");
    let (mut reg, _rx) = Registry::new(settings);

    reg.exec("new switch sw1").await.unwrap();
    assert!(reg.power_on("sw1").await.is_err());
    assert_eq!(reg.brick("sw1").unwrap().state(), ProcessState::Stopped);
}

#[tokio::test]
async fn test_elevated_start_reads_pidfile() {
    let sandbox = Sandbox::new();
    fake_bin(&sandbox.bin, "vde_plug2tap", PIDFILE_WRITER);
    let wrapper = fake_bin(&sandbox.bin, "fake-sudo", r#"exec "$@""#);
    let mut settings = sandbox.settings();
    settings.sudo = Some(wrapper.display().to_string());
    let pidfile = settings.pidfile_path("tap0");
    let (mut reg, _rx) = Registry::new(settings);

    reg.exec("new switch sw1").await.unwrap();
    reg.exec("new tap tap0").await.unwrap();
    reg.exec("tap0 connect sw1_port").await.unwrap();

    let cmdline = reg.exec("tap0 cmdline").await.unwrap();
    assert!(cmdline.starts_with(&wrapper.display().to_string()));
    assert!(cmdline.ends_with(&format!("--pidfile {}", pidfile.display())));

    reg.exec("tap0 on").await.unwrap();
    let pid = reg.brick("tap0").unwrap().pid().unwrap();
    let written: u32 = std::fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();
    assert_eq!(pid, written);
    assert!(is_process_alive(pid));
    // The switch runs unprivileged
    assert!(!reg.command_line("sw1").unwrap()[0].ends_with("fake-sudo"));

    reg.exec("tap0 off").await.unwrap();
    assert!(!is_process_alive(pid));
    assert!(!pidfile.exists());
    reg.shutdown().await;
}

#[tokio::test]
async fn test_running_switch_is_reconfigured_live() {
    let sandbox = Sandbox::new();
    let settings = sandbox.settings();
    let listener = UnixListener::bind(settings.mgmt_path("sw1")).unwrap();
    let (mut reg, _rx) = Registry::new(settings);

    let console = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        write.write_all(b"1000 Success\n").await.unwrap();
        line
    });

    reg.exec("new switch sw1").await.unwrap();
    reg.exec("sw1 on").await.unwrap();
    reg.exec("sw1 config numports=8").await.unwrap();
    assert_eq!(console.await.unwrap(), "port/setnumports 8");
    assert!(!reg.brick("sw1").unwrap().needs_restart());

    // No live command for an extension key
    reg.exec("sw1 config color=red").await.unwrap();
    assert!(reg.brick("sw1").unwrap().needs_restart());

    reg.shutdown().await;
}

#[tokio::test]
async fn test_engine_reaps_exited_process() {
    let sandbox = Sandbox::new();
    fake_bin(&sandbox.bin, "vde_switch", "exit 0");
    let engine = Engine::start(sandbox.settings()).await.unwrap();
    let mut notifications = engine.subscribe();

    engine.exec("new switch sw1").await.unwrap();
    engine.exec("sw1 on").await.unwrap();

    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Notification::BrickStopped { name }) = notifications.recv().await {
                break name;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(stopped, "sw1");

    let snapshot = engine.snapshot();
    let sw1 = snapshot.brick("sw1").unwrap();
    assert_eq!(sw1.state, ProcessState::Stopped);
    assert!(sw1.pid.is_none());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_broken_console_is_dropped_on_live_update() {
    let sandbox = Sandbox::new();
    let settings = sandbox.settings();
    let listener = UnixListener::bind(settings.mgmt_path("sw1")).unwrap();
    let (mut reg, _rx) = Registry::new(settings);

    let console = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    reg.exec("new switch sw1").await.unwrap();
    reg.exec("sw1 on").await.unwrap();
    console.await.unwrap();
    assert!(reg.brick("sw1").unwrap().has_console());

    let mut notifications = reg.subscribe();
    reg.exec("sw1 config numports=8").await.unwrap();

    let sw1 = reg.brick("sw1").unwrap();
    assert_eq!(sw1.config().number("numports"), 8);
    assert!(sw1.needs_restart());
    assert!(!sw1.has_console());
    assert!(sw1.is_running());
    assert!(matches!(
        notifications.try_recv(),
        Ok(Notification::BrickChanged { name }) if name == "sw1"
    ));

    reg.shutdown().await;
}

async fn switch_ring(reg: &mut Registry) {
    for name in ["a", "b", "c"] {
        reg.exec(&format!("new switch {name}")).await.unwrap();
    }
    reg.exec("a connect b_port").await.unwrap();
    reg.exec("b connect c_port").await.unwrap();
    reg.exec("c connect a_port").await.unwrap();
}

#[tokio::test]
async fn test_connected_on_ring_fails_closed() {
    let sandbox = Sandbox::new();
    let (mut reg, _rx) = Registry::new(sandbox.settings());
    switch_ring(&mut reg).await;

    assert!(!reg.connected("a", 0).await.unwrap());
    assert!(reg.bricks().iter().all(|b| !b.is_running()));
}

#[tokio::test]
async fn test_connected_on_ring_raises_when_strict() {
    let sandbox = Sandbox::new();
    let mut settings = sandbox.settings();
    settings.erroronloop = true;
    let (mut reg, _rx) = Registry::new(settings);
    switch_ring(&mut reg).await;

    assert!(matches!(
        reg.connected("a", 0).await,
        Err(EngineError::LinkLoop(_))
    ));
    assert!(reg.bricks().iter().all(|b| !b.is_running()));
}

#[tokio::test]
async fn test_connected_starts_peer() {
    let sandbox = Sandbox::new();
    let (mut reg, _rx) = Registry::new(sandbox.settings());

    reg.exec("new switch sw1").await.unwrap();
    reg.exec("new switch sw2").await.unwrap();
    reg.exec("new wire w1").await.unwrap();
    reg.exec("w1 connect sw1_port").await.unwrap();

    // Unattached plug
    assert!(!reg.connected("w1", 1).await.unwrap());

    assert!(reg.connected("w1", 0).await.unwrap());
    assert!(reg.brick("sw1").unwrap().is_running());
    assert!(!reg.brick("sw2").unwrap().is_running());
    assert!(!reg.brick("w1").unwrap().is_running());

    reg.shutdown().await;
}
