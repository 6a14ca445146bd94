//! Owner of every brick, event and socket.
//!
//! All mutation goes through `&mut Registry`; the engine keeps it behind a
//! single async mutex so power operations and timer-driven actions are
//! serialized. Readers that must not wait use the published
//! [`TopologySnapshot`] instead.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::bricks::{Brick, BrickKind, ProcessState};
use crate::command::BuildContext;
use crate::console::ManagementChannel;
use crate::error::{EngineError, Result};
use crate::event::{Action, ActionKind, Event, TimerFired, parse_event_config, spawn_shell};
use crate::graph::{DEFAULT_NIC_MODEL, Nic, Plug, PlugRef, Sock, format_mac, generate_mac_address, is_valid_mac};
use crate::notify::{BrickStatus, EventStatus, Notification, TopologySnapshot};
use crate::process::{BrickProcess, Elevation, HostCommand, Launch};
use crate::settings::Settings;
use crate::validation::validate_name;

const NOTIFY_CAPACITY: usize = 256;

pub struct Registry {
    settings: Arc<Settings>,
    bricks: Vec<Brick>,
    events: Vec<Event>,
    socks: Vec<Sock>,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
    notify_tx: broadcast::Sender<Notification>,
    snapshot_tx: watch::Sender<TopologySnapshot>,
}

impl Registry {
    /// Create an empty registry. The returned receiver yields timer reports
    /// that must be fed back through [`Registry::fire_event`].
    pub fn new(settings: Settings) -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        let (snapshot_tx, _) = watch::channel(TopologySnapshot::default());

        let registry = Self {
            settings: Arc::new(settings),
            bricks: Vec::new(),
            events: Vec::new(),
            socks: Vec::new(),
            fired_tx,
            notify_tx,
            snapshot_tx,
        };
        (registry, fired_rx)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bricks(&self) -> &[Brick] {
        &self.bricks
    }

    pub fn brick(&self, name: &str) -> Option<&Brick> {
        self.bricks.iter().find(|b| b.name() == name)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn event(&self, name: &str) -> Option<&Event> {
        self.events.iter().find(|e| e.name() == name)
    }

    pub fn socks(&self) -> &[Sock] {
        &self.socks
    }

    pub fn sock(&self, nickname: &str) -> Option<&Sock> {
        self.socks.iter().find(|s| s.nickname() == nickname)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }

    pub fn notifier(&self) -> broadcast::Sender<Notification> {
        self.notify_tx.clone()
    }

    pub fn watch(&self) -> watch::Receiver<TopologySnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            bricks: self.bricks.iter().map(BrickStatus::from).collect(),
            events: self.events.iter().map(EventStatus::from).collect(),
        }
    }

    /// Brick and event names share one namespace.
    pub fn name_taken(&self, name: &str) -> bool {
        self.brick(name).is_some() || self.event(name).is_some()
    }

    fn claim_name(&self, raw: &str) -> Result<String> {
        let name = validate_name(raw)?;
        if self.name_taken(&name) {
            return Err(EngineError::invalid_name(&name, "already in use"));
        }
        Ok(name)
    }

    fn brick_index(&self, name: &str) -> Result<usize> {
        self.bricks
            .iter()
            .position(|b| b.name() == name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    fn event_index(&self, name: &str) -> Result<usize> {
        self.events
            .iter()
            .position(|e| e.name() == name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    fn sock_index(&self, nickname: &str) -> Result<usize> {
        self.socks
            .iter()
            .position(|s| s.nickname() == nickname)
            .ok_or_else(|| EngineError::NotFound(nickname.to_string()))
    }

    fn sock_owner(&self, nickname: &str) -> Option<usize> {
        let sock = self.sock(nickname)?;
        self.bricks.iter().position(|b| b.name() == sock.owner())
    }

    pub(crate) fn emit(&self, notification: Notification) {
        debug!(notification = ?notification, "Topology changed");
        let _ = self.notify_tx.send(notification);
        self.publish();
    }

    pub(crate) fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    // Creation and removal

    pub fn new_brick(&mut self, kind: BrickKind, name: &str) -> Result<String> {
        let name = self.claim_name(name)?;
        let mut brick = Brick::new(kind, &name);

        if brick.driver().owns_sock() {
            let sock = Sock::new(&name, self.settings.sock_path(&name));
            brick.socks.push(sock.nickname().to_string());
            self.socks.push(sock);
        }

        info!(brick = %name, kind = %kind, "Brick created");
        self.bricks.push(brick);
        self.emit(Notification::BrickAdded { name: name.clone() });
        Ok(name)
    }

    pub fn new_event(&mut self, name: &str) -> Result<String> {
        let name = self.claim_name(name)?;
        info!(event = %name, "Event created");
        self.events.push(Event::new(&name));
        self.emit(Notification::EventAdded { name: name.clone() });
        Ok(name)
    }

    /// Remove a brick or an event. A running brick is powered off first, and
    /// plugs of other bricks attached to its sockets are released.
    pub async fn delete(&mut self, name: &str) -> Result<()> {
        if let Ok(idx) = self.event_index(name) {
            let mut event = self.events.remove(idx);
            event.cancel();
            info!(event = %name, "Event deleted");
            self.emit(Notification::EventRemoved {
                name: name.to_string(),
            });
            return Ok(());
        }

        let idx = self.brick_index(name)?;
        if self.bricks[idx].is_running() {
            self.power_off(name).await?;
        }

        self.release_plugs(idx);

        let owned = std::mem::take(&mut self.bricks[idx].socks);
        for nickname in &owned {
            let Ok(sidx) = self.sock_index(nickname) else { continue };
            let sock = self.socks.remove(sidx);
            for plug in sock.plugs() {
                if let Some(peer) = self.bricks.iter_mut().find(|b| b.name() == plug.brick) {
                    if let Some(p) = peer.plugs.get_mut(plug.index) {
                        p.detach();
                    }
                    peer.dirty = true;
                    debug!(brick = %plug.brick, sock = %nickname, "Plug released by deleted socket");
                }
            }
        }

        self.bricks.remove(idx);
        info!(brick = %name, "Brick deleted");
        self.emit(Notification::BrickRemoved {
            name: name.to_string(),
        });
        Ok(())
    }

    fn copy_name(&self, base: &str) -> String {
        let mut candidate = format!("{base}_copy");
        let mut n = 2;
        while self.name_taken(&candidate) {
            candidate = format!("{base}_copy{n}");
            n += 1;
        }
        candidate
    }

    /// Copy configuration under a fresh `<name>_copy[N]` name. Links are not
    /// copied; an event copy starts inactive.
    pub fn duplicate(&mut self, name: &str) -> Result<String> {
        let copy = self.copy_name(name);

        if let Ok(idx) = self.event_index(name) {
            let event = self.events[idx].duplicate(&copy);
            self.events.push(event);
            info!(event = %name, copy = %copy, "Event duplicated");
            self.emit(Notification::EventAdded { name: copy.clone() });
            return Ok(copy);
        }

        let idx = self.brick_index(name)?;
        let kind = self.bricks[idx].kind();
        let mut config = self.bricks[idx].config.clone();
        kind.driver().on_config_changed(&mut config);

        let copy = self.new_brick(kind, &copy)?;
        let cidx = self.brick_index(&copy)?;
        self.bricks[cidx].config = config;
        info!(brick = %name, copy = %copy, "Brick duplicated");
        Ok(copy)
    }

    // Graph

    /// Attach the first free plug of `brick` to `sock`. VMs grow a new NIC
    /// instead. Returns false when every plug is already attached.
    pub fn connect(&mut self, brick: &str, sock: &str) -> Result<bool> {
        let idx = self.brick_index(brick)?;
        if self.bricks[idx].driver().grows_plugs() {
            self.connect_nic(brick, Some(sock), None, None, None)?;
            return Ok(true);
        }

        let sidx = self.sock_index(sock)?;
        let Some(plug) = self.bricks[idx].first_free_plug() else {
            debug!(brick = %brick, sock = %sock, "No free plug");
            return Ok(false);
        };
        self.attach(idx, plug, sidx);
        Ok(true)
    }

    /// Add a NIC to a VM, backed by `sock` or by user-mode networking.
    pub fn connect_nic(
        &mut self,
        brick: &str,
        sock: Option<&str>,
        model: Option<&str>,
        mac: Option<&str>,
        vlan: Option<u32>,
    ) -> Result<()> {
        let idx = self.brick_index(brick)?;
        if !self.bricks[idx].driver().grows_plugs() {
            return Err(EngineError::invalid_value(
                "nic",
                self.bricks[idx].kind().type_name(),
            ));
        }
        let sidx = sock.map(|s| self.sock_index(s)).transpose()?;

        let mac = match mac {
            Some(mac) if is_valid_mac(mac) => mac.to_ascii_lowercase(),
            Some(mac) => return Err(EngineError::invalid_value("mac", mac)),
            None => format_mac(&generate_mac_address()),
        };
        let vm = &mut self.bricks[idx];
        let nic = Nic {
            model: model.unwrap_or(DEFAULT_NIC_MODEL).to_string(),
            mac,
            vlan: vlan.unwrap_or(vm.plugs.len() as u32),
        };
        vm.plugs.push(Plug::with_nic(nic));
        let plug = vm.plugs.len() - 1;

        match sidx {
            Some(sidx) => self.attach(idx, plug, sidx),
            None => self.touch(idx),
        }
        Ok(())
    }

    fn attach(&mut self, idx: usize, plug: usize, sidx: usize) {
        let sock = &mut self.socks[sidx];
        let brick = &mut self.bricks[idx];
        brick.plugs[plug].attach(sock.nickname());
        sock.attach(PlugRef {
            brick: brick.name().to_string(),
            index: plug,
        });
        info!(brick = %brick.name(), plug = plug, sock = %sock.nickname(), "Plug connected");
        self.touch(idx);
    }

    /// Rerun derived-state hooks and mark the brick changed.
    fn touch(&mut self, idx: usize) {
        let brick = &mut self.bricks[idx];
        brick.driver().on_config_changed(&mut brick.config);
        brick.dirty = true;
        if brick.is_running() {
            brick.needs_restart = true;
        }
        let name = brick.name().to_string();
        self.emit(Notification::BrickChanged { name });
    }

    fn release_plugs(&mut self, idx: usize) {
        let name = self.bricks[idx].name().to_string();
        for (index, plug) in self.bricks[idx].plugs.iter_mut().enumerate() {
            if let Some(nickname) = plug.detach() {
                if let Some(sock) = self.socks.iter_mut().find(|s| s.nickname() == nickname) {
                    sock.detach(&PlugRef {
                        brick: name.clone(),
                        index,
                    });
                }
            }
        }
    }

    /// Detach every plug. VM interfaces are removed altogether.
    pub fn disconnect(&mut self, brick: &str) -> Result<()> {
        let idx = self.brick_index(brick)?;
        self.release_plugs(idx);
        if self.bricks[idx].driver().grows_plugs() {
            self.bricks[idx].plugs.clear();
        }
        info!(brick = %brick, "Brick disconnected");
        self.touch(idx);
        Ok(())
    }

    /// Bricks owning the sockets `idx` is plugged into.
    fn peers(&self, idx: usize) -> Vec<usize> {
        self.bricks[idx]
            .plugs
            .iter()
            .filter_map(|p| p.sock())
            .filter_map(|s| self.sock_owner(s))
            .collect()
    }

    /// Depth-first walk over plug dependencies starting at `start`. Returns
    /// the bricks in start order (dependencies first, `start` last), or
    /// `None` when the walk runs back into a brick still on the path.
    fn walk(&self, start: usize, mut on_path: Vec<usize>) -> Option<Vec<usize>> {
        fn visit(
            registry: &Registry,
            idx: usize,
            on_path: &mut Vec<usize>,
            done: &mut HashSet<usize>,
            order: &mut Vec<usize>,
        ) -> bool {
            if done.contains(&idx) {
                return true;
            }
            if on_path.contains(&idx) {
                return false;
            }
            on_path.push(idx);
            for peer in registry.peers(idx) {
                if !visit(registry, peer, on_path, done, order) {
                    return false;
                }
            }
            on_path.pop();
            done.insert(idx);
            order.push(idx);
            true
        }

        let mut done = HashSet::new();
        let mut order = Vec::new();
        visit(self, start, &mut on_path, &mut done, &mut order).then_some(order)
    }

    fn loop_found(&self, name: &str) -> Result<bool> {
        warn!(brick = %name, "Network loop detected");
        if self.settings.erroronloop {
            Err(EngineError::LinkLoop(name.to_string()))
        } else {
            Ok(false)
        }
    }

    /// Loop check over every plug of `brick`.
    pub fn check_links(&self, brick: &str) -> Result<bool> {
        let idx = self.brick_index(brick)?;
        match self.walk(idx, Vec::new()) {
            Some(_) => Ok(true),
            None => self.loop_found(brick),
        }
    }

    /// Whether the peer behind `plug` is live, starting it and everything it
    /// depends on when needed. Fails closed.
    pub async fn connected(&mut self, brick: &str, plug: usize) -> Result<bool> {
        let idx = self.brick_index(brick)?;
        let peer = self.bricks[idx]
            .plugs
            .get(plug)
            .and_then(|p| p.sock())
            .and_then(|s| self.sock_owner(s));
        let Some(peer) = peer else {
            return Ok(false);
        };

        let Some(order) = self.walk(peer, vec![idx]) else {
            return self.loop_found(brick);
        };
        for dep in order {
            if let Err(e) = self.start_checked(dep).await {
                warn!(brick = %brick, peer = %self.bricks[dep].name(), error = %e, "Peer failed to start");
                return Ok(false);
            }
        }
        Ok(self.bricks[peer].is_running())
    }

    // Configuration

    /// Apply `key=value` assignments to a brick or an event. Running bricks
    /// get live updates through their console where the kind supports it;
    /// anything else is flagged as needing a restart.
    pub async fn configure(&mut self, name: &str, args: &[&str]) -> Result<()> {
        if self.event_index(name).is_ok() {
            return self.configure_event(name, args);
        }

        let idx = self.brick_index(name)?;
        let driver = self.bricks[idx].driver();
        let mut config = self.bricks[idx].config.clone();
        let mut changed = Vec::new();
        for arg in args {
            match config.set(arg)? {
                Some(key) => changed.push(key),
                None => debug!(brick = %name, arg = %arg, "Ignoring non-assignment"),
            }
        }
        driver.on_config_changed(&mut config);
        self.bricks[idx].config = config;
        self.bricks[idx].dirty = true;

        if self.bricks[idx].is_running() {
            for key in changed {
                let commands = driver.live_commands(&key, &self.bricks[idx].config);
                let brick = &mut self.bricks[idx];
                let mut failed = false;
                match brick.console.as_mut() {
                    Some(console) if !commands.is_empty() => {
                        for command in commands {
                            match console.request(&command).await {
                                Ok(reply) => {
                                    debug!(brick = %name, command = %command, reply = %reply.trim_end(), "Applied live");
                                }
                                Err(e) => {
                                    warn!(brick = %name, command = %command, error = %e, "Live update failed, dropping console");
                                    failed = true;
                                    break;
                                }
                            }
                        }
                    }
                    _ => brick.needs_restart = true,
                }
                if failed {
                    brick.needs_restart = true;
                    if let Some(console) = brick.console.take() {
                        console.close().await;
                    }
                }
            }
        }

        info!(brick = %name, "Brick configured");
        self.emit(Notification::BrickChanged {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn unset(&mut self, name: &str, key: &str) -> Result<()> {
        if let Ok(idx) = self.event_index(name) {
            self.events[idx].config.unset(key)?;
            self.emit(Notification::EventChanged {
                name: name.to_string(),
            });
            return Ok(());
        }

        let idx = self.brick_index(name)?;
        let brick = &mut self.bricks[idx];
        brick.config.unset(key)?;
        brick.driver().on_config_changed(&mut brick.config);
        brick.dirty = true;
        if brick.is_running() {
            brick.needs_restart = true;
        }
        self.emit(Notification::BrickChanged {
            name: name.to_string(),
        });
        Ok(())
    }

    // Process lifecycle

    fn build_context<'a>(&self, idx: usize, settings: &'a Settings) -> BuildContext<'a> {
        BuildContext {
            settings,
            plug_socks: self.bricks[idx]
                .plugs
                .iter()
                .map(|p| {
                    p.sock()
                        .and_then(|s| self.sock(s))
                        .map(|s| s.path().to_path_buf())
                })
                .collect(),
        }
    }

    fn launch_for(&self, idx: usize, ctx: &BuildContext<'_>) -> Launch {
        let brick = &self.bricks[idx];
        let driver = brick.driver();
        let elevation = match (&ctx.settings.sudo, brick.needs_elevated_start()) {
            (Some(wrapper), true) => Some(Elevation {
                wrapper: wrapper.clone(),
                pidfile: ctx.settings.pidfile_path(brick.name()),
                pidfile_flag: driver.pidfile_flag(),
            }),
            _ => None,
        };
        Launch {
            program: driver.binary(brick, ctx.settings),
            args: driver.args(brick, ctx),
            elevation,
        }
    }

    /// The command line `power_on` would execute right now.
    pub fn command_line(&self, brick: &str) -> Result<Vec<String>> {
        let idx = self.brick_index(brick)?;
        let settings = self.settings.clone();
        let ctx = self.build_context(idx, &settings);
        Ok(self.launch_for(idx, &ctx).argv())
    }

    /// Start a brick after its dependencies. Preconditions are checked in
    /// order (configured, connected, loop free) and nothing is spawned when
    /// one fails.
    pub async fn power_on(&mut self, name: &str) -> Result<()> {
        let idx = self.brick_index(name)?;
        if self.bricks[idx].is_running() {
            debug!(brick = %name, "Already running");
            return Ok(());
        }
        self.check_preconditions(idx)?;

        let Some(order) = self.walk(idx, Vec::new()) else {
            warn!(brick = %name, "Network loop detected");
            return Err(EngineError::LinkLoop(name.to_string()));
        };

        for dep in order {
            if dep == idx {
                break;
            }
            if let Err(e) = self.start_checked(dep).await {
                warn!(brick = %name, peer = %self.bricks[dep].name(), error = %e, "Dependency failed to start");
                return Err(EngineError::NotConnected(name.to_string()));
            }
        }

        self.start_process(idx).await
    }

    fn check_preconditions(&self, idx: usize) -> Result<()> {
        let brick = &self.bricks[idx];
        let settings = self.settings.clone();
        let ctx = self.build_context(idx, &settings);
        if !brick.driver().configured(brick, &ctx) {
            return Err(EngineError::BadConfig(brick.name().to_string()));
        }
        if !brick.properly_connected() {
            return Err(EngineError::NotConnected(brick.name().to_string()));
        }
        Ok(())
    }

    async fn start_checked(&mut self, idx: usize) -> Result<()> {
        if self.bricks[idx].is_running() {
            return Ok(());
        }
        self.check_preconditions(idx)?;
        self.start_process(idx).await
    }

    async fn start_process(&mut self, idx: usize) -> Result<()> {
        let settings = self.settings.clone();
        let (name, launch, prepare, post_start, has_console) = {
            let brick = &self.bricks[idx];
            let driver = brick.driver();
            let ctx = self.build_context(idx, &settings);
            (
                brick.name().to_string(),
                self.launch_for(idx, &ctx),
                driver.prepare(brick, &ctx)?,
                driver.post_start(brick),
                driver.has_console(),
            )
        };

        self.bricks[idx].state = ProcessState::Starting;
        for cmd in prepare {
            if let Err(e) = cmd.run(&settings).await {
                error!(brick = %name, error = %e, "Preparation failed");
                self.bricks[idx].state = ProcessState::Stopped;
                return Err(e);
            }
        }

        let process = match BrickProcess::spawn(&name, &launch, &settings).await {
            Ok(process) => process,
            Err(e) => {
                error!(brick = %name, error = %e, "Failed to spawn brick process");
                self.bricks[idx].state = ProcessState::Stopped;
                return Err(e);
            }
        };
        let pid = process.pid();

        let console = if has_console {
            match ManagementChannel::open(
                &settings.mgmt_path(&name),
                settings.console_attempts,
                settings.console_interval(),
                settings.recv_window(),
            )
            .await
            {
                Ok(console) => Some(console),
                Err(e) => {
                    error!(brick = %name, error = %e, "Management console unavailable");
                    None
                }
            }
        } else {
            None
        };

        for cmd in post_start {
            if let Err(e) = cmd.run(&settings).await {
                warn!(brick = %name, error = %e, "Post-start command failed");
            }
        }

        let brick = &mut self.bricks[idx];
        brick.process = Some(process);
        brick.console = console;
        brick.state = ProcessState::Running;
        brick.dirty = false;
        brick.needs_restart = false;
        info!(brick = %name, pid = ?pid, "Brick started");
        self.emit(Notification::BrickStarted { name, pid });
        Ok(())
    }

    /// Stop a running brick. Termination and console shutdown both happen
    /// even if one of them fails; stopping a stopped brick is a no-op.
    pub async fn power_off(&mut self, name: &str) -> Result<()> {
        let idx = self.brick_index(name)?;
        let brick = &mut self.bricks[idx];
        let Some(process) = brick.process.take() else {
            return Ok(());
        };
        brick.state = ProcessState::Stopping;
        let console = brick.console.take();
        let post_stop = brick.driver().post_stop(brick);

        let settings = self.settings.clone();
        let terminated = process.terminate(&settings).await;
        if let Some(console) = console {
            console.close().await;
        }
        self.finish_stop(idx, post_stop).await;
        terminated
    }

    async fn finish_stop(&mut self, idx: usize, post_stop: Vec<HostCommand>) {
        let name = self.bricks[idx].name().to_string();
        for cmd in post_stop {
            if let Err(e) = cmd.run(&self.settings).await {
                warn!(brick = %name, error = %e, "Post-stop command failed");
            }
        }
        self.bricks[idx].state = ProcessState::Stopped;
        info!(brick = %name, "Brick stopped");
        self.emit(Notification::BrickStopped { name });
    }

    /// Poll every running process; exited ones are moved to Stopped.
    pub async fn reap_exited(&mut self) {
        let mut exited = Vec::new();
        for (idx, brick) in self.bricks.iter_mut().enumerate() {
            let Some(process) = brick.process.as_mut() else {
                continue;
            };
            match process.try_exited() {
                Ok(Some(status)) => {
                    info!(brick = %brick.name(), status = ?status, "Brick process exited");
                    exited.push(idx);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(brick = %brick.name(), error = %e, "Failed to check process status");
                }
            }
        }

        for idx in exited {
            let brick = &mut self.bricks[idx];
            brick.process = None;
            let console = brick.console.take();
            let post_stop = brick.driver().post_stop(brick);
            if let Some(console) = console {
                console.close().await;
            }
            self.finish_stop(idx, post_stop).await;
        }
    }

    /// Write to a running brick's console. Silently ignored otherwise.
    pub async fn send(&mut self, brick: &str, text: &str) -> Result<()> {
        let idx = self.brick_index(brick)?;
        let brick = &mut self.bricks[idx];
        match (brick.process.is_some(), brick.console.as_mut()) {
            (true, Some(console)) => console.send(text).await,
            _ => Ok(()),
        }
    }

    pub async fn recv(&mut self, brick: &str) -> Result<String> {
        let idx = self.brick_index(brick)?;
        match self.bricks[idx].console.as_mut() {
            Some(console) => console.recv().await,
            None => Ok(String::new()),
        }
    }

    /// Send one console command and return the reply.
    pub async fn request(&mut self, brick: &str, command: &str) -> Result<String> {
        let idx = self.brick_index(brick)?;
        let brick = &mut self.bricks[idx];
        match (brick.process.is_some(), brick.console.as_mut()) {
            (true, Some(console)) => console.request(command).await,
            _ => Ok(String::new()),
        }
    }

    // Events

    /// Arm the event timer. An active event is cancelled and re-armed.
    pub fn event_on(&mut self, name: &str) -> Result<()> {
        let idx = self.event_index(name)?;
        let event = &mut self.events[idx];
        if !event.is_configured() {
            return Err(EngineError::BadConfig(name.to_string()));
        }
        event.arm(&self.fired_tx);
        info!(event = %name, delay = ?event.delay(), "Event armed");
        self.emit(Notification::EventStarted {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn event_off(&mut self, name: &str) -> Result<()> {
        let idx = self.event_index(name)?;
        let event = &mut self.events[idx];
        if event.is_active() {
            event.cancel();
            info!(event = %name, "Event stopped");
        }
        self.emit(Notification::EventStopped {
            name: name.to_string(),
        });
        Ok(())
    }

    /// `k=v ... [add <cmd> | addsh <cmd>]`
    pub fn configure_event(&mut self, name: &str, args: &[&str]) -> Result<()> {
        let idx = self.event_index(name)?;
        let parsed = parse_event_config(args)?;

        let mut config = self.events[idx].config.clone();
        for assignment in &parsed.assignments {
            config.set(assignment)?;
        }
        let event = &mut self.events[idx];
        event.config = config;
        if let Some(action) = parsed.action {
            debug!(event = %name, action = ?action, "Action added");
            event.actions.push(action);
        }
        self.emit(Notification::EventChanged {
            name: name.to_string(),
        });
        Ok(())
    }

    pub(crate) fn add_event_action(&mut self, name: &str, action: Action) -> Result<()> {
        let idx = self.event_index(name)?;
        self.events[idx].actions.push(action);
        self.emit(Notification::EventChanged {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Store one persisted `key=value` verbatim, bypassing live updates.
    pub(crate) fn load_value(&mut self, name: &str, key: &str, value: &str) -> Result<()> {
        if let Ok(idx) = self.event_index(name) {
            self.events[idx].config.set_value(key, value)?;
            return Ok(());
        }
        let idx = self.brick_index(name)?;
        let brick = &mut self.bricks[idx];
        brick.config.set_value(key, value)?;
        brick.driver().on_config_changed(&mut brick.config);
        Ok(())
    }

    pub fn clear_event(&mut self, name: &str) -> Result<()> {
        let idx = self.event_index(name)?;
        self.events[idx].actions.clear();
        self.emit(Notification::EventChanged {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Run the actions of a fired timer. Stale reports are dropped. Failing
    /// actions are logged and the rest still run.
    pub async fn fire_event(&mut self, fired: TimerFired) {
        let Some(event) = self.events.iter_mut().find(|e| e.name() == fired.event) else {
            debug!(event = %fired.event, "Timer fired for a deleted event");
            return;
        };
        if !event.accept_fire(fired.generation) {
            debug!(event = %fired.event, generation = fired.generation, "Ignoring stale timer");
            return;
        }
        let actions = event.actions.clone();

        info!(event = %fired.event, actions = actions.len(), "Event fired");
        for action in actions {
            match action.kind {
                ActionKind::Shell => {
                    if let Err(e) = spawn_shell(&fired.event, &action.command) {
                        warn!(event = %fired.event, command = %action.command, error = %e, "Shell action failed");
                    }
                }
                ActionKind::Topology => {
                    if let Err(e) = self.exec(&action.command).await {
                        warn!(event = %fired.event, command = %action.command, error = %e, "Topology action failed");
                    }
                }
            }
        }

        let finished = self
            .events
            .iter_mut()
            .find(|e| e.name() == fired.event)
            .is_some_and(|event| event.finish(fired.generation));
        if finished {
            info!(event = %fired.event, "Event accomplished");
            self.emit(Notification::EventAccomplished { name: fired.event });
        }
    }

    /// Cancel every timer and stop every running brick, dependents first.
    pub async fn shutdown(&mut self) {
        for event in &mut self.events {
            if event.is_active() {
                event.cancel();
            }
        }

        let running: Vec<String> = self
            .bricks
            .iter()
            .rev()
            .filter(|b| b.is_running())
            .map(|b| b.name().to_string())
            .collect();
        for name in running {
            if let Err(e) = self.power_off(&name).await {
                warn!(brick = %name, error = %e, "Failed to stop brick during shutdown");
            }
        }
        info!("Registry shut down");
    }
}
