//! Brick kinds and their capabilities.
//!
//! A [`Brick`] is a kind-tagged struct; everything kind specific lives in a
//! driver implementing [`Configurable`], [`Connectable`] and
//! [`ProcessOwning`], selected by matching on [`BrickKind`].

mod switch;
mod tap;
mod tunnel;
mod vm;
mod wire;

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::command::BuildContext;
use crate::config::{ConfigStore, Schema};
use crate::console::ManagementChannel;
use crate::error::{EngineError, Result};
use crate::graph::Plug;
use crate::process::{BrickProcess, HostCommand};
use crate::settings::Settings;

pub use switch::Switch;
pub use tap::Tap;
pub use tunnel::{TunnelConnect, TunnelListen};
pub use vm::Vm;
pub use wire::{Wire, Wirefilter, WIREFILTER_PARAMS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BrickKind {
    Switch,
    Tap,
    Wire,
    Wirefilter,
    TunnelListen,
    TunnelConnect,
    Vm,
}

impl BrickKind {
    /// Parse a kind as typed on the console (`new <kind> <name>`).
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "switch" => Ok(BrickKind::Switch),
            "tap" => Ok(BrickKind::Tap),
            "wire" => Ok(BrickKind::Wire),
            "wirefilter" => Ok(BrickKind::Wirefilter),
            "tunnell" | "tunnellisten" => Ok(BrickKind::TunnelListen),
            "tunnelc" | "tunnelconnect" => Ok(BrickKind::TunnelConnect),
            "qemu" | "vm" => Ok(BrickKind::Vm),
            _ => Err(EngineError::UnmanagedType(s.to_string())),
        }
    }

    /// Section name used by the topology file.
    pub fn type_name(&self) -> &'static str {
        match self {
            BrickKind::Switch => "Switch",
            BrickKind::Tap => "Tap",
            BrickKind::Wire => "Wire",
            BrickKind::Wirefilter => "Wirefilter",
            BrickKind::TunnelListen => "TunnelListen",
            BrickKind::TunnelConnect => "TunnelConnect",
            BrickKind::Vm => "Qemu",
        }
    }

    pub fn from_type_name(s: &str) -> Result<Self> {
        match s {
            "Switch" => Ok(BrickKind::Switch),
            "Tap" => Ok(BrickKind::Tap),
            "Wire" => Ok(BrickKind::Wire),
            "Wirefilter" => Ok(BrickKind::Wirefilter),
            "TunnelListen" => Ok(BrickKind::TunnelListen),
            "TunnelConnect" => Ok(BrickKind::TunnelConnect),
            "Qemu" | "VM" => Ok(BrickKind::Vm),
            _ => Err(EngineError::UnmanagedType(s.to_string())),
        }
    }

    pub fn driver(&self) -> &'static dyn BrickDriver {
        match self {
            BrickKind::Switch => &Switch,
            BrickKind::Tap => &Tap,
            BrickKind::Wire => &Wire,
            BrickKind::Wirefilter => &Wirefilter,
            BrickKind::TunnelListen => &TunnelListen,
            BrickKind::TunnelConnect => &TunnelConnect,
            BrickKind::Vm => &Vm,
        }
    }
}

impl fmt::Display for BrickKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

pub trait Configurable {
    fn schema(&self) -> &'static Schema;

    /// Recompute derived values after the store changed.
    fn on_config_changed(&self, _config: &mut ConfigStore) {}

    fn configured(&self, brick: &Brick, ctx: &BuildContext<'_>) -> bool;
}

pub trait Connectable {
    fn initial_plugs(&self) -> Vec<Plug>;

    fn owns_sock(&self) -> bool {
        false
    }

    /// Kinds whose plugs are created on demand by `connect`.
    fn grows_plugs(&self) -> bool {
        false
    }
}

pub trait ProcessOwning {
    fn binary(&self, brick: &Brick, settings: &Settings) -> PathBuf;

    fn args(&self, brick: &Brick, ctx: &BuildContext<'_>) -> Vec<String>;

    fn needs_elevation(&self) -> bool {
        false
    }

    fn pidfile_flag(&self) -> &'static str {
        "--pidfile"
    }

    fn has_console(&self) -> bool {
        false
    }

    /// Work that must happen before the process is spawned.
    fn prepare(&self, _brick: &Brick, _ctx: &BuildContext<'_>) -> Result<Vec<HostCommand>> {
        Ok(Vec::new())
    }

    fn post_start(&self, _brick: &Brick) -> Vec<HostCommand> {
        Vec::new()
    }

    fn post_stop(&self, _brick: &Brick) -> Vec<HostCommand> {
        Vec::new()
    }

    /// Console commands applying `key` to a running process. Empty when the
    /// key cannot change live.
    fn live_commands(&self, _key: &str, _config: &ConfigStore) -> Vec<String> {
        Vec::new()
    }
}

pub trait BrickDriver: Configurable + Connectable + ProcessOwning + Send + Sync {}

impl<T: Configurable + Connectable + ProcessOwning + Send + Sync> BrickDriver for T {}

pub struct Brick {
    name: String,
    kind: BrickKind,
    pub(crate) config: ConfigStore,
    pub(crate) plugs: Vec<Plug>,
    pub(crate) socks: Vec<String>,
    pub(crate) process: Option<BrickProcess>,
    pub(crate) console: Option<ManagementChannel>,
    pub(crate) state: ProcessState,
    pub(crate) needs_elevated_start: bool,
    pub(crate) dirty: bool,
    pub(crate) needs_restart: bool,
}

impl Brick {
    pub(crate) fn new(kind: BrickKind, name: &str) -> Self {
        let driver = kind.driver();
        Self {
            name: name.to_string(),
            kind,
            config: ConfigStore::new(driver.schema()),
            plugs: driver.initial_plugs(),
            socks: Vec::new(),
            process: None,
            console: None,
            state: ProcessState::Stopped,
            needs_elevated_start: driver.needs_elevation(),
            dirty: false,
            needs_restart: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BrickKind {
        self.kind
    }

    pub fn driver(&self) -> &'static dyn BrickDriver {
        self.kind.driver()
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn plugs(&self) -> &[Plug] {
        &self.plugs
    }

    /// Nicknames of the sockets this brick owns.
    pub fn socks(&self) -> &[String] {
        &self.socks
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(BrickProcess::pid)
    }

    pub fn has_console(&self) -> bool {
        self.console.is_some()
    }

    pub fn needs_elevated_start(&self) -> bool {
        self.needs_elevated_start
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn needs_restart(&self) -> bool {
        self.needs_restart
    }

    /// Every mandatory plug is attached to a socket.
    pub fn properly_connected(&self) -> bool {
        self.plugs
            .iter()
            .all(|plug| !plug.is_required() || plug.is_attached())
    }

    pub(crate) fn first_free_plug(&self) -> Option<usize> {
        self.plugs.iter().position(|plug| !plug.is_attached())
    }
}

impl fmt::Debug for Brick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Brick")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .field("plugs", &self.plugs)
            .finish()
    }
}
