//! vbricks-engine - orchestration engine for VDE/QEMU network topologies.
//!
//! Bricks (switches, wires, filters, taps, tunnels, VMs) are wired together
//! through plugs and sockets and brought up as external processes.

pub mod bricks;
pub mod command;
pub mod config;
pub mod console;
pub mod disk;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod notify;
pub mod persistence;
pub mod process;
pub mod registry;
pub mod settings;
pub mod validation;

pub use bricks::{BrickKind, ProcessState};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use notify::{Notification, TopologySnapshot};
pub use registry::Registry;
pub use settings::Settings;
