//! Change notifications and read-only topology snapshots for observers.

use serde::Serialize;

use crate::bricks::{Brick, BrickKind, ProcessState};
use crate::event::{ActionKind, Event};
use crate::graph::Nic;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    BrickAdded { name: String },
    BrickRemoved { name: String },
    BrickChanged { name: String },
    BrickStarted { name: String, pid: Option<u32> },
    BrickStopped { name: String },
    EventAdded { name: String },
    EventRemoved { name: String },
    EventChanged { name: String },
    EventStarted { name: String },
    EventStopped { name: String },
    EventAccomplished { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlugStatus {
    pub sock: Option<String>,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nic: Option<Nic>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrickStatus {
    pub name: String,
    pub kind: BrickKind,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub dirty: bool,
    pub needs_restart: bool,
    pub plugs: Vec<PlugStatus>,
}

impl From<&Brick> for BrickStatus {
    fn from(brick: &Brick) -> Self {
        Self {
            name: brick.name().to_string(),
            kind: brick.kind(),
            state: brick.state(),
            pid: brick.pid(),
            dirty: brick.dirty(),
            needs_restart: brick.needs_restart(),
            plugs: brick
                .plugs()
                .iter()
                .map(|plug| PlugStatus {
                    sock: plug.sock().map(str::to_string),
                    required: plug.is_required(),
                    nic: plug.nic().cloned(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventStatus {
    pub name: String,
    pub delay: f64,
    pub active: bool,
    pub actions: usize,
    pub shell_actions: usize,
}

impl From<&Event> for EventStatus {
    fn from(event: &Event) -> Self {
        Self {
            name: event.name().to_string(),
            delay: event.delay().as_secs_f64(),
            active: event.is_active(),
            actions: event.actions().len(),
            shell_actions: event
                .actions()
                .iter()
                .filter(|a| a.kind == ActionKind::Shell)
                .count(),
        }
    }
}

/// Everything a display needs, taken under the registry lock and published
/// through a watch channel so readers never wait on a mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopologySnapshot {
    pub bricks: Vec<BrickStatus>,
    pub events: Vec<EventStatus>,
}

impl TopologySnapshot {
    pub fn brick(&self, name: &str) -> Option<&BrickStatus> {
        self.bricks.iter().find(|b| b.name == name)
    }

    pub fn event(&self, name: &str) -> Option<&EventStatus> {
        self.events.iter().find(|e| e.name == name)
    }
}
