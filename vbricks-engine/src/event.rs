//! Named, delayed, one-shot action lists.
//!
//! Every `arm` bumps the event's generation and spawns a fresh timer task.
//! A timer reports back with the generation it was armed under; stale
//! reports (after a cancel or re-arm) are ignored, so a cancelled timer can
//! never run its actions.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{ConfigStore, Field, Schema, parse_assignment};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Dispatched back into the registry command parser
    Topology,
    /// Spawned as a detached `sh -c` process
    Shell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub command: String,
}

impl Action {
    pub fn topology(command: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Topology,
            command: command.into(),
        }
    }

    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Shell,
            command: command.into(),
        }
    }
}

static EVENT_SCHEMA: Schema = Schema {
    fields: &[Field::seconds("delay", "0")],
    aliases: &[],
};

const RESERVED_KEYS: &[&str] = &["action", "shaction"];

/// Sent by a timer task when its delay elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub event: String,
    pub generation: u64,
}

#[derive(Debug)]
pub struct Event {
    name: String,
    pub(crate) config: ConfigStore,
    pub(crate) actions: Vec<Action>,
    active: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Event {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: ConfigStore::new(&EVENT_SCHEMA),
            actions: Vec::new(),
            active: false,
            generation: 0,
            timer: None,
        }
    }

    /// Copy under a new name. The copy is never active.
    pub(crate) fn duplicate(&self, name: &str) -> Self {
        let mut copy = Self::new(name);
        copy.config = self.config.clone();
        copy.actions = self.actions.clone();
        copy
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.config.seconds("delay")).unwrap_or_default()
    }

    /// At least one action and a positive delay.
    pub fn is_configured(&self) -> bool {
        !self.actions.is_empty() && self.config.seconds("delay") > 0.0
    }

    /// Start a fresh timer, replacing any pending one.
    pub(crate) fn arm(&mut self, fired: &mpsc::UnboundedSender<TimerFired>) {
        self.cancel();

        let generation = self.generation;
        let delay = self.delay();
        let tx = fired.clone();
        let name = self.name.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(event = %name, generation = generation, "Event timer elapsed");
            let _ = tx.send(TimerFired {
                event: name,
                generation,
            });
        }));
        self.active = true;
    }

    /// Abort the pending timer and invalidate any report already in flight.
    pub(crate) fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
        self.active = false;
    }

    /// Whether a timer report is current. Consumes the timer handle.
    pub(crate) fn accept_fire(&mut self, generation: u64) -> bool {
        if self.active && generation == self.generation {
            self.timer = None;
            true
        } else {
            false
        }
    }

    /// Mark the run complete unless the event was re-armed meanwhile.
    pub(crate) fn finish(&mut self, generation: u64) -> bool {
        if self.active && generation == self.generation {
            self.active = false;
            true
        } else {
            false
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Parsed arguments of `event <name> config ...`.
#[derive(Debug, Default, PartialEq)]
pub struct EventConfig {
    pub assignments: Vec<String>,
    pub action: Option<Action>,
}

/// Split `k=v ... [add <cmd...> | addsh <cmd...>]`.
pub fn parse_event_config(args: &[&str]) -> Result<EventConfig> {
    let mut parsed = EventConfig::default();

    for (idx, token) in args.iter().enumerate() {
        let kind = match *token {
            "add" => ActionKind::Topology,
            "addsh" => ActionKind::Shell,
            _ => {
                match parse_assignment(token) {
                    None => {
                        return Err(EngineError::InvalidAction(format!(
                            "expected key=value, add or addsh, got '{token}'"
                        )));
                    }
                    // Reserved for action lines in topology files
                    Some((key, _)) if RESERVED_KEYS.contains(&key.as_str()) => {
                        return Err(EngineError::InvalidAction(format!(
                            "'{key}' is reserved, use add or addsh"
                        )));
                    }
                    Some(_) => {}
                }
                parsed.assignments.push(token.to_string());
                continue;
            }
        };

        let rest = &args[idx + 1..];
        if rest.iter().any(|t| *t == "add" || *t == "addsh") {
            return Err(EngineError::InvalidAction(
                "add and addsh cannot be combined".to_string(),
            ));
        }
        if rest.is_empty() {
            return Err(EngineError::InvalidAction(format!("{token} without a command")));
        }
        parsed.action = Some(Action {
            kind,
            command: rest.join(" "),
        });
        break;
    }

    Ok(parsed)
}

/// Spawn a shell action without waiting for it. The exit status is logged
/// from a background task.
pub fn spawn_shell(event: &str, command: &str) -> Result<()> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let event = event.to_string();
    let command = command.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => {
                debug!(event = %event, command = %command, "Shell action finished");
            }
            Ok(status) => {
                warn!(event = %event, command = %command, status = ?status, "Shell action failed");
            }
            Err(e) => {
                warn!(event = %event, command = %command, error = %e, "Failed to wait for shell action");
            }
        }
    });
    Ok(())
}
