//! Text topology format.
//!
//! ```text
//! [Switch:sw1]
//! numports=32
//!
//! [Event:ev1]
//! delay=5
//! action=sw1 on
//! shaction=logger started
//!
//! link|w1|sw1_port
//! link|vm1|sw1_port|rtl8139|02:12:34:56:78:9a|0
//! userlink|vm1||e1000|02:12:34:56:78:9b|1
//! ```
//!
//! Link lines come after every section so both endpoints exist when a link
//! is read back.

use std::fmt::Write;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::bricks::BrickKind;
use crate::error::{EngineError, Result};
use crate::event::{Action, ActionKind};
use crate::registry::Registry;

const EVENT_SECTION: &str = "Event";

pub fn write_topology(registry: &Registry) -> String {
    let mut out = String::new();

    for brick in registry.bricks() {
        let _ = writeln!(out, "[{}:{}]", brick.kind().type_name(), brick.name());
        for (key, value) in brick.config().dump() {
            let _ = writeln!(out, "{key}={value}");
        }
        out.push('\n');
    }

    for event in registry.events() {
        let _ = writeln!(out, "[{EVENT_SECTION}:{}]", event.name());
        for (key, value) in event.config().dump() {
            let _ = writeln!(out, "{key}={value}");
        }
        for action in event.actions() {
            let key = match action.kind {
                ActionKind::Topology => "action",
                ActionKind::Shell => "shaction",
            };
            let _ = writeln!(out, "{key}={}", action.command);
        }
        out.push('\n');
    }

    for brick in registry.bricks() {
        for plug in brick.plugs() {
            let line = match (plug.sock(), plug.nic()) {
                (Some(sock), None) => format!("link|{}|{sock}", brick.name()),
                (Some(sock), Some(nic)) => format!(
                    "link|{}|{sock}|{}|{}|{}",
                    brick.name(),
                    nic.model,
                    nic.mac,
                    nic.vlan
                ),
                (None, Some(nic)) => format!(
                    "userlink|{}||{}|{}|{}",
                    brick.name(),
                    nic.model,
                    nic.mac,
                    nic.vlan
                ),
                (None, None) => continue,
            };
            out.push_str(&line);
            out.push('\n');
        }
    }

    out
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub bricks: usize,
    pub events: usize,
    pub links: usize,
    /// Blocks and lines dropped with a warning
    pub skipped: usize,
}

enum Section {
    None,
    Entity(String),
    Skipping,
}

/// Replay a topology into `registry` in a single forward scan. Malformed
/// blocks and lines are logged and skipped.
pub fn read_topology(registry: &mut Registry, text: &str) -> LoadReport {
    let mut report = LoadReport::default();
    let mut section = Section::None;

    for (n, raw) in text.lines().enumerate() {
        let line_no = n + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = match create_entity(registry, header) {
                Ok((name, is_event)) => {
                    if is_event {
                        report.events += 1;
                    } else {
                        report.bricks += 1;
                    }
                    Section::Entity(name)
                }
                Err(e) => {
                    warn!(line = line_no, header = %header, error = %e, "Skipping section");
                    report.skipped += 1;
                    Section::Skipping
                }
            };
            continue;
        }

        if line.starts_with("link|") || line.starts_with("userlink|") {
            section = Section::None;
            match read_link(registry, line) {
                Ok(()) => report.links += 1,
                Err(e) => {
                    warn!(line = line_no, error = %e, "Skipping link");
                    report.skipped += 1;
                }
            }
            continue;
        }

        match &section {
            Section::Entity(name) => {
                if let Err(e) = read_value(registry, name, line) {
                    warn!(line = line_no, entity = %name, error = %e, "Skipping value");
                    report.skipped += 1;
                }
            }
            Section::Skipping => {
                debug!(line = line_no, "Ignoring line of skipped section");
            }
            Section::None => {
                warn!(line = line_no, content = %line, "Unexpected line outside a section");
                report.skipped += 1;
            }
        }
    }

    report
}

fn create_entity(registry: &mut Registry, header: &str) -> Result<(String, bool)> {
    let (kind, name) = header.split_once(':').ok_or_else(|| EngineError::Persistence {
        line: 0,
        reason: format!("malformed section header '{header}'"),
    })?;

    if kind == EVENT_SECTION {
        return Ok((registry.new_event(name)?, true));
    }
    let kind = BrickKind::from_type_name(kind)?;
    Ok((registry.new_brick(kind, name)?, false))
}

fn read_value(registry: &mut Registry, entity: &str, line: &str) -> Result<()> {
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| EngineError::invalid_value(line, ""))?;

    match key {
        "action" if registry.event(entity).is_some() => {
            registry.add_event_action(entity, Action::topology(value))
        }
        "shaction" if registry.event(entity).is_some() => {
            registry.add_event_action(entity, Action::shell(value))
        }
        _ => registry.load_value(entity, key, value),
    }
}

fn read_link(registry: &mut Registry, line: &str) -> Result<()> {
    let fields: Vec<&str> = line.split('|').collect();
    let bad = || EngineError::Persistence {
        line: 0,
        reason: format!("malformed link '{line}'"),
    };

    match fields.as_slice() {
        ["link", brick, sock] => {
            if registry.connect(brick, sock)? {
                Ok(())
            } else {
                Err(EngineError::NotConnected(brick.to_string()))
            }
        }
        ["link", brick, sock, model, mac, vlan] => registry.connect_nic(
            brick,
            Some(*sock),
            Some(*model),
            Some(*mac),
            Some(vlan.parse().map_err(|_| bad())?),
        ),
        ["userlink", brick, "", model, mac, vlan] => registry.connect_nic(
            brick,
            None,
            Some(*model),
            Some(*mac),
            Some(vlan.parse().map_err(|_| bad())?),
        ),
        _ => Err(bad()),
    }
}

pub async fn save_file(registry: &Registry, path: &Path) -> Result<()> {
    tokio::fs::write(path, write_topology(registry)).await?;
    info!(path = %path.display(), bricks = registry.bricks().len(), "Topology saved");
    Ok(())
}

pub async fn load_file(registry: &mut Registry, path: &Path) -> Result<LoadReport> {
    let text = tokio::fs::read_to_string(path).await?;
    let report = read_topology(registry, &text);
    info!(
        path = %path.display(),
        bricks = report.bricks,
        events = report.events,
        links = report.links,
        skipped = report.skipped,
        "Topology loaded"
    );
    Ok(report)
}
