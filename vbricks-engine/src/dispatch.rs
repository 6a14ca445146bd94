//! Text command parser shared by the console, event actions and any GUI.

use std::fmt::Write;
use std::path::Path;

use tracing::debug;

use crate::bricks::{Brick, BrickKind};
use crate::error::{EngineError, Result};
use crate::event::{ActionKind, Event};
use crate::persistence;
use crate::registry::Registry;

const DEFAULT_SNAPSHOT_TAG: &str = "virtualbricks";

pub const HELP: &str = "\
new <kind> <name>          create a brick (switch, tap, wire, wirefilter,
                           tunnell, tunnelc, qemu)
new event <name>           create an event
del <name>                 delete a brick or event
copy <name>                duplicate a brick or event
list [json]                list bricks and events
socks                      list sockets and attached plugs
save <file> | load <file>  write or read a topology file
<brick> on|off|show|cmdline
<brick> config k=v ...     change configuration
<brick> unset <key>        restore a key to its default
<brick> connect <sock> [model] [mac]
<brick> userlink [model] [mac]
<brick> disconnect
<brick> send <text> | recv
<vm> savevm [tag] | loadvm [tag] | powerdown | reset
event <name> on|off|show|clear
event <name> config [k=v ...] [add <cmd> | addsh <cmd>]";

impl Registry {
    /// Execute one console line and return its textual output.
    pub async fn exec(&mut self, line: &str) -> Result<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        debug!(line = %line, "Dispatching command");

        match tokens.as_slice() {
            [] => Ok(String::new()),
            ["help"] => Ok(HELP.to_string()),
            ["new", "event", name] => self.new_event(name).map(|n| format!("Event {n} created")),
            ["new", kind, name] => {
                let kind = BrickKind::parse(kind)?;
                self.new_brick(kind, name).map(|n| format!("{kind} {n} created"))
            }
            ["del", name] => {
                self.delete(name).await?;
                Ok(format!("{name} deleted"))
            }
            ["copy", name] => self.duplicate(name).map(|n| format!("Created {n}")),
            ["list"] => Ok(self.render_list()),
            ["list", "json"] => serde_json::to_string_pretty(&self.snapshot())
                .map_err(|e| EngineError::Process(e.to_string())),
            ["socks"] => Ok(self.render_socks()),
            ["save", path] => {
                persistence::save_file(self, Path::new(path)).await?;
                Ok(format!("Saved {path}"))
            }
            ["load", path] => {
                let report = persistence::load_file(self, Path::new(path)).await?;
                Ok(format!(
                    "Loaded {} bricks, {} events, {} links ({} skipped)",
                    report.bricks, report.events, report.links, report.skipped
                ))
            }
            ["event", name, rest @ ..] => self.exec_event(name, rest),
            [name, rest @ ..] if self.event(name).is_some() => self.exec_event(name, rest),
            [name, rest @ ..] if self.brick(name).is_some() => self.exec_brick(name, rest).await,
            [first, ..] => Err(EngineError::UnknownCommand(first.to_string())),
        }
    }

    async fn exec_brick(&mut self, name: &str, args: &[&str]) -> Result<String> {
        let is_vm = self.brick(name).is_some_and(|b| b.kind() == BrickKind::Vm);

        match args {
            ["on"] => {
                self.power_on(name).await?;
                Ok(format!("{name} started"))
            }
            ["off"] => {
                self.power_off(name).await?;
                Ok(format!("{name} stopped"))
            }
            ["show"] | [] => Ok(self.brick(name).map(render_brick).unwrap_or_default()),
            ["cmdline"] => Ok(self.command_line(name)?.join(" ")),
            ["config", assignments @ ..] => {
                self.configure(name, assignments).await?;
                Ok(String::new())
            }
            ["unset", key] => {
                self.unset(name, key)?;
                Ok(String::new())
            }
            ["connect", sock] => {
                if self.connect(name, sock)? {
                    Ok(format!("{name} connected to {sock}"))
                } else {
                    Ok(format!("{name} has no free plug"))
                }
            }
            ["connect", sock, model, mac @ ..] => {
                self.connect_nic(name, Some(*sock), Some(*model), mac.first().copied(), None)?;
                Ok(format!("{name} connected to {sock}"))
            }
            ["userlink", nic @ ..] if nic.len() <= 2 => {
                self.connect_nic(name, None, nic.first().copied(), nic.get(1).copied(), None)?;
                Ok(format!("{name} user-mode interface added"))
            }
            ["disconnect"] => {
                self.disconnect(name)?;
                Ok(format!("{name} disconnected"))
            }
            ["send", text @ ..] if !text.is_empty() => {
                self.send(name, &format!("{}\n", text.join(" "))).await?;
                Ok(String::new())
            }
            ["recv"] => self.recv(name).await,
            ["savevm", tag @ ..] if is_vm => {
                let tag = tag.first().copied().unwrap_or(DEFAULT_SNAPSHOT_TAG);
                self.request(name, &format!("savevm {tag}")).await
            }
            ["loadvm", tag @ ..] if is_vm => {
                let tag = tag.first().copied().unwrap_or(DEFAULT_SNAPSHOT_TAG);
                self.request(name, &format!("loadvm {tag}")).await
            }
            ["powerdown"] if is_vm => self.request(name, "system_powerdown").await,
            ["reset"] if is_vm => self.request(name, "system_reset").await,
            [sub, ..] => Err(EngineError::UnknownCommand(format!("{name} {sub}"))),
        }
    }

    fn exec_event(&mut self, name: &str, args: &[&str]) -> Result<String> {
        match args {
            ["on"] => {
                self.event_on(name)?;
                Ok(format!("{name} armed"))
            }
            ["off"] => {
                self.event_off(name)?;
                Ok(format!("{name} stopped"))
            }
            ["show"] | [] => self
                .event(name)
                .map(render_event)
                .ok_or_else(|| EngineError::NotFound(name.to_string())),
            ["clear"] => {
                self.clear_event(name)?;
                Ok(String::new())
            }
            ["config", rest @ ..] => {
                self.configure_event(name, rest)?;
                Ok(String::new())
            }
            [sub, ..] => Err(EngineError::UnknownCommand(format!("event {name} {sub}"))),
        }
    }

    fn render_list(&self) -> String {
        let mut out = String::from("Bricks:\n");
        for brick in self.bricks() {
            let pid = brick.pid().map(|p| format!(" pid {p}")).unwrap_or_default();
            let _ = writeln!(
                out,
                "  {} {} [{:?}{}]{}",
                brick.kind(),
                brick.name(),
                brick.state(),
                pid,
                if brick.needs_restart() { " (restart needed)" } else { "" }
            );
        }
        out.push_str("Events:\n");
        for event in self.events() {
            let _ = writeln!(
                out,
                "  {} delay {}s [{}]",
                event.name(),
                event.delay().as_secs_f64(),
                if event.is_active() { "active" } else { "idle" }
            );
        }
        out
    }

    fn render_socks(&self) -> String {
        let mut out = String::new();
        for sock in self.socks() {
            let plugs: Vec<String> = sock
                .plugs()
                .iter()
                .map(|p| format!("{}:{}", p.brick, p.index))
                .collect();
            let _ = writeln!(
                out,
                "{} ({}) {} [{}]",
                sock.nickname(),
                sock.owner(),
                sock.path().display(),
                plugs.join(", ")
            );
        }
        out
    }
}

fn render_brick(brick: &Brick) -> String {
    let mut out = format!("[{}:{}] {:?}\n", brick.kind(), brick.name(), brick.state());
    for (key, value) in brick.config().dump() {
        let _ = writeln!(out, "  {key}={value}");
    }
    for (index, plug) in brick.plugs().iter().enumerate() {
        let target = plug.sock().unwrap_or("-");
        match plug.nic() {
            Some(nic) => {
                let _ = writeln!(
                    out,
                    "  plug {index} -> {target} ({} {} vlan {})",
                    nic.model, nic.mac, nic.vlan
                );
            }
            None => {
                let _ = writeln!(out, "  plug {index} -> {target}");
            }
        }
    }
    out
}

fn render_event(event: &Event) -> String {
    let mut out = format!(
        "[Event:{}] delay {}s {}\n",
        event.name(),
        event.delay().as_secs_f64(),
        if event.is_active() { "active" } else { "idle" }
    );
    for action in event.actions() {
        let tag = match action.kind {
            ActionKind::Topology => "add",
            ActionKind::Shell => "addsh",
        };
        let _ = writeln!(out, "  {tag} {}", action.command);
    }
    out
}
