use std::path::PathBuf;

use super::{Brick, Configurable, Connectable, ProcessOwning};
use crate::command::{ArgSpec, BuildContext, build_args};
use crate::config::{Field, Schema};
use crate::graph::Plug;
use crate::process::HostCommand;
use crate::settings::Settings;

/// `vde_plug2tap`: bridges a switch port to a host TAP interface.
pub struct Tap;

static SCHEMA: Schema = Schema {
    fields: &[
        Field::text("ifname", ""),
        // off | dhcp | manual
        Field::text("ip_mode", "off"),
        Field::text("ip", ""),
        Field::text("nm", "255.255.255.0"),
        Field::text("gw", ""),
    ],
    aliases: &[],
};

fn plug_sock(_brick: &Brick, ctx: &BuildContext<'_>) -> String {
    ctx.plug_sock_string(0)
}

fn interface(brick: &Brick, _ctx: &BuildContext<'_>) -> String {
    ifname(brick).to_string()
}

static ARGS: &[ArgSpec] = &[
    ArgSpec::computed("-s", plug_sock),
    ArgSpec::computed("*ifname", interface),
];

fn ifname(brick: &Brick) -> &str {
    match brick.config().text("ifname") {
        "" => brick.name(),
        name => name,
    }
}

impl Configurable for Tap {
    fn schema(&self) -> &'static Schema {
        &SCHEMA
    }

    fn configured(&self, brick: &Brick, _ctx: &BuildContext<'_>) -> bool {
        let config = brick.config();
        match config.text("ip_mode") {
            "off" | "dhcp" => true,
            "manual" => !config.text("ip").is_empty(),
            _ => false,
        }
    }
}

impl Connectable for Tap {
    fn initial_plugs(&self) -> Vec<Plug> {
        vec![Plug::required()]
    }
}

impl ProcessOwning for Tap {
    fn binary(&self, _brick: &Brick, settings: &Settings) -> PathBuf {
        settings.vde_bin("vde_plug2tap")
    }

    fn args(&self, brick: &Brick, ctx: &BuildContext<'_>) -> Vec<String> {
        build_args(ARGS, brick, ctx)
    }

    fn needs_elevation(&self) -> bool {
        true
    }

    fn post_start(&self, brick: &Brick) -> Vec<HostCommand> {
        let config = brick.config();
        let ifname = ifname(brick).to_string();

        match config.text("ip_mode") {
            "dhcp" => vec![HostCommand::new("dhclient").args([ifname]).elevated()],
            "manual" => {
                let mut cmds = vec![
                    HostCommand::new("ip")
                        .args([
                            "addr".to_string(),
                            "add".to_string(),
                            format!("{}/{}", config.text("ip"), config.text("nm")),
                            "dev".to_string(),
                            ifname.clone(),
                        ])
                        .elevated(),
                    HostCommand::new("ip")
                        .args(["link", "set", ifname.as_str(), "up"])
                        .elevated(),
                ];
                let gw = config.text("gw");
                if !gw.is_empty() {
                    cmds.push(
                        HostCommand::new("ip")
                            .args(["route", "add", "default", "via", gw, "dev", ifname.as_str()])
                            .elevated(),
                    );
                }
                cmds
            }
            _ => Vec::new(),
        }
    }

    fn post_stop(&self, brick: &Brick) -> Vec<HostCommand> {
        match brick.config().text("ip_mode") {
            "dhcp" => vec![
                HostCommand::new("dhclient")
                    .args(["-r", ifname(brick)])
                    .elevated(),
            ],
            _ => Vec::new(),
        }
    }
}
