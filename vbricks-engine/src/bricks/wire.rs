use std::path::PathBuf;

use super::{Brick, Configurable, Connectable, ProcessOwning};
use crate::command::{ArgSpec, BuildContext, build_args};
use crate::config::{ConfigStore, Field, Schema, unquote};
use crate::graph::Plug;
use crate::settings::Settings;

/// A cable between two sockets: `dpipe vde_plug <a> = vde_plug <b>`.
pub struct Wire;

static WIRE_SCHEMA: Schema = Schema {
    fields: &[],
    aliases: &[],
};

impl Configurable for Wire {
    fn schema(&self) -> &'static Schema {
        &WIRE_SCHEMA
    }

    // Attachment is checked by the connection precondition
    fn configured(&self, _brick: &Brick, _ctx: &BuildContext<'_>) -> bool {
        true
    }
}

impl Connectable for Wire {
    fn initial_plugs(&self) -> Vec<Plug> {
        vec![Plug::required(), Plug::required()]
    }
}

impl ProcessOwning for Wire {
    fn binary(&self, _brick: &Brick, settings: &Settings) -> PathBuf {
        settings.vde_bin("dpipe")
    }

    fn args(&self, _brick: &Brick, ctx: &BuildContext<'_>) -> Vec<String> {
        let vde_plug = ctx.settings.vde_bin("vde_plug").display().to_string();
        vec![
            vde_plug.clone(),
            ctx.plug_sock_string(0),
            "=".to_string(),
            vde_plug,
            ctx.plug_sock_string(1),
        ]
    }
}

/// A wire with per-direction impairments (`wirefilter`).
pub struct Wirefilter;

/// Impairment parameters and their wirefilter switch. Each one has a
/// symmetric key plus `LR` and `RL` variants.
pub const WIREFILTER_PARAMS: &[(&str, &str)] = &[
    ("bandwidth", "-b"),
    ("speed", "-s"),
    ("delay", "-d"),
    ("chanbufsize", "-c"),
    ("loss", "-l"),
    ("dup", "-D"),
    ("noise", "-n"),
    ("mtu", "-m"),
    ("lostburst", "-L"),
];

static WIREFILTER_SCHEMA: Schema = Schema {
    fields: &[
        Field::text("bandwidth", ""),
        Field::text("bandwidthLR", ""),
        Field::text("bandwidthRL", ""),
        Field::text("speed", ""),
        Field::text("speedLR", ""),
        Field::text("speedRL", ""),
        Field::text("delay", ""),
        Field::text("delayLR", ""),
        Field::text("delayRL", ""),
        Field::text("chanbufsize", ""),
        Field::text("chanbufsizeLR", ""),
        Field::text("chanbufsizeRL", ""),
        Field::text("loss", ""),
        Field::text("lossLR", ""),
        Field::text("lossRL", ""),
        Field::text("dup", ""),
        Field::text("dupLR", ""),
        Field::text("dupRL", ""),
        Field::text("noise", ""),
        Field::text("noiseLR", ""),
        Field::text("noiseRL", ""),
        Field::text("mtu", ""),
        Field::text("mtuLR", ""),
        Field::text("mtuRL", ""),
        Field::text("lostburst", ""),
        Field::text("lostburstLR", ""),
        Field::text("lostburstRL", ""),
        Field::flag("nofifo"),
    ],
    aliases: &[("capacity", "chanbufsize")],
};

fn mgmt_path(brick: &Brick, ctx: &BuildContext<'_>) -> String {
    ctx.settings.mgmt_path(brick.name()).display().to_string()
}

static WIREFILTER_ARGS: &[ArgSpec] = &[
    ArgSpec::computed("-M", mgmt_path),
    ArgSpec::key("-N", "nofifo"),
];

impl Configurable for Wirefilter {
    fn schema(&self) -> &'static Schema {
        &WIREFILTER_SCHEMA
    }

    fn configured(&self, _brick: &Brick, _ctx: &BuildContext<'_>) -> bool {
        true
    }
}

impl Connectable for Wirefilter {
    fn initial_plugs(&self) -> Vec<Plug> {
        vec![Plug::required(), Plug::required()]
    }
}

impl ProcessOwning for Wirefilter {
    fn binary(&self, _brick: &Brick, settings: &Settings) -> PathBuf {
        settings.vde_bin("wirefilter")
    }

    fn args(&self, brick: &Brick, ctx: &BuildContext<'_>) -> Vec<String> {
        let config = brick.config();
        let mut args = vec![
            "-v".to_string(),
            format!("{}:{}", ctx.plug_sock_string(0), ctx.plug_sock_string(1)),
        ];

        for (param, switch) in WIREFILTER_PARAMS {
            let both = unquote(config.text(param));
            if !both.is_empty() {
                args.push(switch.to_string());
                args.push(both.to_string());
            }
            for dir in ["LR", "RL"] {
                let value = unquote(config.text(&format!("{param}{dir}")));
                if !value.is_empty() {
                    args.push(switch.to_string());
                    args.push(format!("{dir}{value}"));
                }
            }
        }

        args.extend(build_args(WIREFILTER_ARGS, brick, ctx));
        args
    }

    fn has_console(&self) -> bool {
        true
    }

    fn live_commands(&self, key: &str, config: &ConfigStore) -> Vec<String> {
        let value = |k: &str| match unquote(config.text(k)) {
            "" => "0".to_string(),
            v => v.to_string(),
        };

        for (param, _) in WIREFILTER_PARAMS {
            if key == *param {
                return vec![
                    format!("{param} LR {}", value(key)),
                    format!("{param} RL {}", value(key)),
                ];
            }
            for dir in ["LR", "RL"] {
                if key.strip_prefix(param) == Some(dir) {
                    return vec![format!("{param} {dir} {}", value(key))];
                }
            }
        }
        Vec::new()
    }
}
