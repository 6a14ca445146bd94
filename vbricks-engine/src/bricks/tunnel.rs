use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use tracing::debug;

use super::{Brick, Configurable, Connectable, ProcessOwning};
use crate::command::{ArgSpec, BuildContext, build_args};
use crate::config::{Field, Schema, unquote};
use crate::error::Result;
use crate::graph::Plug;
use crate::process::HostCommand;
use crate::settings::Settings;

/// Listening end of an encrypted `vde_cryptcab` tunnel.
pub struct TunnelListen;

/// Connecting end of an encrypted `vde_cryptcab` tunnel.
pub struct TunnelConnect;

static LISTEN_SCHEMA: Schema = Schema {
    fields: &[Field::number("port", "7667"), Field::text("password", "")],
    aliases: &[],
};

static CONNECT_SCHEMA: Schema = Schema {
    fields: &[
        Field::text("host", ""),
        Field::number("port", "7667"),
        Field::number("localport", "10771"),
        Field::text("password", ""),
    ],
    aliases: &[],
};

fn keyfile(brick: &Brick, ctx: &BuildContext<'_>) -> String {
    if brick.config().text("password").is_empty() {
        String::new()
    } else {
        ctx.settings.keyfile_path(brick.name()).display().to_string()
    }
}

fn plug_sock(_brick: &Brick, ctx: &BuildContext<'_>) -> String {
    ctx.plug_sock_string(0)
}

fn remote(brick: &Brick, _ctx: &BuildContext<'_>) -> String {
    let config = brick.config();
    format!("{}:{}", unquote(config.text("host")), config.number("port"))
}

static LISTEN_ARGS: &[ArgSpec] = &[
    ArgSpec::computed("-P", keyfile),
    ArgSpec::computed("-s", plug_sock),
    ArgSpec::key("-p", "port"),
];

static CONNECT_ARGS: &[ArgSpec] = &[
    ArgSpec::computed("-P", keyfile),
    ArgSpec::computed("-s", plug_sock),
    ArgSpec::key("-p", "localport"),
    ArgSpec::computed("-c", remote),
];

/// Write the pre-shared key read by `vde_cryptcab -P`, owner read/write only.
fn write_keyfile(brick: &Brick, settings: &Settings) -> Result<()> {
    let password = unquote(brick.config().text("password"));
    if password.is_empty() {
        return Ok(());
    }

    let path = settings.keyfile_path(brick.name());
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)?;
    writeln!(file, "{password}")?;
    debug!(brick = %brick.name(), path = %path.display(), "Wrote tunnel key file");
    Ok(())
}

impl Configurable for TunnelListen {
    fn schema(&self) -> &'static Schema {
        &LISTEN_SCHEMA
    }

    fn configured(&self, brick: &Brick, _ctx: &BuildContext<'_>) -> bool {
        brick.config().number("port") > 0
    }
}

impl Connectable for TunnelListen {
    fn initial_plugs(&self) -> Vec<Plug> {
        vec![Plug::required()]
    }
}

impl ProcessOwning for TunnelListen {
    fn binary(&self, _brick: &Brick, settings: &Settings) -> PathBuf {
        settings.vde_bin("vde_cryptcab")
    }

    fn args(&self, brick: &Brick, ctx: &BuildContext<'_>) -> Vec<String> {
        build_args(LISTEN_ARGS, brick, ctx)
    }

    fn prepare(&self, brick: &Brick, ctx: &BuildContext<'_>) -> Result<Vec<HostCommand>> {
        write_keyfile(brick, ctx.settings)?;
        Ok(Vec::new())
    }
}

impl Configurable for TunnelConnect {
    fn schema(&self) -> &'static Schema {
        &CONNECT_SCHEMA
    }

    fn configured(&self, brick: &Brick, _ctx: &BuildContext<'_>) -> bool {
        let config = brick.config();
        !unquote(config.text("host")).is_empty() && config.number("port") > 0
    }
}

impl Connectable for TunnelConnect {
    fn initial_plugs(&self) -> Vec<Plug> {
        vec![Plug::required()]
    }
}

impl ProcessOwning for TunnelConnect {
    fn binary(&self, _brick: &Brick, settings: &Settings) -> PathBuf {
        settings.vde_bin("vde_cryptcab")
    }

    fn args(&self, brick: &Brick, ctx: &BuildContext<'_>) -> Vec<String> {
        build_args(CONNECT_ARGS, brick, ctx)
    }

    fn prepare(&self, brick: &Brick, ctx: &BuildContext<'_>) -> Result<Vec<HostCommand>> {
        write_keyfile(brick, ctx.settings)?;
        Ok(Vec::new())
    }
}
