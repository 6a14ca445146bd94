use std::path::PathBuf;

use super::{Brick, Configurable, Connectable, ProcessOwning};
use crate::command::{ArgSpec, BuildContext, build_args};
use crate::config::{ConfigStore, Field, Schema};
use crate::graph::{Plug, Sock};
use crate::settings::Settings;

/// `vde_switch`: owns the socket other bricks plug into.
pub struct Switch;

static SCHEMA: Schema = Schema {
    fields: &[
        Field::number("numports", "32"),
        Field::flag("hub"),
        Field::flag("fstp"),
    ],
    aliases: &[],
};

fn sock_path(brick: &Brick, ctx: &BuildContext<'_>) -> String {
    ctx.settings.sock_path(brick.name()).display().to_string()
}

fn mgmt_path(brick: &Brick, ctx: &BuildContext<'_>) -> String {
    ctx.settings.mgmt_path(brick.name()).display().to_string()
}

static ARGS: &[ArgSpec] = &[
    ArgSpec::computed("-s", sock_path),
    ArgSpec::computed("-M", mgmt_path),
    ArgSpec::key("-n", "numports"),
    ArgSpec::key("-F", "fstp"),
    ArgSpec::key("-x", "hub"),
];

impl Configurable for Switch {
    fn schema(&self) -> &'static Schema {
        &SCHEMA
    }

    fn configured(&self, brick: &Brick, ctx: &BuildContext<'_>) -> bool {
        Sock::new(brick.name(), ctx.settings.sock_path(brick.name())).has_valid_path()
    }
}

impl Connectable for Switch {
    fn initial_plugs(&self) -> Vec<Plug> {
        // Uplink towards another switch
        vec![Plug::optional()]
    }

    fn owns_sock(&self) -> bool {
        true
    }
}

impl ProcessOwning for Switch {
    fn binary(&self, _brick: &Brick, settings: &Settings) -> PathBuf {
        settings.vde_bin("vde_switch")
    }

    fn args(&self, brick: &Brick, ctx: &BuildContext<'_>) -> Vec<String> {
        build_args(ARGS, brick, ctx)
    }

    fn has_console(&self) -> bool {
        true
    }

    fn live_commands(&self, key: &str, config: &ConfigStore) -> Vec<String> {
        let on_off = |flag: bool| if flag { 1 } else { 0 };
        match key {
            "fstp" => vec![format!("fstp/setfstp {}", on_off(config.flag("fstp")))],
            "hub" => vec![format!("port/sethub {}", on_off(config.flag("hub")))],
            "numports" => vec![format!("port/setnumports {}", config.number("numports"))],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bricks::BrickKind;

    #[test]
    fn test_switch_argv() {
        let settings = Settings::unprivileged("/run/vb");
        let mut brick = Brick::new(BrickKind::Switch, "sw1");
        brick.config.set("numports=8").unwrap();
        brick.config.set("hub=*").unwrap();
        let ctx = BuildContext {
            settings: &settings,
            plug_socks: vec![None],
        };

        assert_eq!(
            Switch.args(&brick, &ctx),
            vec!["-s", "/run/vb/sw1.ctl", "-M", "/run/vb/sw1.mgmt", "-n", "8", "-x"]
        );
        assert_eq!(
            Switch.binary(&brick, &settings),
            PathBuf::from("/usr/bin/vde_switch")
        );
    }

    #[test]
    fn test_switch_live_commands() {
        let mut brick = Brick::new(BrickKind::Switch, "sw1");
        brick.config.set("fstp=true").unwrap();
        brick.config.set("numports=16").unwrap();

        assert_eq!(Switch.live_commands("fstp", &brick.config), vec!["fstp/setfstp 1"]);
        assert_eq!(Switch.live_commands("hub", &brick.config), vec!["port/sethub 0"]);
        assert_eq!(
            Switch.live_commands("numports", &brick.config),
            vec!["port/setnumports 16"]
        );
        assert!(Switch.live_commands("other", &brick.config).is_empty());
    }

    #[test]
    fn test_switch_configured_needs_writable_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let brick = Brick::new(BrickKind::Switch, "sw1");

        let ok = Settings::unprivileged(dir.path());
        let ctx = BuildContext {
            settings: &ok,
            plug_socks: vec![None],
        };
        assert!(Switch.configured(&brick, &ctx));

        let missing = Settings::unprivileged(dir.path().join("nope"));
        let ctx = BuildContext {
            settings: &missing,
            plug_socks: vec![None],
        };
        assert!(!Switch.configured(&brick, &ctx));
    }
}
