//! Declarative argv synthesis.
//!
//! Each brick kind lists `(token, source)` pairs. Token conventions:
//! - a token starting with `#` is internal and never emitted,
//! - a token starting with `*` emits only the value,
//! - a value of exactly `*` emits only the token (boolean switch),
//! - an empty value emits nothing.

use std::path::{Path, PathBuf};

use crate::bricks::Brick;
use crate::config::unquote;
use crate::settings::Settings;

/// Everything argv synthesis may read besides the brick itself.
pub struct BuildContext<'a> {
    pub settings: &'a Settings,
    /// Socket path behind each plug, in plug order
    pub plug_socks: Vec<Option<PathBuf>>,
}

impl BuildContext<'_> {
    pub fn plug_sock(&self, index: usize) -> Option<&Path> {
        self.plug_socks.get(index).and_then(|p| p.as_deref())
    }

    pub fn plug_sock_string(&self, index: usize) -> String {
        self.plug_sock(index)
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }
}

pub type ArgFn = fn(&Brick, &BuildContext<'_>) -> String;

pub enum ArgSource {
    Key(&'static str),
    Computed(ArgFn),
}

pub struct ArgSpec {
    pub token: &'static str,
    pub source: ArgSource,
}

impl ArgSpec {
    pub const fn key(token: &'static str, key: &'static str) -> Self {
        Self {
            token,
            source: ArgSource::Key(key),
        }
    }

    pub const fn computed(token: &'static str, f: ArgFn) -> Self {
        Self {
            token,
            source: ArgSource::Computed(f),
        }
    }
}

pub fn build_args(specs: &[ArgSpec], brick: &Brick, ctx: &BuildContext<'_>) -> Vec<String> {
    let mut args = Vec::new();

    for spec in specs {
        if spec.token.starts_with('#') {
            continue;
        }

        let value = match &spec.source {
            ArgSource::Key(key) => brick.config().get(key).unwrap_or_default(),
            ArgSource::Computed(f) => f(brick, ctx),
        };

        if value == "*" {
            args.push(spec.token.to_string());
        } else if !value.is_empty() {
            if !spec.token.starts_with('*') {
                args.push(spec.token.to_string());
            }
            args.push(unquote(&value).to_string());
        }
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bricks::{Brick, BrickKind};

    fn sock_of(brick: &Brick, ctx: &BuildContext<'_>) -> String {
        ctx.settings.sock_path(brick.name()).display().to_string()
    }

    fn empty(_: &Brick, _: &BuildContext<'_>) -> String {
        String::new()
    }

    static SPECS: &[ArgSpec] = &[
        ArgSpec::computed("-s", sock_of),
        ArgSpec::key("-n", "numports"),
        ArgSpec::key("-F", "fstp"),
        ArgSpec::key("-x", "hub"),
        ArgSpec::key("#numports", "numports"),
        ArgSpec::computed("-g", empty),
        ArgSpec::key("*tail", "numports"),
    ];

    #[test]
    fn test_token_conventions() {
        let settings = Settings::unprivileged("/run/vb");
        let mut brick = Brick::new(BrickKind::Switch, "sw1");
        brick.config.set("fstp=*").unwrap();
        brick.config.set("numports=8").unwrap();
        let ctx = BuildContext {
            settings: &settings,
            plug_socks: vec![None],
        };

        let args = build_args(SPECS, &brick, &ctx);
        assert_eq!(args, vec!["-s", "/run/vb/sw1.ctl", "-n", "8", "-F", "8"]);
    }
}
