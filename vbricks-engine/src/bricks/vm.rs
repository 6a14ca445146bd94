use std::path::{Path, PathBuf};

use super::{Brick, Configurable, Connectable, ProcessOwning};
use crate::command::{ArgSpec, BuildContext, build_args};
use crate::config::{ConfigStore, Field, Schema, unquote};
use crate::error::Result;
use crate::graph::Plug;
use crate::process::HostCommand;
use crate::settings::Settings;

/// A QEMU/KVM virtual machine. Its plugs are network interfaces added on
/// demand; each carries model, MAC and VLAN.
pub struct Vm;

pub const DISK_SLOTS: [&str; 4] = ["hda", "hdb", "hdc", "hdd"];

static SCHEMA: Schema = Schema {
    fields: &[
        Field::text("argv0", "qemu-system-x86_64"),
        Field::text("machine", ""),
        Field::text("cpu", ""),
        Field::number("ram", "64"),
        Field::number("smp", "1"),
        Field::flag("kvm"),
        Field::disk("hda"),
        Field::disk("hdb"),
        Field::disk("hdc"),
        Field::disk("hdd"),
        Field::flag("privatehda"),
        Field::flag("privatehdb"),
        Field::flag("privatehdc"),
        Field::flag("privatehdd"),
        Field::text("cdrom", ""),
        Field::text("boot", ""),
        Field::text("kernel", ""),
        Field::text("initrd", ""),
        Field::text("kopt", ""),
        Field::flag("snapshot"),
        Field::flag("noacpi"),
        Field::flag("nographic"),
        Field::flag("vnc"),
        Field::number("vncN", "1"),
        Field::flag("usbmode"),
        Field::text("soundhw", ""),
        Field::text("loadvm", ""),
    ],
    aliases: &[],
};

fn name(brick: &Brick, _ctx: &BuildContext<'_>) -> String {
    brick.name().to_string()
}

fn disk(brick: &Brick, ctx: &BuildContext<'_>, slot: &str) -> String {
    brick
        .config()
        .disk(slot)
        .and_then(|d| d.effective_path(brick.name(), &ctx.settings.base_dir))
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

fn hda(brick: &Brick, ctx: &BuildContext<'_>) -> String {
    disk(brick, ctx, "hda")
}

fn hdb(brick: &Brick, ctx: &BuildContext<'_>) -> String {
    disk(brick, ctx, "hdb")
}

fn hdc(brick: &Brick, ctx: &BuildContext<'_>) -> String {
    disk(brick, ctx, "hdc")
}

fn hdd(brick: &Brick, ctx: &BuildContext<'_>) -> String {
    disk(brick, ctx, "hdd")
}

fn vnc_display(brick: &Brick, _ctx: &BuildContext<'_>) -> String {
    let config = brick.config();
    if config.flag("vnc") {
        format!(":{}", config.number("vncN"))
    } else {
        String::new()
    }
}

static ARGS: &[ArgSpec] = &[
    ArgSpec::key("#argv0", "argv0"),
    ArgSpec::key("#kvm", "kvm"),
    ArgSpec::computed("-name", name),
    ArgSpec::key("-M", "machine"),
    ArgSpec::key("-cpu", "cpu"),
    ArgSpec::key("-m", "ram"),
    ArgSpec::key("-smp", "smp"),
    ArgSpec::computed("-hda", hda),
    ArgSpec::computed("-hdb", hdb),
    ArgSpec::computed("-hdc", hdc),
    ArgSpec::computed("-hdd", hdd),
    ArgSpec::key("#privatehda", "privatehda"),
    ArgSpec::key("-cdrom", "cdrom"),
    ArgSpec::key("-boot", "boot"),
    ArgSpec::key("-kernel", "kernel"),
    ArgSpec::key("-initrd", "initrd"),
    ArgSpec::key("-append", "kopt"),
    ArgSpec::key("-snapshot", "snapshot"),
    ArgSpec::key("-no-acpi", "noacpi"),
    ArgSpec::key("-nographic", "nographic"),
    ArgSpec::computed("-vnc", vnc_display),
    ArgSpec::key("-usb", "usbmode"),
    ArgSpec::key("-soundhw", "soundhw"),
    ArgSpec::key("-loadvm", "loadvm"),
];

/// `-net nic` plus backend stanzas, one pair per plug.
fn nic_args(brick: &Brick, ctx: &BuildContext<'_>) -> Vec<String> {
    let mut args = Vec::new();

    for (index, plug) in brick.plugs().iter().enumerate() {
        let Some(nic) = plug.nic() else { continue };
        args.push("-net".to_string());
        args.push(format!(
            "nic,model={},vlan={},macaddr={}",
            nic.model, nic.vlan, nic.mac
        ));
        args.push("-net".to_string());
        match ctx.plug_sock(index) {
            Some(sock) => args.push(format!("vde,vlan={},sock={}", nic.vlan, sock.display())),
            None => args.push(format!("user,vlan={}", nic.vlan)),
        }
    }

    if args.is_empty() {
        args.push("-net".to_string());
        args.push("none".to_string());
    }
    args
}

impl Configurable for Vm {
    fn schema(&self) -> &'static Schema {
        &SCHEMA
    }

    /// Mirror `private<slot>` onto the disk objects.
    fn on_config_changed(&self, config: &mut ConfigStore) {
        for slot in DISK_SLOTS {
            let private = config.flag(&format!("private{slot}"));
            if let Some(disk) = config.disk_mut(slot) {
                disk.set_cow(private);
            }
        }
    }

    fn configured(&self, brick: &Brick, _ctx: &BuildContext<'_>) -> bool {
        let config = brick.config();
        config.number("ram") > 0 && config.number("smp") > 0
    }
}

impl Connectable for Vm {
    fn initial_plugs(&self) -> Vec<Plug> {
        Vec::new()
    }

    fn grows_plugs(&self) -> bool {
        true
    }
}

impl ProcessOwning for Vm {
    fn binary(&self, brick: &Brick, settings: &Settings) -> PathBuf {
        let config = brick.config();
        if config.flag("kvm") {
            return settings.qemu_bin("kvm");
        }
        let argv0 = unquote(config.text("argv0"));
        if Path::new(argv0).is_absolute() {
            PathBuf::from(argv0)
        } else {
            settings.qemu_bin(argv0)
        }
    }

    fn args(&self, brick: &Brick, ctx: &BuildContext<'_>) -> Vec<String> {
        let mut args = build_args(ARGS, brick, ctx);
        args.extend(nic_args(brick, ctx));
        args.push("-chardev".to_string());
        args.push(format!(
            "socket,id=mon,path={},server,nowait",
            ctx.settings.mgmt_path(brick.name()).display()
        ));
        args.push("-mon".to_string());
        args.push("chardev=mon,mode=readline".to_string());
        args
    }

    fn pidfile_flag(&self) -> &'static str {
        "-pidfile"
    }

    fn has_console(&self) -> bool {
        true
    }

    fn prepare(&self, brick: &Brick, ctx: &BuildContext<'_>) -> Result<Vec<HostCommand>> {
        Ok(DISK_SLOTS
            .iter()
            .filter_map(|slot| brick.config().disk(slot))
            .filter_map(|disk| disk.overlay_command(brick.name(), ctx.settings))
            .collect())
    }

    fn live_commands(&self, key: &str, config: &ConfigStore) -> Vec<String> {
        match (key, unquote(config.text("loadvm"))) {
            ("loadvm", "") => Vec::new(),
            ("loadvm", tag) => vec![format!("loadvm {tag}")],
            _ => Vec::new(),
        }
    }
}
