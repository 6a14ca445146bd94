//! Plugs, sockets and VM network interfaces.
//!
//! Bricks reference each other by name only: a plug records the nickname of
//! the socket it is attached to, a socket records `(brick, plug index)` pairs.
//! The registry owns both sides and keeps them consistent.

use std::path::{Path, PathBuf};

use serde::Serialize;

pub const DEFAULT_NIC_MODEL: &str = "rtl8139";

/// Per-plug settings of a VM network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Nic {
    pub model: String,
    pub mac: String,
    pub vlan: u32,
}

impl Nic {
    pub fn new(vlan: u32) -> Self {
        Self {
            model: DEFAULT_NIC_MODEL.to_string(),
            mac: format_mac(&generate_mac_address()),
            vlan,
        }
    }
}

/// Generate a random MAC address with local admin bit set.
pub fn generate_mac_address() -> [u8; 6] {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut mac = [0u8; 6];
    rng.fill(&mut mac);
    // Set locally administered and unicast bits
    mac[0] = (mac[0] & 0xfe) | 0x02;
    mac
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && u8::from_str_radix(p, 16).is_ok())
}

#[derive(Debug, Clone)]
pub struct Plug {
    sock: Option<String>,
    required: bool,
    nic: Option<Nic>,
}

impl Plug {
    /// A plug that must be attached before its brick may start.
    pub fn required() -> Self {
        Self {
            sock: None,
            required: true,
            nic: None,
        }
    }

    /// A plug whose attachment is a dependency edge only.
    pub fn optional() -> Self {
        Self {
            sock: None,
            required: false,
            nic: None,
        }
    }

    /// A VM interface. Unattached means user-mode networking.
    pub fn with_nic(nic: Nic) -> Self {
        Self {
            sock: None,
            required: false,
            nic: Some(nic),
        }
    }

    pub fn sock(&self) -> Option<&str> {
        self.sock.as_deref()
    }

    pub fn is_attached(&self) -> bool {
        self.sock.is_some()
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn nic(&self) -> Option<&Nic> {
        self.nic.as_ref()
    }

    pub(crate) fn attach(&mut self, sock: &str) {
        self.sock = Some(sock.to_string());
    }

    pub(crate) fn detach(&mut self) -> Option<String> {
        self.sock.take()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PlugRef {
    pub brick: String,
    pub index: usize,
}

/// An attachment point owned by a brick.
#[derive(Debug, Clone)]
pub struct Sock {
    nickname: String,
    owner: String,
    path: PathBuf,
    plugs: Vec<PlugRef>,
}

impl Sock {
    pub fn new(owner: &str, path: PathBuf) -> Self {
        Self {
            nickname: Self::nickname_for(owner),
            owner: owner.to_string(),
            path,
            plugs: Vec::new(),
        }
    }

    pub fn nickname_for(owner: &str) -> String {
        format!("{owner}_port")
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn plugs(&self) -> &[PlugRef] {
        &self.plugs
    }

    /// Whether the owner can create the socket: its directory must be writable.
    pub fn has_valid_path(&self) -> bool {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        nix::unistd::access(dir, nix::unistd::AccessFlags::W_OK).is_ok()
    }

    pub(crate) fn attach(&mut self, plug: PlugRef) {
        if !self.plugs.contains(&plug) {
            self.plugs.push(plug);
        }
    }

    pub(crate) fn detach(&mut self, plug: &PlugRef) {
        self.plugs.retain(|p| p != plug);
    }
}
