//! Typed, ordered configuration attached to every brick and event.
//!
//! Each brick kind declares a [`Schema`]: the fields it understands, their
//! types and defaults. Values are validated on `set`. Keys outside the schema
//! are kept verbatim in an ordered extension list so that files written by
//! newer versions survive a load/save cycle.

use std::time::Duration;

use tracing::debug;

use crate::disk::VmDisk;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    /// Boolean rendered as `*` (set) or empty (unset)
    Flag,
    Number,
    /// Non-negative duration in seconds
    Seconds,
    Disk,
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub key: &'static str,
    pub kind: FieldKind,
    pub default: &'static str,
}

impl Field {
    pub const fn text(key: &'static str, default: &'static str) -> Self {
        Self {
            key,
            kind: FieldKind::Text,
            default,
        }
    }

    pub const fn flag(key: &'static str) -> Self {
        Self {
            key,
            kind: FieldKind::Flag,
            default: "",
        }
    }

    pub const fn number(key: &'static str, default: &'static str) -> Self {
        Self {
            key,
            kind: FieldKind::Number,
            default,
        }
    }

    pub const fn seconds(key: &'static str, default: &'static str) -> Self {
        Self {
            key,
            kind: FieldKind::Seconds,
            default,
        }
    }

    pub const fn disk(key: &'static str) -> Self {
        Self {
            key,
            kind: FieldKind::Disk,
            default: "",
        }
    }
}

/// Field table of one brick kind, plus accepted alternative spellings.
#[derive(Debug)]
pub struct Schema {
    pub fields: &'static [Field],
    /// `(prefix, canonical prefix)` pairs, e.g. `("capacity", "chanbufsize")`
    pub aliases: &'static [(&'static str, &'static str)],
}

impl Schema {
    fn canonical(&self, key: &str) -> String {
        for (alias, canonical) in self.aliases {
            if let Some(rest) = key.strip_prefix(alias) {
                return format!("{canonical}{rest}");
            }
        }
        key.to_string()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.key == key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Flag(bool),
    Number(u64),
    Seconds(f64),
    Disk(VmDisk),
}

impl Value {
    fn parse(field: &Field, raw: &str) -> Result<Self> {
        let invalid = || EngineError::invalid_value(field.key, raw);
        match field.kind {
            FieldKind::Text => Ok(Value::Text(raw.to_string())),
            FieldKind::Flag => parse_flag(raw).map(Value::Flag).ok_or_else(invalid),
            FieldKind::Number => raw.trim().parse().map(Value::Number).map_err(|_| invalid()),
            // Must fit a Duration: rejects negative, NaN and overflowing values
            FieldKind::Seconds => match raw.trim().parse::<f64>() {
                Ok(secs) if Duration::try_from_secs_f64(secs).is_ok() => Ok(Value::Seconds(secs)),
                _ => Err(invalid()),
            },
            FieldKind::Disk => Ok(Value::Disk(VmDisk::new(field.key, unquote(raw)))),
        }
    }

    fn default_for(field: &Field) -> Self {
        Self::parse(field, field.default).unwrap_or(match field.kind {
            FieldKind::Text => Value::Text(String::new()),
            FieldKind::Flag => Value::Flag(false),
            FieldKind::Number => Value::Number(0),
            FieldKind::Seconds => Value::Seconds(0.0),
            FieldKind::Disk => Value::Disk(VmDisk::new(field.key, "")),
        })
    }

    /// String form used for argv synthesis and persistence.
    pub fn render(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Flag(true) => "*".to_string(),
            Value::Flag(false) => String::new(),
            Value::Number(n) => n.to_string(),
            Value::Seconds(s) => s.to_string(),
            Value::Disk(disk) => disk.base().display().to_string(),
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "*" | "true" | "yes" | "on" | "1" => Some(true),
        "" | "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Split a raw `key=value` assignment.
///
/// Fewer than two parts is not an assignment. With exactly one `=` the value
/// is kept verbatim. With more, the tail is rejoined on `=`, quote characters
/// are stripped from each segment and the result is wrapped in double quotes,
/// so values such as `kopt=console=ttyS0` keep their literal `=`.
pub fn parse_assignment(raw: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = raw.split('=').collect();
    match parts.as_slice() {
        [] | [_] => None,
        [key, value] => Some((key.trim().to_string(), value.to_string())),
        [key, tail @ ..] => {
            let joined = tail
                .iter()
                .map(|segment| segment.replace(['"', '\''], ""))
                .collect::<Vec<_>>()
                .join("=");
            Some((key.trim().to_string(), format!("\"{joined}\"")))
        }
    }
}

/// Strip one pair of surrounding double quotes.
pub fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    schema: &'static Schema,
    values: Vec<Value>,
    extra: Vec<(String, String)>,
}

impl ConfigStore {
    pub fn new(schema: &'static Schema) -> Self {
        Self {
            schema,
            values: schema.fields.iter().map(Value::default_for).collect(),
            extra: Vec::new(),
        }
    }

    /// Apply a raw `key=value` string. Returns the canonical key that changed,
    /// or `None` when `raw` is not an assignment.
    pub fn set(&mut self, raw: &str) -> Result<Option<String>> {
        match parse_assignment(raw) {
            Some((key, value)) => self.set_value(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    /// Set a single key, validating against the schema.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<String> {
        if key.is_empty() {
            return Err(EngineError::invalid_value(key, value));
        }
        let key = self.schema.canonical(key);

        match self.schema.position(&key) {
            Some(idx) => {
                let field = &self.schema.fields[idx];
                let mut parsed = Value::parse(field, value)?;
                // Changing a disk path must not drop its private flag
                if let (Value::Disk(old), Value::Disk(new)) = (&self.values[idx], &mut parsed) {
                    new.set_cow(old.cow());
                }
                self.values[idx] = parsed;
            }
            None => {
                debug!(key = %key, "Storing key outside of schema");
                match self.extra.iter_mut().find(|(k, _)| *k == key) {
                    Some(entry) => entry.1 = value.to_string(),
                    None => self.extra.push((key.clone(), value.to_string())),
                }
            }
        }
        Ok(key)
    }

    /// Store a derived object for a disk field without string parsing.
    pub fn set_object(&mut self, key: &str, disk: VmDisk) -> Result<()> {
        match self.schema.position(key) {
            Some(idx) if self.schema.fields[idx].kind == FieldKind::Disk => {
                self.values[idx] = Value::Disk(disk);
                Ok(())
            }
            _ => Err(EngineError::invalid_value(key, &disk.base().display().to_string())),
        }
    }

    /// Restore a schema field to its default, or drop an extension key.
    pub fn unset(&mut self, key: &str) -> Result<()> {
        let key = self.schema.canonical(key);
        match self.schema.position(&key) {
            Some(idx) => {
                self.values[idx] = Value::default_for(&self.schema.fields[idx]);
                Ok(())
            }
            None => {
                let before = self.extra.len();
                self.extra.retain(|(k, _)| *k != key);
                if self.extra.len() == before {
                    Err(EngineError::NotFound(key))
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.schema.position(key).map(|idx| &self.values[idx])
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.value(key) {
            Some(value) => Some(value.render()),
            None => self
                .extra
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone()),
        }
    }

    pub fn text(&self, key: &str) -> &str {
        match self.value(key) {
            Some(Value::Text(s)) => s,
            Some(_) => "",
            None => self
                .extra
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .unwrap_or(""),
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.value(key), Some(Value::Flag(true)))
    }

    pub fn number(&self, key: &str) -> u64 {
        match self.value(key) {
            Some(Value::Number(n)) => *n,
            _ => 0,
        }
    }

    pub fn seconds(&self, key: &str) -> f64 {
        match self.value(key) {
            Some(Value::Seconds(s)) => *s,
            _ => 0.0,
        }
    }

    pub fn disk(&self, key: &str) -> Option<&VmDisk> {
        match self.value(key) {
            Some(Value::Disk(disk)) => Some(disk),
            _ => None,
        }
    }

    pub fn disk_mut(&mut self, key: &str) -> Option<&mut VmDisk> {
        let idx = self.schema.position(key)?;
        match &mut self.values[idx] {
            Value::Disk(disk) => Some(disk),
            _ => None,
        }
    }

    /// All pairs in declaration order, extension keys last in insertion order.
    pub fn dump(&self) -> Vec<(String, String)> {
        self.schema
            .fields
            .iter()
            .zip(&self.values)
            .map(|(field, value)| (field.key.to_string(), value.render()))
            .chain(self.extra.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_SCHEMA: Schema = Schema {
        fields: &[
            Field::number("numports", "32"),
            Field::flag("hub"),
            Field::text("kopt", ""),
            Field::text("chanbufsizeLR", ""),
            Field::seconds("delay", "0"),
            Field::disk("hda"),
        ],
        aliases: &[("capacity", "chanbufsize")],
    };

    #[test]
    fn test_parse_assignment_rules() {
        assert_eq!(parse_assignment("novalue"), None);
        assert_eq!(
            parse_assignment("numports=8"),
            Some(("numports".to_string(), "8".to_string()))
        );
        assert_eq!(
            parse_assignment("kopt=console=ttyS0"),
            Some(("kopt".to_string(), "\"console=ttyS0\"".to_string()))
        );
        assert_eq!(
            parse_assignment("kopt=\"a=b\""),
            Some(("kopt".to_string(), "\"a=b\"".to_string()))
        );
        assert_eq!(
            parse_assignment("kopt=root=/dev/sda=x"),
            Some(("kopt".to_string(), "\"root=/dev/sda=x\"".to_string()))
        );
    }

    #[test]
    fn test_requoted_value_is_stable() {
        let mut store = ConfigStore::new(&TEST_SCHEMA);
        store.set("kopt=console=ttyS0").unwrap();
        let first = store.text("kopt").to_string();
        store.set(&format!("kopt={first}")).unwrap();
        assert_eq!(store.text("kopt"), first);
        assert_eq!(unquote(&first), "console=ttyS0");
    }

    #[test]
    fn test_defaults_and_typed_access() {
        let store = ConfigStore::new(&TEST_SCHEMA);
        assert_eq!(store.number("numports"), 32);
        assert!(!store.flag("hub"));
        assert_eq!(store.get("hub").as_deref(), Some(""));
        assert!(store.disk("hda").unwrap().is_empty());
    }

    #[test]
    fn test_set_validates() {
        let mut store = ConfigStore::new(&TEST_SCHEMA);
        assert!(matches!(
            store.set("numports=many"),
            Err(EngineError::InvalidValue { .. })
        ));
        assert!(matches!(store.set("hub=maybe"), Err(EngineError::InvalidValue { .. })));
        assert!(matches!(store.set("delay=-1"), Err(EngineError::InvalidValue { .. })));
        assert!(matches!(store.set("delay=1e20"), Err(EngineError::InvalidValue { .. })));
        assert!(matches!(store.set("delay=NaN"), Err(EngineError::InvalidValue { .. })));

        assert_eq!(store.set("hub=*").unwrap().as_deref(), Some("hub"));
        assert!(store.flag("hub"));
        assert_eq!(store.get("hub").as_deref(), Some("*"));
        store.set("delay=0.1").unwrap();
        assert_eq!(store.seconds("delay"), 0.1);
        assert_eq!(store.set("garbage").unwrap(), None);
    }

    #[test]
    fn test_alias_maps_to_canonical_key() {
        let mut store = ConfigStore::new(&TEST_SCHEMA);
        assert_eq!(store.set("capacityLR=100").unwrap().as_deref(), Some("chanbufsizeLR"));
        assert_eq!(store.text("chanbufsizeLR"), "100");
    }

    #[test]
    fn test_extension_keys_keep_insertion_order() {
        let mut store = ConfigStore::new(&TEST_SCHEMA);
        store.set("zeta=1").unwrap();
        store.set("alpha=2").unwrap();
        store.set("zeta=3").unwrap();

        let dump = store.dump();
        let tail: Vec<_> = dump[TEST_SCHEMA.fields.len()..].to_vec();
        assert_eq!(
            tail,
            vec![
                ("zeta".to_string(), "3".to_string()),
                ("alpha".to_string(), "2".to_string())
            ]
        );
        assert_eq!(dump[0], ("numports".to_string(), "32".to_string()));
    }

    #[test]
    fn test_unset() {
        let mut store = ConfigStore::new(&TEST_SCHEMA);
        store.set("numports=4").unwrap();
        store.set("custom=x").unwrap();

        store.unset("numports").unwrap();
        assert_eq!(store.number("numports"), 32);
        store.unset("custom").unwrap();
        assert_eq!(store.get("custom"), None);
        assert!(matches!(store.unset("custom"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_disk_keeps_private_flag_on_path_change() {
        let mut store = ConfigStore::new(&TEST_SCHEMA);
        store.set("hda=/images/a.img").unwrap();
        store.disk_mut("hda").unwrap().set_cow(true);
        store.set("hda=/images/b.img").unwrap();

        let disk = store.disk("hda").unwrap();
        assert!(disk.cow());
        assert_eq!(store.get("hda").as_deref(), Some("/images/b.img"));

        let mut other = VmDisk::new("hda", "/images/c.img");
        other.set_cow(false);
        store.set_object("hda", other).unwrap();
        assert!(!store.disk("hda").unwrap().cow());
        assert!(store.set_object("numports", VmDisk::new("hda", "/x")).is_err());
    }
}
