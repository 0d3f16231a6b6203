//! Proxmox property strings.
//!
//! Device options travel as a single comma separated string such as
//! `local-lvm:vm-100-disk-0,backup=0,size=10G`. The first item may be a bare
//! value without a key; that is the property's default key (`file` for disks).

use std::fmt;

/// A parsed property string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyString {
    default: Option<String>,
    pairs: Vec<(String, String)>,
}

impl PropertyString {
    /// An empty property string.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a property string. `default_key` names the key a bare leading
    /// value belongs to, and is also accepted in `key=value` form.
    pub fn parse(input: &str, default_key: &str) -> Self {
        let mut parsed = Self::new();
        for (i, item) in input.split(',').map(str::trim).enumerate() {
            if item.is_empty() {
                continue;
            }
            match item.split_once('=') {
                Some((key, value)) if key == default_key => {
                    parsed.default = Some(value.to_string());
                },
                Some((key, value)) => parsed.pairs.push((key.to_string(), value.to_string())),
                None if i == 0 => parsed.default = Some(item.to_string()),
                None => parsed.pairs.push((item.to_string(), String::new())),
            }
        }
        parsed
    }

    /// The bare leading value.
    pub fn default_value(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Look up a boolean key (`1`, `0`, `true`, `false`, ...).
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(parse_bool)
    }

    /// All `key=value` pairs in order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Set the bare leading value.
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Append a pair.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    /// Append a pair when `value` is present.
    pub fn with_opt(self, key: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    /// Append a boolean pair as `1`/`0` when present.
    pub fn with_bool(self, key: &str, value: Option<bool>) -> Self {
        self.with_opt(key, value.map(format_bool))
    }
}

impl fmt::Display for PropertyString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        if let Some(default) = &self.default {
            f.write_str(default)?;
            first = false;
        }
        for (k, v) in &self.pairs {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if v.is_empty() {
                f.write_str(k)?;
            } else {
                write!(f, "{}={}", k, v)?;
            }
        }
        Ok(())
    }
}

/// Parse a Proxmox boolean.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Format a boolean the way the API expects it.
pub fn format_bool(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_disk_string() {
        let p = PropertyString::parse("local-lvm:vm-100-disk-0,backup=0,size=10G", "file");
        assert_eq!(p.default_value(), Some("local-lvm:vm-100-disk-0"));
        assert_eq!(p.get("size"), Some("10G"));
        assert_eq!(p.get_bool("backup"), Some(false));
        assert_eq!(p.get("snapshot"), None);
    }

    #[test]
    fn test_parse_explicit_default_key() {
        let p = PropertyString::parse("media=cdrom,file=local:iso/debian.iso", "file");
        assert_eq!(p.default_value(), Some("local:iso/debian.iso"));
        assert_eq!(p.get("media"), Some("cdrom"));
    }

    #[test]
    fn test_parse_net_string() {
        let p = PropertyString::parse("virtio=BC:24:11:2E:90:01,bridge=vmbr0,firewall=1", "model");
        assert_eq!(p.default_value(), None);
        assert_eq!(p.get("virtio"), Some("BC:24:11:2E:90:01"));
        assert_eq!(p.get("bridge"), Some("vmbr0"));
        assert_eq!(p.get_bool("firewall"), Some(true));
    }

    #[test]
    fn test_display() {
        let p = PropertyString::new()
            .with_default("local-lvm:0")
            .with("import-from", "local:100/base.qcow2")
            .with_bool("snapshot", Some(true))
            .with_bool("backup", None);
        assert_eq!(p.to_string(), "local-lvm:0,import-from=local:100/base.qcow2,snapshot=1");

        let p = PropertyString::new().with("virtio", "").with("bridge", "vmbr0");
        assert_eq!(p.to_string(), "virtio,bridge=vmbr0");
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
