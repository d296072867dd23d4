//! Reloadable admin capability set. Replaces a compiled-in allowlist:
//! identities come from ADMIN_CAPABILITIES (comma-separated) or a file named
//! by ADMIN_CAPABILITY_FILE, and can be re-read at runtime without restart.

use std::collections::HashSet;
use std::sync::RwLock;

use crate::error::{SimError, SimResult};
use crate::logging::{json_log, obj, v_int, v_str};
use crate::state::Config;

#[derive(Debug)]
pub struct CapabilitySet {
    inline: Option<String>,
    file: Option<String>,
    admins: RwLock<HashSet<String>>,
}

impl CapabilitySet {
    pub fn from_config(cfg: &Config) -> SimResult<Self> {
        let set = Self {
            inline: cfg.admin_capabilities.clone(),
            file: cfg.admin_capability_file.clone(),
            admins: RwLock::new(HashSet::new()),
        };
        set.reload()?;
        Ok(set)
    }

    /// Re-read the configured sources. The previous set stays live until the
    /// new one is fully parsed.
    pub fn reload(&self) -> SimResult<()> {
        let mut next = HashSet::new();
        if let Some(raw) = &self.inline {
            for entry in raw.split(',') {
                let entry = entry.trim();
                if !entry.is_empty() {
                    next.insert(entry.to_string());
                }
            }
        }
        if let Some(path) = &self.file {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                SimError::Misconfiguration(format!("capability file {}: {}", path, e))
            })?;
            for line in raw.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    next.insert(line.to_string());
                }
            }
        }
        let count = next.len();
        if let Ok(mut admins) = self.admins.write() {
            *admins = next;
        }
        json_log(
            "capability",
            obj(&[("status", v_str("reloaded")), ("admins", v_int(count as i64))]),
        );
        Ok(())
    }

    pub fn is_admin(&self, identity: &str) -> bool {
        self.admins
            .read()
            .map(|a| a.contains(identity))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cfg_with(inline: Option<&str>, file: Option<&str>) -> Config {
        let mut cfg = Config::from_env();
        cfg.admin_capabilities = inline.map(|s| s.to_string());
        cfg.admin_capability_file = file.map(|s| s.to_string());
        cfg
    }

    #[test]
    fn test_inline_list() {
        let cfg = cfg_with(Some("root@example.org, ops@example.org"), None);
        let caps = CapabilitySet::from_config(&cfg).unwrap();
        assert!(caps.is_admin("root@example.org"));
        assert!(caps.is_admin("ops@example.org"));
        assert!(!caps.is_admin("nobody@example.org"));
    }

    #[test]
    fn test_file_reload_picks_up_changes() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "first@example.org").unwrap();
        f.flush().unwrap();
        let path = f.path().to_string_lossy().to_string();

        let cfg = cfg_with(None, Some(&path));
        let caps = CapabilitySet::from_config(&cfg).unwrap();
        assert!(caps.is_admin("first@example.org"));
        assert!(!caps.is_admin("second@example.org"));

        writeln!(f, "second@example.org").unwrap();
        f.flush().unwrap();
        caps.reload().unwrap();
        assert!(caps.is_admin("second@example.org"));
    }

    #[test]
    fn test_missing_file_is_misconfiguration() {
        let cfg = cfg_with(None, Some("/nonexistent/capabilities.txt"));
        let err = CapabilitySet::from_config(&cfg).unwrap_err();
        assert!(matches!(err, SimError::Misconfiguration(_)));
    }

    #[test]
    fn test_empty_sources_mean_no_admins() {
        let cfg = cfg_with(None, None);
        let caps = CapabilitySet::from_config(&cfg).unwrap();
        assert!(!caps.is_admin("anyone@example.org"));
    }
}
