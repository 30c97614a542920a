use crate::error::{OutreachError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const OUTREACH_DIR: &str = ".outreach";
pub const CONFIG_FILE: &str = ".outreach/config.yaml";
pub const DB_FILE: &str = ".outreach/outreach.db";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn outreach_dir(root: &Path) -> PathBuf {
    root.join(OUTREACH_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE)
}

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

fn sender_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9+_.\-]{1,64}$").expect("valid regex"))
}

/// Sender ids end up inside composite byte keys, so they are restricted to a
/// printable subset without separators.
pub fn validate_sender_id(id: &str) -> Result<()> {
    if sender_id_re().is_match(id) {
        Ok(())
    } else {
        Err(OutreachError::InvalidSenderId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_ids() {
        assert!(validate_sender_id("+15550001111").is_ok());
        assert!(validate_sender_id("sales-line_2.eu").is_ok());
        assert!(validate_sender_id("").is_err());
        assert!(validate_sender_id("has space").is_err());
        assert!(validate_sender_id("nul\0byte").is_err());
    }

    #[test]
    fn paths_are_under_outreach_dir() {
        let root = Path::new("/tmp/project");
        assert_eq!(config_path(root), root.join(".outreach/config.yaml"));
        assert_eq!(db_path(root), root.join(".outreach/outreach.db"));
        assert!(db_path(root).starts_with(outreach_dir(root)));
    }
}
