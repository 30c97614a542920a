pub mod campaign;
pub mod config;
pub mod enroll;
pub mod feedback;
pub mod init;
pub mod run;
pub mod sender;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use outreach_core::config::Config;
use outreach_core::store::CampaignDb;
use uuid::Uuid;

/// Load the config and open the database under `root`.
pub(crate) fn open(root: &Path) -> anyhow::Result<(Config, Arc<CampaignDb>)> {
    let config = Config::load(root).context("failed to load .outreach/config.yaml")?;
    let store = CampaignDb::open_root(root).context("failed to open the campaign database")?;
    Ok((config, Arc::new(store)))
}

pub(crate) fn parse_id(raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("invalid campaign id '{raw}'"))
}
