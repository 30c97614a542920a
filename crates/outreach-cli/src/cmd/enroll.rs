use crate::output::print_json;
use anyhow::Context;
use chrono::Utc;
use outreach_core::enrollment::Recipient;
use outreach_core::store::CampaignStore;
use std::path::Path;

pub fn run(
    root: &Path,
    campaign: &str,
    file: Option<&Path>,
    to: Option<String>,
    vars: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let campaign_id = super::parse_id(campaign)?;
    let recipients = match (file, to) {
        (Some(path), _) => read_recipients(path)?,
        (None, Some(address)) => {
            let mut r = Recipient::new(address);
            for kv in vars {
                let (k, v) = parse_var(kv)?;
                r = r.with_var(k, v);
            }
            vec![r]
        }
        (None, None) => anyhow::bail!("pass --file <recipients.yaml> or --to <address>"),
    };

    let (_config, store) = super::open(root)?;
    store.get_campaign(campaign_id)?;
    let drip = outreach_core::drip::DripSequencer::new(store);
    let now = Utc::now();

    let mut enrolled = Vec::new();
    let mut failed = Vec::new();
    for r in recipients {
        let address = r.address.clone();
        match drip.enroll(campaign_id, r, now) {
            Ok(e) => enrolled.push(e),
            Err(err) => failed.push((address, err.to_string())),
        }
    }

    if json {
        print_json(&serde_json::json!({
            "enrolled": enrolled,
            "failed": failed
                .iter()
                .map(|(address, error)| serde_json::json!({ "address": address, "error": error }))
                .collect::<Vec<_>>(),
        }))?;
    } else {
        println!("Enrolled {} recipient(s)", enrolled.len());
        for (address, error) in &failed {
            println!("  skipped {address}: {error}");
        }
    }

    if enrolled.is_empty() && !failed.is_empty() {
        anyhow::bail!("no recipients were enrolled");
    }
    Ok(())
}

fn read_recipients(path: &Path) -> anyhow::Result<Vec<Recipient>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("{} is not a list of recipients", path.display()))
}

fn parse_var(raw: &str) -> anyhow::Result<(&str, &str)> {
    raw.split_once('=')
        .filter(|(k, _)| !k.trim().is_empty())
        .map(|(k, v)| (k.trim(), v))
        .with_context(|| format!("expected KEY=VALUE, got '{raw}'"))
}
