//! Inbound signals from the channel: opt-outs and replies.

use crate::output::print_json;
use chrono::Utc;
use outreach_core::drip::DripSequencer;
use std::path::Path;

pub fn optout(root: &Path, address: &str, json: bool) -> anyhow::Result<()> {
    let (_config, store) = super::open(root)?;
    let ended = DripSequencer::new(store).unsubscribe(address, Utc::now())?;
    if json {
        print_json(&serde_json::json!({ "address": address.trim(), "enrollments_ended": ended }))
    } else {
        println!("Opted out {} ({ended} active enrollment(s) ended)", address.trim());
        Ok(())
    }
}

pub fn reply(root: &Path, sender: &str, address: &str, json: bool) -> anyhow::Result<()> {
    let (_config, store) = super::open(root)?;
    let seen = DripSequencer::new(store).record_reply(sender, address.trim(), Utc::now())?;
    if json {
        print_json(&serde_json::json!({
            "sender": sender,
            "address": address.trim(),
            "enrollments": seen
        }))
    } else {
        println!("Recorded reply from {} to {sender} ({seen} enrollment(s))", address.trim());
        Ok(())
    }
}
