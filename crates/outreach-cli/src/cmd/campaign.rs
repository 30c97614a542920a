use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use chrono::Utc;
use clap::Subcommand;
use outreach_core::campaign::CampaignSpec;
use outreach_core::control::Control;
use outreach_core::store::CampaignStore;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum CampaignSubcommand {
    /// Create a draft campaign from a YAML definition
    Create {
        #[arg(long)]
        file: PathBuf,
    },

    /// List campaigns
    List,

    /// Show progress counters and enrollments
    Show { id: String },

    /// Start a draft (or scheduled) campaign
    Start { id: String },

    /// Pause a running campaign
    Pause {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Resume a paused campaign
    Resume { id: String },

    /// Stop a campaign and end all of its enrollments
    Stop { id: String },
}

pub fn run(root: &Path, subcmd: CampaignSubcommand, json: bool) -> anyhow::Result<()> {
    let (config, store) = super::open(root)?;
    let control = Control::new(store.clone(), &config);
    let now = Utc::now();

    let changed = match subcmd {
        CampaignSubcommand::Create { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let spec: CampaignSpec = serde_yaml::from_str(&raw)
                .with_context(|| format!("invalid campaign definition in {}", file.display()))?;
            let campaign = control.create_campaign(spec, now)?;
            if json {
                return print_json(&campaign);
            }
            println!(
                "Created {} campaign '{}' ({} step(s)): {}",
                campaign.kind,
                campaign.name,
                campaign.steps.len(),
                campaign.id
            );
            return Ok(());
        }
        CampaignSubcommand::List => return list(store.as_ref(), json),
        CampaignSubcommand::Show { id } => {
            let id = super::parse_id(&id)?;
            return show(&control, store.as_ref(), id, json);
        }
        CampaignSubcommand::Start { id } => control.start_campaign(super::parse_id(&id)?, now)?,
        CampaignSubcommand::Pause { id, reason } => {
            control.pause_campaign(super::parse_id(&id)?, reason, now)?
        }
        CampaignSubcommand::Resume { id } => control.resume_campaign(super::parse_id(&id)?, now)?,
        CampaignSubcommand::Stop { id } => control.stop_campaign(super::parse_id(&id)?, now)?,
    };

    if json {
        print_json(&changed)
    } else {
        println!("Campaign '{}' is now {}", changed.name, changed.status);
        Ok(())
    }
}

fn list(store: &dyn CampaignStore, json: bool) -> anyhow::Result<()> {
    let mut campaigns = store.list_campaigns()?;
    campaigns.sort_by_key(|c| c.created_at);
    if json {
        return print_json(&campaigns);
    }
    if campaigns.is_empty() {
        println!("No campaigns.");
        return Ok(());
    }
    let rows = campaigns
        .into_iter()
        .map(|c| {
            vec![
                c.id.to_string(),
                c.name,
                c.tenant,
                c.kind.to_string(),
                c.status.to_string(),
                c.sender_id,
                c.steps.len().to_string(),
            ]
        })
        .collect();
    print_table(
        &["ID", "NAME", "TENANT", "KIND", "STATUS", "SENDER", "STEPS"],
        rows,
    );
    Ok(())
}

fn show(
    control: &Control,
    store: &dyn CampaignStore,
    id: uuid::Uuid,
    json: bool,
) -> anyhow::Result<()> {
    let report = control.campaign_status(id)?;
    if json {
        return print_json(&report);
    }

    println!("Campaign:  {} ({})", report.name, report.id);
    println!("Tenant:    {}", report.tenant);
    println!("Kind:      {}", report.kind);
    println!("Sender:    {}", report.sender_id);
    match &report.pause_reason {
        Some(reason) => println!("Status:    {} ({reason})", report.status),
        None => println!("Status:    {}", report.status),
    }
    println!("Steps:     {}", report.steps);
    println!(
        "Progress:  {} sent, {} failed, next fire {}",
        report.sent,
        report.failed,
        fmt_time(report.next_fire_at)
    );
    let e = &report.enrollments;
    println!(
        "Enrolled:  {} ({} active, {} completed, {} unsubscribed, {} stopped)",
        e.total, e.active, e.completed, e.unsubscribed, e.stopped
    );

    let enrollments = store.list_enrollments(id)?;
    if enrollments.is_empty() {
        return Ok(());
    }
    println!();
    let rows = enrollments
        .into_iter()
        .map(|e| {
            vec![
                e.address().to_string(),
                e.state.to_string(),
                e.current_step.to_string(),
                e.sent.to_string(),
                e.failed.to_string(),
                fmt_time(e.next_fire_at),
                e.last_error.unwrap_or_default(),
            ]
        })
        .collect();
    print_table(
        &["RECIPIENT", "STATE", "STEP", "SENT", "FAILED", "NEXT", "LAST ERROR"],
        rows,
    );
    Ok(())
}
