use crate::output::{fmt_time, print_json, print_table};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use outreach_core::budget::warmup::day_index;
use outreach_core::budget::WarmupManager;
use outreach_core::control::{Control, SenderSpec};
use outreach_core::store::CampaignStore;
use std::path::Path;

#[derive(Subcommand)]
pub enum SenderSubcommand {
    /// Register a sending identity
    Add {
        /// Identifier, e.g. the E.164 number of the line
        id: String,
        #[arg(long)]
        label: Option<String>,
        /// Warmup day 1 (RFC 3339; default: now)
        #[arg(long)]
        activated_at: Option<DateTime<Utc>>,
        /// Override limits.hourly_cap for this sender
        #[arg(long)]
        hourly_cap: Option<u32>,
        /// Override limits.daily_cap for this sender
        #[arg(long)]
        daily_cap: Option<u32>,
        /// Override the warmup ramp, e.g. 10,25,50
        #[arg(long, value_delimiter = ',')]
        ramp: Vec<u32>,
    },

    /// List senders with today's budget
    List,

    /// Compute the sender's current risk score
    Risk { id: String },
}

pub fn run(root: &Path, subcmd: SenderSubcommand, json: bool) -> anyhow::Result<()> {
    let (config, store) = super::open(root)?;
    let now = Utc::now();
    match subcmd {
        SenderSubcommand::Add {
            id,
            label,
            activated_at,
            hourly_cap,
            daily_cap,
            ramp,
        } => {
            let control = Control::new(store, &config);
            let sender = control.add_sender(
                SenderSpec {
                    id,
                    label,
                    activated_at,
                    hourly_cap,
                    daily_cap,
                    ramp: (!ramp.is_empty()).then_some(ramp),
                },
                now,
            )?;
            if json {
                print_json(&sender)?;
            } else {
                println!("Added sender '{}' (warmup day 1: {})", sender.id, fmt_time(Some(sender.activated_at)));
            }
        }
        SenderSubcommand::List => {
            let warmup = WarmupManager::new(config.warmup.clone());
            let senders = store.list_senders()?;
            if json {
                return print_json(&senders);
            }
            if senders.is_empty() {
                println!("No senders. Add one with: outreach sender add <id>");
                return Ok(());
            }
            let rows = senders
                .into_iter()
                .map(|mut s| {
                    let hourly = s.hourly_cap(&config.limits);
                    let daily = warmup.effective_daily_cap(&s, &config.limits, now);
                    let (left_h, left_d) = s.window.remaining(now, hourly, daily);
                    vec![
                        s.id.clone(),
                        s.label.clone().unwrap_or_default(),
                        day_index(s.activated_at, now).to_string(),
                        format!("{left_h}/{hourly}"),
                        format!("{left_d}/{daily}"),
                        s.risk
                            .as_ref()
                            .map(|r| format!("{} ({})", r.level, r.score))
                            .unwrap_or_else(|| "-".into()),
                        fmt_time(s.last_ban_at),
                    ]
                })
                .collect();
            print_table(
                &["ID", "LABEL", "DAY", "HOUR LEFT", "DAY LEFT", "RISK", "LAST BAN"],
                rows,
            );
        }
        SenderSubcommand::Risk { id } => {
            let control = Control::new(store, &config);
            let assessment = control.sender_risk(&id, now)?;
            if json {
                return print_json(&assessment);
            }
            println!("Sender:  {}", assessment.sender_id);
            println!("Score:   {} ({})", assessment.score, assessment.level);
            if assessment.banned {
                println!("Banned:  yes (recent ban signal)");
            }
            let rows = assessment
                .factors
                .iter()
                .map(|f| {
                    vec![
                        f.name.clone(),
                        format!("{:.2}", f.value),
                        format!("{:.2}", f.weight),
                    ]
                })
                .collect();
            println!();
            print_table(&["FACTOR", "VALUE", "WEIGHT"], rows);
        }
    }
    Ok(())
}
