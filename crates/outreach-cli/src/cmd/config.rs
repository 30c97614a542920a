use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use outreach_core::config::{Config, WarnLevel};
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration
    Show,

    /// Check the config for errors and suspicious values
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    match subcmd {
        ConfigSubcommand::Show => show(&config, json),
        ConfigSubcommand::Validate => validate(&config, json),
    }
}

fn show(config: &Config, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(config)
    } else {
        print!("{}", serde_yaml::to_string(config)?);
        Ok(())
    }
}

fn validate(config: &Config, json: bool) -> anyhow::Result<()> {
    let (errors, warnings): (Vec<_>, Vec<_>) = config
        .validate()
        .into_iter()
        .partition(|w| w.level == WarnLevel::Error);

    if json {
        print_json(&serde_json::json!({
            "valid": errors.is_empty(),
            "errors": errors,
            "warnings": warnings,
        }))?;
    } else if errors.is_empty() && warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for e in &errors {
            println!("[error] {}", e.message);
        }
        for w in &warnings {
            println!("[warning] {}", w.message);
        }
        println!("{} error(s), {} warning(s)", errors.len(), warnings.len());
    }

    if !errors.is_empty() {
        anyhow::bail!("config has {} error(s)", errors.len());
    }
    Ok(())
}
