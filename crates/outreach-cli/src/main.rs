mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    campaign::CampaignSubcommand, config::ConfigSubcommand, sender::SenderSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "outreach",
    about = "Paced outbound messaging: senders, warmup, drip campaigns and the scheduler",
    version,
    propagate_version = true
)]
struct Cli {
    /// Directory containing .outreach/ (default: search upward from cwd)
    #[arg(long, global = true, env = "OUTREACH_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .outreach/ with a default config and an empty database
    Init,

    /// Manage sending identities
    Sender {
        #[command(subcommand)]
        subcommand: SenderSubcommand,
    },

    /// Create, inspect and control campaigns
    Campaign {
        #[command(subcommand)]
        subcommand: CampaignSubcommand,
    },

    /// Enroll recipients into a campaign
    Enroll {
        /// Campaign id
        campaign: String,
        /// YAML or JSON list of recipients ({address, variables})
        #[arg(long, conflicts_with = "to")]
        file: Option<PathBuf>,
        /// Single recipient address
        #[arg(long)]
        to: Option<String>,
        /// Recipient variable as KEY=VALUE (repeatable, with --to)
        #[arg(long = "var", value_name = "KEY=VALUE", requires = "to")]
        vars: Vec<String>,
    },

    /// Record an opt-out; the address is never messaged again
    Optout { address: String },

    /// Record that a recipient replied to a sender
    Reply { sender: String, address: String },

    /// Run the scheduler until interrupted
    Run {
        /// Perform a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Inspect and validate .outreach/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Sender { subcommand } => cmd::sender::run(&root, subcommand, cli.json),
        Commands::Campaign { subcommand } => cmd::campaign::run(&root, subcommand, cli.json),
        Commands::Enroll {
            campaign,
            file,
            to,
            vars,
        } => cmd::enroll::run(&root, &campaign, file.as_deref(), to, &vars, cli.json),
        Commands::Optout { address } => cmd::feedback::optout(&root, &address, cli.json),
        Commands::Reply { sender, address } => {
            cmd::feedback::reply(&root, &sender, &address, cli.json)
        }
        Commands::Run { once } => cmd::run::run(&root, once, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
