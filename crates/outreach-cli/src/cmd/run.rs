use crate::output::print_json;
use anyhow::Context;
use chrono::Utc;
use outreach_core::orchestrator::Scheduler;
use std::path::Path;

pub fn run(root: &Path, once: bool, json: bool) -> anyhow::Result<()> {
    let (config, store) = super::open(root)?;
    config.ensure_valid()?;
    let transport = outreach_transport::from_config(&config.transport)
        .context("failed to set up the transport")?;
    let scheduler = Scheduler::new(store, transport, &config);

    let rt = tokio::runtime::Runtime::new()?;
    if once {
        rt.block_on(tick_once(&scheduler, json))
    } else {
        rt.block_on(serve(&scheduler))
    }
}

async fn tick_once(scheduler: &Scheduler, json: bool) -> anyhow::Result<()> {
    scheduler.recover()?;
    let report = scheduler.tick(Utc::now()).await?;
    if json {
        return print_json(&report);
    }
    println!(
        "tick: {} campaign(s), {} sent, {} failed, {} skipped, {} paused, {} completed",
        report.campaigns,
        report.sent,
        report.failed,
        report.skipped,
        report.paused,
        report.completed
    );
    Ok(())
}

/// Run until ctrl-c. The database stays locked by this process meanwhile.
async fn serve(scheduler: &Scheduler) -> anyhow::Result<()> {
    scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
