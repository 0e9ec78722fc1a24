//! Orchestrator loop: repeatedly drives scheduler passes.
//!
//! One-shot mode is just the CLI calling [`scheduler::run_once_pass`]
//! directly once and exiting; this module adds the continuous mode on top,
//! sleeping between passes and watching for a shutdown signal between
//! (not during) passes.

use tokio::time::Duration;

use crate::context::AppContext;
use crate::error::Result;
use crate::scheduler::{self, PassOptions};

pub struct RunnerOptions {
    pub once: bool,
    pub interval_seconds: u64,
    pub pass: PassOptions,
}

/// Runs passes until `once` is set (after the first pass) or a Ctrl-C is
/// observed during the inter-pass sleep. A pass already in flight is never
/// interrupted; only the sleep between passes is cancellable.
pub async fn run(ctx: &AppContext, opts: RunnerOptions) -> Result<()> {
    let interval = Duration::from_secs(opts.interval_seconds.max(1));

    loop {
        let pass = scheduler::PassOptions {
            dry_run: opts.pass.dry_run,
            max_jobs: opts.pass.max_jobs,
            schedule_id: opts.pass.schedule_id,
            lease_seconds: opts.pass.lease_seconds,
            default_output_dir: opts.pass.default_output_dir.clone(),
        };
        let report = scheduler::run_once_pass(ctx, pass).await?;
        tracing::info!(processed = report.processed, "scheduler pass finished");

        if opts.once {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "failed to listen for shutdown signal");
                }
                tracing::info!("shutdown signal received, stopping scheduler");
                return Ok(());
            }
        }
    }
}
