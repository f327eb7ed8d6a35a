use crate::output::print_json;
use anyhow::Context;
use killchain_core::{
    config::Config, resolver, CancelToken, KillchainError, RestClient, SequenceReport, Sequencer,
    SystemClock,
};
use serde_json::json;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// RunExit: typed non-zero exit codes (no std::process::exit in library code)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum RunExit {
    SequenceFailed {
        failed: usize,
        not_run: usize,
        planned: usize,
    },
}

impl RunExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunExit::SequenceFailed { .. } => 1,
        }
    }
}

impl std::fmt::Display for RunExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunExit::SequenceFailed {
                failed,
                not_run,
                planned,
            } => write!(
                f,
                "sequence failed: {failed} failed and {not_run} not run out of {planned} job(s)"
            ),
        }
    }
}

impl std::error::Error for RunExit {}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub fn run(config: Config, no_hold: bool, json: bool) -> anyhow::Result<()> {
    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || on_signal.cancel())
        .context("failed to install termination signal handler")?;

    let jobs = resolver::resolve(&config.adversaries);
    if jobs.is_empty() {
        info!("no adversaries enabled -> nothing to run");
        return print_summary(&SequenceReport::default(), json);
    }

    let client = RestClient::new(&config.control_plane, cancel.clone())
        .context("failed to build control plane client")?;
    info!(url = client.base_url(), jobs = jobs.len(), "starting sequence");

    let clock = SystemClock;
    let sequencer = Sequencer::new(&client, &client, &clock, &cancel, &config);
    let report = match sequencer.run(&jobs) {
        Ok(report) => report,
        Err(KillchainError::Cancelled) => {
            interrupted(sequencer.in_flight());
            return Ok(());
        }
        Err(e) => return Err(anyhow::Error::new(e).context("sequence aborted")),
    };

    print_summary(&report, json)?;

    if config.sequence.hold_after_run && !no_hold {
        info!(
            exit_code = report.exit_code(),
            "sequence finished; holding until termination signal"
        );
        cancel.wait();
        info!("termination signal received, exiting");
        return Ok(());
    }

    if report.success() {
        Ok(())
    } else {
        let failed = report.outcomes.iter().filter(|o| !o.ok).count();
        Err(RunExit::SequenceFailed {
            failed,
            not_run: report.planned.saturating_sub(report.outcomes.len()),
            planned: report.planned,
        }
        .into())
    }
}

fn interrupted(in_flight: Option<String>) {
    match in_flight {
        Some(op_id) => warn!(
            operation_id = %op_id,
            "interrupted; operation left running on the control plane"
        ),
        None => warn!("interrupted; no operation in flight"),
    }
}

fn print_summary(report: &SequenceReport, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&json!({
            "success": report.success(),
            "planned": report.planned,
            "outcomes": report.outcomes,
        }));
    }

    println!("=== SEQUENCE SUMMARY ===");
    if report.outcomes.is_empty() {
        println!("(no adversaries run)");
    }
    for outcome in &report.outcomes {
        println!("{}", outcome.summary_line());
    }
    Ok(())
}
