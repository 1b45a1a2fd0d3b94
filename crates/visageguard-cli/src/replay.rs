//! `visageguard replay`: run the presence policy offline over a recorded feed.

use std::fs;
use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result};
use visageguard_core::feed::{read_records, FeedError};
use visageguard_core::{LockDecision, Phase, PolicyConfig, PresencePolicy};

/// What a replay run observed.
#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub frames: u64,
    pub blinks: u64,
    pub decision: Option<LockDecision>,
}

/// Load a policy settings file, falling back to defaults when none is given.
pub fn load_policy(path: Option<&Path>) -> Result<PolicyConfig> {
    let Some(path) = path else {
        return Ok(PolicyConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings {}", path.display()))?;
    PolicyConfig::from_toml_str(&text)
        .with_context(|| format!("bad settings file {}", path.display()))
}

fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::Idle => "idle",
        Phase::FaceAbsent => "face absent",
        Phase::FacePresentWatching => "watching",
        Phase::Locking => "locking",
    }
}

/// Feed every record of `reader` through a fresh policy, writing phase
/// changes to `out`. The session clock starts at the first record's `t_ms`.
///
/// Stops at the first lock decision.
pub fn replay<R: BufRead, W: Write>(
    reader: R,
    config: PolicyConfig,
    out: &mut W,
) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();
    let mut policy: Option<PresencePolicy> = None;
    let mut last_phase = Phase::Idle;

    for item in read_records(reader) {
        let (line, record) = item?;
        let timestamp = record
            .timestamp()
            .ok_or(FeedError::MissingTimestamp { line })?;
        let policy =
            policy.get_or_insert_with(|| PresencePolicy::new(config.clone(), timestamp));

        let eval = policy.evaluate(&record.to_sample(timestamp));
        summary.frames += 1;
        if eval.blink.is_some_and(|b| b.just_closed) {
            summary.blinks += 1;
            writeln!(out, "{:>8} ms  blink", timestamp.as_millis())?;
        }
        if eval.phase != last_phase {
            writeln!(
                out,
                "{:>8} ms  {} -> {}",
                timestamp.as_millis(),
                phase_name(last_phase),
                phase_name(eval.phase)
            )?;
            last_phase = eval.phase;
        }
        if let Some(decision) = eval.decision {
            summary.decision = Some(decision);
            break;
        }
    }

    match summary.decision {
        Some(decision) => writeln!(
            out,
            "LOCK at {} ms: {} ({})",
            decision.triggered_at.as_millis(),
            decision.reason,
            decision.reason.describe()
        )?,
        None => writeln!(
            out,
            "no lock after {} frame(s), {} blink(s)",
            summary.frames, summary.blinks
        )?,
    }
    Ok(summary)
}

/// Entry point for the `replay` subcommand.
pub fn run(feed: &Path, settings: Option<&Path>) -> Result<()> {
    let config = load_policy(settings)?;
    let file = fs::File::open(feed)
        .with_context(|| format!("failed to open feed {}", feed.display()))?;
    tracing::debug!(feed = %feed.display(), "replaying recorded feed");

    let stdout = std::io::stdout();
    let summary = replay(std::io::BufReader::new(file), config, &mut stdout.lock())?;
    if let Some(decision) = summary.decision {
        tracing::info!(
            reason = %decision.reason,
            at_ms = decision.triggered_at.as_millis() as u64,
            "replay ended in a lock"
        );
    }
    Ok(())
}
