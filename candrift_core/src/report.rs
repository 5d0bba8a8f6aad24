use crate::executor::VerdictCounts;
use crate::recorder::{Finding, RecordOutcome};
use crate::session::{SessionOutcome, SessionPhase};
use log::info;
use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;

/// Iteration statistics handed to a [`ProgressSink`] while the session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub iterations: u64,
    pub max_iterations: Option<u64>,
    pub findings: usize,
    pub counts: VerdictCounts,
    /// Running time, pauses excluded.
    pub elapsed: Duration,
}

impl Progress {
    pub fn iterations_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.iterations as f64 / secs
        } else {
            0.0
        }
    }
}

/// Host callback for session events. Every method defaults to doing nothing.
pub trait ProgressSink: Send {
    fn on_phase_change(&mut self, _from: SessionPhase, _to: SessionPhase) {}

    /// Called for each recorded finding, new or repeated.
    fn on_finding(&mut self, _finding: &Finding, _outcome: &RecordOutcome) {}

    fn on_progress(&mut self, _progress: &Progress) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {}

/// Forwards session events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_phase_change(&mut self, from: SessionPhase, to: SessionPhase) {
        info!("Session {from} -> {to}");
    }

    fn on_finding(&mut self, finding: &Finding, outcome: &RecordOutcome) {
        if outcome.is_new {
            info!(
                "New finding #{} at iteration {}: {} ({})",
                outcome.index + 1,
                finding.discovered_at_iteration,
                finding.candidate().frame,
                finding.verdict
            );
        }
    }

    fn on_progress(&mut self, progress: &Progress) {
        info!(
            "Iter: {}, Findings: {}, Iter/sec: {:.2}",
            progress.iterations,
            progress.findings,
            progress.iterations_per_sec()
        );
    }
}

/// One deduplicated finding, rendered for output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FindingRecord {
    pub arbitration_id: String,
    pub payload: String,
    pub reason: String,
    pub hit_count: u64,
    pub first_iteration: u64,
    pub last_iteration: u64,
    /// Bus traffic from the first hit, as cansend directives.
    pub responses: Vec<String>,
    pub bus_error: Option<String>,
    pub fingerprint: String,
}

impl From<&Finding> for FindingRecord {
    fn from(finding: &Finding) -> Self {
        let frame = &finding.candidate().frame;
        Self {
            arbitration_id: frame.id_hex(),
            payload: frame.payload_hex(),
            reason: finding.verdict.reason().to_string(),
            hit_count: finding.hit_count,
            first_iteration: finding.discovered_at_iteration,
            last_iteration: finding.last_seen_iteration,
            responses: finding
                .observation
                .responses
                .iter()
                .map(ToString::to_string)
                .collect(),
            bus_error: finding.observation.bus_error.as_ref().map(ToString::to_string),
            fingerprint: finding.fingerprint(),
        }
    }
}

/// Summary produced once a session reaches `Completed` or `Aborted`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FinalReport {
    pub outcome: SessionOutcome,
    pub strategy: String,
    pub seed: u64,
    pub iterations: u64,
    pub elapsed_ms: u64,
    pub generator_exhausted: bool,
    pub verdicts: VerdictCounts,
    /// Ordered by first-discovery iteration.
    pub findings: Vec<FindingRecord>,
    /// Last frame that reached the bus, for reproducing a fault.
    pub last_sent: Option<String>,
    pub bus_fault: Option<String>,
}

impl FinalReport {
    pub fn findings_from(snapshot: &[Finding]) -> Vec<FindingRecord> {
        snapshot.iter().map(FindingRecord::from).collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Session {} after {} iterations in {:.2?}",
            self.outcome,
            self.iterations,
            Duration::from_millis(self.elapsed_ms)
        );
        let _ = writeln!(out, "Strategy: {} (seed {})", self.strategy, self.seed);
        if self.generator_exhausted {
            let _ = writeln!(out, "Generator exhausted its frame space.");
        }
        let _ = writeln!(
            out,
            "Verdicts: {} boring, {} interesting, {} bus faults",
            self.verdicts.boring, self.verdicts.interesting, self.verdicts.bus_faults
        );
        if let Some(fault) = &self.bus_fault {
            let _ = writeln!(out, "BUS FAULT: {fault}");
        }
        if let Some(frame) = &self.last_sent {
            let _ = writeln!(out, "Last frame sent: {frame}");
        }

        let _ = writeln!(out, "Findings: {}", self.findings.len());
        if self.findings.is_empty() {
            return out;
        }
        let _ = writeln!(
            out,
            "  {:>3}  {:<12} {:<24} {:<22} {:>5} {:>8}  {:<32}",
            "#", "ID", "Payload", "Reason", "Hits", "First", "Fingerprint"
        );
        for (n, record) in self.findings.iter().enumerate() {
            let _ = writeln!(
                out,
                "  {:>3}  {:<12} {:<24} {:<22} {:>5} {:>8}  {:<32}",
                n + 1,
                record.arbitration_id,
                record.payload,
                record.reason,
                record.hit_count,
                record.first_iteration,
                record.fingerprint
            );
            for response in &record.responses {
                let _ = writeln!(out, "         <- {response}");
            }
        }
        out
    }
}
