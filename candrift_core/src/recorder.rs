use crate::classifier::Verdict;
use crate::generator::Candidate;
use crate::observer::Observation;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error("Finding from iteration {got} arrived after iteration {latest} was recorded")]
    OutOfOrder { got: u64, latest: u64 },
    #[error("Boring verdicts are not recorded")]
    NotReportable,
}

/// An interesting (or faulting) candidate, with the bus activity that made
/// it stand out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Observation from the first time this finding was seen.
    pub observation: Observation,
    pub verdict: Verdict,
    pub discovered_at_iteration: u64,
    pub last_seen_iteration: u64,
    pub hit_count: u64,
}

impl Finding {
    pub fn new(observation: Observation, verdict: Verdict, iteration: u64) -> Self {
        Self {
            observation,
            verdict,
            discovered_at_iteration: iteration,
            last_seen_iteration: iteration,
            hit_count: 1,
        }
    }

    pub fn candidate(&self) -> &Candidate {
        &self.observation.candidate
    }

    /// MD5 hex digest of the deduplication key, stable across sessions.
    pub fn fingerprint(&self) -> String {
        let frame = &self.candidate().frame;
        let mut context = md5::Context::new();
        context.consume(frame.id().to_be_bytes());
        context.consume(frame.payload());
        context.consume(self.verdict.reason().as_bytes());
        format!("{:x}", context.compute())
    }

    fn key(&self) -> FindingKey {
        let frame = &self.candidate().frame;
        (frame.id(), frame.payload().to_vec(), self.verdict.reason())
    }
}

type FindingKey = (u32, Vec<u8>, &'static str);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    /// Position of the finding in the snapshot order.
    pub index: usize,
    pub is_new: bool,
    pub hit_count: u64,
}

/// Append-only store of findings.
///
/// Findings with the same arbitration ID, payload and verdict reason collapse
/// into one entry whose hit counter and last-seen iteration are updated.
/// Entries stay ordered by first-discovery iteration.
#[derive(Debug, Default)]
pub struct ResultRecorder {
    findings: Vec<Finding>,
    index: HashMap<FindingKey, usize>,
    latest_iteration: u64,
}

impl ResultRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, finding: Finding) -> Result<RecordOutcome, RecorderError> {
        if !finding.verdict.is_reportable() {
            return Err(RecorderError::NotReportable);
        }
        let iteration = finding.discovered_at_iteration;
        if iteration < self.latest_iteration {
            return Err(RecorderError::OutOfOrder {
                got: iteration,
                latest: self.latest_iteration,
            });
        }
        self.latest_iteration = iteration;

        let key = finding.key();
        if let Some(&index) = self.index.get(&key) {
            let existing = &mut self.findings[index];
            existing.hit_count += 1;
            existing.last_seen_iteration = iteration;
            return Ok(RecordOutcome {
                index,
                is_new: false,
                hit_count: existing.hit_count,
            });
        }

        let index = self.findings.len();
        self.findings.push(finding);
        self.index.insert(key, index);
        Ok(RecordOutcome {
            index,
            is_new: true,
            hit_count: 1,
        })
    }

    pub fn get(&self, index: usize) -> Option<&Finding> {
        self.findings.get(index)
    }

    /// Copy of every finding, ordered by first-discovery iteration.
    pub fn snapshot(&self) -> Vec<Finding> {
        self.findings.clone()
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    /// Sum of hit counters, i.e. recorded findings before deduplication.
    pub fn total_hits(&self) -> u64 {
        self.findings.iter().map(|f| f.hit_count).sum()
    }
}
