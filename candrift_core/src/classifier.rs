use crate::baseline::{Baseline, BaselineError, ExpectedResponse};
use crate::config::ClassifierSettings;
use crate::frame::Frame;
use crate::observer::Observation;
use log::{info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Upper bound on remembered candidate responses for the history fallback.
const MAX_HISTORY_ENTRIES: usize = 65_536;

/// Why an observation was judged interesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterestReason {
    /// The ID normally gets an answer, but the bus stayed quiet.
    UnexpectedSilence,
    /// A response arrived that does not match what is normally seen.
    AnomalousResponse,
    /// A node emitted one of the configured reset signatures.
    EcuReset,
}

impl InterestReason {
    pub fn as_str(self) -> &'static str {
        match self {
            InterestReason::UnexpectedSilence => "unexpected silence",
            InterestReason::AnomalousResponse => "anomalous response",
            InterestReason::EcuReset => "ecu reset signature",
        }
    }
}

impl fmt::Display for InterestReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of classifying one observation. Never mutated once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Interesting(InterestReason),
    Boring,
    BusFault,
}

impl Verdict {
    pub fn reason(&self) -> &'static str {
        match self {
            Verdict::Interesting(reason) => reason.as_str(),
            Verdict::Boring => "boring",
            Verdict::BusFault => "bus fault",
        }
    }

    /// Whether the verdict is kept by the result recorder.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, Verdict::Boring)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// A `Classifier` decides whether an observation is worth reporting.
pub trait Classifier: Send {
    fn name(&self) -> &'static str;

    /// Judges one observation. Implementations may learn from the sequence of
    /// observations, hence `&mut self`.
    fn classify(&mut self, observation: &Observation) -> Verdict;
}

/// The default rule set. First matching rule wins:
///
/// 1. a bus error was observed: `BusFault`;
/// 2. a response matches a reset signature: interesting (`EcuReset`);
/// 3. no response and the baseline marks the ID silent: `Boring`;
/// 4. no response and the baseline marks the ID responsive: interesting
///    (`UnexpectedSilence`);
/// 5. a response differs from the baseline's expected shape, or, for IDs the
///    baseline does not list, from the previous response to the same
///    candidate: interesting (`AnomalousResponse`);
/// 6. otherwise `Boring`.
///
/// Frames from ignored IDs are dropped before rules 3-6. Without a baseline
/// only rules 1, 2 and 6 can fire.
#[derive(Debug, Default)]
pub struct RuleClassifier {
    baseline: Option<Baseline>,
    ignore_ids: HashSet<u32>,
    reset_signatures: Vec<Frame>,
    history: HashMap<(u32, Vec<u8>), Vec<Frame>>,
    history_full_warned: bool,
}

impl RuleClassifier {
    pub fn new(baseline: Option<Baseline>) -> Self {
        Self {
            baseline,
            ..Self::default()
        }
    }

    /// Builds the classifier described by `[classifier]`, loading the baseline
    /// file when one is configured.
    pub fn from_settings(settings: &ClassifierSettings) -> Result<Self, BaselineError> {
        let baseline = match &settings.baseline_path {
            Some(path) => {
                let baseline = Baseline::load_from_file(path)?;
                info!("Loaded baseline with {} entries from {path:?}", baseline.len());
                Some(baseline)
            }
            None => None,
        };
        Ok(Self::new(baseline)
            .with_ignored_ids(settings.ignore_ids.iter().copied())
            .with_reset_signatures(settings.reset_signatures.iter().cloned()))
    }

    pub fn with_ignored_ids(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.ignore_ids.extend(ids);
        self
    }

    pub fn with_reset_signatures(mut self, signatures: impl IntoIterator<Item = Frame>) -> Self {
        self.reset_signatures.extend(signatures);
        self
    }

    fn is_reset_signature(&self, frame: &Frame) -> bool {
        self.reset_signatures
            .iter()
            .any(|sig| sig.id() == frame.id() && frame.payload().starts_with(sig.payload()))
    }

    /// Compares against the previous response to the same candidate and
    /// remembers the current one.
    fn differs_from_history(&mut self, sent: &Frame, relevant: &[Frame]) -> bool {
        let key = (sent.id(), sent.payload().to_vec());
        if let Some(previous) = self.history.get_mut(&key) {
            let differs = previous.as_slice() != relevant;
            *previous = relevant.to_vec();
            return differs;
        }
        if self.history.len() < MAX_HISTORY_ENTRIES {
            self.history.insert(key, relevant.to_vec());
        } else if !self.history_full_warned {
            warn!("Response history is full; new candidates are no longer tracked");
            self.history_full_warned = true;
        }
        false
    }
}

impl Classifier for RuleClassifier {
    fn name(&self) -> &'static str {
        "RuleClassifier"
    }

    fn classify(&mut self, observation: &Observation) -> Verdict {
        if observation.bus_error.is_some() {
            return Verdict::BusFault;
        }
        if observation
            .responses
            .iter()
            .any(|frame| self.is_reset_signature(frame))
        {
            return Verdict::Interesting(InterestReason::EcuReset);
        }

        let relevant: Vec<Frame> = observation
            .responses
            .iter()
            .filter(|frame| !self.ignore_ids.contains(&frame.id()))
            .cloned()
            .collect();
        let sent = &observation.candidate.frame;

        let Some(baseline) = &self.baseline else {
            return Verdict::Boring;
        };
        match baseline.expectation(sent.id()) {
            Some(ExpectedResponse::Silent) if relevant.is_empty() => Verdict::Boring,
            Some(ExpectedResponse::Silent) => {
                Verdict::Interesting(InterestReason::AnomalousResponse)
            }
            Some(ExpectedResponse::Responds(_)) if relevant.is_empty() => {
                Verdict::Interesting(InterestReason::UnexpectedSilence)
            }
            Some(ExpectedResponse::Responds(shape)) => {
                if relevant.iter().any(|frame| shape.matches(frame)) {
                    Verdict::Boring
                } else {
                    Verdict::Interesting(InterestReason::AnomalousResponse)
                }
            }
            None if relevant.is_empty() => Verdict::Boring,
            None => {
                if self.differs_from_history(sent, &relevant) {
                    Verdict::Interesting(InterestReason::AnomalousResponse)
                } else {
                    Verdict::Boring
                }
            }
        }
    }
}
