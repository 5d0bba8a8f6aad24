use crate::classifier::{Classifier, Verdict};
use crate::frame::{Frame, FrameError};
use crate::generator::{Candidate, Generator};
use crate::observer::{BusErrorKind, Observation, QuietWindowObserver};
use crate::recorder::{Finding, RecordOutcome, RecorderError, ResultRecorder};
use crate::transport::{BusTransport, TransportError};
use log::{debug, error, trace, warn};
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Bounded retry of transient send failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub limit: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusFaultKind {
    #[error("bus offline: {0}")]
    Offline(String),
    #[error("send failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Fatal bus failure. Ends the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Fatal bus fault at iteration {iteration}: {kind} (last frame sent: {})",
    .last_sent.as_ref().map_or_else(|| "none".to_string(), Frame::to_string)
)]
pub struct BusFault {
    pub kind: BusFaultKind,
    /// Last frame that made it onto the bus, for reproduction.
    pub last_sent: Option<Frame>,
    pub iteration: u64,
}

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("Generator produced an invalid frame: {0}")]
    Generator(#[from] FrameError),
    #[error("Result recorder rejected a finding: {0}")]
    Recorder(#[from] RecorderError),
}

/// Sends candidates and captures the bus activity that follows.
///
/// Owns the transport exclusively for the lifetime of the session.
pub struct BusExecutor<T: BusTransport> {
    transport: T,
    retry: RetryPolicy,
    observer: QuietWindowObserver,
    last_sent: Option<Frame>,
}

impl<T: BusTransport> BusExecutor<T> {
    pub fn new(transport: T, retry: RetryPolicy, observer: QuietWindowObserver) -> Self {
        Self {
            transport,
            retry,
            observer,
            last_sent: None,
        }
    }

    pub fn last_sent(&self) -> Option<&Frame> {
        self.last_sent.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Sends `candidate` and observes the quiet window after it.
    ///
    /// A send that keeps failing transiently yields an observation with
    /// `bus_error` set. Only a fatal transport error is returned as `Err`.
    pub fn execute(&mut self, candidate: Candidate) -> Result<Observation, TransportError> {
        let started = Instant::now();
        self.discard_stale_traffic()?;

        let attempts_allowed = self.retry.limit.saturating_add(1);
        let mut last_error = None;
        for attempt in 1..=attempts_allowed {
            match self.transport.send(&candidate.frame) {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(
                        "Send of {} failed (attempt {attempt}/{attempts_allowed}): {e}",
                        candidate.frame
                    );
                    last_error = Some(e);
                    if attempt < attempts_allowed {
                        std::thread::sleep(self.retry.backoff);
                    }
                }
            }
        }

        if let Some(e) = last_error {
            warn!(
                "Giving up on {} after {attempts_allowed} attempts: {e}",
                candidate.frame
            );
            return Ok(Observation {
                candidate,
                responses: Vec::new(),
                bus_error: Some(BusErrorKind::SendFailed {
                    attempts: attempts_allowed,
                    last_error: e.to_string(),
                }),
                elapsed: started.elapsed(),
            });
        }

        trace!("TX {}", candidate.frame);
        self.last_sent = Some(candidate.frame.clone());
        let capture = self.observer.observe(&mut self.transport)?;
        Ok(Observation {
            candidate,
            responses: capture.responses,
            bus_error: capture.bus_error,
            elapsed: started.elapsed(),
        })
    }

    /// Drops traffic left over from earlier candidates so responses are
    /// attributed to the right frame.
    fn discard_stale_traffic(&mut self) -> Result<(), TransportError> {
        match self.transport.drain() {
            Ok(stale) if !stale.is_empty() => {
                debug!("Discarded {} stale frames before sending", stale.len());
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!("Could not drain bus before sending: {e}");
                Ok(())
            }
        }
    }
}

/// Result of one fuzz iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The candidate was sent, observed and classified.
    Completed {
        verdict: Verdict,
        recorded: Option<RecordOutcome>,
    },
    /// The generator has no more candidates; nothing was sent.
    Exhausted,
    /// The bus failed fatally. If the failure was retry exhaustion the
    /// iteration was still classified and recorded first.
    Fatal {
        fault: BusFault,
        recorded: Option<RecordOutcome>,
    },
}

/// Running counts of verdicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VerdictCounts {
    pub boring: u64,
    pub interesting: u64,
    pub bus_faults: u64,
}

/// One send → observe → classify → record pass per call.
pub struct FuzzLoop<T: BusTransport> {
    generator: Box<dyn Generator>,
    executor: BusExecutor<T>,
    classifier: Box<dyn Classifier>,
    recorder: ResultRecorder,
    abort_on_retry_exhaustion: bool,
    iterations: u64,
    counts: VerdictCounts,
}

impl<T: BusTransport> FuzzLoop<T> {
    pub fn new(
        generator: Box<dyn Generator>,
        executor: BusExecutor<T>,
        classifier: Box<dyn Classifier>,
        abort_on_retry_exhaustion: bool,
    ) -> Self {
        Self {
            generator,
            executor,
            classifier,
            recorder: ResultRecorder::new(),
            abort_on_retry_exhaustion,
            iterations: 0,
            counts: VerdictCounts::default(),
        }
    }

    /// Completed iterations so far.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn counts(&self) -> VerdictCounts {
        self.counts
    }

    pub fn recorder(&self) -> &ResultRecorder {
        &self.recorder
    }

    pub fn generator(&self) -> &dyn Generator {
        self.generator.as_ref()
    }

    pub fn last_sent(&self) -> Option<&Frame> {
        self.executor.last_sent()
    }

    pub fn into_transport(self) -> T {
        self.executor.into_transport()
    }

    pub fn run_iteration(&mut self) -> Result<IterationOutcome, LoopError> {
        let Some(candidate) = self.generator.next_candidate()? else {
            debug!("Generator '{}' exhausted", self.generator.name());
            return Ok(IterationOutcome::Exhausted);
        };
        let iteration = self.iterations + 1;

        let observation = match self.executor.execute(candidate) {
            Ok(observation) => observation,
            Err(e) => {
                let fault = BusFault {
                    kind: BusFaultKind::Offline(e.to_string()),
                    last_sent: self.executor.last_sent().cloned(),
                    iteration,
                };
                error!("{fault}");
                return Ok(IterationOutcome::Fatal {
                    fault,
                    recorded: None,
                });
            }
        };

        let verdict = self.classifier.classify(&observation);
        match verdict {
            Verdict::Boring => self.counts.boring += 1,
            Verdict::Interesting(_) => self.counts.interesting += 1,
            Verdict::BusFault => self.counts.bus_faults += 1,
        }

        let exhausted_send = match &observation.bus_error {
            Some(BusErrorKind::SendFailed {
                attempts,
                last_error,
            }) => Some(BusFaultKind::RetriesExhausted {
                attempts: *attempts,
                last_error: last_error.clone(),
            }),
            _ => None,
        };

        let recorded = if verdict.is_reportable() {
            Some(
                self.recorder
                    .record(Finding::new(observation, verdict, iteration))?,
            )
        } else {
            None
        };
        self.iterations = iteration;

        if let Some(kind) = exhausted_send.filter(|_| self.abort_on_retry_exhaustion) {
            let fault = BusFault {
                kind,
                last_sent: self.executor.last_sent().cloned(),
                iteration,
            };
            error!("{fault}");
            return Ok(IterationOutcome::Fatal { fault, recorded });
        }

        Ok(IterationOutcome::Completed { verdict, recorded })
    }
}
