//! Session state machine.
//!
//! ```text
//! Configuring --start--> Running --pause--> Paused --resume--> Running
//!                          |  \
//!                          |   +--exhausted / budget--> Completed
//!                          +--cancel / bus fault------> Aborted
//! ```
//!
//! Pause and cancel requests made through a [`SessionControl`] are honoured
//! at iteration boundaries, so the iteration in flight is always classified
//! and recorded first.

use crate::classifier::Classifier;
use crate::config::{
    ConfigError, ObserverSettings, StopCondition, StrategyConfig, TransportSettings,
};
use crate::executor::{
    BusExecutor, BusFault, FuzzLoop, IterationOutcome, LoopError, RetryPolicy, VerdictCounts,
};
use crate::frame::Frame;
use crate::observer::QuietWindowObserver;
use crate::recorder::Finding;
use crate::report::{FinalReport, NullSink, Progress, ProgressSink};
use crate::transport::BusTransport;
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    Configuring,
    Running,
    Paused,
    Completed,
    Aborted,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Completed | SessionPhase::Aborted)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Configuring => "configuring",
            SessionPhase::Running => "running",
            SessionPhase::Paused => "paused",
            SessionPhase::Completed => "completed",
            SessionPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionReason {
    GeneratorExhausted,
    IterationBudget,
    TimeBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbortReason {
    Cancelled,
    BusFault,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionOutcome {
    Completed(CompletionReason),
    Aborted(AbortReason),
}

impl SessionOutcome {
    pub fn phase(self) -> SessionPhase {
        match self {
            SessionOutcome::Completed(_) => SessionPhase::Completed,
            SessionOutcome::Aborted(_) => SessionPhase::Aborted,
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Completed(CompletionReason::GeneratorExhausted) => {
                f.write_str("completed (generator exhausted)")
            }
            SessionOutcome::Completed(CompletionReason::IterationBudget) => {
                f.write_str("completed (iteration budget reached)")
            }
            SessionOutcome::Completed(CompletionReason::TimeBudget) => {
                f.write_str("completed (time budget reached)")
            }
            SessionOutcome::Aborted(AbortReason::Cancelled) => f.write_str("aborted (cancelled)"),
            SessionOutcome::Aborted(AbortReason::BusFault) => f.write_str("aborted (bus fault)"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid session configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    BusFault(#[from] BusFault),
    #[error(transparent)]
    Loop(#[from] LoopError),
    #[error("Cannot {action} a session that is {phase}")]
    InvalidTransition {
        action: &'static str,
        phase: SessionPhase,
    },
}

const NO_REQUEST: u8 = 0;
const PAUSE_REQUESTED: u8 = 1;
const CANCEL_REQUESTED: u8 = 2;

/// Thread-safe handle for asking a running session to pause or cancel.
///
/// Cancellation wins over a pending pause.
#[derive(Debug, Clone, Default)]
pub struct SessionControl {
    request: Arc<AtomicU8>,
}

impl SessionControl {
    pub fn request_pause(&self) {
        let _ = self.request.compare_exchange(
            NO_REQUEST,
            PAUSE_REQUESTED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn request_cancel(&self) {
        self.request.store(CANCEL_REQUESTED, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.request.load(Ordering::SeqCst) == CANCEL_REQUESTED
    }

    fn take_pause(&self) -> bool {
        self.request
            .compare_exchange(
                PAUSE_REQUESTED,
                NO_REQUEST,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

/// Owns one fuzzing session from configuration to final report.
pub struct SessionController<T: BusTransport> {
    phase: SessionPhase,
    transport: Option<T>,
    strategy: Option<StrategyConfig>,
    classifier: Option<Box<dyn Classifier>>,
    stop: Option<StopCondition>,
    retry: RetryPolicy,
    observer: QuietWindowObserver,
    abort_on_retry_exhaustion: bool,
    sink: Box<dyn ProgressSink>,
    progress_interval: u64,
    control: SessionControl,
    fuzz: Option<FuzzLoop<T>>,
    active_time: Duration,
    running_since: Option<Instant>,
    outcome: Option<SessionOutcome>,
    generator_exhausted: bool,
    bus_fault: Option<BusFault>,
}

impl<T: BusTransport> SessionController<T> {
    pub fn new(transport: T) -> Self {
        Self::with_control(transport, SessionControl::default())
    }

    /// Like [`SessionController::new`], driven by an existing control handle.
    pub fn with_control(transport: T, control: SessionControl) -> Self {
        let observer_defaults = ObserverSettings::default();
        Self {
            phase: SessionPhase::Configuring,
            transport: Some(transport),
            strategy: None,
            classifier: None,
            stop: None,
            retry: RetryPolicy::default(),
            observer: QuietWindowObserver::new(
                observer_defaults.quiet_window(),
                observer_defaults.max_responses,
            ),
            abort_on_retry_exhaustion: true,
            sink: Box::new(NullSink),
            progress_interval: 0,
            control,
            fuzz: None,
            active_time: Duration::ZERO,
            running_since: None,
            outcome: None,
            generator_exhausted: false,
            bus_fault: None,
        }
    }

    pub fn configure_strategy(&mut self, strategy: StrategyConfig) -> Result<(), SessionError> {
        self.ensure_configuring("configure")?;
        self.strategy = Some(strategy);
        Ok(())
    }

    pub fn configure_classifier(
        &mut self,
        classifier: Box<dyn Classifier>,
    ) -> Result<(), SessionError> {
        self.ensure_configuring("configure")?;
        self.classifier = Some(classifier);
        Ok(())
    }

    pub fn set_stop_condition(&mut self, stop: StopCondition) -> Result<(), SessionError> {
        self.ensure_configuring("configure")?;
        self.stop = Some(stop);
        Ok(())
    }

    /// Applies quiet-window and retry settings.
    pub fn configure_bus(
        &mut self,
        observer: &ObserverSettings,
        transport: &TransportSettings,
    ) -> Result<(), SessionError> {
        self.ensure_configuring("configure")?;
        if observer.quiet_window_ms == 0 {
            return Err(ConfigError::ZeroQuietWindow.into());
        }
        self.observer = QuietWindowObserver::new(observer.quiet_window(), observer.max_responses);
        self.retry = RetryPolicy {
            limit: transport.retry_limit,
            backoff: Duration::from_millis(transport.retry_backoff_ms),
        };
        self.abort_on_retry_exhaustion = transport.abort_on_retry_exhaustion;
        Ok(())
    }

    /// Installs the host's event sink, notified every `progress_interval`
    /// iterations (0 disables progress events).
    pub fn set_sink(&mut self, sink: Box<dyn ProgressSink>, progress_interval: u64) {
        self.sink = sink;
        self.progress_interval = progress_interval;
    }

    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome
    }

    pub fn iterations(&self) -> u64 {
        self.fuzz.as_ref().map_or(0, FuzzLoop::iterations)
    }

    pub fn findings(&self) -> Vec<Finding> {
        self.fuzz
            .as_ref()
            .map_or_else(Vec::new, |fuzz| fuzz.recorder().snapshot())
    }

    pub fn last_sent(&self) -> Option<&Frame> {
        self.fuzz.as_ref().and_then(FuzzLoop::last_sent)
    }

    /// Running time so far, excluding pauses.
    pub fn active_elapsed(&self) -> Duration {
        self.active_time + self.running_since.map_or(Duration::ZERO, |s| s.elapsed())
    }

    /// Validates the configuration, builds the generator and enters `Running`.
    ///
    /// On error the session stays in `Configuring` and nothing has been sent.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.ensure_configuring("start")?;
        let strategy = self
            .strategy
            .as_ref()
            .ok_or(ConfigError::MissingSetting("strategy"))?;
        if self.classifier.is_none() {
            return Err(ConfigError::MissingSetting("classifier").into());
        }
        let stop = self.stop.ok_or(ConfigError::MissingSetting("stop condition"))?;
        stop.validate()?;
        let generator = strategy.build()?;

        let (Some(classifier), Some(transport)) = (self.classifier.take(), self.transport.take())
        else {
            return Err(ConfigError::MissingSetting("transport").into());
        };
        info!(
            "Starting '{}' session (seed {}) with {}, quiet window {:?}",
            generator.name(),
            strategy.seed,
            classifier.name(),
            self.observer.window()
        );
        let executor = BusExecutor::new(transport, self.retry, self.observer);
        self.fuzz = Some(FuzzLoop::new(
            generator,
            executor,
            classifier,
            self.abort_on_retry_exhaustion,
        ));
        self.running_since = Some(Instant::now());
        self.set_phase(SessionPhase::Running);
        Ok(())
    }

    /// Runs iterations until the session pauses, completes or aborts.
    ///
    /// A fatal bus fault moves the session to `Aborted` and is returned as
    /// `SessionError::BusFault`; the final report is still available.
    pub fn run(&mut self) -> Result<SessionPhase, SessionError> {
        if self.phase != SessionPhase::Running {
            return Err(SessionError::InvalidTransition {
                action: "run",
                phase: self.phase,
            });
        }

        loop {
            if self.control.is_cancel_requested() {
                info!("Cancellation requested");
                self.finish(SessionOutcome::Aborted(AbortReason::Cancelled));
                return Ok(self.phase);
            }
            if self.control.take_pause() {
                self.pause()?;
                return Ok(self.phase);
            }
            if let Some(reason) = self.stop_reason() {
                self.finish(SessionOutcome::Completed(reason));
                return Ok(self.phase);
            }

            let Some(fuzz) = self.fuzz.as_mut() else {
                return Err(ConfigError::MissingSetting("generator").into());
            };
            match fuzz.run_iteration()? {
                IterationOutcome::Exhausted => {
                    self.generator_exhausted = true;
                    self.finish(SessionOutcome::Completed(CompletionReason::GeneratorExhausted));
                    return Ok(self.phase);
                }
                IterationOutcome::Completed { recorded, .. } => {
                    if let Some(outcome) = recorded {
                        if let Some(finding) = fuzz.recorder().get(outcome.index) {
                            self.sink.on_finding(finding, &outcome);
                        }
                    }
                    let iterations = fuzz.iterations();
                    if self.progress_interval > 0 && iterations % self.progress_interval == 0 {
                        let progress = self.progress();
                        self.sink.on_progress(&progress);
                    }
                }
                IterationOutcome::Fatal { fault, recorded } => {
                    if let Some(outcome) = recorded {
                        if let Some(finding) = fuzz.recorder().get(outcome.index) {
                            self.sink.on_finding(finding, &outcome);
                        }
                    }
                    self.bus_fault = Some(fault.clone());
                    self.finish(SessionOutcome::Aborted(AbortReason::BusFault));
                    return Err(fault.into());
                }
            }
        }
    }

    /// Stops a running session between iterations.
    pub fn pause(&mut self) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Running {
            return Err(SessionError::InvalidTransition {
                action: "pause",
                phase: self.phase,
            });
        }
        self.stop_clock();
        self.set_phase(SessionPhase::Paused);
        Ok(())
    }

    /// Continues a paused session exactly where it stopped.
    pub fn resume(&mut self) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Paused {
            return Err(SessionError::InvalidTransition {
                action: "resume",
                phase: self.phase,
            });
        }
        self.control.take_pause();
        self.running_since = Some(Instant::now());
        self.set_phase(SessionPhase::Running);
        Ok(())
    }

    /// Aborts the session. Has no effect once it has already ended.
    pub fn cancel(&mut self) {
        if !self.phase.is_terminal() {
            self.finish(SessionOutcome::Aborted(AbortReason::Cancelled));
        }
    }

    /// Final report, available once the session is `Completed` or `Aborted`.
    pub fn report(&self) -> Option<FinalReport> {
        let outcome = self.outcome?;
        let (strategy, seed) = self
            .strategy
            .as_ref()
            .map_or((String::from("none"), 0), |s| (s.kind.to_string(), s.seed));
        let (findings, verdicts) = match &self.fuzz {
            Some(fuzz) => (
                FinalReport::findings_from(&fuzz.recorder().snapshot()),
                fuzz.counts(),
            ),
            None => (Vec::new(), VerdictCounts::default()),
        };
        Some(FinalReport {
            outcome,
            strategy,
            seed,
            iterations: self.iterations(),
            elapsed_ms: u64::try_from(self.active_elapsed().as_millis()).unwrap_or(u64::MAX),
            generator_exhausted: self.generator_exhausted,
            verdicts,
            findings,
            last_sent: self.last_sent().map(ToString::to_string),
            bus_fault: self.bus_fault.as_ref().map(ToString::to_string),
        })
    }

    /// Consumes a finished session and hands the transport back to the host.
    pub fn into_transport(self) -> Option<T> {
        match self.fuzz {
            Some(fuzz) => Some(fuzz.into_transport()),
            None => self.transport,
        }
    }

    fn stop_reason(&mut self) -> Option<CompletionReason> {
        let fuzz = self.fuzz.as_ref()?;
        if fuzz.generator().remaining() == Some(0) {
            self.generator_exhausted = true;
            return Some(CompletionReason::GeneratorExhausted);
        }
        let stop = self.stop.unwrap_or_default();
        if stop
            .max_iterations
            .is_some_and(|max| fuzz.iterations() >= max)
        {
            return Some(CompletionReason::IterationBudget);
        }
        if stop
            .max_duration
            .is_some_and(|max| self.active_elapsed() >= max)
        {
            return Some(CompletionReason::TimeBudget);
        }
        None
    }

    fn progress(&self) -> Progress {
        Progress {
            iterations: self.iterations(),
            max_iterations: self.stop.and_then(|s| s.max_iterations),
            findings: self.fuzz.as_ref().map_or(0, |f| f.recorder().len()),
            counts: self
                .fuzz
                .as_ref()
                .map_or_else(VerdictCounts::default, FuzzLoop::counts),
            elapsed: self.active_elapsed(),
        }
    }

    fn finish(&mut self, outcome: SessionOutcome) {
        self.stop_clock();
        self.outcome = Some(outcome);
        match outcome {
            SessionOutcome::Aborted(AbortReason::BusFault) => {
                warn!("Session {outcome} after {} iterations", self.iterations())
            }
            _ => info!("Session {outcome} after {} iterations", self.iterations()),
        }
        self.set_phase(outcome.phase());
    }

    fn stop_clock(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.active_time += since.elapsed();
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            debug!("Session phase {} -> {}", self.phase, phase);
            self.sink.on_phase_change(self.phase, phase);
            self.phase = phase;
        }
    }

    fn ensure_configuring(&self, action: &'static str) -> Result<(), SessionError> {
        if self.phase == SessionPhase::Configuring {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                action,
                phase: self.phase,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::Baseline;
    use crate::classifier::RuleClassifier;
    use crate::config::{GeneratorSettings, StrategyKind};
    use crate::frame::IdWidth;
    use crate::generator::{
        Generator, IdRange, IdSelection, LengthBounds, PayloadPattern, RandomGenerator,
    };
    use crate::transport::TransportError;
    use crate::virtual_bus::{VirtualBus, VirtualEcu};

    fn frame(directive: &str) -> Frame {
        Frame::parse_directive(directive).unwrap()
    }

    fn brute(start: u32, end: u32, len: usize, patterns: Vec<PayloadPattern>) -> StrategyConfig {
        StrategyConfig::new(
            StrategyKind::Brute,
            GeneratorSettings {
                id_range: IdRange::new(start, end),
                payload_length: LengthBounds::fixed(len),
                patterns,
                ..GeneratorSettings::default()
            },
        )
    }

    fn random(seed: u64) -> StrategyConfig {
        StrategyConfig::new(
            StrategyKind::Random,
            GeneratorSettings {
                id_range: IdRange::new(0x100, 0x1FF),
                ..GeneratorSettings::default()
            },
        )
        .with_seed(seed)
    }

    fn configured<T: BusTransport>(
        mut session: SessionController<T>,
        strategy: StrategyConfig,
        stop: StopCondition,
        baseline: Option<Baseline>,
    ) -> SessionController<T> {
        session.configure_strategy(strategy).unwrap();
        session
            .configure_classifier(Box::new(RuleClassifier::new(baseline)))
            .unwrap();
        session.set_stop_condition(stop).unwrap();
        session
    }

    /// Wraps a virtual bus and fires a control request while listening after
    /// the `trigger_after`-th frame.
    struct ControlledBus {
        inner: VirtualBus,
        control: SessionControl,
        trigger_after: usize,
        cancel: bool,
    }

    impl BusTransport for ControlledBus {
        fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
            self.inner.send(frame)
        }

        fn poll(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
            if self.inner.sent().len() == self.trigger_after {
                if self.cancel {
                    self.control.request_cancel();
                } else {
                    self.control.request_pause();
                }
            }
            self.inner.poll(timeout)
        }

        fn drain(&mut self) -> Result<Vec<Frame>, TransportError> {
            self.inner.drain()
        }
    }

    #[test]
    fn single_id_brute_force_completes_after_one_boring_iteration() {
        let strategy = brute(0x10, 0x10, 8, vec![PayloadPattern::AllZero]);
        let mut session = configured(
            SessionController::new(VirtualBus::new()),
            strategy,
            StopCondition::iterations(1),
            None,
        );
        session.start().unwrap();
        assert_eq!(session.run().unwrap(), SessionPhase::Completed);

        let report = session.report().unwrap();
        assert_eq!(report.iterations, 1);
        assert!(report.generator_exhausted);
        assert_eq!(
            report.outcome,
            SessionOutcome::Completed(CompletionReason::GeneratorExhausted)
        );
        assert_eq!(report.verdicts.boring, 1);
        assert!(report.findings.is_empty());
        assert_eq!(report.last_sent.as_deref(), Some("0x010#00 00 00 00 00 00 00 00"));
    }

    #[test]
    fn silence_from_responsive_baseline_id_is_reported() {
        let mut baseline = Baseline::new();
        baseline.mark_responsive(0x10, Default::default());
        let mut session = configured(
            SessionController::new(VirtualBus::new()),
            brute(0x10, 0x10, 8, vec![PayloadPattern::AllZero]),
            StopCondition::iterations(1),
            Some(baseline),
        );
        session.start().unwrap();
        session.run().unwrap();
        let report = session.report().unwrap();
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].reason, "unexpected silence");
        assert_eq!(report.findings[0].first_iteration, 1);
    }

    #[test]
    fn invalid_configuration_never_touches_the_bus() {
        let mut session = configured(
            SessionController::new(VirtualBus::new()),
            brute(0x200, 0x100, 8, vec![PayloadPattern::AllZero]),
            StopCondition::iterations(10),
            None,
        );
        assert!(matches!(
            session.start(),
            Err(SessionError::Config(ConfigError::EmptyIdRange { .. }))
        ));
        assert_eq!(session.phase(), SessionPhase::Configuring);
        assert!(session.report().is_none());
        assert!(session.into_transport().unwrap().sent().is_empty());
    }

    #[test]
    fn start_requires_strategy_classifier_and_stop_condition() {
        let mut session = SessionController::new(VirtualBus::new());
        assert!(matches!(
            session.start(),
            Err(SessionError::Config(ConfigError::MissingSetting("strategy")))
        ));
        session.configure_strategy(random(1)).unwrap();
        assert!(matches!(
            session.start(),
            Err(SessionError::Config(ConfigError::MissingSetting("classifier")))
        ));
        session
            .configure_classifier(Box::new(RuleClassifier::new(None)))
            .unwrap();
        assert!(matches!(
            session.start(),
            Err(SessionError::Config(ConfigError::MissingSetting("stop condition")))
        ));
        session.set_stop_condition(StopCondition::iterations(1)).unwrap();
        session.start().unwrap();
        assert!(matches!(
            session.configure_strategy(random(2)),
            Err(SessionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn pause_and_resume_keep_the_candidate_sequence() {
        let control = SessionControl::default();
        let bus = ControlledBus {
            inner: VirtualBus::new(),
            control: control.clone(),
            trigger_after: 3,
            cancel: false,
        };
        let mut session = configured(
            SessionController::with_control(bus, control),
            random(7),
            StopCondition::iterations(6),
            None,
        );
        session.start().unwrap();
        assert_eq!(session.run().unwrap(), SessionPhase::Paused);
        assert_eq!(session.iterations(), 3);
        assert!(session.report().is_none());

        session.resume().unwrap();
        assert_eq!(session.run().unwrap(), SessionPhase::Completed);
        assert_eq!(
            session.outcome(),
            Some(SessionOutcome::Completed(CompletionReason::IterationBudget))
        );

        let sent = session.into_transport().unwrap().inner.sent().to_vec();
        let mut reference = RandomGenerator::new(
            IdSelection::Range(IdRange::new(0x100, 0x1FF)),
            IdWidth::Standard,
            LengthBounds::default(),
            None,
            7,
        )
        .unwrap();
        let expected: Vec<Frame> = (0..6)
            .map(|_| reference.next_candidate().unwrap().unwrap().frame)
            .collect();
        assert_eq!(sent, expected);
    }

    #[test]
    fn cancel_during_quiet_window_still_records_the_iteration() {
        let control = SessionControl::default();
        let mut baseline = Baseline::new();
        baseline.mark_silent(0x100);
        let bus = ControlledBus {
            inner: VirtualBus::with_ecus([VirtualEcu::responder(0x100, frame("108#01"))]),
            control: control.clone(),
            trigger_after: 2,
            cancel: true,
        };
        let mut session = configured(
            SessionController::with_control(bus, control),
            brute(
                0x100,
                0x100,
                1,
                vec![
                    PayloadPattern::AllZero,
                    PayloadPattern::AllOne,
                    PayloadPattern::WalkingBit,
                ],
            ),
            StopCondition::iterations(100),
            Some(baseline),
        );
        session.start().unwrap();
        assert_eq!(session.run().unwrap(), SessionPhase::Aborted);

        let report = session.report().unwrap();
        assert_eq!(report.outcome, SessionOutcome::Aborted(AbortReason::Cancelled));
        assert_eq!(report.iterations, 2);
        assert_eq!(report.findings.len(), 2);
        assert_eq!(report.findings[1].payload, "FF");
        assert_eq!(report.findings[1].responses, vec!["0x108#01".to_string()]);
    }

    #[test]
    fn offline_bus_aborts_with_last_sent_frame() {
        let mut bus = VirtualBus::new();
        bus.offline_after_sends(2);
        let mut session = configured(
            SessionController::new(bus),
            brute(
                0x100,
                0x100,
                1,
                vec![
                    PayloadPattern::AllZero,
                    PayloadPattern::AllOne,
                    PayloadPattern::WalkingBit,
                ],
            ),
            StopCondition::iterations(100),
            None,
        );
        session.start().unwrap();
        match session.run() {
            Err(SessionError::BusFault(fault)) => {
                assert_eq!(fault.iteration, 3);
                assert_eq!(fault.last_sent, Some(frame("100#FF")));
            }
            other => panic!("Expected bus fault, got {other:?}"),
        }
        assert_eq!(session.phase(), SessionPhase::Aborted);
        let report = session.report().unwrap();
        assert_eq!(report.outcome, SessionOutcome::Aborted(AbortReason::BusFault));
        assert_eq!(report.iterations, 2);
        assert_eq!(report.last_sent.as_deref(), Some("0x100#FF"));
        assert!(report.bus_fault.is_some());
        assert!(report.render_text().contains("BUS FAULT"));
    }

    #[test]
    fn time_budget_ends_an_unbounded_session() {
        let mut session = configured(
            SessionController::new(VirtualBus::new()),
            random(3),
            StopCondition {
                max_iterations: None,
                max_duration: Some(Duration::from_millis(20)),
            },
            None,
        );
        session.start().unwrap();
        assert_eq!(session.run().unwrap(), SessionPhase::Completed);
        assert_eq!(
            session.outcome(),
            Some(SessionOutcome::Completed(CompletionReason::TimeBudget))
        );
        assert!(session.active_elapsed() >= Duration::from_millis(20));
        assert!(session.iterations() > 0);
    }

    #[test]
    fn cancel_before_start_reports_nothing_sent() {
        let mut session = SessionController::new(VirtualBus::new());
        session.cancel();
        assert_eq!(session.phase(), SessionPhase::Aborted);
        let report = session.report().unwrap();
        assert_eq!(report.iterations, 0);
        assert!(report.last_sent.is_none());
        assert!(matches!(session.resume(), Err(SessionError::InvalidTransition { .. })));
    }
}
