use crate::corpus::SeedCorpus;
use crate::frame::{Frame, IdWidth, MAX_PAYLOAD_LEN};
use crate::generator::{
    BruteForceGenerator, Generator, IdRange, IdSelection, LengthBounds, MutationGenerator,
    PayloadPattern, RandomGenerator, ReplayGenerator,
};
use crate::virtual_bus::{VirtualBus, VirtualEcu};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Invalid session parameters, detected before any frame is sent.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("ID range 0x{start:X}..=0x{end:X} is empty")]
    EmptyIdRange { start: u32, end: u32 },
    #[error("ID list is empty")]
    EmptyIdList,
    #[error("Arbitration ID 0x{id:X} does not fit {width} addressing")]
    IdBeyondWidth { id: u32, width: IdWidth },
    #[error("Payload length {0} exceeds the 8 byte CAN limit")]
    PayloadLengthOutOfBounds(usize),
    #[error("Payload length bounds are inverted: min {min} > max {max}")]
    InvertedLengthBounds { min: usize, max: usize },
    #[error("Brute-force strategy has no usable payload patterns")]
    NoPayloadPatterns,
    #[error("Strategy requires a non-empty seed corpus")]
    EmptySeedCorpus,
    #[error("Mutation rate {0} must be in (0, 1]")]
    InvalidMutationRate(f64),
    #[error("Iteration budget must be greater than zero")]
    ZeroIterationBudget,
    #[error("Time budget must be greater than zero")]
    ZeroTimeBudget,
    #[error("Quiet window must be greater than zero")]
    ZeroQuietWindow,
    #[error("Session cannot start: {0} is not configured")]
    MissingSetting(&'static str),
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    Random,
    Brute,
    Mutation,
    Replay,
}

impl StrategyKind {
    pub fn uses_seed_corpus(self) -> bool {
        matches!(self, StrategyKind::Mutation | StrategyKind::Replay)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::Random => RandomGenerator::NAME,
            StrategyKind::Brute => BruteForceGenerator::NAME,
            StrategyKind::Mutation => MutationGenerator::NAME,
            StrategyKind::Replay => ReplayGenerator::NAME,
        };
        f.write_str(name)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_iterations")]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

pub fn default_iterations() -> Option<u64> {
    Some(10_000)
}

pub fn default_progress_interval() -> u64 {
    100
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            seed: 0,
            max_iterations: default_iterations(),
            max_duration_secs: None,
            progress_interval: default_progress_interval(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GeneratorSettings {
    #[serde(default)]
    pub id_width: IdWidth,
    #[serde(default = "default_id_range")]
    pub id_range: IdRange,
    /// Explicit ID subset; overrides `id-range` when set.
    #[serde(default)]
    pub ids: Option<Vec<u32>>,
    #[serde(default)]
    pub payload_length: LengthBounds,
    #[serde(default)]
    pub fixed_payload: Option<Vec<u8>>,
    #[serde(default = "default_patterns")]
    pub patterns: Vec<PayloadPattern>,
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,
    #[serde(default)]
    pub id_nibble_mask: Option<u8>,
}

pub fn default_id_range() -> IdRange {
    IdRange::new(0x000, IdWidth::Standard.max_id())
}

pub fn default_patterns() -> Vec<PayloadPattern> {
    vec![
        PayloadPattern::AllZero,
        PayloadPattern::AllOne,
        PayloadPattern::WalkingBit,
        PayloadPattern::Exhaustive,
    ]
}

pub fn default_mutation_rate() -> f64 {
    0.25
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            id_width: IdWidth::default(),
            id_range: default_id_range(),
            ids: None,
            payload_length: LengthBounds::default(),
            fixed_payload: None,
            patterns: default_patterns(),
            mutation_rate: default_mutation_rate(),
            id_nibble_mask: None,
        }
    }
}

impl GeneratorSettings {
    pub fn id_selection(&self) -> IdSelection {
        match &self.ids {
            Some(ids) => IdSelection::list(ids.iter().copied()),
            None => IdSelection::Range(self.id_range),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ObserverSettings {
    #[serde(default = "default_quiet_window_ms")]
    pub quiet_window_ms: u64,
    #[serde(default = "default_max_responses")]
    pub max_responses: usize,
}

pub fn default_quiet_window_ms() -> u64 {
    100
}

pub fn default_max_responses() -> usize {
    64
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            quiet_window_ms: default_quiet_window_ms(),
            max_responses: default_max_responses(),
        }
    }
}

impl ObserverSettings {
    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TransportSettings {
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_abort_on_retry_exhaustion")]
    pub abort_on_retry_exhaustion: bool,
}

pub fn default_retry_limit() -> u32 {
    3
}

pub fn default_retry_backoff_ms() -> u64 {
    10
}

fn default_abort_on_retry_exhaustion() -> bool {
    true
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            retry_backoff_ms: default_retry_backoff_ms(),
            abort_on_retry_exhaustion: default_abort_on_retry_exhaustion(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ClassifierSettings {
    #[serde(default)]
    pub baseline_path: Option<PathBuf>,
    /// Background traffic that never counts as a response.
    #[serde(default)]
    pub ignore_ids: Vec<u32>,
    /// Frames an ECU emits while rebooting, e.g. a boot announcement.
    #[serde(default)]
    pub reset_signatures: Vec<Frame>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    #[serde(default)]
    pub seed_paths: Vec<PathBuf>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReportSettings {
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub format: ReportFormat,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct VirtualBusSettings {
    #[serde(default)]
    pub ecu: Vec<VirtualEcu>,
    /// Take the bus offline after this many successful sends.
    #[serde(default)]
    pub offline_after_sends: Option<u64>,
    /// Fail this many sends transiently, starting with the first.
    #[serde(default)]
    pub fail_next_sends: u32,
}

impl VirtualBusSettings {
    pub fn build_bus(&self) -> VirtualBus {
        let mut bus = VirtualBus::new();
        for ecu in &self.ecu {
            bus.add_ecu(ecu.clone());
        }
        if let Some(sends) = self.offline_after_sends {
            bus.offline_after_sends(sends);
        }
        bus.fail_next_sends(self.fail_next_sends);
        bus
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CandriftConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub generator: GeneratorSettings,
    #[serde(default)]
    pub observer: ObserverSettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub classifier: ClassifierSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub report: ReportSettings,
    #[serde(default)]
    pub virtual_bus: VirtualBusSettings,
}

impl CandriftConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: CandriftConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Checks everything that can be checked without loading external files.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fuzzer.max_iterations == Some(0) {
            return Err(ConfigError::ZeroIterationBudget);
        }
        if self.fuzzer.max_duration_secs == Some(0) {
            return Err(ConfigError::ZeroTimeBudget);
        }
        if self.observer.quiet_window_ms == 0 {
            return Err(ConfigError::ZeroQuietWindow);
        }
        let generator = &self.generator;
        generator.id_selection().validate(generator.id_width)?;
        generator.payload_length.validate()?;
        if let Some(fixed) = &generator.fixed_payload {
            if fixed.len() > MAX_PAYLOAD_LEN {
                return Err(ConfigError::PayloadLengthOutOfBounds(fixed.len()));
            }
        }
        if self.fuzzer.strategy == StrategyKind::Mutation
            && !(generator.mutation_rate > 0.0 && generator.mutation_rate <= 1.0)
        {
            return Err(ConfigError::InvalidMutationRate(generator.mutation_rate));
        }
        Ok(())
    }

    pub fn stop_condition(&self) -> StopCondition {
        StopCondition {
            max_iterations: self.fuzzer.max_iterations,
            max_duration: self.fuzzer.max_duration_secs.map(Duration::from_secs),
        }
    }

    pub fn strategy(&self, seed_corpus: SeedCorpus) -> StrategyConfig {
        StrategyConfig::new(self.fuzzer.strategy, self.generator.clone())
            .with_seed(self.fuzzer.seed)
            .with_seed_corpus(seed_corpus)
    }
}

/// When a running session completes on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopCondition {
    pub max_iterations: Option<u64>,
    /// Budget of running time; paused time is not counted.
    pub max_duration: Option<Duration>,
}

impl StopCondition {
    pub fn iterations(max: u64) -> Self {
        Self {
            max_iterations: Some(max),
            max_duration: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == Some(0) {
            return Err(ConfigError::ZeroIterationBudget);
        }
        if self.max_duration == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroTimeBudget);
        }
        Ok(())
    }
}

/// Everything needed to build the session's generator.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    pub seed: u64,
    pub generator: GeneratorSettings,
    /// Parents for `mutation`, send list for `replay`; ignored otherwise.
    pub seed_corpus: SeedCorpus,
}

impl StrategyConfig {
    pub fn new(kind: StrategyKind, generator: GeneratorSettings) -> Self {
        Self {
            kind,
            seed: 0,
            generator,
            seed_corpus: SeedCorpus::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_seed_corpus(mut self, corpus: SeedCorpus) -> Self {
        self.seed_corpus = corpus;
        self
    }

    pub fn build(&self) -> Result<Box<dyn Generator>, ConfigError> {
        let g = &self.generator;
        let generator: Box<dyn Generator> = match self.kind {
            StrategyKind::Random => Box::new(RandomGenerator::new(
                g.id_selection(),
                g.id_width,
                g.payload_length,
                g.fixed_payload.clone(),
                self.seed,
            )?),
            StrategyKind::Brute => {
                g.payload_length.validate()?;
                Box::new(BruteForceGenerator::new(
                    g.id_selection(),
                    g.id_width,
                    g.payload_length.max,
                    g.patterns.clone(),
                )?)
            }
            StrategyKind::Mutation => Box::new(MutationGenerator::new(
                self.seed_corpus.clone(),
                g.mutation_rate,
                g.id_nibble_mask,
                self.seed,
            )?),
            StrategyKind::Replay => Box::new(ReplayGenerator::new(self.seed_corpus.clone())?),
        };
        Ok(generator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_documented_defaults() {
        let config: CandriftConfig = toml::from_str("").unwrap();
        assert_eq!(config.fuzzer.strategy, StrategyKind::Random);
        assert_eq!(config.fuzzer.max_iterations, Some(10_000));
        assert_eq!(config.observer.quiet_window(), Duration::from_millis(100));
        assert_eq!(config.transport.retry_limit, 3);
        assert!(config.transport.abort_on_retry_exhaustion);
        assert_eq!(config.generator.id_range, IdRange::new(0, 0x7FF));
        assert_eq!(
            config.generator.patterns,
            vec![
                PayloadPattern::AllZero,
                PayloadPattern::AllOne,
                PayloadPattern::WalkingBit,
                PayloadPattern::Exhaustive,
            ]
        );
        assert!(config.virtual_bus.offline_after_sends.is_none());
        assert_eq!(config.virtual_bus.fail_next_sends, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_full_config() {
        let text = r#"
            [fuzzer]
            strategy = "brute"
            seed = 42
            max-iterations = 6

            [generator]
            id-range = { start = 0x100, end = 0x102 }
            payload-length = { min = 8, max = 8 }
            patterns = ["all-zero", "all-one", { fixed = [1, 2] }]

            [observer]
            quiet-window-ms = 50

            [classifier]
            ignore-ids = [0x3E8]
            reset-signatures = ["0x700#7F"]

            [[virtual-bus.ecu]]
            request-id = 0x100
            response = "0x108#01"
        "#;
        let config: CandriftConfig = toml::from_str(text).unwrap();
        assert_eq!(config.fuzzer.strategy, StrategyKind::Brute);
        assert_eq!(config.generator.patterns.len(), 3);
        assert_eq!(
            config.generator.patterns[2],
            PayloadPattern::Fixed(vec![1, 2])
        );
        assert_eq!(config.classifier.reset_signatures[0].id(), 0x700);
        assert_eq!(config.virtual_bus.ecu.len(), 1);
        assert!(config.validate().is_ok());

        let generator = config.strategy(SeedCorpus::new()).build().unwrap();
        assert_eq!(generator.name(), "brute");
        assert_eq!(generator.remaining(), Some(9));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<CandriftConfig>("[fuzzer]\nspeed = 3\n").is_err());
    }

    #[test]
    fn validate_catches_bad_parameters() {
        let mut config = CandriftConfig::default();
        config.generator.payload_length = LengthBounds::new(0, 12);
        assert_eq!(
            config.validate(),
            Err(ConfigError::PayloadLengthOutOfBounds(12))
        );

        let mut config = CandriftConfig::default();
        config.generator.id_range = IdRange::new(0x10, 0x0F);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyIdRange { .. })
        ));

        let mut config = CandriftConfig::default();
        config.fuzzer.max_iterations = Some(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroIterationBudget));

        let mut config = CandriftConfig::default();
        config.fuzzer.strategy = StrategyKind::Mutation;
        config.generator.mutation_rate = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMutationRate(0.0)));
    }

    #[test]
    fn mutation_strategy_without_corpus_fails_to_build() {
        let config = StrategyConfig::new(StrategyKind::Mutation, GeneratorSettings::default());
        assert!(matches!(config.build(), Err(ConfigError::EmptySeedCorpus)));
    }

    #[test]
    fn virtual_bus_failure_injection_is_configurable() {
        use crate::transport::{BusTransport, TransportError};

        let config: CandriftConfig = toml::from_str(
            r#"
            [virtual-bus]
            offline-after-sends = 1
            fail-next-sends = 2

            [[virtual-bus.ecu]]
            request-id = 0x7DF
            response = "7E8#41 00"
            "#,
        )
        .unwrap();
        assert_eq!(config.virtual_bus.offline_after_sends, Some(1));
        assert_eq!(config.virtual_bus.fail_next_sends, 2);

        let mut bus = config.virtual_bus.build_bus();
        let request = Frame::parse_directive("7DF#02 01 00").unwrap();
        for _ in 0..2 {
            assert!(matches!(bus.send(&request), Err(TransportError::Transient(_))));
        }
        bus.send(&request).unwrap();
        assert_eq!(
            bus.poll(Duration::from_millis(10)).unwrap(),
            Some(Frame::parse_directive("7E8#41 00").unwrap())
        );
        assert!(matches!(bus.send(&request), Err(TransportError::Offline(_))));
        assert_eq!(bus.sent(), &[request]);
    }

    #[test]
    fn offline_bus_config_parses_alone() {
        let config: CandriftConfig =
            toml::from_str("[virtual-bus]\noffline-after-sends = 1\n").unwrap();
        assert_eq!(config.virtual_bus.offline_after_sends, Some(1));
        assert!(config.virtual_bus.ecu.is_empty());
    }

    #[test]
    fn strategy_carries_seed_corpus_to_mutation() {
        let mut config = CandriftConfig::default();
        config.fuzzer.strategy = StrategyKind::Mutation;
        config.fuzzer.seed = 9;
        assert_eq!(
            config.strategy(SeedCorpus::new()).build().err(),
            Some(ConfigError::EmptySeedCorpus)
        );

        let corpus: SeedCorpus = [Frame::parse_directive("7DF#02 01 00").unwrap()]
            .into_iter()
            .collect();
        let strategy = config.strategy(corpus);
        assert_eq!(strategy.seed, 9);
        assert_eq!(strategy.seed_corpus.len(), 1);
        let mut generator = strategy.build().unwrap();
        let candidate = generator.next_candidate().unwrap().unwrap();
        assert_eq!(candidate.parent, Some(0));
    }
}
