pub mod baseline;
pub mod classifier;
pub mod config;
pub mod corpus;
pub mod executor;
pub mod frame;
pub mod generator;
pub mod mutator;
pub mod observer;
pub mod recorder;
pub mod report;
pub mod session;
pub mod transport;
pub mod virtual_bus;

pub use baseline::{Baseline, BaselineError, ExpectedResponse, ResponseShape};
pub use classifier::{Classifier, InterestReason, RuleClassifier, Verdict};
pub use config::{CandriftConfig, ConfigError, StopCondition, StrategyConfig, StrategyKind};
pub use corpus::{CorpusError, SeedCorpus};
pub use executor::{BusExecutor, BusFault, BusFaultKind, FuzzLoop, IterationOutcome, RetryPolicy};
pub use frame::{Frame, FrameError, IdWidth};
pub use generator::{
    BruteForceGenerator, Candidate, Generator, MutationGenerator, RandomGenerator,
    ReplayGenerator,
};
pub use mutator::Mutator;
pub use observer::{BusErrorKind, Observation, QuietWindowObserver};
pub use recorder::{Finding, RecorderError, ResultRecorder};
pub use report::{FinalReport, LogSink, ProgressSink};
pub use session::{SessionControl, SessionController, SessionError, SessionOutcome, SessionPhase};
pub use transport::{BusTransport, TransportError};
pub use virtual_bus::{VirtualBus, VirtualEcu};
