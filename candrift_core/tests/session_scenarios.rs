use candrift_core::classifier::RuleClassifier;
use candrift_core::config::CandriftConfig;
use candrift_core::corpus::SeedCorpus;
use candrift_core::frame::Frame;
use candrift_core::session::{
    AbortReason, CompletionReason, SessionController, SessionError, SessionOutcome, SessionPhase,
};
use candrift_core::virtual_bus::VirtualBus;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_temp(contents: &str, suffix: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Builds and starts a session the way the CLI does.
fn start_config(config: &CandriftConfig) -> SessionController<VirtualBus> {
    config.validate().unwrap();
    let seed_corpus = SeedCorpus::load_from_paths(&config.corpus.seed_paths).unwrap();
    let classifier = RuleClassifier::from_settings(&config.classifier).unwrap();
    let bus = config.virtual_bus.build_bus();

    let mut session = SessionController::new(bus);
    session
        .configure_strategy(config.strategy(seed_corpus))
        .unwrap();
    session.configure_classifier(Box::new(classifier)).unwrap();
    session.set_stop_condition(config.stop_condition()).unwrap();
    session
        .configure_bus(&config.observer, &config.transport)
        .unwrap();
    session.start().unwrap();
    session
}

fn run_config(config: &CandriftConfig) -> SessionController<VirtualBus> {
    let mut session = start_config(config);
    assert_eq!(session.run().unwrap(), SessionPhase::Completed);
    session
}

#[test]
fn brute_force_against_baseline_flags_silence_and_anomalies() {
    let baseline = write_temp(
        r#"
[[entry]]
id = 0x7DF
expect = "responds"
response-id = 0x7E8
payload-prefix = [0x41]
"#,
        ".toml",
    );
    let config: CandriftConfig = toml::from_str(&format!(
        r#"
[fuzzer]
strategy = "brute"
max-iterations = 100

[generator]
id-range = {{ start = 0x7DF, end = 0x7E0 }}
payload-length = {{ min = 2, max = 2 }}
patterns = ["all-zero", "walking-bit"]

[classifier]
baseline-path = '{}'

[[virtual-bus.ecu]]
request-id = 0x7DF
trigger-prefix = [0x80]
response = "7E8#7F 01"
"#,
        baseline.path().display()
    ))
    .unwrap();

    let session = run_config(&config);
    let report = session.report().unwrap();
    assert_eq!(
        report.outcome,
        SessionOutcome::Completed(CompletionReason::GeneratorExhausted)
    );
    assert!(report.generator_exhausted);
    // 0x7DF and 0x7E0 each get one all-zero and 16 walking-bit payloads.
    assert_eq!(report.iterations, 34);
    assert_eq!(report.verdicts.boring, 17);
    assert_eq!(report.findings.len(), 17);

    let anomalous: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.reason == "anomalous response")
        .collect();
    assert_eq!(anomalous.len(), 1);
    assert_eq!(anomalous[0].payload, "80 00");
    assert_eq!(anomalous[0].responses, vec!["0x7E8#7F 01".to_string()]);
    assert!(
        report
            .findings
            .iter()
            .all(|f| f.arbitration_id == "0x7DF")
    );

    let first_iterations: Vec<u64> = report.findings.iter().map(|f| f.first_iteration).collect();
    let mut sorted = first_iterations.clone();
    sorted.sort_unstable();
    assert_eq!(first_iterations, sorted);
}

#[test]
fn mutation_sessions_with_same_seed_send_identical_frames() {
    let corpus = write_temp(
        "// known-good OBD requests\n7DF#02 01 00\n7DF#02 01 0C\n\n7E0#03 22 F1 90\n",
        ".txt",
    );
    let config: CandriftConfig = toml::from_str(&format!(
        r#"
[fuzzer]
strategy = "mutation"
seed = 1234
max-iterations = 200

[generator]
mutation-rate = 0.5

[corpus]
seed-paths = ['{}']
"#,
        corpus.path().display()
    ))
    .unwrap();

    let first = run_config(&config).into_transport().unwrap();
    let second = run_config(&config).into_transport().unwrap();
    assert_eq!(first.sent().len(), 200);
    assert_eq!(first.sent(), second.sent());
    assert!(first.sent().iter().all(|f| f.payload().len() <= 8));
}

#[test]
fn replay_sends_directive_file_in_order_once() {
    let frames = [
        Frame::parse_directive("123#DEADBEEF").unwrap(),
        Frame::parse_directive("0x456#0x01 0x02").unwrap(),
        Frame::parse_directive("18DAF110#02 10 03").unwrap(),
    ];
    let directives = tempfile::NamedTempFile::new().unwrap();
    SeedCorpus::write_directives(directives.path(), &frames).unwrap();

    let config: CandriftConfig = toml::from_str(&format!(
        r#"
[fuzzer]
strategy = "replay"

[corpus]
seed-paths = ['{}']
"#,
        directives.path().display()
    ))
    .unwrap();

    let session = run_config(&config);
    assert_eq!(
        session.outcome(),
        Some(SessionOutcome::Completed(CompletionReason::GeneratorExhausted))
    );
    assert_eq!(session.iterations(), 3);
    assert_eq!(session.into_transport().unwrap().sent(), &frames);
}

#[test]
fn bus_going_offline_mid_session_aborts_with_fault() {
    let config: CandriftConfig = toml::from_str(
        r#"
[fuzzer]
strategy = "brute"
max-iterations = 50

[generator]
ids = [0x7DF]
payload-length = { min = 1, max = 1 }
patterns = ["walking-bit"]

[virtual-bus]
offline-after-sends = 3
"#,
    )
    .unwrap();

    let mut session = start_config(&config);
    match session.run() {
        Err(SessionError::BusFault(fault)) => {
            assert_eq!(fault.iteration, 4);
            assert_eq!(fault.last_sent, Some(Frame::parse_directive("7DF#20").unwrap()));
        }
        other => panic!("Expected bus fault, got {other:?}"),
    }
    let report = session.report().unwrap();
    assert_eq!(report.outcome, SessionOutcome::Aborted(AbortReason::BusFault));
    assert_eq!(report.iterations, 3);
    assert_eq!(session.into_transport().unwrap().sent().len(), 3);
}
