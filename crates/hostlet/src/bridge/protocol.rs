//! Wire protocol types for launcher ↔ test-host communication.
//!
//! Control kinds occupy the first registry slots on every connection; domain
//! kinds (discovery, execution) are appended after them. The frame terminator
//! carries the kind ID, so these types serialize as plain JSON objects with
//! no tag field of their own.

use serde::{Deserialize, Serialize};

use super::registry::MessageRegistry;

/// Severity used both to tag relayed diagnostics and as the child-side
/// outbound filter threshold.
///
/// Integer-encoded on the wire; the ordering is part of the protocol contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum LogLevel {
    None = 0,
    Verbose = 1,
    Detailed = 2,
    Informational = 3,
    Warning = 4,
    Error = 5,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Informational
    }
}

impl From<u8> for LogLevel {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Verbose,
            2 => Self::Detailed,
            3 => Self::Informational,
            4 => Self::Warning,
            5 => Self::Error,
            // Unknown severities from a newer peer degrade to the default
            // rather than failing the whole frame.
            _ => Self::Informational,
        }
    }
}

impl From<LogLevel> for u8 {
    fn from(value: LogLevel) -> Self {
        value as u8
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Verbose => "verbose",
            Self::Detailed => "detailed",
            Self::Informational => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Start-work parameters embedded in every request message.
///
/// The log level doubles as the child's outbound relay threshold: the test
/// host suppresses diagnostics below it instead of flooding the pipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Parameters {
    pub fn with_log_level(log_level: LogLevel) -> Self {
        Self { log_level }
    }
}

/// Request types that carry [`Parameters`]. The registry records an extractor
/// per such type so the dispatch loop can observe the embedded threshold
/// without knowing concrete domain types.
pub trait WorkRequest {
    fn parameters(&self) -> &Parameters;
}

impl WorkRequest for Parameters {
    fn parameters(&self) -> &Parameters {
        self
    }
}

/// Child→parent diagnostic relay. Processed strictly in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub text: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }
}

/// Parent→child notice that no further application messages will be sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AboutToStop {}

/// Bidirectional shutdown message.
///
/// Parent→child: cooperative (or, with `abort`, cancelled) shutdown.
/// Child→parent: "I have finished draining" acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stop {
    #[serde(default)]
    pub abort: bool,
}

/// Ask the test host to discover the tests in the given sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    #[serde(default)]
    pub parameters: Parameters,
    pub sources: Vec<String>,
}

impl WorkRequest for DiscoveryRequest {
    fn parameters(&self) -> &Parameters {
        &self.parameters
    }
}

/// One discovered test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseInfo {
    pub fully_qualified_name: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

/// Child→parent discovery result for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredTests {
    pub source: String,
    pub tests: Vec<TestCaseInfo>,
}

/// A concrete (source, test) pair selected for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSelection {
    pub source: String,
    pub fully_qualified_name: String,
}

/// Ask the test host to run tests: either everything in `sources`, or only
/// the explicit `selection`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub parameters: Parameters,
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Vec<TestSelection>>,
}

impl WorkRequest for ExecutionRequest {
    fn parameters(&self) -> &Parameters {
        &self.parameters
    }
}

/// Terminal outcome of one test case, carried as a value instead of
/// exception-shaped control flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed { message: String },
    Skipped { reason: String },
    SetupFailed { message: String },
    CleanupFailed { message: String },
}

impl TestOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    /// The failure/skip text, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Passed => None,
            Self::Failed { message }
            | Self::SetupFailed { message }
            | Self::CleanupFailed { message } => Some(message),
            Self::Skipped { reason } => Some(reason),
        }
    }
}

/// One executed test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResultInfo {
    pub display_name: String,
    #[serde(flatten)]
    pub outcome: TestOutcome,
    pub duration_millis: u64,
    /// Name of the (virtual or real) device the test ran against.
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
}

/// Child→parent streamed batch of execution results. A run typically produces
/// several of these before completing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResultBatch {
    pub results: Vec<TestResultInfo>,
}

/// Child→parent total number of test cases an execution run will report,
/// letting the requester know when all results have arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseCount {
    pub count: u32,
}

/// Registry carrying the core control kinds plus the standard discovery and
/// execution vocabulary, in the fixed order both ends must share.
pub fn standard_registry() -> MessageRegistry {
    let mut registry = MessageRegistry::with_core();
    registry.register_request::<DiscoveryRequest>();
    registry.register::<DiscoveredTests>();
    registry.register_request::<ExecutionRequest>();
    registry.register::<TestResultBatch>();
    registry.register::<TestCaseCount>();
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_level_ordering() {
        assert!(LogLevel::None < LogLevel::Verbose);
        assert!(LogLevel::Verbose < LogLevel::Detailed);
        assert!(LogLevel::Detailed < LogLevel::Informational);
        assert!(LogLevel::Informational < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn log_level_encodes_as_integer() {
        assert_eq!(
            serde_json::to_value(LogLevel::Warning).unwrap(),
            json!(4)
        );
        let level: LogLevel = serde_json::from_value(json!(1)).unwrap();
        assert_eq!(level, LogLevel::Verbose);
    }

    #[test]
    fn unknown_log_level_degrades_to_default() {
        let level: LogLevel = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(level, LogLevel::Informational);
    }

    #[test]
    fn parameters_tolerate_absent_fields() {
        let params: Parameters = serde_json::from_str("{}").unwrap();
        assert_eq!(params.log_level, LogLevel::Informational);
    }

    #[test]
    fn stop_serializes() {
        assert_eq!(
            serde_json::to_value(Stop { abort: true }).unwrap(),
            json!({"abort": true})
        );
        let stop: Stop = serde_json::from_str("{}").unwrap();
        assert!(!stop.abort);
    }

    #[test]
    fn about_to_stop_is_empty_object() {
        assert_eq!(serde_json::to_value(AboutToStop {}).unwrap(), json!({}));
    }

    #[test]
    fn discovery_request_roundtrips() {
        let req = DiscoveryRequest {
            parameters: Parameters::with_log_level(LogLevel::Verbose),
            sources: vec!["tests.bin".to_string()],
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({"parameters": {"log_level": 1}, "sources": ["tests.bin"]})
        );
        let parsed: DiscoveryRequest = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_case_info_omits_defaults() {
        let case = TestCaseInfo {
            fully_qualified_name: "suite.blink".to_string(),
            display_name: "blink".to_string(),
            source_file: None,
            line: None,
            categories: Vec::new(),
        };
        assert_eq!(
            serde_json::to_value(&case).unwrap(),
            json!({"fully_qualified_name": "suite.blink", "display_name": "blink"})
        );
    }

    #[test]
    fn outcome_tags_by_variant() {
        assert_eq!(
            serde_json::to_value(TestOutcome::Passed).unwrap(),
            json!({"outcome": "passed"})
        );
        assert_eq!(
            serde_json::to_value(TestOutcome::Failed {
                message: "assert failed".to_string()
            })
            .unwrap(),
            json!({"outcome": "failed", "message": "assert failed"})
        );
        assert_eq!(
            serde_json::to_value(TestOutcome::Skipped {
                reason: "cancelled".to_string()
            })
            .unwrap(),
            json!({"outcome": "skipped", "reason": "cancelled"})
        );
    }

    #[test]
    fn result_info_flattens_outcome() {
        let result = TestResultInfo {
            display_name: "blink".to_string(),
            outcome: TestOutcome::SetupFailed {
                message: "no device".to_string(),
            },
            duration_millis: 12,
            device_name: "virtual-0".to_string(),
            output: vec!["line".to_string()],
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({
                "display_name": "blink",
                "outcome": "setup_failed",
                "message": "no device",
                "duration_millis": 12,
                "device_name": "virtual-0",
                "output": ["line"],
            })
        );
        let parsed: TestResultInfo = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, result);
    }

    #[test]
    fn outcome_message_accessor() {
        assert_eq!(TestOutcome::Passed.message(), None);
        let skipped = TestOutcome::Skipped {
            reason: "board unplugged".to_string(),
        };
        assert_eq!(skipped.message(), Some("board unplugged"));
    }

    #[test]
    fn standard_registry_is_order_stable() {
        let a = standard_registry();
        let b = standard_registry();
        assert_eq!(a.len(), b.len());
        assert_eq!(
            a.kind_of::<DiscoveryRequest>(),
            b.kind_of::<DiscoveryRequest>()
        );
        assert_eq!(a.kind_of::<TestCaseCount>(), b.kind_of::<TestCaseCount>());
    }
}
