use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "snippet";
pub const DEFAULT_CONTAINER: &str = "Snippet";
pub const DEFAULT_ENTRY_POINT: &str = "run";

/// Snippet execution request, built once per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Source text as submitted by the caller
    pub source_text: String,
    /// Method to invoke, `run` when absent
    #[serde(default)]
    pub entry_point: Option<String>,
    /// Type wrapping a fragment
    #[serde(default = "default_container")]
    pub container: String,
    /// Module wrapping the container
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Extra `use` paths added to wrapped fragments
    #[serde(default)]
    pub imports: Vec<String>,
    /// Positional arguments for the entry point
    #[serde(default)]
    pub parameters: Vec<serde_json::Value>,
    /// Compilation deadline
    #[serde(with = "duration_serde", default = "default_timeout")]
    pub timeout: Duration,
    /// Keep the build directory for reuse by identical requests
    #[serde(default)]
    pub keep_artifacts: bool,
    /// Return what the invocation wrote to stdout
    #[serde(default = "default_true")]
    pub capture_output: bool,
}

impl ExecutionRequest {
    pub fn new(source_text: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
            entry_point: None,
            container: default_container(),
            namespace: default_namespace(),
            imports: Vec::new(),
            parameters: Vec::new(),
            timeout: default_timeout(),
            keep_artifacts: false,
            capture_output: true,
        }
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = Some(entry_point.into());
        self
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = container.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_imports(mut self, imports: Vec<String>) -> Self {
        self.imports = imports;
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<serde_json::Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn keep_artifacts(mut self, keep: bool) -> Self {
        self.keep_artifacts = keep;
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn entry_point(&self) -> &str {
        self.entry_point.as_deref().unwrap_or(DEFAULT_ENTRY_POINT)
    }
}

/// Severity of a compiler message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileDiagnostic {
    pub severity: Severity,
    pub message: String,
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl CompileDiagnostic {
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for CompileDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Line {}, Column {}: ", self.line, self.column)?;
        if let Some(code) = &self.code {
            write!(f, "[{}] ", code)?;
        }
        write!(f, "{}", self.message)
    }
}

/// Files produced for one cache key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub build_dir: PathBuf,
    pub source_path: PathBuf,
    pub module_path: PathBuf,
    #[serde(default)]
    pub diagnostics: Vec<CompileDiagnostic>,
}

/// Pipeline stage a failed result stopped at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Generation,
    Compilation,
    CompileTimeout,
    Load,
    Invocation,
    Process,
}

/// Terminal value of a snippet execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub message: String,
    pub captured_output: String,
    pub return_value: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<FailureStage>,
}

impl ExecutionResult {
    pub fn failure(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            captured_output: String::new(),
            return_value: "null".to_string(),
            duration_ms: 0,
            stack_trace: None,
            stage: Some(stage),
        }
    }
}

/// Classified result of one test method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Inconclusive,
    Ignored,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Outcome::Fail)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub name: String,
    pub outcome: Outcome,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub duration_ms: u64,
    /// Standard output written while the test ran
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub outcomes: Vec<TestOutcome>,
}

impl TestSummary {
    pub fn from_outcomes(outcomes: Vec<TestOutcome>) -> Self {
        let passed = outcomes.iter().filter(|o| o.success).count();
        Self {
            total: outcomes.len(),
            passed,
            failed: outcomes.len() - passed,
            outcomes,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Result of an interpreter subprocess run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptResult {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

/// Caller-facing envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Response {
    pub fn success(message: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn error(message: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Environment overrides for child processes
pub type EnvVars = HashMap<String, String>;

fn default_container() -> String {
    DEFAULT_CONTAINER.to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_apply_when_fields_missing() {
        let request: ExecutionRequest =
            serde_json::from_str(r#"{ "source_text": "return 1;" }"#).unwrap();
        assert_eq!(request.namespace, DEFAULT_NAMESPACE);
        assert_eq!(request.container, DEFAULT_CONTAINER);
        assert_eq!(request.entry_point(), DEFAULT_ENTRY_POINT);
        assert_eq!(request.timeout, Duration::from_secs(30));
        assert!(request.capture_output);
        assert!(!request.keep_artifacts);
    }

    #[test]
    fn diagnostic_display_names_line_and_column() {
        let diagnostic = CompileDiagnostic {
            severity: Severity::Error,
            message: "expected expression, found `;`".into(),
            line: 7,
            column: 23,
            code: None,
        };
        assert_eq!(
            diagnostic.to_string(),
            "Line 7, Column 23: expected expression, found `;`"
        );
    }

    #[test]
    fn summary_counts_non_failures_as_passed() {
        let outcome = |name: &str, outcome: Outcome| TestOutcome {
            name: name.into(),
            outcome,
            success: outcome.is_success(),
            message: String::new(),
            stack_trace: None,
            duration_ms: 0,
            output: String::new(),
        };
        let summary = TestSummary::from_outcomes(vec![
            outcome("a", Outcome::Pass),
            outcome("b", Outcome::Fail),
            outcome("c", Outcome::Ignored),
        ]);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
        assert!(!summary.all_passed());
    }
}
