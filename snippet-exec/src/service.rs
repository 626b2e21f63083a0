//! Request handling: action-tagged JSON in, `{ success, message, data }` out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::SemaphorePermit;
use tracing::{error, info, instrument};

use crate::config::RunnerConfig;
use crate::engine;
use crate::error::Error;
use crate::script::packages::{self, Packages};
use crate::script::{OutputSink, RunOptions, ScriptSource};
use crate::state::{OperationInfo, RunnerState};
use crate::template::{numbered, CompilationUnit, Mode, UnitKind};
use crate::types::{
    CompileDiagnostic, EnvVars, ExecutionRequest, ExecutionResult, FailureStage, Response,
    ScriptResult, TestSummary, DEFAULT_CONTAINER, DEFAULT_NAMESPACE,
};

/// A handler for one family of actions.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, params: Value) -> Response;
}

fn default_true() -> bool {
    true
}

/// Parameters shared by the code and test runners.
#[derive(Debug, Clone, Deserialize)]
pub struct CodeParams {
    pub code: String,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub entry_method: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<Value>,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default = "default_true")]
    pub cleanup: bool,
    #[serde(default = "default_true")]
    pub return_output: bool,
}

impl CodeParams {
    pub fn into_request(self) -> ExecutionRequest {
        let mut request = ExecutionRequest::new(self.code)
            .with_container(self.class_name.unwrap_or_else(|| DEFAULT_CONTAINER.to_string()))
            .with_namespace(self.namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()))
            .with_imports(self.includes)
            .with_parameters(self.parameters)
            .keep_artifacts(!self.cleanup)
            .capture_output(self.return_output);
        if let Some(entry) = self.entry_method.filter(|e| !e.trim().is_empty()) {
            request = request.with_entry_point(entry);
        }
        if let Some(secs) = self.timeout.filter(|s| *s > 0) {
            request = request.with_timeout(Duration::from_secs(secs));
        }
        request
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CodeAction {
    Execute(CodeParams),
    Validate(CodeParams),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    #[serde(default)]
    pub script_name: Option<String>,
    #[serde(default)]
    pub python_path: Option<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default = "default_true")]
    pub cleanup: bool,
    #[serde(default)]
    pub packages: Option<Value>,
    #[serde(default)]
    pub requirements_file: Option<PathBuf>,
    #[serde(default)]
    pub virtual_env: Option<PathBuf>,
    #[serde(default)]
    pub env: EnvVars,
}

impl ScriptParams {
    fn options(&self) -> RunOptions {
        RunOptions {
            interpreter: self.python_path.clone(),
            virtual_env: self.virtual_env.clone(),
            working_dir: self.working_directory.clone(),
            timeout: self.timeout.filter(|s| *s > 0).map(Duration::from_secs),
            env: self.env.clone(),
        }
    }

    fn source(&self) -> Option<ScriptSource> {
        match (&self.code, &self.script_path) {
            (Some(code), _) if !code.trim().is_empty() => Some(ScriptSource::Inline(code.clone())),
            (_, Some(path)) => Some(ScriptSource::Path(path.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScriptAction {
    Execute(ScriptParams),
    Validate(ScriptParams),
    InstallPackage(ScriptParams),
    Create(ScriptParams),
}

/// Data of a code run.
#[derive(Debug, Clone, Serialize)]
pub struct CodeReport {
    #[serde(flatten)]
    pub result: ExecutionResult,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<CompileDiagnostic>,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_kind: Option<UnitKind>,
}

/// Data of a test run.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    #[serde(flatten)]
    pub summary: TestSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<CompileDiagnostic>,
    pub cached: bool,
}

/// Data of a compile-only check.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub unit_kind: UnitKind,
    pub diagnostics: Vec<CompileDiagnostic>,
    pub entries: Vec<String>,
    pub generated_code: String,
}

fn invalid_params(e: serde_json::Error) -> Response {
    Response::error(format!("Invalid parameters: {}", e), Value::Null)
}

async fn acquire(state: &RunnerState) -> Result<SemaphorePermit<'_>, Response> {
    state.permits.acquire().await.map_err(|e| {
        Response::error(
            format!("Failed to acquire execution permit: {}", e),
            Value::Null,
        )
    })
}

fn generation_failure(e: Error) -> Response {
    let message = e.to_string();
    error!("{}", message);
    Response::error(
        message.clone(),
        CodeReport {
            result: ExecutionResult::failure(FailureStage::Generation, message),
            diagnostics: Vec::new(),
            cached: false,
            unit_kind: None,
        },
    )
}

/// Compile-only validation shared by the code and test runners.
async fn validate_unit(
    state: &RunnerState,
    unit: &CompilationUnit,
    request: &ExecutionRequest,
) -> Response {
    let entries = unit
        .entries
        .iter()
        .map(|e| e.qualified_name())
        .collect::<Vec<_>>();
    match state.check(unit, request.timeout).await {
        Ok(checked) => {
            let report = ValidationReport {
                valid: true,
                unit_kind: unit.kind,
                diagnostics: checked.artifact.diagnostics.clone(),
                entries,
                generated_code: numbered(&unit.source),
            };
            state.finish(&checked.artifact, checked.lease, request.keep_artifacts);
            Response::success("Compilation succeeded", report)
        }
        Err(failure) => Response::error(
            failure.message,
            ValidationReport {
                valid: false,
                unit_kind: unit.kind,
                diagnostics: failure.diagnostics,
                entries,
                generated_code: numbered(&unit.source),
            },
        ),
    }
}

/// Compiles fragments or complete units and runs their entry point.
pub struct CodeRunner {
    state: Arc<RunnerState>,
}

impl CodeRunner {
    pub fn new(state: Arc<RunnerState>) -> Self {
        Self { state }
    }

    #[instrument(skip_all, fields(entry = %request.entry_point()))]
    pub async fn execute(&self, request: ExecutionRequest) -> Response {
        let state = &self.state;
        let unit = match state.generator.generate(&request, Mode::Run) {
            Ok(unit) => unit,
            Err(e) => return generation_failure(e),
        };

        let built = match state.build(&unit, request.timeout).await {
            Ok(built) => built,
            Err(failure) => {
                error!("Build failed at {:?}", failure.stage);
                let result = ExecutionResult::failure(failure.stage, failure.message.clone());
                return Response::error(
                    failure.message,
                    CodeReport {
                        result,
                        diagnostics: failure.diagnostics,
                        cached: false,
                        unit_kind: Some(unit.kind),
                    },
                );
            }
        };

        let mut result = engine::execute(Arc::clone(&built.module), &request, unit.kind).await;
        drop(built.module);
        state.finish(&built.artifact, built.lease, request.keep_artifacts);
        if !request.capture_output {
            result.captured_output.clear();
        }

        let report = CodeReport {
            diagnostics: built.artifact.diagnostics,
            cached: built.cached,
            unit_kind: Some(unit.kind),
            result,
        };
        if report.result.success {
            info!("Code executed successfully");
            Response::success("Code executed successfully", report)
        } else {
            Response::error(report.result.message.clone(), report)
        }
    }

    pub async fn validate(&self, request: ExecutionRequest) -> Response {
        match self.state.generator.generate(&request, Mode::Run) {
            Ok(unit) => validate_unit(&self.state, &unit, &request).await,
            Err(e) => generation_failure(e),
        }
    }
}

#[async_trait]
impl Tool for CodeRunner {
    fn name(&self) -> &'static str {
        "code"
    }

    #[instrument(skip_all, name = "code")]
    async fn handle(&self, params: Value) -> Response {
        let action: CodeAction = match serde_json::from_value(params) {
            Ok(action) => action,
            Err(e) => return invalid_params(e),
        };
        let _permit = match acquire(&self.state).await {
            Ok(permit) => permit,
            Err(response) => return response,
        };
        let _operation = self.state.operations.begin("code");
        match action {
            CodeAction::Execute(params) => self.execute(params.into_request()).await,
            CodeAction::Validate(params) => self.validate(params.into_request()).await,
        }
    }
}

/// Compiles a fixture and runs its `#[test]` methods.
pub struct TestRunner {
    state: Arc<RunnerState>,
}

impl TestRunner {
    pub fn new(state: Arc<RunnerState>) -> Self {
        Self { state }
    }

    #[instrument(skip_all)]
    pub async fn execute(&self, request: ExecutionRequest) -> Response {
        let state = &self.state;
        let unit = match state.generator.generate(&request, Mode::Test) {
            Ok(unit) => unit,
            Err(e) => return generation_failure(e),
        };
        if !unit.entries.iter().any(|e| e.is_test()) {
            return Response::error(
                "No test methods found; test methods must be `pub fn` items marked #[test]",
                TestSummary::default(),
            );
        }

        let built = match state.build(&unit, request.timeout).await {
            Ok(built) => built,
            Err(failure) => {
                return Response::error(
                    failure.message.clone(),
                    CodeReport {
                        result: ExecutionResult::failure(failure.stage, failure.message),
                        diagnostics: failure.diagnostics,
                        cached: false,
                        unit_kind: Some(unit.kind),
                    },
                )
            }
        };

        let summary = engine::run_tests(Arc::clone(&built.module), &request).await;
        drop(built.module);
        state.finish(&built.artifact, built.lease, request.keep_artifacts);

        let message = format!(
            "{} of {} tests passed, {} failed",
            summary.passed, summary.total, summary.failed
        );
        info!("{}", message);
        let report = TestReport {
            summary,
            diagnostics: built.artifact.diagnostics,
            cached: built.cached,
        };
        if report.summary.all_passed() {
            Response::success(message, report)
        } else {
            Response::error(message, report)
        }
    }

    pub async fn validate(&self, request: ExecutionRequest) -> Response {
        match self.state.generator.generate(&request, Mode::Test) {
            Ok(unit) => validate_unit(&self.state, &unit, &request).await,
            Err(e) => generation_failure(e),
        }
    }
}

#[async_trait]
impl Tool for TestRunner {
    fn name(&self) -> &'static str {
        "tests"
    }

    #[instrument(skip_all, name = "tests")]
    async fn handle(&self, params: Value) -> Response {
        let action: CodeAction = match serde_json::from_value(params) {
            Ok(action) => action,
            Err(e) => return invalid_params(e),
        };
        let _permit = match acquire(&self.state).await {
            Ok(permit) => permit,
            Err(response) => return response,
        };
        let _operation = self.state.operations.begin("tests");
        match action {
            CodeAction::Execute(params) => self.execute(params.into_request()).await,
            CodeAction::Validate(params) => self.validate(params.into_request()).await,
        }
    }
}

/// Runs Python scripts and manages their packages.
pub struct ScriptRunner {
    state: Arc<RunnerState>,
}

impl ScriptRunner {
    pub fn new(state: Arc<RunnerState>) -> Self {
        Self { state }
    }

    /// Runs a script, forwarding each output line to `sink` as it arrives.
    #[instrument(skip_all)]
    pub async fn execute(&self, params: &ScriptParams, sink: Option<OutputSink>) -> Response {
        let Some(source) = params.source() else {
            return Response::error("Either code or script_path is required", Value::Null);
        };
        let run = match self.state.scripts.run(source, params.options(), sink).await {
            Ok(run) => run,
            Err(e) => return script_error(e),
        };
        if params.cleanup {
            if let Some(path) = &run.script_path {
                self.state.cleanup.cleanup_file(path).await;
            }
        }

        let result = run.result;
        if result.timed_out {
            let secs = params
                .timeout
                .unwrap_or(self.state.config.python.default_timeout.as_secs());
            Response::error(format!("Script timed out after {} seconds", secs), result)
        } else if result.success {
            Response::success("Script executed successfully", result)
        } else {
            Response::error(
                format!("Script failed with exit code {}", result.exit_code),
                result,
            )
        }
    }

    pub async fn validate(&self, params: &ScriptParams) -> Response {
        let Some(source) = params.source() else {
            return Response::error("Either code or script_path is required", Value::Null);
        };
        let run = match self.state.scripts.validate(source, &params.options()).await {
            Ok(run) => run,
            Err(e) => return script_error(e),
        };
        if let Some(path) = &run.script_path {
            self.state.cleanup.cleanup_file(path).await;
        }
        if run.result.success {
            Response::success("Syntax is valid", run.result)
        } else {
            Response::error("Syntax errors found", run.result)
        }
    }

    pub async fn install_package(&self, params: &ScriptParams) -> Response {
        let packages = match (&params.requirements_file, &params.packages) {
            (Some(path), _) => Packages::Requirements(path.clone()),
            (None, Some(value)) => Packages::Named(Packages::from_value(value)),
            (None, None) => {
                return Response::error(
                    "Either packages or requirements_file is required",
                    Value::Null,
                )
            }
        };
        match self.state.scripts.install(&packages, &params.options()).await {
            Ok(result) if result.success => Response::success("Packages installed", result),
            Ok(result) if result.timed_out => {
                Response::error("Package installation timed out", result)
            }
            Ok(result) => Response::error("Package installation failed", result),
            Err(e) => script_error(e),
        }
    }

    pub async fn create(&self, params: &ScriptParams) -> Response {
        let path = match &params.script_path {
            Some(path) => path.clone(),
            None => match packages::default_script_path(params.script_name.as_deref()) {
                Ok(path) => path,
                Err(e) => return script_error(e),
            },
        };
        let content = params.code.clone().unwrap_or_default();
        match packages::create(&path, &content).await {
            Ok(path) => Response::success(
                format!("Created {}", path.display()),
                serde_json::json!({ "path": path }),
            ),
            Err(e) => script_error(e),
        }
    }
}

fn script_error(e: Error) -> Response {
    error!("Script operation failed: {}", e);
    Response::error(e.to_string(), ScriptResult::default())
}

#[async_trait]
impl Tool for ScriptRunner {
    fn name(&self) -> &'static str {
        "python"
    }

    #[instrument(skip_all, name = "python")]
    async fn handle(&self, params: Value) -> Response {
        let action: ScriptAction = match serde_json::from_value(params) {
            Ok(action) => action,
            Err(e) => return invalid_params(e),
        };
        let _permit = match acquire(&self.state).await {
            Ok(permit) => permit,
            Err(response) => return response,
        };
        let _operation = self.state.operations.begin("python");
        match action {
            ScriptAction::Execute(params) => self.execute(&params, None).await,
            ScriptAction::Validate(params) => self.validate(&params).await,
            ScriptAction::InstallPackage(params) => self.install_package(&params).await,
            ScriptAction::Create(params) => self.create(&params).await,
        }
    }
}

/// The three runners over one shared state.
#[derive(Clone)]
pub struct SnippetService {
    state: Arc<RunnerState>,
    code: Arc<CodeRunner>,
    tests: Arc<TestRunner>,
    scripts: Arc<ScriptRunner>,
}

impl SnippetService {
    pub fn new(config: RunnerConfig) -> Result<Self, Error> {
        Ok(Self::from_state(Arc::new(RunnerState::new(config)?)))
    }

    pub fn from_state(state: Arc<RunnerState>) -> Self {
        Self {
            code: Arc::new(CodeRunner::new(Arc::clone(&state))),
            tests: Arc::new(TestRunner::new(Arc::clone(&state))),
            scripts: Arc::new(ScriptRunner::new(Arc::clone(&state))),
            state,
        }
    }

    pub fn state(&self) -> &Arc<RunnerState> {
        &self.state
    }

    pub async fn code(&self, params: Value) -> Response {
        self.code.handle(params).await
    }

    pub async fn tests(&self, params: Value) -> Response {
        self.tests.handle(params).await
    }

    pub async fn python(&self, params: Value) -> Response {
        self.scripts.handle(params).await
    }

    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![
            self.code.clone() as Arc<dyn Tool>,
            self.tests.clone() as Arc<dyn Tool>,
            self.scripts.clone() as Arc<dyn Tool>,
        ]
    }

    pub fn get_available_slots(&self) -> usize {
        self.state.permits.available_permits()
    }

    pub fn active_operations(&self) -> Vec<OperationInfo> {
        self.state.operations.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service(dir: &std::path::Path) -> Result<SnippetService, Error> {
        SnippetService::new(RunnerConfig::default().with_scratch_dir(dir).with_max_concurrent(2))
    }

    #[test]
    fn code_params_map_onto_requests() -> Result<(), Error> {
        let action: CodeAction = serde_json::from_value(json!({
            "action": "execute",
            "code": "return 1;",
            "class_name": "Calc",
            "entry_method": "go",
            "includes": ["std::rc::Rc"],
            "parameters": [1, "two"],
            "timeout": 5,
            "cleanup": false,
            "return_output": false
        }))?;
        let CodeAction::Execute(params) = action else {
            panic!("expected execute");
        };
        let request = params.into_request();
        assert_eq!(request.container, "Calc");
        assert_eq!(request.namespace, DEFAULT_NAMESPACE);
        assert_eq!(request.entry_point(), "go");
        assert_eq!(request.timeout, Duration::from_secs(5));
        assert!(request.keep_artifacts);
        assert!(!request.capture_output);
        Ok(())
    }

    #[test]
    fn script_actions_use_snake_case_names() -> Result<(), Error> {
        let action: ScriptAction = serde_json::from_value(json!({
            "action": "install_package",
            "packages": "requests,numpy"
        }))?;
        assert!(matches!(action, ScriptAction::InstallPackage(_)));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_actions_are_rejected() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let response = service(dir.path())?.code(json!({ "action": "compile", "code": "x" })).await;
        assert!(!response.success);
        assert!(response.message.starts_with("Invalid parameters"));
        Ok(())
    }

    #[tokio::test]
    async fn generation_errors_report_their_stage() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let response = service(dir.path())?
            .code(json!({ "action": "execute", "code": "   " }))
            .await;
        assert!(!response.success);
        assert_eq!(response.data["stage"], "generation");
        Ok(())
    }

    #[tokio::test]
    async fn scripts_need_code_or_path() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let response = service(dir.path())?.python(json!({ "action": "execute" })).await;
        assert!(!response.success);
        assert_eq!(response.message, "Either code or script_path is required");
        Ok(())
    }

    #[tokio::test]
    async fn permits_and_operations_are_released() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let service = service(dir.path())?;
        assert_eq!(service.get_available_slots(), 2);
        service.tests(json!({ "action": "execute", "code": "" })).await;
        assert_eq!(service.get_available_slots(), 2);
        assert!(service.active_operations().is_empty());
        assert_eq!(service.tools().len(), 3);
        Ok(())
    }
}
