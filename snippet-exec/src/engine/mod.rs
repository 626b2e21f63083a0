//! Finds and invokes entries of a loaded module.

pub mod capture;
pub mod outcome;
pub mod params;

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::module::{CompiledModule, Fault, Invokable, Reply};
use crate::template::{Role, UnitKind};
use crate::types::{
    ExecutionRequest, ExecutionResult, FailureStage, Outcome, TestOutcome, TestSummary,
};

pub use outcome::classify;

pub const NO_CANDIDATES: &str = "No executable public static methods found in the module";

/// Names never picked by the broad scan over complete units.
const SKIPPED_NAMES: &[&str] = &["new", "default", "drop", "fmt", "clone"];

/// What a single invocation produced.
#[derive(Debug)]
pub struct Invocation {
    pub reply: Result<Reply, Error>,
    pub output: String,
    pub duration_ms: u64,
}

/// Invokes `target` on a blocking thread, capturing stdout when asked to.
pub async fn invoke(target: &Invokable, args: Vec<String>, capture_output: bool) -> Invocation {
    let target = target.clone();
    let start = Instant::now();
    let joined = tokio::task::spawn_blocking(move || {
        if capture_output {
            match capture::captured(|| target.invoke(&args)) {
                Ok((reply, output)) => (reply, output),
                Err(e) => (Err(e), String::new()),
            }
        } else {
            (target.invoke(&args), String::new())
        }
    })
    .await;

    let (reply, output) = match joined {
        Ok(pair) => pair,
        Err(e) => (
            Err(Error::Invocation(format!("Invocation thread failed: {}", e))),
            String::new(),
        ),
    };
    Invocation {
        reply,
        output,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

/// Candidates in the order they should be tried.
pub fn discover(
    module: &Arc<dyn CompiledModule>,
    request: &ExecutionRequest,
    kind: UnitKind,
) -> Vec<Invokable> {
    let all = Invokable::all(module);
    let namespace: Vec<&str> = request.namespace.split("::").map(str::trim).collect();
    let on_container = |target: &Invokable| {
        let descriptor = target.descriptor();
        descriptor.role == Role::Method
            && descriptor.owner.as_deref() == Some(request.container.as_str())
            && descriptor.module_path.iter().map(String::as_str).eq(namespace.iter().copied())
    };

    if let Some(exact) = all
        .iter()
        .find(|t| on_container(*t) && t.name() == request.entry_point())
    {
        debug!("Using requested entry point {}", exact.qualified_name());
        return vec![exact.clone()];
    }

    if let Some(first) = all.iter().find(|t| on_container(*t)) {
        debug!(
            "Entry point {} not found, using first method {}",
            request.entry_point(),
            first.qualified_name()
        );
        return vec![first.clone()];
    }

    if kind != UnitKind::Complete {
        return Vec::new();
    }

    all.into_iter()
        .filter(|t| {
            let descriptor = t.descriptor();
            descriptor.role == Role::Method
                && !descriptor.has_receiver()
                && !is_skipped_name(&descriptor.name)
        })
        .collect()
}

fn is_skipped_name(name: &str) -> bool {
    name.starts_with("get_") || name.starts_with("set_") || SKIPPED_NAMES.contains(&name)
}

/// Runs the discovered entry point and reports the outcome.
///
/// With several candidates (complete units without a matching container),
/// the first one that completes without a fault wins; if none does, the
/// first failure is reported.
pub async fn execute(
    module: Arc<dyn CompiledModule>,
    request: &ExecutionRequest,
    kind: UnitKind,
) -> ExecutionResult {
    let candidates = discover(&module, request, kind);
    if candidates.is_empty() {
        warn!("{}", NO_CANDIDATES);
        return ExecutionResult::failure(FailureStage::Invocation, NO_CANDIDATES);
    }

    let mut first_failure: Option<ExecutionResult> = None;
    for target in &candidates {
        let args = params::coerce_all(&request.parameters, &target.parameter_shapes());
        let invocation = invoke(target, args, request.capture_output).await;
        let result = into_result(target, invocation);
        if result.success {
            info!("Executed {} in {}ms", target.qualified_name(), result.duration_ms);
            return result;
        }
        debug!("{} failed: {}", target.qualified_name(), result.message);
        first_failure.get_or_insert(result);
    }

    let failure = first_failure
        .unwrap_or_else(|| ExecutionResult::failure(FailureStage::Invocation, NO_CANDIDATES));
    error!("Execution failed: {}", failure.message);
    failure
}

fn into_result(target: &Invokable, invocation: Invocation) -> ExecutionResult {
    let Invocation {
        reply,
        output,
        duration_ms,
    } = invocation;
    match reply {
        Ok(Reply::Fault(fault)) => ExecutionResult {
            success: false,
            message: format!(
                "{} raised {}: {}",
                target.qualified_name(),
                fault.kind,
                fault.message
            ),
            captured_output: output,
            return_value: "null".to_string(),
            duration_ms,
            stack_trace: fault.trace,
            stage: Some(FailureStage::Invocation),
        },
        Ok(reply) => ExecutionResult {
            success: true,
            message: format!("Executed {}", target.qualified_name()),
            captured_output: output,
            return_value: reply.return_value().unwrap_or_else(|| "null".to_string()),
            duration_ms,
            stack_trace: None,
            stage: None,
        },
        Err(e) => ExecutionResult {
            success: false,
            message: e.to_string(),
            captured_output: output,
            return_value: "null".to_string(),
            duration_ms,
            stack_trace: None,
            stage: Some(FailureStage::Invocation),
        },
    }
}

/// Runs every `#[test]` entry in declaration order.
///
/// The setup entry of the same type runs before each test and its teardown
/// after, whatever the test did. Teardown failures are only logged.
pub async fn run_tests(module: Arc<dyn CompiledModule>, request: &ExecutionRequest) -> TestSummary {
    let all = Invokable::all(&module);
    let hook = |role: Role, owner: Option<String>| {
        all.iter()
            .find(|t| t.descriptor().role == role && t.descriptor().owner_path() == owner)
            .cloned()
    };

    let mut outcomes = Vec::new();
    for test in all.iter().filter(|t| t.descriptor().is_test()) {
        let name = test.qualified_name();
        if test.descriptor().ignored {
            debug!("Skipping ignored test {}", name);
            outcomes.push(TestOutcome {
                name,
                outcome: Outcome::Ignored,
                success: true,
                message: "Ignored".to_string(),
                stack_trace: None,
                duration_ms: 0,
                output: String::new(),
            });
            continue;
        }

        let owner = test.descriptor().owner_path();
        let setup = hook(Role::Setup, owner.clone());
        let teardown = hook(Role::Teardown, owner);
        let start = Instant::now();
        let mut output = String::new();

        let setup_failure = match &setup {
            Some(setup) => {
                let invocation = invoke(setup, Vec::new(), request.capture_output).await;
                output.push_str(&invocation.output);
                failure_text(&invocation.reply).map(|text| format!("Setup failed: {}", text))
            }
            None => None,
        };

        let mut outcome = match setup_failure {
            Some(message) => TestOutcome {
                name: name.clone(),
                outcome: Outcome::Fail,
                success: false,
                message,
                stack_trace: None,
                duration_ms: 0,
                output: String::new(),
            },
            None => {
                let invocation = invoke(test, Vec::new(), request.capture_output).await;
                output.push_str(&invocation.output);
                test_outcome(&name, invocation.reply)
            }
        };

        if let Some(teardown) = &teardown {
            let invocation = invoke(teardown, Vec::new(), request.capture_output).await;
            output.push_str(&invocation.output);
            if let Some(text) = failure_text(&invocation.reply) {
                warn!("Teardown after {} failed: {}", name, text);
            }
        }

        outcome.duration_ms = start.elapsed().as_millis() as u64;
        outcome.output = output;
        info!("Test {} finished: {:?}", name, outcome.outcome);
        outcomes.push(outcome);
    }

    TestSummary::from_outcomes(outcomes)
}

fn failure_text(reply: &Result<Reply, Error>) -> Option<String> {
    match reply {
        Ok(Reply::Fault(fault)) => Some(format!("{}: {}", fault.kind, fault.message)),
        Ok(_) => None,
        Err(e) => Some(e.to_string()),
    }
}

fn test_outcome(name: &str, reply: Result<Reply, Error>) -> TestOutcome {
    let (outcome, message, stack_trace) = match reply {
        Ok(Reply::Fault(fault)) => {
            let outcome = classify(&fault);
            let Fault {
                kind,
                message,
                trace,
            } = fault;
            let message = match outcome {
                Outcome::Fail => format!("{}: {}", kind, message),
                _ if message.is_empty() => format!("{:?}", outcome),
                _ => message,
            };
            let trace = if outcome == Outcome::Fail { trace } else { None };
            (outcome, message, trace)
        }
        Ok(_) => (Outcome::Pass, "Passed".to_string(), None),
        Err(e) => (Outcome::Fail, e.to_string(), None),
    };
    TestOutcome {
        name: name.to_string(),
        outcome,
        success: outcome.is_success(),
        message,
        stack_trace,
        duration_ms: 0,
        output: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{EntryDescriptor, ParamDescriptor, Receiver, Shape};
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Behaviour = Box<dyn Fn(&[String]) -> Reply + Send + Sync>;

    /// In-memory module: each entry answers through a closure.
    struct FakeModule {
        entries: Vec<EntryDescriptor>,
        behaviours: HashMap<u32, Behaviour>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeModule {
        fn new() -> Self {
            Self {
                entries: Vec::new(),
                behaviours: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn entry(
            mut self,
            module_path: &[&str],
            owner: Option<&str>,
            name: &str,
            role: Role,
            behaviour: impl Fn(&[String]) -> Reply + Send + Sync + 'static,
        ) -> Self {
            let index = self.entries.len() as u32;
            self.entries.push(EntryDescriptor {
                index,
                module_path: module_path.iter().map(|s| s.to_string()).collect(),
                owner: owner.map(str::to_string),
                name: name.to_string(),
                receiver: Receiver::None,
                params: Vec::new(),
                returns_value: true,
                role,
                ignored: false,
                line: index as usize + 1,
            });
            self.behaviours.insert(index, Box::new(behaviour));
            self
        }

        fn with_params(mut self, params: &[Shape]) -> Self {
            if let Some(last) = self.entries.last_mut() {
                last.params = params
                    .iter()
                    .enumerate()
                    .map(|(i, shape)| ParamDescriptor {
                        name: format!("p{}", i),
                        shape: *shape,
                    })
                    .collect();
            }
            self
        }

        fn ignored(mut self) -> Self {
            if let Some(last) = self.entries.last_mut() {
                last.ignored = true;
            }
            self
        }
    }

    impl CompiledModule for FakeModule {
        fn entries(&self) -> &[EntryDescriptor] {
            &self.entries
        }

        fn invoke(&self, index: u32, args: &[String]) -> Result<Reply, Error> {
            let name = self.entries[index as usize].name.clone();
            self.calls.lock().unwrap().push(name);
            let behaviour = self
                .behaviours
                .get(&index)
                .ok_or_else(|| Error::Invocation(format!("no entry {}", index)))?;
            Ok(behaviour(args))
        }
    }

    fn fault(kind: &str, message: &str) -> Reply {
        Reply::Fault(Fault {
            kind: kind.to_string(),
            message: message.to_string(),
            trace: Some("at snippet.rs:3:5".to_string()),
        })
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest::new("unused").capture_output(false)
    }

    #[tokio::test]
    async fn exact_entry_point_wins() {
        let module: Arc<dyn CompiledModule> = Arc::new(
            FakeModule::new()
                .entry(&["snippet"], Some("Snippet"), "helper", Role::Method, |_| {
                    Reply::Value("helper".into())
                })
                .entry(&["snippet"], Some("Snippet"), "run", Role::Method, |_| {
                    Reply::Value("2".into())
                }),
        );
        let result = execute(module, &request(), UnitKind::Fragment).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.return_value, "2");
        assert_eq!(result.message, "Executed snippet::Snippet::run");
    }

    #[tokio::test]
    async fn falls_back_to_first_container_method() {
        let module: Arc<dyn CompiledModule> = Arc::new(
            FakeModule::new()
                .entry(&[], None, "main", Role::Method, |_| Reply::Unit)
                .entry(&["snippet"], Some("Snippet"), "compute", Role::Method, |_| {
                    Reply::Value("9".into())
                }),
        );
        let result = execute(module, &request(), UnitKind::Fragment).await;
        assert_eq!(result.return_value, "9");
    }

    #[tokio::test]
    async fn broad_scan_skips_accessors_and_failures() {
        let fake = FakeModule::new()
            .entry(&["shapes"], Some("Circle"), "new", Role::Method, |_| Reply::Unit)
            .entry(&["shapes"], Some("Circle"), "get_radius", Role::Method, |_| {
                Reply::Value("1".into())
            })
            .entry(&["shapes"], None, "explode", Role::Method, |_| fault("Panic", "boom"))
            .entry(&["shapes"], None, "area", Role::Method, |_| Reply::Value("3.14".into()));
        let module: Arc<dyn CompiledModule> = Arc::new(fake);

        let result = execute(module.clone(), &request(), UnitKind::Complete).await;
        assert!(result.success);
        assert_eq!(result.return_value, "3.14");

        let fragment = execute(module, &request(), UnitKind::Fragment).await;
        assert!(!fragment.success);
        assert_eq!(fragment.message, NO_CANDIDATES);
    }

    #[tokio::test]
    async fn first_failure_is_reported() {
        let module: Arc<dyn CompiledModule> = Arc::new(
            FakeModule::new()
                .entry(&[], None, "first", Role::Method, |_| fault("Panic", "first broke"))
                .entry(&[], None, "second", Role::Method, |_| fault("Panic", "second broke")),
        );
        let result = execute(module, &request(), UnitKind::Complete).await;
        assert!(!result.success);
        assert_eq!(result.message, "first raised Panic: first broke");
        assert_eq!(result.stage, Some(FailureStage::Invocation));
        assert!(result.stack_trace.is_some());
    }

    #[tokio::test]
    async fn parameters_are_coerced_to_shapes() {
        let module: Arc<dyn CompiledModule> = Arc::new(
            FakeModule::new()
                .entry(&["snippet"], Some("Snippet"), "run", Role::Method, |args| {
                    Reply::Value(args.join("|"))
                })
                .with_params(&[Shape::I32, Shape::Bool]),
        );
        let request = request().with_parameters(vec![
            serde_json::json!("42"),
            serde_json::json!(1),
            serde_json::json!("extra"),
        ]);
        let result = execute(module, &request, UnitKind::Fragment).await;
        assert_eq!(result.return_value, "42|true");
    }

    #[tokio::test]
    async fn tests_run_with_setup_and_teardown() {
        let fake = FakeModule::new()
            .entry(&["snippet"], Some("Snippet"), "prepare", Role::Setup, |_| Reply::Unit)
            .entry(&["snippet"], Some("Snippet"), "passes", Role::Test, |_| Reply::Unit)
            .entry(&["snippet"], Some("Snippet"), "signals", Role::Test, |_| {
                fault("PassedSignal", "explicit pass")
            })
            .entry(&["snippet"], Some("Snippet"), "fails", Role::Test, |_| {
                fault("Panic", "assertion failed")
            })
            .entry(&["snippet"], Some("Snippet"), "skipped", Role::Test, |_| Reply::Unit)
            .ignored()
            .entry(&["snippet"], Some("Snippet"), "clean", Role::Teardown, |_| {
                fault("Panic", "teardown broke")
            });
        let module = Arc::new(fake);
        let shared: Arc<dyn CompiledModule> = module.clone();

        let summary = run_tests(shared, &request()).await;
        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 1);

        let outcomes: Vec<Outcome> = summary.outcomes.iter().map(|o| o.outcome).collect();
        assert_eq!(
            outcomes,
            vec![Outcome::Pass, Outcome::Pass, Outcome::Fail, Outcome::Ignored]
        );
        assert_eq!(summary.outcomes[1].message, "explicit pass");
        assert!(summary.outcomes[2].stack_trace.is_some());

        let calls = module.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "prepare", "passes", "clean", "prepare", "signals", "clean", "prepare", "fails",
                "clean"
            ]
        );
    }

    #[tokio::test]
    async fn setup_failure_fails_the_test() {
        let module: Arc<dyn CompiledModule> = Arc::new(
            FakeModule::new()
                .entry(&["snippet"], Some("Snippet"), "prepare", Role::Setup, |_| {
                    fault("Panic", "no fixture")
                })
                .entry(&["snippet"], Some("Snippet"), "checks", Role::Test, |_| Reply::Unit),
        );
        let summary = run_tests(module, &request()).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.outcomes[0].message, "Setup failed: Panic: no fixture");
    }
}
