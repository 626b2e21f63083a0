//! # Snippet Execution Service
//!
//! Compiles submitted Rust snippets into shared modules, loads them into the
//! running process and invokes their entry points or fixture tests. Python
//! scripts run through a separate interpreter process with live output and
//! timeout handling.

pub mod cache;
pub mod cleanup;
pub mod compiler;
pub mod config;
pub mod engine;
mod error;
pub mod module;
pub mod poll;
pub mod script;
pub mod service;
pub mod state;
pub mod template;
mod types;

#[cfg(test)]
mod tests;

pub use cleanup::{CleanupManager, CleanupReport};
pub use config::RunnerConfig;
pub use error::Error;
pub use module::{CompiledModule, DylibModule, Invokable, Reply};
pub use script::{OutputLine, ScriptExecutor, ScriptSource};
pub use service::{CodeRunner, ScriptRunner, SnippetService, TestRunner, Tool};
pub use state::RunnerState;
pub use template::{CompilationUnit, Mode, TemplateGenerator, UnitKind};
pub use types::{
    BuildArtifact, CompileDiagnostic, EnvVars, ExecutionRequest, ExecutionResult, FailureStage,
    Outcome, Response, ScriptResult, Severity, TestOutcome, TestSummary,
};

/// Result type for snippet execution operations
pub type Result<T> = std::result::Result<T, Error>;
