use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to generate code: {0}")]
    Generation(String),

    #[error("Compilation failed: {0}")]
    Compilation(String),

    #[error("Failed to load module: {0}")]
    Load(String),

    #[error("Invocation failed: {0}")]
    Invocation(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Interpreter not found: {0}")]
    InterpreterNotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
