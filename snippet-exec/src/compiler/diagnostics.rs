//! rustc JSON diagnostics and the fallback failure report.

use serde::Deserialize;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::types::{CompileDiagnostic, Severity};

#[derive(Debug, Deserialize)]
struct RawDiagnostic {
    #[serde(rename = "$message_type", default)]
    message_type: Option<String>,
    message: String,
    #[serde(default)]
    code: Option<RawCode>,
    level: String,
    #[serde(default)]
    spans: Vec<RawSpan>,
}

#[derive(Debug, Deserialize)]
struct RawCode {
    code: String,
}

#[derive(Debug, Deserialize)]
struct RawSpan {
    #[serde(default)]
    is_primary: bool,
    line_start: u32,
    column_start: u32,
}

/// Parses one line of rustc `--error-format json` output.
///
/// `Ok(None)` means the line was JSON but not a reportable diagnostic
/// (artifact notices, failure notes, the trailing "aborting" summary).
pub fn parse_line(line: &str) -> Result<Option<CompileDiagnostic>, serde_json::Error> {
    let raw: RawDiagnostic = serde_json::from_str(line)?;
    if raw.message_type.as_deref().is_some_and(|t| t != "diagnostic") {
        return Ok(None);
    }
    let severity = match raw.level.as_str() {
        level if level.starts_with("error") => Severity::Error,
        "warning" => Severity::Warning,
        "note" | "help" => Severity::Note,
        _ => return Ok(None),
    };
    if raw.spans.is_empty() && raw.message.starts_with("aborting due to") {
        return Ok(None);
    }
    let span = raw
        .spans
        .iter()
        .find(|s| s.is_primary)
        .or_else(|| raw.spans.first());
    Ok(Some(CompileDiagnostic {
        severity,
        message: raw.message,
        line: span.map(|s| s.line_start).unwrap_or(0),
        column: span.map(|s| s.column_start).unwrap_or(0),
        code: raw.code.map(|c| c.code),
    }))
}

/// Forwards parsed diagnostics from `stream` until it closes.
///
/// Resolves to the stream's non-JSON text.
pub fn spawn_reader<R>(stream: R, tx: UnboundedSender<CompileDiagnostic>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut raw_text = String::new();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(Some(diagnostic)) => {
                        debug!(target: "snippet_exec::compiler", "{}", diagnostic);
                        if tx.send(diagnostic).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(_) => {
                        raw_text.push_str(&line);
                        raw_text.push('\n');
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    raw_text.push_str(&format!("<stderr read error: {}>\n", e));
                    break;
                }
            }
        }
        raw_text
    })
}

/// Failure details when no diagnostics arrived: stray log files,
/// the build directory listing and any raw compiler text.
pub async fn fallback_details(build_dir: &Path, raw_stderr: &str) -> String {
    let mut details = String::new();

    let mut names = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(build_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            names.push(format!(
                "{} ({} bytes)",
                entry.file_name().to_string_lossy(),
                size
            ));
            if path.extension().is_some_and(|ext| ext == "log") {
                if let Ok(log) = tokio::fs::read_to_string(&path).await {
                    details.push_str(&format!("--- {} ---\n{}\n", path.display(), log.trim_end()));
                }
            }
        }
    }
    names.sort();

    details.push_str(&format!("Build directory {}:\n", build_dir.display()));
    if names.is_empty() {
        details.push_str("  <empty>\n");
    }
    for name in names {
        details.push_str("  ");
        details.push_str(&name);
        details.push('\n');
    }

    let raw = raw_stderr.trim();
    if !raw.is_empty() {
        details.push_str("Compiler output:\n");
        details.push_str(raw);
        details.push('\n');
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYNTAX_ERROR: &str = r#"{"$message_type":"diagnostic","message":"expected expression, found `;`","code":null,"level":"error","spans":[{"file_name":"source.rs","byte_start":210,"byte_end":211,"line_start":12,"line_end":12,"column_start":11,"column_end":12,"is_primary":true,"text":[],"label":"expected expression","suggested_replacement":null,"suggestion_applicability":null,"expansion":null}],"children":[],"rendered":"error: expected expression, found `;`\n"}"#;

    #[test]
    fn parses_primary_span() {
        let diagnostic = parse_line(SYNTAX_ERROR).unwrap().unwrap();
        assert_eq!(diagnostic.severity, Severity::Error);
        assert_eq!(diagnostic.line, 12);
        assert_eq!(diagnostic.column, 11);
        assert_eq!(diagnostic.to_string(), "Line 12, Column 11: expected expression, found `;`");
    }

    #[test]
    fn keeps_error_codes_and_skips_summaries() {
        let with_code = r#"{"$message_type":"diagnostic","message":"mismatched types","code":{"code":"E0308","explanation":"..."},"level":"error","spans":[{"is_primary":false,"line_start":3,"column_start":1},{"is_primary":true,"line_start":4,"column_start":5}],"children":[]}"#;
        let diagnostic = parse_line(with_code).unwrap().unwrap();
        assert_eq!(diagnostic.code.as_deref(), Some("E0308"));
        assert_eq!((diagnostic.line, diagnostic.column), (4, 5));

        let summary = r#"{"$message_type":"diagnostic","message":"aborting due to 1 previous error","code":null,"level":"error","spans":[],"children":[]}"#;
        assert!(parse_line(summary).unwrap().is_none());

        let note = r#"{"$message_type":"diagnostic","message":"For more information about this error, try `rustc --explain E0308`.","code":null,"level":"failure-note","spans":[],"children":[]}"#;
        assert!(parse_line(note).unwrap().is_none());

        assert!(parse_line("error: linking with `cc` failed").is_err());
    }

    #[tokio::test]
    async fn reader_splits_json_from_raw_text() {
        let input = format!("{}\nnote: some raw linker text\n", SYNTAX_ERROR);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let raw = spawn_reader(std::io::Cursor::new(input.into_bytes()), tx)
            .await
            .unwrap();

        assert_eq!(raw.trim(), "note: some raw linker text");
        let diagnostic = rx.recv().await.unwrap();
        assert_eq!(diagnostic.line, 12);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn fallback_lists_directory_and_logs() -> Result<(), std::io::Error> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("source.rs"), "fn main() {}")?;
        std::fs::write(dir.path().join("linker.log"), "undefined reference to `foo`")?;

        let details = fallback_details(dir.path(), "raw stderr").await;
        assert!(details.contains("source.rs (12 bytes)"));
        assert!(details.contains("undefined reference to `foo`"));
        assert!(details.contains("Compiler output:\nraw stderr"));
        Ok(())
    }
}
