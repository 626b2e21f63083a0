//! Output encoding between the interpreter and the host.
//!
//! Interpreter streams are wrapped so that any text outside ASCII, or any
//! text that already looks like a marker, travels as a
//! `[SNIPPET_B64:<base64>]` marker, which the host decodes line by line.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::{Captures, Regex};
use std::sync::OnceLock;

pub const MARKER_PREFIX: &str = "[SNIPPET_B64:";

/// Prepended to every inline script.
pub const PREAMBLE: &str = r#"import sys as _snippet_sys, base64 as _snippet_b64, builtins as _snippet_builtins


class _SnippetStream:
    def __init__(self, inner):
        self._inner = inner

    def _encode(self, line):
        if "[SNIPPET_B64:" not in line and all(ord(c) < 128 for c in line):
            return line
        data = _snippet_b64.b64encode(line.encode("utf-8", "replace")).decode("ascii")
        return "[SNIPPET_B64:" + data + "]"

    def write(self, text):
        if not isinstance(text, str):
            text = str(text)
        encoded = "\n".join(self._encode(part) for part in text.split("\n"))
        self._inner.write(encoded)
        self._inner.flush()
        return len(text)

    def flush(self):
        self._inner.flush()

    def __getattr__(self, name):
        return getattr(self._inner, name)


_snippet_sys.stdout = _SnippetStream(_snippet_sys.stdout)
_snippet_sys.stderr = _SnippetStream(_snippet_sys.stderr)
_snippet_print = _snippet_builtins.print


def _snippet_flushing_print(*args, **kwargs):
    kwargs.setdefault("flush", True)
    return _snippet_print(*args, **kwargs)


_snippet_builtins.print = _snippet_flushing_print
del _snippet_flushing_print
"#;

/// Lines the preamble adds in front of user code.
pub fn preamble_lines() -> usize {
    PREAMBLE.lines().count()
}

pub fn with_preamble(script: &str) -> String {
    let mut text = String::with_capacity(PREAMBLE.len() + script.len() + 1);
    text.push_str(PREAMBLE);
    text.push('\n');
    text.push_str(script);
    text
}

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[SNIPPET_B64:([A-Za-z0-9+/=]*)\]").expect("valid marker pattern"))
}

/// Decodes one raw output line: lossy UTF-8, then every marker expanded.
pub fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\r', '\n']);
    if !text.contains(MARKER_PREFIX) {
        return text.to_string();
    }
    marker_pattern()
        .replace_all(text, |caps: &Captures<'_>| match STANDARD.decode(&caps[1]) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => caps[0].to_string(),
        })
        .into_owned()
}
