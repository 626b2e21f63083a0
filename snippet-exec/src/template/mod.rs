//! Turns submitted source text into a compilable unit plus its harness.

pub mod harness;
pub mod scan;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

use crate::error::Error;
use crate::types::ExecutionRequest;

pub use harness::{Manifest, ReceiverTarget};
pub use scan::{EntryDescriptor, ParamDescriptor, Receiver, Role, Shape};

pub const DEFAULT_RETURN: &str = "Execution completed";

const LINT_RELAXATIONS: &str =
    "#![allow(dead_code, unused_imports, unused_variables, unused_mut, unreachable_code)]";

const KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum",
    "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
    "mut", "pub", "ref", "return", "self", "Self", "static", "struct", "super", "trait", "true",
    "type", "unsafe", "use", "where", "while", "abstract", "become", "box", "do", "final",
    "macro", "override", "priv", "typeof", "unsized", "virtual", "yield", "try", "gen",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Fragment,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Run,
    Test,
}

/// A unit ready for compilation.
#[derive(Debug, Clone)]
pub struct CompilationUnit {
    pub kind: UnitKind,
    pub mode: Mode,
    /// User-visible unit; compiler line numbers refer to this text
    pub source: String,
    pub harness: String,
    pub entries: Vec<EntryDescriptor>,
    pub namespace: Vec<String>,
    pub container: String,
    pub entry_point: String,
}

impl CompilationUnit {
    /// The full text handed to the compiler.
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(self.source.len() + self.harness.len() + 1);
        text.push_str(&self.source);
        if !self.source.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&self.harness);
        text
    }

    pub fn is_fragment(&self) -> bool {
        self.kind == UnitKind::Fragment
    }
}

#[derive(Debug, Clone)]
pub struct TemplateGenerator {
    default_imports: Vec<String>,
}

impl TemplateGenerator {
    pub fn new(default_imports: Vec<String>) -> Self {
        Self { default_imports }
    }

    pub fn generate(&self, request: &ExecutionRequest, mode: Mode) -> Result<CompilationUnit, Error> {
        if request.source_text.trim().is_empty() {
            return Err(Error::Generation("Source text is empty".to_string()));
        }
        let namespace = parse_namespace(&request.namespace)?;
        validate_identifier("container", &request.container)?;
        let entry_point = request.entry_point().to_string();
        validate_identifier("entry point", &entry_point)?;
        let mut imports = self.imports(&request.imports)?;
        if mode == Mode::Test {
            push_unique(&mut imports, "crate::snippet_test".to_string());
        }

        let kind = if is_complete_unit(&request.source_text) {
            UnitKind::Complete
        } else {
            UnitKind::Fragment
        };

        let raw = match kind {
            UnitKind::Complete => request.source_text.clone(),
            UnitKind::Fragment => wrap_fragment(
                &request.source_text,
                &namespace,
                &request.container,
                &entry_point,
                &imports,
                mode,
            ),
        };

        let options = scan::ScanOptions {
            receiver_owner: (kind == UnitKind::Fragment)
                .then(|| (namespace.clone(), request.container.clone())),
        };
        let scanned = scan::scan(&raw, &options);
        let source = match mode {
            Mode::Test => neutralize(&raw, &scanned.markers),
            Mode::Run => raw,
        };

        let target = ReceiverTarget {
            module_path: &namespace,
            container: &request.container,
        };
        let harness = harness::render(
            &scanned.entries,
            (kind == UnitKind::Fragment).then_some(&target),
        );

        debug!(
            "Generated {:?} unit with {} entries ({} markers)",
            kind,
            scanned.entries.len(),
            scanned.markers.len()
        );

        Ok(CompilationUnit {
            kind,
            mode,
            source,
            harness,
            entries: scanned.entries,
            namespace,
            container: request.container.clone(),
            entry_point,
        })
    }

    fn imports(&self, extra: &[String]) -> Result<Vec<String>, Error> {
        let mut imports = Vec::new();
        for import in self.default_imports.iter().chain(extra.iter()) {
            let import = import.trim();
            let import = import.strip_prefix("use ").unwrap_or(import).trim();
            if import.is_empty() || import.contains(';') || import.contains('\n') {
                return Err(Error::Generation(format!("Invalid import: {:?}", import)));
            }
            push_unique(&mut imports, import.to_string());
        }
        Ok(imports)
    }
}

impl Default for TemplateGenerator {
    fn default() -> Self {
        Self::new(crate::config::RunnerConfig::default().default_imports)
    }
}

fn push_unique(list: &mut Vec<String>, item: String) {
    if !list.contains(&item) {
        list.push(item);
    }
}

fn complete_unit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:pub(?:\s*\([^)]*\))?\s+)?(?:use|mod|struct|enum|trait|union|impl|type)\b")
            .expect("valid complete-unit pattern")
    })
}

fn fn_signature_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?m)^\s*(?:pub(?:\s*\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+[A-Za-z_]",
        )
        .expect("valid fn signature pattern")
    })
}

fn value_return_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\breturn\b\s*[^;\s]").expect("valid return pattern"))
}

/// A unit declaring an import, module or type at the start of a line.
///
/// Keywords inside comments or string literals also match; a fragment
/// misread this way fails with a compiler diagnostic.
pub fn is_complete_unit(source: &str) -> bool {
    complete_unit_pattern().is_match(source)
}

pub fn has_fn_signature(source: &str) -> bool {
    fn_signature_pattern().is_match(source)
}

/// Whether a body fragment produces a value: an explicit `return <expr>`
/// or a final statement that is a tail expression. A trailing block counts
/// when it is a `match`, a bare or `unsafe` block, or an `if` with an `else`.
pub fn yields_value(fragment: &str) -> bool {
    if value_return_pattern().is_match(fragment) {
        return true;
    }
    let statement = last_statement(fragment);
    if is_blank(statement) {
        return false;
    }
    let tail = statement
        .lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n");
    let tail = tail.trim();
    if tail.ends_with('}') {
        return is_block_expression(tail);
    }
    !tail.ends_with(';') && !tail.ends_with('{')
}

fn is_block_expression(tail: &str) -> bool {
    let starts_with_keyword = |keyword: &str| {
        tail.strip_prefix(keyword).is_some_and(|rest| {
            rest.starts_with(|c: char| c.is_whitespace() || c == '{' || c == '(')
        })
    };
    if starts_with_keyword("if") {
        return else_pattern().is_match(tail);
    }
    starts_with_keyword("match") || starts_with_keyword("unsafe") || tail.starts_with('{')
}

fn else_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\}\s*else\b").expect("valid else pattern"))
}

/// Text of the last top-level statement, skipping strings, character
/// literals and comments. Statements end at a top-level `;` or at a
/// top-level `}` not followed by `else`, `.` or `?`.
fn last_statement(fragment: &str) -> &str {
    let chars: Vec<(usize, char)> = fragment.char_indices().collect();
    let byte_at = |i: usize| chars.get(i).map(|(b, _)| *b).unwrap_or(fragment.len());
    let char_at = |i: usize| chars.get(i).map(|(_, c)| *c);
    let mut depth = 0usize;
    let mut start = 0;
    let mut closed_block = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i].1;
        match c {
            '/' if char_at(i + 1) == Some('/') => {
                while i < chars.len() && chars[i].1 != '\n' {
                    i += 1;
                }
            }
            '/' if char_at(i + 1) == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i].1 == '*' && char_at(i + 1) == Some('/')) {
                    i += 1;
                }
                i += 1;
            }
            '"' => {
                i += 1;
                while i < chars.len() && chars[i].1 != '"' {
                    if chars[i].1 == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            '\'' if char_at(i + 2) == Some('\'') => i += 2,
            '\'' if char_at(i + 1) == Some('\\') => {
                i += 2;
                while i < chars.len() && chars[i].1 != '\'' {
                    i += 1;
                }
            }
            '{' | '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let rest = fragment[byte_at(i + 1)..].trim_start();
                    let continues = rest.starts_with("else")
                        || rest.starts_with('.')
                        || rest.starts_with('?');
                    if !continues {
                        closed_block = Some(start);
                        start = byte_at(i + 1);
                    }
                }
            }
            ';' if depth == 0 => {
                closed_block = None;
                start = byte_at(i + 1);
            }
            _ => {}
        }
        i += 1;
    }

    let tail = &fragment[start..];
    match closed_block {
        Some(block_start) if is_blank(tail) => &fragment[block_start..],
        _ => tail,
    }
}

fn is_blank(text: &str) -> bool {
    text.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with("//")
    })
}

fn wrap_fragment(
    fragment: &str,
    namespace: &[String],
    container: &str,
    entry_point: &str,
    imports: &[String],
    mode: Mode,
) -> String {
    let mut out = String::new();
    out.push_str(LINT_RELAXATIONS);
    out.push('\n');
    for segment in namespace {
        out.push_str("pub mod ");
        out.push_str(segment);
        out.push_str(" {\n");
    }
    for import in imports {
        out.push_str("use ");
        out.push_str(import);
        out.push_str(";\n");
    }
    out.push('\n');
    out.push_str("pub struct ");
    out.push_str(container);
    out.push_str(";\n\n");
    if mode == Mode::Test {
        out.push_str("impl crate::snippet_test::TestFixture for ");
        out.push_str(container);
        out.push_str(" {}\n\n");
    }
    out.push_str("impl ");
    out.push_str(container);
    out.push_str(" {\n");

    if has_fn_signature(fragment) {
        out.push_str(fragment);
        if !fragment.ends_with('\n') {
            out.push('\n');
        }
    } else {
        if mode == Mode::Test {
            out.push_str("    #[test]\n");
        }
        if yields_value(fragment) {
            out.push_str("    pub fn ");
            out.push_str(entry_point);
            out.push_str("() -> impl ::std::fmt::Debug {\n");
            out.push_str(fragment);
            if !fragment.ends_with('\n') {
                out.push('\n');
            }
        } else {
            out.push_str("    pub fn ");
            out.push_str(entry_point);
            out.push_str("() -> &'static str {\n");
            out.push_str(fragment);
            if !fragment.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("        \"");
            out.push_str(DEFAULT_RETURN);
            out.push_str("\"\n");
        }
        out.push_str("    }\n");
    }

    out.push_str("}\n");
    for _ in namespace {
        out.push_str("}\n");
    }
    out
}

/// Rewrites each marker span into a comment of the same byte length,
/// keeping newlines so line numbers do not move.
fn neutralize(source: &str, markers: &[scan::Span]) -> String {
    let mut bytes = source.as_bytes().to_vec();
    for span in markers {
        let len = span.end - span.start;
        if len < 4 {
            continue;
        }
        for (offset, byte) in bytes[span.start..span.end].iter_mut().enumerate() {
            *byte = match offset {
                0 => b'/',
                1 => b'*',
                o if o == len - 2 => b'*',
                o if o == len - 1 => b'/',
                _ if *byte == b'\n' => b'\n',
                _ => b' ',
            };
        }
    }
    String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

fn parse_namespace(namespace: &str) -> Result<Vec<String>, Error> {
    let segments: Vec<String> = namespace.split("::").map(|s| s.trim().to_string()).collect();
    for segment in &segments {
        validate_identifier("namespace", segment)?;
    }
    Ok(segments)
}

fn validate_identifier(what: &str, ident: &str) -> Result<(), Error> {
    let mut chars = ident.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || ident == "_" || KEYWORDS.contains(&ident) {
        return Err(Error::Generation(format!(
            "Invalid {} identifier: {:?}",
            what, ident
        )));
    }
    Ok(())
}

/// Source with right-aligned line numbers, for failure reports.
pub fn numbered(source: &str) -> String {
    let width = source.lines().count().max(1).to_string().len();
    source
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{:>width$}: {}", i + 1, line, width = width))
        .collect::<Vec<_>>()
        .join("\n")
}
