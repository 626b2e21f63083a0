//! Item scanner over a generated unit.
//!
//! Finds the functions a harness can reach from the crate root, along with
//! their parameter shapes and test markers. This is a token-level scan, not a
//! parser: bodies are skipped by brace matching, and anything it does not
//! understand is skipped rather than rejected, leaving real errors to rustc.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parameter and argument types a harness can build from text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    I8,
    I16,
    I32,
    I64,
    I128,
    Isize,
    U8,
    U16,
    U32,
    U64,
    U128,
    Usize,
    F32,
    F64,
    Bool,
    Char,
    String,
    Str,
}

impl Shape {
    /// Recognises a type written without whitespace, e.g. `&str`.
    pub fn from_type(text: &str) -> Option<Self> {
        let shape = match text {
            "i8" => Shape::I8,
            "i16" => Shape::I16,
            "i32" => Shape::I32,
            "i64" => Shape::I64,
            "i128" => Shape::I128,
            "isize" => Shape::Isize,
            "u8" => Shape::U8,
            "u16" => Shape::U16,
            "u32" => Shape::U32,
            "u64" => Shape::U64,
            "u128" => Shape::U128,
            "usize" => Shape::Usize,
            "f32" => Shape::F32,
            "f64" => Shape::F64,
            "bool" => Shape::Bool,
            "char" => Shape::Char,
            "String" | "std::string::String" | "::std::string::String" => Shape::String,
            "&str" | "&'staticstr" => Shape::Str,
            _ => return None,
        };
        Some(shape)
    }

    pub fn rust_type(&self) -> &'static str {
        match self {
            Shape::Str => "&str",
            other => other.owned_type(),
        }
    }

    /// Type an argument is parsed into before the call.
    pub fn owned_type(&self) -> &'static str {
        match self {
            Shape::I8 => "i8",
            Shape::I16 => "i16",
            Shape::I32 => "i32",
            Shape::I64 => "i64",
            Shape::I128 => "i128",
            Shape::Isize => "isize",
            Shape::U8 => "u8",
            Shape::U16 => "u16",
            Shape::U32 => "u32",
            Shape::U64 => "u64",
            Shape::U128 => "u128",
            Shape::Usize => "usize",
            Shape::F32 => "f32",
            Shape::F64 => "f64",
            Shape::Bool => "bool",
            Shape::Char => "char",
            Shape::String | Shape::Str => "String",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Shape::I8
                | Shape::I16
                | Shape::I32
                | Shape::I64
                | Shape::I128
                | Shape::Isize
                | Shape::U8
                | Shape::U16
                | Shape::U32
                | Shape::U64
                | Shape::U128
                | Shape::Usize
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Shape::F32 | Shape::F64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Receiver {
    None,
    Ref,
    RefMut,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Method,
    Test,
    Setup,
    Teardown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub name: String,
    pub shape: Shape,
}

/// One function the harness can call, identified by `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    pub index: u32,
    pub module_path: Vec<String>,
    #[serde(default)]
    pub owner: Option<String>,
    pub name: String,
    pub receiver: Receiver,
    pub params: Vec<ParamDescriptor>,
    pub returns_value: bool,
    pub role: Role,
    #[serde(default)]
    pub ignored: bool,
    pub line: usize,
}

impl EntryDescriptor {
    /// `a::b::Type::name`, without the crate prefix.
    pub fn qualified_name(&self) -> String {
        let mut parts: Vec<&str> = self.module_path.iter().map(String::as_str).collect();
        if let Some(owner) = &self.owner {
            parts.push(owner);
        }
        parts.push(&self.name);
        parts.join("::")
    }

    pub fn owner_path(&self) -> Option<String> {
        self.owner.as_ref().map(|owner| {
            let mut parts: Vec<&str> = self.module_path.iter().map(String::as_str).collect();
            parts.push(owner);
            parts.join("::")
        })
    }

    pub fn parameter_shapes(&self) -> Vec<Shape> {
        self.params.iter().map(|p| p.shape).collect()
    }

    pub fn has_receiver(&self) -> bool {
        self.receiver != Receiver::None
    }

    pub fn is_test(&self) -> bool {
        self.role == Role::Test
    }
}

/// Byte range in the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Default)]
pub struct ScanOutput {
    pub entries: Vec<EntryDescriptor>,
    /// `#[test]`, `#[setup]`, `#[teardown]` and `#[ignore]` attributes
    pub markers: Vec<Span>,
}

#[derive(Debug, Default, Clone)]
pub struct ScanOptions {
    /// Only methods of this type (module path, name) may take `self`
    pub receiver_owner: Option<(Vec<String>, String)>,
}

pub fn scan(source: &str, options: &ScanOptions) -> ScanOutput {
    let tokens = lex(source);
    let mut parser = Parser {
        tokens,
        pos: 0,
        options,
        candidates: Vec::new(),
        markers: Vec::new(),
        types: HashMap::new(),
    };
    let root = ModuleCtx {
        path: Vec::new(),
        reachable: true,
    };
    parser.items(&root);
    parser.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokKind {
    Ident,
    Punct(char),
    Literal,
    Lifetime,
}

#[derive(Debug, Clone)]
struct Token<'s> {
    kind: TokKind,
    text: &'s str,
    start: usize,
    end: usize,
    line: usize,
}

impl Token<'_> {
    fn is_punct(&self, c: char) -> bool {
        self.kind == TokKind::Punct(c)
    }

    fn is_ident(&self, word: &str) -> bool {
        self.kind == TokKind::Ident && self.text == word
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

fn lex(src: &str) -> Vec<Token<'_>> {
    let b = src.as_bytes();
    let len = b.len();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;

    let at = |i: usize| -> u8 { if i < len { b[i] } else { 0 } };

    while i < len {
        let c = b[i];
        let start = i;
        let start_line = line;

        if c == b'\n' {
            line += 1;
            i += 1;
            continue;
        }
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c == b'/' && at(i + 1) == b'/' {
            while i < len && b[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if c == b'/' && at(i + 1) == b'*' {
            let mut depth = 1;
            i += 2;
            while i < len && depth > 0 {
                if b[i] == b'\n' {
                    line += 1;
                    i += 1;
                } else if b[i] == b'/' && at(i + 1) == b'*' {
                    depth += 1;
                    i += 2;
                } else if b[i] == b'*' && at(i + 1) == b'/' {
                    depth -= 1;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            continue;
        }

        // String-like literals, including the b"", c"" and r#""# forms.
        let prefix = match c {
            b'b' | b'c' if at(i + 1) == b'r' && matches!(at(i + 2), b'"' | b'#') => 2,
            b'b' | b'c' if at(i + 1) == b'"' => 1,
            b'r' if at(i + 1) == b'"' => 1,
            b'r' if at(i + 1) == b'#' && matches!(at(i + 2), b'"' | b'#') => 1,
            b'"' => 0,
            _ => usize::MAX,
        };
        if prefix != usize::MAX {
            let raw = prefix > 0 && b[i + prefix - 1] == b'r';
            i += prefix;
            if raw {
                let mut hashes = 0;
                while at(i) == b'#' {
                    hashes += 1;
                    i += 1;
                }
                // Opening quote
                i += 1;
                while i < len {
                    if b[i] == b'\n' {
                        line += 1;
                    }
                    if b[i] == b'"' && (1..=hashes).all(|k| at(i + k) == b'#') {
                        i += 1 + hashes;
                        break;
                    }
                    i += 1;
                }
            } else {
                i = skip_quoted(b, i + 1, b'"', &mut line);
            }
            tokens.push(Token {
                kind: TokKind::Literal,
                text: &src[start..i.min(len)],
                start,
                end: i.min(len),
                line: start_line,
            });
            continue;
        }

        if c == b'b' && at(i + 1) == b'\'' {
            i = skip_quoted(b, i + 2, b'\'', &mut line);
            tokens.push(Token {
                kind: TokKind::Literal,
                text: &src[start..i.min(len)],
                start,
                end: i.min(len),
                line: start_line,
            });
            continue;
        }

        if c == b'\'' {
            let next = at(i + 1);
            let char_len = src[i + 1..].chars().next().map(char::len_utf8).unwrap_or(1);
            let is_char = next == b'\\' || at(i + 1 + char_len) == b'\'';
            if is_char {
                i = skip_quoted(b, i + 1, b'\'', &mut line);
                tokens.push(Token {
                    kind: TokKind::Literal,
                    text: &src[start..i.min(len)],
                    start,
                    end: i.min(len),
                    line: start_line,
                });
            } else {
                i += 1;
                while i < len && is_ident_continue(b[i]) {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokKind::Lifetime,
                    text: &src[start..i],
                    start,
                    end: i,
                    line: start_line,
                });
            }
            continue;
        }

        if c == b'r' && at(i + 1) == b'#' && is_ident_start(at(i + 2)) {
            i += 2;
            let ident_start = i;
            while i < len && is_ident_continue(b[i]) {
                i += 1;
            }
            tokens.push(Token {
                kind: TokKind::Ident,
                text: &src[ident_start..i],
                start,
                end: i,
                line: start_line,
            });
            continue;
        }

        if is_ident_start(c) {
            while i < len && is_ident_continue(b[i]) {
                i += 1;
            }
            tokens.push(Token {
                kind: TokKind::Ident,
                text: &src[start..i],
                start,
                end: i,
                line: start_line,
            });
            continue;
        }

        if c.is_ascii_digit() {
            while i < len
                && (is_ident_continue(b[i]) || (b[i] == b'.' && at(i + 1).is_ascii_digit()))
            {
                i += 1;
            }
            tokens.push(Token {
                kind: TokKind::Literal,
                text: &src[start..i],
                start,
                end: i,
                line: start_line,
            });
            continue;
        }

        i += 1;
        if c.is_ascii() {
            tokens.push(Token {
                kind: TokKind::Punct(c as char),
                text: &src[start..i],
                start,
                end: i,
                line: start_line,
            });
        }
    }

    tokens
}

/// Returns the index just past the closing `quote`.
fn skip_quoted(b: &[u8], mut i: usize, quote: u8, line: &mut usize) -> usize {
    while i < b.len() {
        match b[i] {
            b'\\' => {
                if b.get(i + 1) == Some(&b'\n') {
                    *line += 1;
                }
                i += 2;
            }
            b'\n' => {
                *line += 1;
                i += 1;
            }
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    b.len()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Vis {
    Private,
    Public,
    Crate,
    Super,
    Restricted,
}

impl Vis {
    /// Whether an item at `depth` modules below the root is nameable from the root.
    fn reaches_root(self, depth: usize) -> bool {
        match self {
            Vis::Public | Vis::Crate => true,
            Vis::Super => depth <= 1,
            Vis::Private => depth == 0,
            Vis::Restricted => false,
        }
    }

    fn is_declared_public(self) -> bool {
        !matches!(self, Vis::Private | Vis::Restricted)
    }
}

#[derive(Debug, Default)]
struct Attrs {
    cfg: bool,
    role: Option<Role>,
    ignored: bool,
}

#[derive(Debug, Default)]
struct Quals {
    is_async: bool,
    is_unsafe: bool,
    is_extern: bool,
}

struct ModuleCtx {
    path: Vec<String>,
    reachable: bool,
}

struct Candidate {
    entry: EntryDescriptor,
}

struct Parser<'s, 'o> {
    tokens: Vec<Token<'s>>,
    pos: usize,
    options: &'o ScanOptions,
    candidates: Vec<Candidate>,
    markers: Vec<Span>,
    /// Declared types by (module path, name) and whether they are public
    types: HashMap<(Vec<String>, String), bool>,
}

impl<'s> Parser<'s, '_> {
    fn peek(&self) -> Option<&Token<'s>> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token<'s>> {
        self.tokens.get(self.pos + offset)
    }

    fn peek_punct(&self, c: char) -> bool {
        self.peek().map(|t| t.is_punct(c)).unwrap_or(false)
    }

    fn peek_ident(&self, word: &str) -> bool {
        self.peek().map(|t| t.is_ident(word)).unwrap_or(false)
    }

    fn finish(self) -> ScanOutput {
        let types = self.types;
        let entries = self
            .candidates
            .into_iter()
            .map(|c| c.entry)
            .filter(|entry| match &entry.owner {
                None => true,
                Some(_) if entry.module_path.is_empty() => true,
                Some(owner) => types
                    .get(&(entry.module_path.clone(), owner.clone()))
                    .copied()
                    .unwrap_or(false),
            })
            .enumerate()
            .map(|(index, mut entry)| {
                entry.index = index as u32;
                entry
            })
            .collect();
        ScanOutput {
            entries,
            markers: self.markers,
        }
    }

    /// Items until the closing `}` of the current block or end of input.
    fn items(&mut self, module: &ModuleCtx) {
        loop {
            match self.peek() {
                None => return,
                Some(t) if t.is_punct('}') => {
                    self.pos += 1;
                    return;
                }
                Some(t) if t.is_punct(';') => {
                    self.pos += 1;
                    continue;
                }
                _ => {}
            }
            let attrs = self.attributes();
            let vis = self.visibility();
            self.item(module, attrs, vis);
        }
    }

    fn attributes(&mut self) -> Attrs {
        let mut attrs = Attrs::default();
        while self.peek_punct('#') {
            let hash_start = self.tokens[self.pos].start;
            if self.peek_at(1).map(|t| t.is_punct('!')).unwrap_or(false) {
                self.pos += 2;
                self.skip_group();
                continue;
            }
            if !self.peek_at(1).map(|t| t.is_punct('[')).unwrap_or(false) {
                return attrs;
            }
            self.pos += 1;
            let (inner_start, inner_end) = self.skip_group();
            let end = self.tokens[inner_end - 1].end;
            let inner = &self.tokens[inner_start..inner_end.saturating_sub(1).max(inner_start)];
            let Some(head) = inner.first() else { continue };
            // `#[name]`, `#[name = ".."]` or `#[name(..)]`, never a path
            let simple = inner
                .get(1)
                .map(|t| t.is_punct('=') || t.is_punct('('))
                .unwrap_or(true);
            if head.kind != TokKind::Ident {
                continue;
            }
            match head.text {
                "cfg" => attrs.cfg = true,
                "test" if simple => {
                    attrs.role = Some(Role::Test);
                    self.markers.push(Span { start: hash_start, end });
                }
                "setup" if simple => {
                    attrs.role = Some(Role::Setup);
                    self.markers.push(Span { start: hash_start, end });
                }
                "teardown" if simple => {
                    attrs.role = Some(Role::Teardown);
                    self.markers.push(Span { start: hash_start, end });
                }
                "ignore" if simple => {
                    attrs.ignored = true;
                    self.markers.push(Span { start: hash_start, end });
                }
                _ => {}
            }
        }
        attrs
    }

    fn visibility(&mut self) -> Vis {
        if !self.peek_ident("pub") {
            return Vis::Private;
        }
        self.pos += 1;
        if !self.peek_punct('(') {
            return Vis::Public;
        }
        let (start, end) = self.skip_group();
        let inner: Vec<&str> = self.tokens[start..end.saturating_sub(1)]
            .iter()
            .map(|t| t.text)
            .collect();
        match inner.as_slice() {
            ["crate"] => Vis::Crate,
            ["super"] => Vis::Super,
            ["self"] => Vis::Private,
            _ => Vis::Restricted,
        }
    }

    fn qualifiers(&mut self) -> Quals {
        let mut quals = Quals::default();
        loop {
            let Some(tok) = self.peek() else { return quals };
            if tok.kind != TokKind::Ident {
                return quals;
            }
            let next_is_fn_qualifier = self
                .peek_at(1)
                .map(|t| {
                    t.kind == TokKind::Literal
                        || ["fn", "async", "unsafe", "extern", "const"]
                            .iter()
                            .any(|w| t.is_ident(w))
                })
                .unwrap_or(false);
            match tok.text {
                "const" | "default" if next_is_fn_qualifier => self.pos += 1,
                "async" if next_is_fn_qualifier => {
                    quals.is_async = true;
                    self.pos += 1;
                }
                "unsafe" if next_is_fn_qualifier => {
                    quals.is_unsafe = true;
                    self.pos += 1;
                }
                "extern" if next_is_fn_qualifier => {
                    quals.is_extern = true;
                    self.pos += 1;
                    if self.peek().map(|t| t.kind == TokKind::Literal).unwrap_or(false) {
                        self.pos += 1;
                    }
                }
                _ => return quals,
            }
        }
    }

    fn item(&mut self, module: &ModuleCtx, attrs: Attrs, vis: Vis) {
        let quals = self.qualifiers();
        let Some(keyword) = self.peek().filter(|t| t.kind == TokKind::Ident).map(|t| t.text)
        else {
            self.skip_item_rest();
            return;
        };

        match keyword {
            "fn" => self.function(module, &attrs, vis, &quals, None),
            "mod" => self.module(module, &attrs, vis),
            "impl" => self.implementation(module, &attrs),
            "struct" | "enum" | "union"
                if self.peek_at(1).map(|t| t.kind == TokKind::Ident).unwrap_or(false) =>
            {
                let name = self.tokens[self.pos + 1].text.to_string();
                let public = !attrs.cfg && vis.is_declared_public();
                self.types.insert((module.path.clone(), name), public);
                self.pos += 2;
                self.skip_item_rest();
            }
            _ => self.skip_item_rest(),
        }
    }

    fn module(&mut self, parent: &ModuleCtx, attrs: &Attrs, vis: Vis) {
        self.pos += 1;
        let Some(name) = self.peek().filter(|t| t.kind == TokKind::Ident).map(|t| t.text) else {
            self.skip_item_rest();
            return;
        };
        let name = name.to_string();
        self.pos += 1;
        if !self.peek_punct('{') {
            self.skip_item_rest();
            return;
        }
        if attrs.cfg {
            self.skip_group();
            return;
        }
        self.pos += 1;
        let mut path = parent.path.clone();
        path.push(name);
        let child = ModuleCtx {
            reachable: parent.reachable && vis.reaches_root(parent.path.len()),
            path,
        };
        self.items(&child);
    }

    fn implementation(&mut self, module: &ModuleCtx, attrs: &Attrs) {
        self.pos += 1;
        if self.peek_punct('<') {
            self.skip_item_rest();
            return;
        }
        let header_start = self.pos;
        while let Some(tok) = self.peek() {
            if tok.is_punct('{') || tok.is_punct(';') || tok.is_punct('}') {
                break;
            }
            self.pos += 1;
        }
        if !self.peek_punct('{') {
            self.skip_item_rest();
            return;
        }
        let header = &self.tokens[header_start..self.pos];
        let owner = match header {
            [only] if only.kind == TokKind::Ident => Some(only.text.to_string()),
            _ => None,
        };
        let Some(owner) = owner.filter(|_| !attrs.cfg) else {
            self.skip_group();
            return;
        };

        self.pos += 1;
        loop {
            match self.peek() {
                None => return,
                Some(t) if t.is_punct('}') => {
                    self.pos += 1;
                    return;
                }
                Some(t) if t.is_punct(';') => {
                    self.pos += 1;
                    continue;
                }
                _ => {}
            }
            let attrs = self.attributes();
            let vis = self.visibility();
            let quals = self.qualifiers();
            if self.peek_ident("fn") {
                self.function(module, &attrs, vis, &quals, Some(&owner));
            } else {
                self.skip_item_rest();
            }
        }
    }

    fn function(
        &mut self,
        module: &ModuleCtx,
        attrs: &Attrs,
        vis: Vis,
        quals: &Quals,
        owner: Option<&str>,
    ) {
        self.pos += 1;
        let Some(name_tok) = self.peek().filter(|t| t.kind == TokKind::Ident).cloned() else {
            self.skip_item_rest();
            return;
        };
        self.pos += 1;

        let mut supported =
            !attrs.cfg && !quals.is_async && !quals.is_unsafe && !quals.is_extern;
        if self.peek_punct('<') {
            supported = false;
            self.skip_angles();
        }
        if !self.peek_punct('(') {
            self.skip_item_rest();
            return;
        }
        let (params_start, params_end) = self.skip_group();
        let params_tokens: Vec<Token<'s>> =
            self.tokens[params_start..params_end.saturating_sub(1)].to_vec();

        let mut return_type = String::new();
        if self.peek_punct('-') && self.peek_at(1).map(|t| t.is_punct('>')).unwrap_or(false) {
            self.pos += 2;
            let mut depth = 0i32;
            while let Some(tok) = self.peek() {
                match tok.kind {
                    TokKind::Punct('{') | TokKind::Punct(';') if depth <= 0 => break,
                    TokKind::Ident if tok.text == "where" && depth <= 0 => break,
                    TokKind::Punct('(') | TokKind::Punct('[') | TokKind::Punct('<') => depth += 1,
                    TokKind::Punct(')') | TokKind::Punct(']') | TokKind::Punct('>') => depth -= 1,
                    _ => {}
                }
                return_type.push_str(tok.text);
                self.pos += 1;
            }
        }
        while let Some(tok) = self.peek() {
            if tok.is_punct('{') || tok.is_punct(';') || tok.is_punct('}') {
                break;
            }
            self.pos += 1;
        }
        if self.peek_punct('{') {
            self.skip_group();
        } else if self.peek_punct(';') {
            self.pos += 1;
        }

        if !supported || !module.reachable {
            return;
        }

        let Some((receiver, params)) = parse_params(&params_tokens) else {
            return;
        };

        let depth = module.path.len();
        let privileged_root = depth == 0
            && (attrs.role.is_some() || (owner.is_none() && name_tok.text == "main"));
        let visible = match vis {
            Vis::Private => privileged_root,
            other => other.reaches_root(depth),
        };
        if !visible {
            return;
        }

        if receiver != Receiver::None {
            let allowed = match (&self.options.receiver_owner, owner) {
                (Some((path, container)), Some(owner)) => {
                    path == &module.path && container == owner
                }
                _ => false,
            };
            if !allowed {
                return;
            }
        }

        let returns_value = !return_type.is_empty() && return_type != "()" && return_type != "!";
        self.candidates.push(Candidate {
            entry: EntryDescriptor {
                index: 0,
                module_path: module.path.clone(),
                owner: owner.map(str::to_string),
                name: name_tok.text.to_string(),
                receiver,
                params,
                returns_value,
                role: attrs.role.unwrap_or(Role::Method),
                ignored: attrs.ignored,
                line: name_tok.line,
            },
        });
    }

    /// Skips a balanced `(..)`, `[..]` or `{..}` group starting at the
    /// current token. Returns the token range inside it, closing token included.
    fn skip_group(&mut self) -> (usize, usize) {
        let open = self.pos;
        self.pos += 1;
        let mut depth = 1;
        while let Some(tok) = self.peek() {
            match tok.kind {
                TokKind::Punct('(') | TokKind::Punct('[') | TokKind::Punct('{') => depth += 1,
                TokKind::Punct(')') | TokKind::Punct(']') | TokKind::Punct('}') => {
                    depth -= 1;
                    if depth == 0 {
                        self.pos += 1;
                        return (open + 1, self.pos);
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
        (open + 1, self.pos)
    }

    fn skip_angles(&mut self) {
        let mut depth = 0;
        while let Some(tok) = self.peek() {
            match tok.kind {
                TokKind::Punct('<') => depth += 1,
                TokKind::Punct('>') => {
                    let arrow = self.pos > 0 && self.tokens[self.pos - 1].is_punct('-');
                    if !arrow {
                        depth -= 1;
                        if depth == 0 {
                            self.pos += 1;
                            return;
                        }
                    }
                }
                TokKind::Punct('(') | TokKind::Punct('[') => {
                    self.skip_group();
                    continue;
                }
                TokKind::Punct('{') | TokKind::Punct(';') => return,
                _ => {}
            }
            self.pos += 1;
        }
    }

    /// Advances past the rest of an item: through a `;` or a block at depth 0.
    fn skip_item_rest(&mut self) {
        while let Some(tok) = self.peek() {
            match tok.kind {
                TokKind::Punct(';') => {
                    self.pos += 1;
                    return;
                }
                TokKind::Punct('{') => {
                    self.skip_group();
                    return;
                }
                TokKind::Punct('(') | TokKind::Punct('[') => {
                    self.skip_group();
                }
                TokKind::Punct('}') => return,
                _ => self.pos += 1,
            }
        }
    }
}

/// Splits a parameter list; `None` when any parameter has an unsupported type.
fn parse_params(tokens: &[Token<'_>]) -> Option<(Receiver, Vec<ParamDescriptor>)> {
    let mut segments: Vec<&[Token<'_>]> = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, tok) in tokens.iter().enumerate() {
        match tok.kind {
            TokKind::Punct('(') | TokKind::Punct('[') | TokKind::Punct('<') | TokKind::Punct('{') => {
                depth += 1
            }
            TokKind::Punct(')') | TokKind::Punct(']') | TokKind::Punct('}') => depth -= 1,
            TokKind::Punct('>') if i == 0 || !tokens[i - 1].is_punct('-') => depth -= 1,
            TokKind::Punct(',') if depth == 0 => {
                segments.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&tokens[start..]);

    let mut receiver = Receiver::None;
    let mut params = Vec::new();
    for (i, segment) in segments.into_iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 && segment.iter().any(|t| t.is_ident("self")) {
            let has_colon = segment.iter().any(|t| t.is_punct(':'));
            if has_colon {
                return None;
            }
            receiver = if segment[0].is_punct('&') {
                if segment.iter().any(|t| t.is_ident("mut")) {
                    Receiver::RefMut
                } else {
                    Receiver::Ref
                }
            } else {
                Receiver::Value
            };
            continue;
        }

        let colon = segment.iter().position(|t| t.is_punct(':'))?;
        let pattern = &segment[..colon];
        let name = match pattern {
            [name] if name.kind == TokKind::Ident => name.text,
            [m, name] if m.is_ident("mut") && name.kind == TokKind::Ident => name.text,
            _ => return None,
        };
        let ty: String = segment[colon + 1..].iter().map(|t| t.text).collect();
        let shape = Shape::from_type(&ty)?;
        params.push(ParamDescriptor {
            name: name.to_string(),
            shape,
        });
    }
    Some((receiver, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(output: &ScanOutput) -> Vec<String> {
        output.entries.iter().map(|e| e.qualified_name()).collect()
    }

    #[test]
    fn finds_public_functions_in_reachable_modules() {
        let source = r#"
mod tools {
    pub fn visible(a: i32, b: &str) -> i32 { a }
    fn hidden() {}
    mod private_inner {
        pub fn unreachable() {}
    }
    pub mod inner {
        pub fn nested(flag: bool) {}
    }
}

pub fn root_helper() -> String { String::new() }
fn private_helper() {}
fn main() {}
"#;
        let output = scan(source, &ScanOptions::default());
        assert_eq!(
            names(&output),
            vec![
                "tools::visible",
                "tools::inner::nested",
                "root_helper",
                "main"
            ]
        );
        let visible = &output.entries[0];
        assert_eq!(visible.parameter_shapes(), vec![Shape::I32, Shape::Str]);
        assert!(visible.returns_value);
        assert!(!output.entries[1].returns_value);
        assert_eq!(output.entries[3].index, 3);
    }

    #[test]
    fn skips_generic_async_unsafe_and_unsupported_parameters() {
        let source = r#"
pub fn generic<T: Default>() -> T { T::default() }
pub async fn later() {}
pub unsafe fn raw() {}
pub extern "C" fn exported() {}
pub fn takes_vec(items: Vec<i32>) {}
pub const fn constant() -> u8 { 1 }
pub fn tuple((a, b): (i32, i32)) {}
"#;
        let output = scan(source, &ScanOptions::default());
        assert_eq!(names(&output), vec!["constant"]);
    }

    #[test]
    fn ignores_braces_in_strings_comments_and_chars() {
        let source = r##"
pub fn first() -> &'static str { "}{ not a block" }
// pub fn commented() {}
/* pub fn blocked() { */
pub fn second() -> char { '{' }
pub fn third() -> &'static str { r#"raw } string"# }
"##;
        let output = scan(source, &ScanOptions::default());
        assert_eq!(names(&output), vec!["first", "second", "third"]);
    }

    #[test]
    fn receivers_only_on_configured_owner() {
        let source = r#"
pub mod snippet {
    pub struct Snippet;
    impl Snippet {
        pub fn run(&self) -> i32 { 1 }
        pub fn helper(&mut self, n: u64) {}
    }
    pub struct Other;
    impl Other {
        pub fn measure(&self) {}
        pub fn build() -> Self { Other }
    }
    struct Hidden;
    impl Hidden {
        pub fn reach() {}
    }
}
"#;
        let options = ScanOptions {
            receiver_owner: Some((vec!["snippet".to_string()], "Snippet".to_string())),
        };
        let output = scan(source, &options);
        assert_eq!(
            names(&output),
            vec![
                "snippet::Snippet::run",
                "snippet::Snippet::helper",
                "snippet::Other::build"
            ]
        );
        assert_eq!(output.entries[0].receiver, Receiver::Ref);
        assert_eq!(output.entries[1].receiver, Receiver::RefMut);
    }

    #[test]
    fn trait_impls_and_cfg_items_are_skipped() {
        let source = r#"
pub struct Point;
impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { Ok(()) }
}
impl Point {
    pub fn origin() -> Point { Point }
}
#[cfg(test)]
mod tests {
    pub fn not_compiled() {}
}
"#;
        let output = scan(source, &ScanOptions::default());
        assert_eq!(names(&output), vec!["Point::origin"]);
    }

    #[test]
    fn records_markers_and_roles() {
        let source = "impl Fixture {\n    #[setup]\n    pub fn prepare() {}\n    #[test]\n    #[ignore = \"slow\"]\n    pub fn checks() {}\n    #[tokio::test]\n    pub fn other() {}\n}\n";
        let output = scan(source, &ScanOptions::default());
        assert_eq!(output.markers.len(), 3);
        assert_eq!(&source[output.markers[0].start..output.markers[0].end], "#[setup]");
        assert_eq!(
            &source[output.markers[2].start..output.markers[2].end],
            "#[ignore = \"slow\"]"
        );

        assert_eq!(output.entries[0].role, Role::Setup);
        assert_eq!(output.entries[1].role, Role::Test);
        assert!(output.entries[1].ignored);
        assert_eq!(output.entries[1].line, 6);
        assert_eq!(output.entries[2].role, Role::Method);
    }
}
