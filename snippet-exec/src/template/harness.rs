//! Generated module harness: exported manifest, dispatcher and test signals.
//!
//! The harness is appended after the unit and talks to the host through
//! three C symbols. Arguments and replies are netstring framed
//! (`<len>:<bytes>,`); a reply carries status, value, kind, message and trace.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::scan::{EntryDescriptor, Receiver};

pub const MANIFEST_SYMBOL: &[u8] = b"snippet_manifest\0";
pub const CALL_SYMBOL: &[u8] = b"snippet_call\0";
pub const FREE_SYMBOL: &[u8] = b"snippet_free\0";

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub entries: Vec<EntryDescriptor>,
}

/// Container type (module path and name) that receiver methods are called on.
pub struct ReceiverTarget<'a> {
    pub module_path: &'a [String],
    pub container: &'a str,
}

pub fn render(entries: &[EntryDescriptor], target: Option<&ReceiverTarget<'_>>) -> String {
    let manifest = Manifest {
        version: MANIFEST_VERSION,
        entries: entries.to_vec(),
    };
    let manifest_json = serde_json::to_string(&manifest).unwrap_or_else(|_| "{}".to_string());

    let mut out = String::new();
    out.push_str(PRELUDE_OPEN);
    let _ = writeln!(
        out,
        "    const MANIFEST: &str = concat!({}, \"\\0\");\n",
        raw_literal(&manifest_json)
    );
    out.push_str(SUPPORT);

    out.push_str("    fn dispatch(index: u32, args: &[String]) -> Reply {\n        match index {\n");
    for entry in entries {
        let _ = writeln!(out, "            {0} => call_{0}(args),", entry.index);
    }
    out.push_str(
        "            _ => Reply::fault(\"DispatchError\", format!(\"no entry with index {}\", index), String::new()),\n        }\n    }\n",
    );

    for entry in entries {
        out.push('\n');
        out.push_str(&thunk(entry, target));
    }
    out.push_str("}\n");
    out.push_str(TEST_SIGNALS);
    out
}

fn thunk(entry: &EntryDescriptor, target: Option<&ReceiverTarget<'_>>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "    // {}", entry.qualified_name());
    let _ = writeln!(out, "    fn call_{}(args: &[String]) -> Reply {{", entry.index);

    let mut call_args = Vec::with_capacity(entry.params.len());
    for (i, param) in entry.params.iter().enumerate() {
        let ty = param.shape.owned_type();
        let _ = writeln!(
            out,
            "        let arg{i}: {ty} = match parse_arg::<{ty}>(args, {i}, {:?}) {{ Ok(v) => v, Err(reply) => return reply }};",
            param.name
        );
        call_args.push(if param.shape.rust_type().starts_with('&') {
            format!("&arg{}", i)
        } else {
            format!("arg{}", i)
        });
    }
    let call_args = call_args.join(", ");

    out.push_str("        guarded(move || {\n");
    let call = match (entry.receiver, target) {
        (Receiver::None, _) | (_, None) => format!("crate::{}({})", entry.qualified_name(), call_args),
        (_, Some(target)) => {
            let mut container = target.module_path.join("::");
            if !container.is_empty() {
                container.push_str("::");
            }
            container.push_str(target.container);
            let _ = writeln!(out, "            let mut target = crate::{};", container);
            format!("target.{}({})", entry.name, call_args)
        }
    };
    if entry.returns_value {
        let _ = writeln!(out, "            let value = {};", call);
        out.push_str("            Reply::value((&&&Render(&value)).render())\n");
    } else {
        let _ = writeln!(out, "            {};", call);
        out.push_str("            Reply::unit()\n");
    }
    out.push_str("        })\n    }\n");
    out
}

/// A raw string literal with enough `#`s to hold `text`.
fn raw_literal(text: &str) -> String {
    let mut hashes = 1;
    while text.contains(&format!("\"{}", "#".repeat(hashes))) {
        hashes += 1;
    }
    let fence = "#".repeat(hashes);
    format!("r{fence}\"{text}\"{fence}")
}

const PRELUDE_OPEN: &str = r#"
#[doc(hidden)]
#[allow(dead_code, unused_imports, unused_variables, unused_mut, non_snake_case, clippy::all)]
pub mod __snippet_harness {
    use ::std::ffi::{CStr, CString};
    use ::std::io::Write as _;
    use ::std::os::raw::c_char;
    use ::std::panic::{self, AssertUnwindSafe};

"#;

const SUPPORT: &str = r#"    pub struct Reply {
        status: &'static str,
        value: String,
        kind: String,
        message: String,
        trace: String,
    }

    impl Reply {
        fn value(value: String) -> Self {
            Reply { status: "ok", value, kind: String::new(), message: String::new(), trace: String::new() }
        }

        fn unit() -> Self {
            Reply { status: "unit", value: String::new(), kind: String::new(), message: String::new(), trace: String::new() }
        }

        fn fault(kind: impl Into<String>, message: impl Into<String>, trace: String) -> Self {
            Reply { status: "fault", value: String::new(), kind: kind.into(), message: message.into(), trace }
        }

        fn encode(&self) -> String {
            let mut out = String::new();
            for field in [self.status, self.value.as_str(), self.kind.as_str(), self.message.as_str(), self.trace.as_str()] {
                out.push_str(&field.len().to_string());
                out.push(':');
                out.push_str(field);
                out.push(',');
            }
            out
        }
    }

    pub struct Render<'a, T: ?Sized>(pub &'a T);

    pub trait ViaDisplay {
        fn render(&self) -> String;
    }

    impl<T: ::std::fmt::Display + ?Sized> ViaDisplay for &&Render<'_, T> {
        fn render(&self) -> String {
            self.0.to_string()
        }
    }

    pub trait ViaDebug {
        fn render(&self) -> String;
    }

    impl<T: ::std::fmt::Debug + ?Sized> ViaDebug for &Render<'_, T> {
        fn render(&self) -> String {
            format!("{:?}", self.0)
        }
    }

    pub trait ViaName {
        fn render(&self) -> String;
    }

    impl<T: ?Sized> ViaName for Render<'_, T> {
        fn render(&self) -> String {
            ::std::any::type_name::<T>().to_string()
        }
    }

    thread_local! {
        static LAST_PANIC: ::std::cell::RefCell<Option<(String, String)>> = ::std::cell::RefCell::new(None);
    }

    fn install_hook() {
        static HOOK: ::std::sync::Once = ::std::sync::Once::new();
        HOOK.call_once(|| {
            panic::set_hook(Box::new(|info| {
                let location = info
                    .location()
                    .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                    .unwrap_or_default();
                let trace = ::std::backtrace::Backtrace::force_capture().to_string();
                LAST_PANIC.with(|slot| *slot.borrow_mut() = Some((location, trace)));
            }));
        });
    }

    fn guarded(f: impl FnOnce() -> Reply) -> Reply {
        install_hook();
        LAST_PANIC.with(|slot| slot.borrow_mut().take());
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(reply) => reply,
            Err(payload) => fault_from(payload),
        }
    }

    fn fault_from(payload: Box<dyn ::std::any::Any + Send>) -> Reply {
        let (kind, message) = if let Some(signal) = payload.downcast_ref::<crate::snippet_test::Signal>() {
            (signal.kind.to_string(), signal.message.clone())
        } else if let Some(text) = payload.downcast_ref::<&'static str>() {
            ("Panic".to_string(), text.to_string())
        } else if let Some(text) = payload.downcast_ref::<String>() {
            ("Panic".to_string(), text.clone())
        } else {
            ("Panic".to_string(), "Box<dyn Any>".to_string())
        };
        let (location, trace) = LAST_PANIC.with(|slot| slot.borrow_mut().take()).unwrap_or_default();
        let trace = if location.is_empty() { trace } else { format!("at {}\n{}", location, trace) };
        Reply::fault(kind, message, trace)
    }

    fn parse_arg<T>(args: &[String], index: usize, name: &str) -> Result<T, Reply>
    where
        T: ::std::str::FromStr + ::std::default::Default,
        T::Err: ::std::fmt::Display,
    {
        match args.get(index) {
            None => Ok(T::default()),
            Some(raw) if raw.is_empty() => Ok(T::default()),
            Some(raw) => raw.parse::<T>().map_err(|e| {
                Reply::fault(
                    "ArgumentError",
                    format!("cannot convert {:?} for parameter `{}` to {}: {}", raw, name, ::std::any::type_name::<T>(), e),
                    String::new(),
                )
            }),
        }
    }

    fn decode(raw: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut rest = raw;
        while let Some(colon) = rest.find(':') {
            let Ok(len) = rest[..colon].parse::<usize>() else { break };
            let start = colon + 1;
            let end = start + len;
            if rest.len() <= end || !rest.is_char_boundary(end) {
                break;
            }
            out.push(rest[start..end].to_string());
            rest = &rest[end + 1..];
        }
        out
    }

    #[no_mangle]
    pub extern "C" fn snippet_manifest() -> *const c_char {
        MANIFEST.as_ptr() as *const c_char
    }

    #[no_mangle]
    pub extern "C" fn snippet_call(index: u32, args: *const c_char) -> *mut c_char {
        let raw = if args.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(args) }.to_string_lossy().into_owned()
        };
        let reply = dispatch(index, &decode(&raw));
        let _ = ::std::io::stdout().flush();
        let _ = ::std::io::stderr().flush();
        CString::new(reply.encode().replace('\0', "\u{FFFD}"))
            .unwrap_or_default()
            .into_raw()
    }

    #[no_mangle]
    pub extern "C" fn snippet_free(ptr: *mut c_char) {
        if !ptr.is_null() {
            unsafe { drop(CString::from_raw(ptr)) };
        }
    }

"#;

const TEST_SIGNALS: &str = r#"
/// Control signals for fixture tests.
#[allow(dead_code)]
pub mod snippet_test {
    /// Marks a type whose `#[test]` methods should be run.
    pub trait TestFixture {}

    #[derive(Debug)]
    pub struct Signal {
        pub kind: &'static str,
        pub message: String,
    }

    pub fn pass(message: impl Into<String>) -> ! {
        ::std::panic::panic_any(Signal { kind: "PassedSignal", message: message.into() })
    }

    pub fn ignore(message: impl Into<String>) -> ! {
        ::std::panic::panic_any(Signal { kind: "IgnoreSignal", message: message.into() })
    }

    pub fn inconclusive(message: impl Into<String>) -> ! {
        ::std::panic::panic_any(Signal { kind: "InconclusiveSignal", message: message.into() })
    }
}
"#;
