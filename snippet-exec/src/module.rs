//! Loaded modules and the handles used to call into them.

use libloading::Library;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

use crate::error::Error;
use crate::template::harness::{Manifest, CALL_SYMBOL, FREE_SYMBOL, MANIFEST_SYMBOL};
use crate::template::{EntryDescriptor, Shape};

/// A panic raised inside the module, caught before it reached the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: String,
    pub message: String,
    pub trace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Value(String),
    Unit,
    Fault(Fault),
}

impl Reply {
    /// Rendered return value, `null` for functions returning nothing.
    pub fn return_value(&self) -> Option<String> {
        match self {
            Reply::Value(value) => Some(value.clone()),
            Reply::Unit => Some("null".to_string()),
            Reply::Fault(_) => None,
        }
    }
}

/// A compiled unit whose entries can be invoked by index.
pub trait CompiledModule: Send + Sync {
    fn entries(&self) -> &[EntryDescriptor];

    fn invoke(&self, index: u32, args: &[String]) -> Result<Reply, Error>;
}

/// Handle on one entry of a loaded module.
#[derive(Clone)]
pub struct Invokable {
    module: Arc<dyn CompiledModule>,
    descriptor: EntryDescriptor,
}

impl Invokable {
    pub fn new(module: Arc<dyn CompiledModule>, descriptor: EntryDescriptor) -> Self {
        Self { module, descriptor }
    }

    /// All entries of `module`, in declaration order.
    pub fn all(module: &Arc<dyn CompiledModule>) -> Vec<Invokable> {
        module
            .entries()
            .iter()
            .cloned()
            .map(|descriptor| Invokable::new(Arc::clone(module), descriptor))
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn qualified_name(&self) -> String {
        self.descriptor.qualified_name()
    }

    pub fn descriptor(&self) -> &EntryDescriptor {
        &self.descriptor
    }

    pub fn parameter_shapes(&self) -> Vec<Shape> {
        self.descriptor.parameter_shapes()
    }

    pub fn invoke(&self, args: &[String]) -> Result<Reply, Error> {
        self.module.invoke(self.descriptor.index, args)
    }
}

impl std::fmt::Debug for Invokable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invokable")
            .field("name", &self.qualified_name())
            .field("parameter_shapes", &self.parameter_shapes())
            .finish()
    }
}

type ManifestFn = unsafe extern "C" fn() -> *const c_char;
type CallFn = unsafe extern "C" fn(u32, *const c_char) -> *mut c_char;
type FreeFn = unsafe extern "C" fn(*mut c_char);

/// A module loaded with `dlopen` from a private copy of the build output.
pub struct DylibModule {
    call: CallFn,
    free: FreeFn,
    entries: Vec<EntryDescriptor>,
    // Field order matters: the library is closed before its copy is removed.
    _library: Library,
    _shadow: TempDir,
}

impl DylibModule {
    /// Loads `module_path` through a shadow copy, so the cached file can be
    /// replaced or deleted while the module is in use.
    pub fn load(module_path: &Path) -> Result<Self, Error> {
        let bytes = std::fs::read(module_path).map_err(|e| {
            Error::Load(format!("Failed to read {}: {}", module_path.display(), e))
        })?;
        if bytes.is_empty() {
            return Err(Error::Load(format!(
                "Module {} is empty",
                module_path.display()
            )));
        }

        let shadow = tempfile::Builder::new()
            .prefix("snippet-shadow-")
            .tempdir()
            .map_err(|e| Error::Load(format!("Failed to create shadow directory: {}", e)))?;
        let file_name = module_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());
        let shadow_path = shadow
            .path()
            .join(format!("{}-{}", Uuid::new_v4().simple(), file_name));
        std::fs::write(&shadow_path, &bytes)?;

        let library = unsafe { Library::new(&shadow_path) }
            .map_err(|e| Error::Load(format!("Failed to load {}: {}", module_path.display(), e)))?;

        let (manifest_fn, call, free) = unsafe {
            let manifest = library
                .get::<ManifestFn>(MANIFEST_SYMBOL)
                .map_err(|e| Error::Load(format!("Module manifest missing: {}", e)))?;
            let call = library
                .get::<CallFn>(CALL_SYMBOL)
                .map_err(|e| Error::Load(format!("Module dispatcher missing: {}", e)))?;
            let free = library
                .get::<FreeFn>(FREE_SYMBOL)
                .map_err(|e| Error::Load(format!("Module free function missing: {}", e)))?;
            (*manifest, *call, *free)
        };

        let raw = unsafe { manifest_fn() };
        if raw.is_null() {
            return Err(Error::Load("Module returned a null manifest".to_string()));
        }
        let manifest_text = unsafe { CStr::from_ptr(raw) }
            .to_str()
            .map_err(|e| Error::Load(format!("Manifest is not UTF-8: {}", e)))?;
        let manifest: Manifest = serde_json::from_str(manifest_text)
            .map_err(|e| Error::Load(format!("Manifest is malformed: {}", e)))?;

        debug!(
            "Loaded {} with {} entries",
            module_path.display(),
            manifest.entries.len()
        );

        Ok(Self {
            call,
            free,
            entries: manifest.entries,
            _library: library,
            _shadow: shadow,
        })
    }
}

impl CompiledModule for DylibModule {
    fn entries(&self) -> &[EntryDescriptor] {
        &self.entries
    }

    fn invoke(&self, index: u32, args: &[String]) -> Result<Reply, Error> {
        let framed = encode_frames(args.iter().map(|a| a.replace('\0', "\u{FFFD}")));
        let framed = CString::new(framed)
            .map_err(|e| Error::Invocation(format!("Invalid argument text: {}", e)))?;

        let raw = unsafe { (self.call)(index, framed.as_ptr()) };
        if raw.is_null() {
            return Err(Error::Invocation("Module returned no reply".to_string()));
        }
        let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        unsafe { (self.free)(raw) };

        decode_reply(&text)
    }
}

/// Netstring framing shared with the generated harness: `<len>:<bytes>,`.
pub fn encode_frames<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for field in fields {
        let field = field.as_ref();
        out.push_str(&field.len().to_string());
        out.push(':');
        out.push_str(field);
        out.push(',');
    }
    out
}

pub fn decode_frames(raw: &str) -> Result<Vec<String>, Error> {
    let mut out = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        let colon = rest
            .find(':')
            .ok_or_else(|| Error::Invocation("Malformed reply: missing length".to_string()))?;
        let len: usize = rest[..colon]
            .parse()
            .map_err(|_| Error::Invocation("Malformed reply: bad length".to_string()))?;
        let start = colon + 1;
        let end = start + len;
        if rest.len() <= end || !rest.is_char_boundary(end) || rest.as_bytes()[end] != b',' {
            return Err(Error::Invocation("Malformed reply: truncated field".to_string()));
        }
        out.push(rest[start..end].to_string());
        rest = &rest[end + 1..];
    }
    Ok(out)
}

fn decode_reply(text: &str) -> Result<Reply, Error> {
    let fields = decode_frames(text)?;
    let [status, value, kind, message, trace] = <[String; 5]>::try_from(fields).map_err(|f| {
        Error::Invocation(format!("Malformed reply: expected 5 fields, got {}", f.len()))
    })?;
    match status.as_str() {
        "ok" => Ok(Reply::Value(value)),
        "unit" => Ok(Reply::Unit),
        "fault" => Ok(Reply::Fault(Fault {
            kind,
            message,
            trace: (!trace.is_empty()).then_some(trace),
        })),
        other => Err(Error::Invocation(format!("Unknown reply status {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_survive_multibyte_text() -> Result<(), Error> {
        let fields = ["héllo", "", "1:2,3"];
        let framed = encode_frames(fields);
        assert_eq!(framed, "6:héllo,0:,5:1:2,3,");
        assert_eq!(decode_frames(&framed)?, fields);
        Ok(())
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(decode_frames("5:abc,").is_err());
        assert!(decode_frames("x:abc,").is_err());
    }

    #[test]
    fn replies_decode_by_status() -> Result<(), Error> {
        let ok = encode_frames(["ok", "2", "", "", ""]);
        assert_eq!(decode_reply(&ok)?, Reply::Value("2".into()));

        let unit = encode_frames(["unit", "", "", "", ""]);
        assert_eq!(decode_reply(&unit)?.return_value().as_deref(), Some("null"));

        let fault = encode_frames(["fault", "", "PassedSignal", "all good", ""]);
        match decode_reply(&fault)? {
            Reply::Fault(f) => {
                assert_eq!(f.kind, "PassedSignal");
                assert_eq!(f.message, "all good");
                assert!(f.trace.is_none());
            }
            other => panic!("unexpected reply {:?}", other),
        }

        assert!(decode_reply(&encode_frames(["ok", "1"])).is_err());
        Ok(())
    }

    #[test]
    fn loading_an_empty_or_foreign_file_fails() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let empty = dir.path().join("libempty.so");
        std::fs::write(&empty, b"")?;
        assert!(matches!(DylibModule::load(&empty), Err(Error::Load(_))));

        let garbage = dir.path().join("libgarbage.so");
        std::fs::write(&garbage, b"not a shared object")?;
        assert!(matches!(DylibModule::load(&garbage), Err(Error::Load(_))));
        Ok(())
    }
}
