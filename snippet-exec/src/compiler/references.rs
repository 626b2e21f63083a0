//! Library search paths and extern crates passed to rustc.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::{CompilerConfig, ExternCrate};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct References {
    pub library_dirs: Vec<PathBuf>,
    pub extern_crates: Vec<ExternCrate>,
}

impl References {
    pub fn collect(config: &CompilerConfig) -> Self {
        let mut dirs: Vec<PathBuf> = config.library_dirs.clone();
        for krate in &config.extern_crates {
            if let Some(parent) = krate.path.parent() {
                dirs.push(parent.to_path_buf());
            }
        }
        if config.include_loaded_modules {
            dirs.extend(loaded_module_dirs());
        }

        let library_dirs = dedup_existing(dirs);
        let extern_crates = config
            .extern_crates
            .iter()
            .filter(|krate| {
                let exists = krate.path.exists();
                if !exists {
                    debug!("Skipping missing extern crate {}", krate.path.display());
                }
                exists
            })
            .cloned()
            .collect();

        Self {
            library_dirs,
            extern_crates,
        }
    }

    pub fn args(&self) -> Vec<OsString> {
        let mut args = Vec::with_capacity(self.library_dirs.len() * 2 + self.extern_crates.len() * 2);
        for dir in &self.library_dirs {
            args.push(OsString::from("-L"));
            args.push(dir.as_os_str().to_owned());
        }
        for krate in &self.extern_crates {
            args.push(OsString::from("--extern"));
            let mut spec = OsString::from(format!("{}=", krate.name));
            spec.push(krate.path.as_os_str());
            args.push(spec);
        }
        args
    }

    pub fn fingerprint(&self) -> String {
        let mut parts: Vec<String> = self
            .library_dirs
            .iter()
            .map(|d| format!("L:{}", d.display()))
            .collect();
        parts.extend(
            self.extern_crates
                .iter()
                .map(|k| format!("extern:{}={}", k.name, k.path.display())),
        );
        parts.join(";")
    }
}

fn dedup_existing(dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = Vec::new();
    for dir in dirs {
        if dir.is_dir() && !seen.contains(&dir) {
            seen.push(dir);
        }
    }
    seen
}

/// Directories of shared objects mapped into this process.
#[cfg(target_os = "linux")]
fn loaded_module_dirs() -> Vec<PathBuf> {
    match std::fs::read_to_string("/proc/self/maps") {
        Ok(maps) => mapped_object_dirs(&maps),
        Err(e) => {
            debug!("Cannot read /proc/self/maps: {}", e);
            Vec::new()
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn loaded_module_dirs() -> Vec<PathBuf> {
    Vec::new()
}

fn mapped_object_dirs(maps: &str) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for line in maps.lines() {
        let Some(path) = line.split_whitespace().nth(5) else {
            continue;
        };
        let file_name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !path.starts_with('/') || !(file_name.ends_with(".so") || file_name.contains(".so.")) {
            continue;
        }
        if let Some(parent) = Path::new(path).parent() {
            let parent = parent.to_path_buf();
            if !dirs.contains(&parent) {
                dirs.push(parent);
            }
        }
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mapped_shared_objects() {
        let maps = "\
7f1c2a000000-7f1c2a022000 r--p 00000000 08:01 1311 /usr/lib/x86_64-linux-gnu/libc.so.6
7f1c2a200000-7f1c2a201000 r--p 00000000 08:01 1312 /usr/lib/x86_64-linux-gnu/libm.so.6
7f1c2b000000-7f1c2b001000 r-xp 00000000 08:01 2001 /opt/app/lib/libplugin.so
7ffd5c000000-7ffd5c021000 rw-p 00000000 00:00 0 [stack]
55d0c0000000-55d0c0100000 r-xp 00000000 08:01 99 /usr/local/bin/server
";
        assert_eq!(
            mapped_object_dirs(maps),
            vec![
                PathBuf::from("/usr/lib/x86_64-linux-gnu"),
                PathBuf::from("/opt/app/lib")
            ]
        );
    }

    #[test]
    fn args_include_existing_dirs_and_externs() -> Result<(), std::io::Error> {
        let dir = tempfile::tempdir()?;
        let rlib = dir.path().join("libhelpers.rlib");
        std::fs::write(&rlib, b"")?;

        let config = CompilerConfig {
            library_dirs: vec![dir.path().to_path_buf(), PathBuf::from("/does/not/exist")],
            extern_crates: vec![
                ExternCrate {
                    name: "helpers".into(),
                    path: rlib.clone(),
                },
                ExternCrate {
                    name: "missing".into(),
                    path: dir.path().join("libmissing.rlib"),
                },
            ],
            include_loaded_modules: false,
            ..CompilerConfig::default()
        };
        let refs = References::collect(&config);

        assert_eq!(refs.library_dirs, vec![dir.path().to_path_buf()]);
        assert_eq!(refs.extern_crates.len(), 1);
        let args: Vec<String> = refs.args().iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args[0], "-L");
        assert_eq!(args[2], "--extern");
        assert_eq!(args[3], format!("helpers={}", rlib.display()));
        Ok(())
    }
}
