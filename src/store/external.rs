//! External-process bundle store.
//!
//! Delegates blob persistence to a pair of site-provided executables.
//! The `put` binary receives the blob path (via its arg template) and
//! prints the handle on stdout; the `get` binary receives a destination
//! path and the handle and writes the blob there. Arg templates use the
//! `{filename}` and `{handle}` placeholders.

use std::io::Write;
use std::process::Command;

use crate::config::StoreConfig;
use crate::error::{Result, ServerError};
use crate::store::BundleStore;

#[derive(Debug)]
pub struct ExternalStore {
    put_binary: String,
    put_args: Vec<String>,
    get_binary: String,
    get_args: Vec<String>,
}

impl ExternalStore {
    pub fn new(
        put_binary: String,
        put_args: Vec<String>,
        get_binary: String,
        get_args: Vec<String>,
    ) -> Self {
        Self {
            put_binary,
            put_args,
            get_binary,
            get_args,
        }
    }

    /// Missing binaries are a setup-time configuration error, not a
    /// failure on the first push.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let put_binary = config
            .put_binary
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServerError::Config("put binary is not specified".to_string()))?;
        let get_binary = config
            .get_binary
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServerError::Config("get binary is not specified".to_string()))?;
        Ok(Self::new(
            put_binary,
            config.put_args.clone(),
            get_binary,
            config.get_args.clone(),
        ))
    }

    fn format_args(template: &[String], filename: &str, handle: Option<&str>) -> Vec<String> {
        template
            .iter()
            .map(|arg| {
                let arg = arg.replace("{filename}", filename);
                match handle {
                    Some(h) => arg.replace("{handle}", h),
                    None => arg,
                }
            })
            .collect()
    }

    fn run(binary: &str, args: &[String]) -> Result<std::process::Output> {
        let output = Command::new(binary).args(args).output().map_err(|e| {
            ServerError::Store(format!("cannot execute {:?}: {}", binary, e))
        })?;
        if !output.status.success() {
            return Err(ServerError::Store(format!(
                "{:?} exited with {}: {}",
                binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }
}

impl BundleStore for ExternalStore {
    fn write(&self, data: &[u8]) -> Result<String> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(data)?;
        tmp.flush()?;

        let filename = tmp.path().to_string_lossy().into_owned();
        let args = Self::format_args(&self.put_args, &filename, None);
        let output = Self::run(&self.put_binary, &args)?;

        let handle = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if handle.is_empty() {
            return Err(ServerError::Store(format!(
                "{:?} produced no handle",
                self.put_binary
            )));
        }
        Ok(handle)
    }

    fn read(&self, handle: &str) -> Result<Vec<u8>> {
        let tmp = tempfile::NamedTempFile::new()?;
        let filename = tmp.path().to_string_lossy().into_owned();
        let args = Self::format_args(&self.get_args, &filename, Some(handle));
        Self::run(&self.get_binary, &args)?;

        match std::fs::read(tmp.path()) {
            Ok(data) if data.is_empty() => Err(ServerError::StoreNotFound(handle.to_string())),
            Ok(data) => Ok(data),
            Err(e) => Err(e.into()),
        }
    }
}
