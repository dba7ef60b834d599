// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Status file: the on-disk observability surface reporting which policy
//! is active.
//!
//! While a policy is attached the file holds exactly its name as a single
//! UTF-8 line; while nothing is attached the file is absent. Readers
//! trim whitespace so a trailing newline from manual inspection tools is
//! harmless.

use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATUS_PATH: &str = "/var/run/scx_minimal/status";

#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        StatusFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Publish the active policy name. The file is created exclusively,
    /// so the write doubles as the cross-process claim on the single
    /// active slot: if another instance already published a name this
    /// fails with `AlreadyExists` instead of clobbering it.
    pub fn write_name(&self, name: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        file.write_all(name.as_bytes())
    }

    /// Remove the published name. Clearing an already absent file is not
    /// an error.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Read back the active policy name, `None` when no policy is
    /// attached (file absent or empty).
    pub fn read(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                let name = content.trim();
                if name.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(name.to_string()))
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}
