/*
Copyright 2025 Google LLC

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! File access for the parser and the evaluator.
//!
//! In full mode everything goes to the real file system. Otherwise writes
//! land in an in-memory overlay which later reads consult first, and
//! existence probes are remembered.

use std::collections::HashMap;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    fileutil::{is_file, os_str},
    strutil::dirname,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Truncate,
    Append,
}

#[derive(Debug, Clone)]
enum VfsEntry {
    Missing,
    Existing,
    Contents(Bytes),
}

pub struct Vfs {
    full: bool,
    files: Mutex<HashMap<Bytes, VfsEntry>>,
}

impl Vfs {
    pub fn new(full: bool) -> Self {
        Vfs {
            full,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn read_file(&self, path: &[u8]) -> Result<Bytes> {
        if !self.full {
            match self.files.lock().get(path) {
                Some(VfsEntry::Contents(data)) => return Ok(data.clone()),
                Some(VfsEntry::Missing) => anyhow::bail!("No such file or directory"),
                _ => {}
            }
        }
        let data = match std::fs::read(os_str(path)) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                anyhow::bail!("No such file or directory")
            }
            Err(err) => return Err(err.into()),
        };
        if data.starts_with(b"\xef\xbb\xbf") {
            anyhow::bail!("Unexpected UTF-8 BOM");
        }
        Ok(Bytes::from(data))
    }

    pub fn write_file(&self, path: &[u8], mode: WriteMode, contents: &[u8]) -> Result<()> {
        if !self.full {
            let mut files = self.files.lock();
            let data = match (mode, files.get(path)) {
                (WriteMode::Append, Some(VfsEntry::Contents(old))) => {
                    let mut data = old.to_vec();
                    data.extend_from_slice(contents);
                    Bytes::from(data)
                }
                _ => Bytes::copy_from_slice(contents),
            };
            files.insert(Bytes::copy_from_slice(path), VfsEntry::Contents(data));
            return Ok(());
        }

        let parent = dirname(&Bytes::copy_from_slice(path));
        if !parent.is_empty() && std::fs::create_dir_all(os_str(&parent)).is_err() {
            anyhow::bail!("Cannot create parent directory");
        }
        match mode {
            WriteMode::Truncate => {
                if std::fs::read(os_str(path)).is_ok_and(|old| old == contents) {
                    return Ok(());
                }
                std::fs::write(os_str(path), contents)?;
            }
            WriteMode::Append => {
                use std::io::Write;
                let mut f = std::fs::File::options()
                    .append(true)
                    .create(true)
                    .open(os_str(path))?;
                f.write_all(contents)?;
            }
        }
        Ok(())
    }

    pub fn exists(&self, path: &[u8]) -> bool {
        if self.full {
            return is_file(path);
        }
        let mut files = self.files.lock();
        match files.get(path) {
            Some(VfsEntry::Missing) => false,
            Some(_) => true,
            None => {
                let exists = is_file(path);
                let entry = if exists {
                    VfsEntry::Existing
                } else {
                    VfsEntry::Missing
                };
                files.insert(Bytes::copy_from_slice(path), entry);
                exists
            }
        }
    }

    /// Forgets remembered existence probes. Overlay contents stay.
    pub fn invalidate_cache(&self) {
        self.files
            .lock()
            .retain(|_, e| matches!(e, VfsEntry::Contents(_)));
    }

    pub fn invalidate_contents(&self) {
        self.files.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_write_and_read() {
        let vfs = Vfs::new(false);
        let path = b"/nonexistent/proeval/out.pri";
        assert!(!vfs.exists(path));
        vfs.write_file(path, WriteMode::Truncate, b"A = 1\n").unwrap();
        vfs.write_file(path, WriteMode::Append, b"B = 2\n").unwrap();
        assert!(vfs.exists(path));
        assert_eq!(vfs.read_file(path).unwrap(), "A = 1\nB = 2\n");
        vfs.invalidate_cache();
        assert!(vfs.exists(path));
        vfs.invalidate_contents();
        assert!(vfs.read_file(path).is_err());
    }

    #[test]
    fn test_missing_file() {
        let vfs = Vfs::new(true);
        let err = vfs.read_file(b"/nonexistent/proeval/x.pro").unwrap_err();
        assert_eq!(err.to_string(), "No such file or directory");
    }

    #[test]
    fn test_full_mode_writes_disk() {
        let dir = std::env::temp_dir().join(format!("proeval-vfs-{}", std::process::id()));
        let file = dir.join("deep/x.txt");
        let path = std::os::unix::ffi::OsStrExt::as_bytes(file.as_os_str()).to_vec();
        let vfs = Vfs::new(true);
        vfs.write_file(&path, WriteMode::Truncate, b"one\n").unwrap();
        vfs.write_file(&path, WriteMode::Append, b"two\n").unwrap();
        assert_eq!(vfs.read_file(&path).unwrap(), "one\ntwo\n");
        assert!(vfs.exists(&path));
        std::fs::write(&file, b"\xef\xbb\xbfA=1").unwrap();
        assert_eq!(
            vfs.read_file(&path).unwrap_err().to_string(),
            "Unexpected UTF-8 BOM"
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
