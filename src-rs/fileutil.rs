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

use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::{
    ffi::{CString, OsStr},
    fs::{File, FileTimes},
    process::{Command, ExitStatus, Stdio},
    time::SystemTime,
};

use anyhow::Result;
use bytes::Bytes;

use crate::log;

pub fn os_str(s: &[u8]) -> &OsStr {
    <OsStr as OsStrExt>::from_bytes(s)
}

pub fn get_timestamp(filename: &[u8]) -> Result<Option<SystemTime>> {
    let filename = os_str(filename);
    if !std::fs::exists(filename)? {
        return Ok(None);
    }
    let metadata = std::fs::metadata(filename)?;
    Ok(Some(metadata.modified()?))
}

pub fn exists(path: &[u8]) -> bool {
    std::fs::exists(os_str(path)).unwrap_or(false)
}

pub fn is_dir(path: &[u8]) -> bool {
    std::fs::metadata(os_str(path)).is_ok_and(|m| m.is_dir())
}

pub fn is_file(path: &[u8]) -> bool {
    std::fs::metadata(os_str(path)).is_ok_and(|m| m.is_file())
}

fn shell_command(cmd: &[u8], working_dir: &[u8]) -> Command {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(os_str(cmd));
    if !working_dir.is_empty() {
        command.current_dir(os_str(working_dir));
    }
    command
}

/// Runs `cmd` through the shell and returns its standard output. Standard
/// error is passed through.
pub fn run_command(cmd: &[u8], working_dir: &[u8]) -> Result<(ExitStatus, Vec<u8>)> {
    log!("run_command({})", String::from_utf8_lossy(cmd));

    let mut command = shell_command(cmd, working_dir);
    let (mut reader, writer) = os_pipe::pipe()?;
    command.stderr(Stdio::inherit());
    command.stdout(writer);

    let mut handle = command.spawn()?;
    // Drop the command, otherwise the pipe will be retained.
    drop(command);

    let mut output = Vec::new();
    reader.read_to_end(&mut output)?;

    let res = handle.wait()?;
    Ok((res, output))
}

/// Runs `cmd` through the shell with inherited stdio.
pub fn run_status(cmd: &[u8], working_dir: &[u8]) -> Result<ExitStatus> {
    log!("run_status({})", String::from_utf8_lossy(cmd));
    Ok(shell_command(cmd, working_dir).status()?)
}

pub fn is_wildcard(s: &[u8]) -> bool {
    s.iter().any(|c| matches!(c, b'*' | b'?' | b'['))
}

/// Shell-style wildcard match of the whole string. `*` also matches `/`.
pub fn fnmatch(pattern: &[u8], string: &[u8]) -> bool {
    let (Ok(pattern), Ok(string)) = (CString::new(pattern), CString::new(string)) else {
        return false;
    };
    // SAFETY: This is a relatively simple C func, both CStrings are inputs
    // and only need to last through the function call.
    unsafe { libc::fnmatch(pattern.as_ptr(), string.as_ptr(), 0) == 0 }
}

pub struct DirEntry {
    pub name: Bytes,
    pub is_dir: bool,
}

/// The entries of `dir`, sorted by name. Unreadable directories are empty.
pub fn list_dir(dir: &[u8]) -> Vec<DirEntry> {
    let Ok(entries) = std::fs::read_dir(os_str(dir)) else {
        return Vec::new();
    };
    let mut ret: Vec<DirEntry> = entries
        .filter_map(|e| e.ok())
        .map(|e| DirEntry {
            name: Bytes::copy_from_slice(e.file_name().as_bytes()),
            is_dir: e.file_type().is_ok_and(|t| t.is_dir()),
        })
        .collect();
    ret.sort_by(|a, b| a.name.cmp(&b.name));
    ret
}

/// Gives `file` the modification time of `reference`.
pub fn touch(file: &[u8], reference: &[u8]) -> Result<()> {
    let Some(mtime) = get_timestamp(reference)? else {
        anyhow::bail!("Cannot stat() reference file {}", String::from_utf8_lossy(reference));
    };
    let f = File::options().write(true).open(os_str(file))?;
    f.set_times(FileTimes::new().set_modified(mtime))?;
    Ok(())
}

pub fn mkpath(path: &[u8]) -> Result<()> {
    std::fs::create_dir_all(os_str(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnmatch() {
        assert!(fnmatch(b"deb*", b"debug"));
        assert!(fnmatch(b"*", b"a/b"));
        assert!(fnmatch(b"x?z", b"xyz"));
        assert!(!fnmatch(b"release", b"debug"));
        assert!(!fnmatch(b"a\0", b"a"));
    }

    #[test]
    fn test_run_command() {
        let (status, out) = run_command(b"echo hi; echo there", b"").unwrap();
        assert!(status.success());
        assert_eq!(out, b"hi\nthere\n");
        assert!(!run_status(b"exit 3", b"/").unwrap().success());
    }

    #[test]
    fn test_list_dir_and_touch() {
        let dir = std::env::temp_dir().join(format!("proeval-fileutil-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("b.txt"), "b").unwrap();
        std::fs::write(dir.join("a.txt"), "a").unwrap();
        let d = dir.as_os_str().as_bytes();
        let names: Vec<_> = list_dir(d).into_iter().map(|e| (e.name, e.is_dir)).collect();
        assert_eq!(
            names,
            vec![
                (Bytes::from_static(b"a.txt"), false),
                (Bytes::from_static(b"b.txt"), false),
                (Bytes::from_static(b"sub"), true),
            ]
        );

        let a = dir.join("a.txt");
        let b = dir.join("b.txt");
        let old = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        File::options()
            .write(true)
            .open(&b)
            .unwrap()
            .set_times(FileTimes::new().set_modified(old))
            .unwrap();
        touch(a.as_os_str().as_bytes(), b.as_os_str().as_bytes()).unwrap();
        assert_eq!(get_timestamp(a.as_os_str().as_bytes()).unwrap(), Some(old));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
