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

//! Settings shared by every evaluator of one run: the command line, the
//! environment, properties and the registry of base environments.

use std::{collections::HashMap, os::unix::ffi::OsStrExt, sync::Arc};

use anyhow::{Result, bail};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::{
    eval::BaseEnv,
    proitem::ProString,
    strutil::{clean_path, has_path_prefix, resolve_path},
};

/// Identifies a base environment. Projects sharing a build root, a stash
/// file and the host/target choice start from the same evaluated spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseKey {
    pub build_root: Bytes,
    pub stash_file: Bytes,
    pub host_build: bool,
}

/// Parsing state that spans several calls to
/// [`Globals::add_command_line_arguments`].
#[derive(Default)]
pub struct CmdLineState {
    pub pwd: Bytes,
    pub after: bool,
    pub precmds: Vec<Bytes>,
    pub preconfigs: Vec<Bytes>,
    pub postcmds: Vec<Bytes>,
    pub postconfigs: Vec<Bytes>,
}

pub struct Globals {
    pub qmakespec: Bytes,
    pub xqmakespec: Bytes,
    pub user_template: Bytes,
    pub user_template_prefix: Bytes,
    pub precmds: Bytes,
    pub postcmds: Bytes,
    pub properties: HashMap<Bytes, Bytes>,
    /// Replaces the process environment when set.
    pub environment: Option<HashMap<Bytes, Bytes>>,
    pub dir_sep: Bytes,
    pub dirlist_sep: Bytes,
    pub source_root: Bytes,
    pub build_root: Bytes,
    pub cachefile: Bytes,
    pub do_cache: bool,
    pub qmake_abslocation: Bytes,
    pub qmake_args: Vec<Bytes>,
    pub debug_level: i32,
    pub(crate) base_envs: Mutex<HashMap<BaseKey, Arc<BaseEnv>>>,
}

impl Default for Globals {
    fn default() -> Self {
        Globals {
            qmakespec: Bytes::new(),
            xqmakespec: Bytes::new(),
            user_template: Bytes::new(),
            user_template_prefix: Bytes::new(),
            precmds: Bytes::new(),
            postcmds: Bytes::new(),
            properties: HashMap::new(),
            environment: None,
            dir_sep: Bytes::from_static(b"/"),
            dirlist_sep: Bytes::from_static(b":"),
            source_root: Bytes::new(),
            build_root: Bytes::new(),
            cachefile: Bytes::new(),
            do_cache: true,
            qmake_abslocation: Bytes::new(),
            qmake_args: Vec::new(),
            debug_level: 0,
            base_envs: Mutex::new(HashMap::new()),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ArgState {
    None,
    Config,
    Spec,
    XSpec,
    Template,
    TemplatePrefix,
    Cache,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    fn clean_spec(state: &CmdLineState, spec: &[u8]) -> Result<Bytes> {
        let ret = clean_path(spec);
        if ret.contains(&b'/') {
            let abs = resolve_path(&state.pwd, &ret)?;
            if crate::fileutil::is_dir(&abs) {
                return Ok(abs);
            }
        }
        Ok(ret)
    }

    /// Consumes qmake style arguments: options, `VAR=value` assignments and
    /// `-config` values. Assignments and configs seen after `-after` apply
    /// once the project has been read.
    pub fn add_command_line_arguments(
        &mut self,
        state: &mut CmdLineState,
        args: &[Bytes],
    ) -> Result<()> {
        let mut arg_state = ArgState::None;
        for arg in args {
            match arg_state {
                ArgState::Config => {
                    if state.after {
                        state.postconfigs.push(arg.clone());
                    } else {
                        state.preconfigs.push(arg.clone());
                    }
                }
                ArgState::Spec => self.qmakespec = Self::clean_spec(state, arg)?,
                ArgState::XSpec => self.xqmakespec = Self::clean_spec(state, arg)?,
                ArgState::Template => self.user_template = arg.clone(),
                ArgState::TemplatePrefix => self.user_template_prefix = arg.clone(),
                ArgState::Cache => self.cachefile = resolve_path(&state.pwd, arg)?,
                ArgState::None => {
                    if arg.starts_with(b"-") {
                        arg_state = match arg.as_ref() {
                            b"-after" => {
                                state.after = true;
                                ArgState::None
                            }
                            b"-config" => ArgState::Config,
                            b"-nocache" => {
                                self.do_cache = false;
                                ArgState::None
                            }
                            b"-cache" => ArgState::Cache,
                            b"-platform" | b"-spec" => ArgState::Spec,
                            b"-xplatform" | b"-xspec" => ArgState::XSpec,
                            b"-template" | b"-t" => ArgState::Template,
                            b"-template_prefix" | b"-tp" => ArgState::TemplatePrefix,
                            b"-win32" => {
                                self.dir_sep = Bytes::from_static(b"\\");
                                ArgState::None
                            }
                            b"-unix" => {
                                self.dir_sep = Bytes::from_static(b"/");
                                ArgState::None
                            }
                            _ => bail!("Unknown option {}", String::from_utf8_lossy(arg)),
                        };
                    } else if arg.contains(&b'=') {
                        if state.after {
                            state.postcmds.push(arg.clone());
                        } else {
                            state.precmds.push(arg.clone());
                        }
                    } else {
                        bail!("Unexpected argument {}", String::from_utf8_lossy(arg));
                    }
                    continue;
                }
            }
            arg_state = ArgState::None;
        }
        if arg_state != ArgState::None {
            bail!("Missing value for the last option");
        }
        Ok(())
    }

    pub fn commit_command_line_arguments(&mut self, state: &mut CmdLineState) {
        if !state.preconfigs.is_empty() {
            state
                .precmds
                .push(config_assignment(&state.preconfigs));
        }
        self.precmds = Bytes::from(state.precmds.join(&b'\n'));
        if !state.postconfigs.is_empty() {
            state
                .postcmds
                .push(config_assignment(&state.postconfigs));
        }
        self.postcmds = Bytes::from(state.postcmds.join(&b'\n'));
        if self.xqmakespec.is_empty() {
            self.xqmakespec = self.qmakespec.clone();
        }
    }

    /// Derives the source and build roots from a project directory and its
    /// output directory by stripping their common trailing components.
    pub fn set_directories(&mut self, input_dir: &[u8], output_dir: &[u8]) {
        if input_dir == output_dir || output_dir.is_empty() {
            return;
        }
        let with_slash = |s: &[u8]| {
            let mut v = s.to_vec();
            if !v.ends_with(b"/") {
                v.push(b'/');
            }
            v
        };
        let src = with_slash(input_dir);
        let dst = with_slash(output_dir);
        let mut src_len = src.len();
        let mut dst_len = dst.len();
        let mut last_sl = 0;
        loop {
            src_len -= 1;
            dst_len -= 1;
            if src_len == 0 || dst_len == 0 || src[src_len] != dst[dst_len] {
                break;
            }
            if src[src_len] == b'/' {
                last_sl = 0;
            }
            last_sl += 1;
        }
        // Cut just before the last separator both paths share.
        self.source_root = Bytes::copy_from_slice(&src[..src_len + last_sl]);
        self.build_root = Bytes::copy_from_slice(&dst[..dst_len + last_sl]);
    }

    /// Maps a path below the source root to the build root. Paths outside
    /// the source tree have no shadow.
    pub fn shadowed_path(&self, file_name: &[u8]) -> Bytes {
        if self.source_root.is_empty() {
            return Bytes::copy_from_slice(file_name);
        }
        if has_path_prefix(file_name, &self.source_root) {
            let mut ret = BytesMut::from(&self.build_root[..]);
            ret.put_slice(&file_name[self.source_root.len()..]);
            return ret.freeze();
        }
        Bytes::new()
    }

    pub fn getenv(&self, name: &[u8]) -> Bytes {
        match &self.environment {
            Some(env) => env.get(name).cloned().unwrap_or_default(),
            None => std::env::var_os(crate::fileutil::os_str(name))
                .map(|v| Bytes::copy_from_slice(v.as_bytes()))
                .unwrap_or_default(),
        }
    }

    /// Replaces `$(NAME)` references with environment values.
    pub fn expand_env_vars(&self, s: &[u8]) -> Bytes {
        let mut string = s.to_vec();
        let mut start = 0;
        while let Some(idx) = memchr::memchr(b'$', &string[start..]) {
            start += idx;
            if string.len() < start + 3 {
                break;
            }
            if string[start + 1] != b'(' {
                start += 1;
                continue;
            }
            let Some(end) = memchr::memchr(b')', &string[start + 2..]) else {
                break;
            };
            let end = start + 2 + end;
            let value = self.getenv(&string[start + 2..end]);
            string.splice(start..=end, value.iter().copied());
            start += value.len();
        }
        Bytes::from(string)
    }

    pub fn split_path_list(&self, val: &[u8]) -> Vec<Bytes> {
        if val.is_empty() {
            return Vec::new();
        }
        memchr::memmem::find_iter(val, &self.dirlist_sep[..])
            .chain(std::iter::once(val.len()))
            .scan(0, |start, end| {
                let part = &val[*start..end];
                *start = end + self.dirlist_sep.len();
                Some(part)
            })
            .filter(|p| !p.is_empty())
            .map(clean_path)
            .collect()
    }

    pub fn get_path_list_env(&self, var: &[u8]) -> Vec<Bytes> {
        self.split_path_list(&self.getenv(var))
    }

    /// Looks up a property. `NAME/get`, `NAME/src` and `NAME/raw` fall back
    /// to `NAME`.
    pub fn property_value(&self, name: &[u8]) -> Option<ProString> {
        if let Some(v) = self.properties.get(name) {
            return Some(ProString::new(v.clone()));
        }
        for suffix in [&b"/get"[..], b"/src", b"/raw"] {
            if let Some(base) = name.strip_suffix(suffix)
                && let Some(v) = self.properties.get(base)
            {
                return Some(ProString::new(v.clone()));
            }
        }
        if name == b"QMAKE_MKSPECS" {
            for host_data in [&b"QT_HOST_DATA/src"[..], b"QT_HOST_DATA/get"] {
                if let Some(dir) = self.property_value(host_data) {
                    let mut ret = dir.bytes().to_vec();
                    ret.extend_from_slice(b"/mkspecs");
                    return Some(ProString::new(ret));
                }
            }
        }
        None
    }

    pub fn set_property(&mut self, name: &[u8], value: &[u8]) {
        self.properties
            .insert(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
    }

    pub(crate) fn base_env(&self, key: &BaseKey) -> Option<Arc<BaseEnv>> {
        self.base_envs.lock().get(key).cloned()
    }

    /// Drops every base environment. Base environments refer back to the
    /// globals, so this must run before the globals can be freed.
    pub fn reset_base_envs(&self) {
        self.base_envs.lock().clear();
    }
}

fn config_assignment(configs: &[Bytes]) -> Bytes {
    let mut ret = b"CONFIG += ".to_vec();
    ret.extend_from_slice(&configs.join(&b' '));
    Bytes::from(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<Bytes> {
        list.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
    }

    #[test]
    fn test_command_line_arguments() {
        let mut globals = Globals::new();
        let mut state = CmdLineState {
            pwd: Bytes::from_static(b"/tmp"),
            ..Default::default()
        };
        globals
            .add_command_line_arguments(
                &mut state,
                &args(&[
                    "-config", "debug", "A=1", "-t", "lib", "-after", "B=2", "-config", "x",
                    "-win32", "-nocache",
                ]),
            )
            .unwrap();
        globals.commit_command_line_arguments(&mut state);
        assert_eq!(globals.precmds, "A=1\nCONFIG += debug");
        assert_eq!(globals.postcmds, "B=2\nCONFIG += x");
        assert_eq!(globals.user_template, "lib");
        assert_eq!(globals.dir_sep, "\\");
        assert!(!globals.do_cache);

        let mut state = CmdLineState::default();
        assert!(
            globals
                .add_command_line_arguments(&mut state, &args(&["-bogus"]))
                .is_err()
        );
        assert!(
            globals
                .add_command_line_arguments(&mut state, &args(&["-spec"]))
                .is_err()
        );
    }

    #[test]
    fn test_spec_defaults() {
        let mut globals = Globals::new();
        let mut state = CmdLineState::default();
        globals
            .add_command_line_arguments(&mut state, &args(&["-spec", "linux-g++"]))
            .unwrap();
        globals.commit_command_line_arguments(&mut state);
        assert_eq!(globals.qmakespec, "linux-g++");
        assert_eq!(globals.xqmakespec, "linux-g++");
    }

    #[test]
    fn test_set_directories() {
        let mut globals = Globals::new();
        globals.set_directories(b"/a/src/x", b"/a/build/x");
        assert_eq!(globals.source_root, "/a/src");
        assert_eq!(globals.build_root, "/a/build");
        assert_eq!(globals.shadowed_path(b"/a/src/x/y.pro"), "/a/build/x/y.pro");
        assert_eq!(globals.shadowed_path(b"/a/other"), "");

        let mut globals = Globals::new();
        globals.set_directories(b"/p", b"/p");
        assert!(globals.source_root.is_empty());
        assert_eq!(globals.shadowed_path(b"/p/q"), "/p/q");
    }

    #[test]
    fn test_env_expansion() {
        let mut globals = Globals::new();
        let mut env = HashMap::new();
        env.insert(Bytes::from_static(b"HOME"), Bytes::from_static(b"/home/u"));
        env.insert(Bytes::from_static(b"P"), Bytes::from_static(b"/x::/y/../z"));
        globals.environment = Some(env);
        assert_eq!(globals.expand_env_vars(b"$(HOME)/bin $$x $(NONE)."), "/home/u/bin $$x .");
        assert_eq!(globals.getenv(b"HOME"), "/home/u");
        assert_eq!(
            globals.get_path_list_env(b"P"),
            vec![Bytes::from_static(b"/x"), Bytes::from_static(b"/z")]
        );
    }

    #[test]
    fn test_properties() {
        let mut globals = Globals::new();
        globals.set_property(b"QT_HOST_DATA", b"/qt");
        assert_eq!(
            globals.property_value(b"QT_HOST_DATA/get").unwrap(),
            "/qt"
        );
        assert_eq!(
            globals.property_value(b"QMAKE_MKSPECS").unwrap(),
            "/qt/mkspecs"
        );
        assert!(globals.property_value(b"NOPE").is_none());
    }
}
