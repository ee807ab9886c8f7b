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

//! The interpreter for parsed project files.
//!
//! An [`Evaluator`] walks the token stream of a [`ProFile`] and keeps a stack
//! of variable scopes. Function calls push a scope, everything else writes
//! to the innermost one. Projects loaded with [`LoadFlags::PRE_FILES`]
//! start from a shared base environment holding the evaluated mkspec.

use std::{
    collections::{HashMap, HashSet},
    ops::BitOr,
    sync::{Arc, LazyLock},
};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};

use crate::{
    collect_stats, cond,
    fileutil::exists,
    func,
    globals::{BaseKey, Globals},
    handler::{EvalFileType, MessageHandler, MsgType},
    loc::Loc,
    log,
    parser::{Grammar, ParseFlags, QmakeParser},
    proitem::{
        ProFile, ProKey, ProString, ProStringList, ProValue, ProValueMap, TOK_NEW_STR, TOK_QUOTED,
        Tok, TokenCursor, ValueList,
    },
    strutil::{
        self, base_name_no_ext, basename, clean_path, compile_regex, dirname, is_absolute_path,
        qt_replacement, regexp_escape,
    },
    vfs::Vfs,
};

/// A fatal error stopped the evaluation. It has been reported already.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;

pub type EvalResult<T> = Result<T, Aborted>;

/// The outcome of evaluating a block, a test or a whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitReturn {
    False,
    True,
    Return,
    Break,
    Next,
    Error,
}

impl From<bool> for VisitReturn {
    fn from(b: bool) -> Self {
        if b {
            VisitReturn::True
        } else {
            VisitReturn::False
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadFlags(u8);

impl LoadFlags {
    pub const PRO_ONLY: LoadFlags = LoadFlags(0);
    /// Set up the project and run `default_pre.prf` and the pre-commands.
    pub const PRE_FILES: LoadFlags = LoadFlags(1);
    /// Run the post-commands, `default_post.prf` and the CONFIG features.
    pub const POST_FILES: LoadFlags = LoadFlags(2);
    pub const ALL: LoadFlags = LoadFlags(3);
    /// Keep the file out of `QMAKE_INTERNAL_INCLUDED_FILES`.
    pub const HIDDEN: LoadFlags = LoadFlags(4);
    /// Do not complain about a missing file.
    pub const SILENT: LoadFlags = LoadFlags(8);

    pub fn contains(self, other: LoadFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for LoadFlags {
    type Output = LoadFlags;

    fn bitor(self, rhs: LoadFlags) -> LoadFlags {
        LoadFlags(self.0 | rhs.0)
    }
}

/// Where the body of a user defined function starts.
#[derive(Clone)]
pub(crate) struct FunctionDef {
    pro: Arc<ProFile>,
    offset: usize,
}

#[derive(Clone, Default)]
pub(crate) struct FunctionDefs {
    pub(crate) test: HashMap<ProKey, FunctionDef>,
    pub(crate) replace: HashMap<ProKey, FunctionDef>,
}

/// The directories searched for features, with a memo of lookups keyed by
/// feature file name and the feature that asked for it.
pub(crate) struct FeatureRoots {
    paths: Vec<Bytes>,
    // An empty result records a failed lookup.
    cache: Mutex<HashMap<(Bytes, Bytes), Bytes>>,
}

#[derive(Clone, Default)]
pub(crate) struct Location {
    pub(crate) pro: Option<Arc<ProFile>>,
    pub(crate) line: i32,
}

#[derive(Default)]
pub(crate) struct BaseEnv {
    pub(crate) state: Mutex<BaseEnvState>,
    pub(crate) cond: Condvar,
}

#[derive(Default)]
pub(crate) struct BaseEnvState {
    pub(crate) in_progress: bool,
    pub(crate) is_ok: bool,
    pub(crate) evaluator: Option<Box<Evaluator>>,
}

static DEPRECATED_VARS: LazyLock<HashMap<&'static [u8], &'static str>> = LazyLock::new(|| {
    [
        ("INTERFACES", "FORMS"),
        ("QMAKE_POST_BUILD", "QMAKE_POST_LINK"),
        ("TARGETDEPS", "POST_TARGETDEPS"),
        ("LIBPATH", "QMAKE_LIBDIR"),
        ("QMAKE_EXT_MOC", "QMAKE_EXT_CPP_MOC"),
        ("QMAKE_MOD_MOC", "QMAKE_H_MOD_MOC"),
        ("QMAKE_LFLAGS_SHAPP", "QMAKE_LFLAGS_APP"),
        ("PRECOMPH", "PRECOMPILED_HEADER"),
        ("PRECOMPCPP", "PRECOMPILED_SOURCE"),
        ("INCPATH", "INCLUDEPATH"),
        ("QMAKE_EXTRA_WIN_COMPILERS", "QMAKE_EXTRA_COMPILERS"),
        ("QMAKE_EXTRA_UNIX_COMPILERS", "QMAKE_EXTRA_COMPILERS"),
        ("QMAKE_EXTRA_WIN_TARGETS", "QMAKE_EXTRA_TARGETS"),
        ("QMAKE_EXTRA_UNIX_TARGETS", "QMAKE_EXTRA_TARGETS"),
        ("QMAKE_EXTRA_UNIX_INCLUDES", "QMAKE_EXTRA_INCLUDES"),
        ("QMAKE_EXTRA_UNIX_VARIABLES", "QMAKE_EXTRA_VARIABLES"),
        ("QMAKE_RPATH", "QMAKE_LFLAGS_RPATH"),
        ("QMAKE_FRAMEWORKDIR", "QMAKE_FRAMEWORKPATH"),
        ("QMAKE_FRAMEWORKDIR_FLAGS", "QMAKE_FRAMEWORKPATH_FLAGS"),
        ("IN_PWD", "PWD"),
    ]
    .into_iter()
    .map(|(old, new)| (old.as_bytes(), new))
    .collect()
});

pub(crate) fn key(name: &'static str) -> ProKey {
    ProKey::from_static(name)
}

fn concat(a: &[u8], b: &[u8]) -> Bytes {
    let mut ret = BytesMut::with_capacity(a.len() + b.len());
    ret.put_slice(a);
    ret.put_slice(b);
    ret.freeze()
}

fn is_root(dir: &[u8]) -> bool {
    dir.is_empty() || dir == b"/"
}

fn add_str(s: ProString, ret: &mut ProStringList, pending: &mut bool, joined: bool) {
    if joined {
        if let Some(last) = ret.last_mut() {
            last.append(&s, Some(pending));
        }
    } else if !*pending {
        *pending = true;
        ret.push(s);
    } else if let Some(last) = ret.last_mut() {
        last.append(&s, None);
    }
}

fn add_str_list(
    list: ProStringList,
    tok: u16,
    ret: &mut ProStringList,
    pending: &mut bool,
    joined: bool,
) {
    if list.is_empty() {
        return;
    }
    if joined {
        if let Some(last) = ret.last_mut() {
            last.append_list(&list, Some(pending), tok & TOK_QUOTED == 0);
        }
    } else if tok & TOK_QUOTED != 0 {
        if !*pending {
            *pending = true;
            ret.push(ProString::default());
        }
        if let Some(last) = ret.last_mut() {
            last.append_list(&list, None, false);
        }
    } else {
        if !*pending {
            // A leading empty value is swallowed when nothing is pending.
            if !list[0].is_empty() {
                *pending = true;
                ret.extend(list);
                return;
            }
        } else if let Some(last) = ret.last_mut() {
            last.append(&list[0], None);
        }
        for s in list.into_iter().skip(1) {
            *pending = true;
            ret.push(s);
        }
    }
}

fn zip_empty(list: &mut ProStringList) {
    list.retain(|s| !s.is_empty());
}

fn insert_unique(list: &mut ProStringList, values: &[ProString]) {
    for s in values {
        if !s.is_empty() && !list.contains(s) {
            list.push(s.clone());
        }
    }
}

fn remove_each(list: &mut ProStringList, values: &[ProString]) {
    for s in values {
        if !s.is_empty() {
            list.remove_all(s.as_bytes());
        }
    }
}

fn replace_in_list(list: &mut ProStringList, re: &regex::bytes::Regex, replace: &[u8], global: bool) {
    let mut i = 0;
    while i < list.len() {
        let val = list[i].as_bytes();
        let replaced = re.replace_all(val, replace);
        let changed = (replaced.as_ref() != val).then(|| replaced.into_owned());
        match changed {
            Some(new) => {
                if new.is_empty() {
                    list.remove(i);
                } else {
                    list[i] = ProString::new(new).set_source_from(&list[i]);
                    i += 1;
                }
                if !global {
                    break;
                }
            }
            None => i += 1,
        }
    }
}

fn uname_fields() -> Option<[Bytes; 5]> {
    // SAFETY: utsname is plain data, all zeroes is a valid value.
    let mut name: libc::utsname = unsafe { std::mem::zeroed() };
    // SAFETY: uname only writes into the struct we pass.
    if unsafe { libc::uname(&mut name) } == -1 {
        return None;
    }
    let field = |f: &[libc::c_char]| {
        Bytes::from(
            f.iter()
                .take_while(|c| **c != 0)
                .map(|c| *c as u8)
                .collect::<Vec<u8>>(),
        )
    };
    Some([
        field(&name.sysname),
        field(&name.nodename),
        field(&name.release),
        field(&name.version),
        field(&name.machine),
    ])
}

fn current_date() -> Bytes {
    let mut buf = [0u8; 64];
    // SAFETY: localtime_r and strftime only write into the buffers we own,
    // and strftime never writes more than buf.len() bytes.
    let len = unsafe {
        let now = libc::time(std::ptr::null_mut());
        let mut tm: libc::tm = std::mem::zeroed();
        if libc::localtime_r(&now, &mut tm).is_null() {
            return Bytes::new();
        }
        libc::strftime(
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            c"%a %b %-d %H:%M:%S %Y".as_ptr(),
            &tm,
        )
    };
    Bytes::copy_from_slice(&buf[..len])
}

pub struct Evaluator {
    pub(crate) globals: Arc<Globals>,
    pub(crate) parser: Arc<QmakeParser>,
    pub(crate) vfs: Arc<Vfs>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    // Files being evaluated by the evaluators that spawned this one.
    caller_files: Vec<Bytes>,
    pub(crate) cumulative: bool,
    pub(crate) host_build: bool,
    pub(crate) skip_level: i32,
    pub(crate) list_count: u32,
    pub(crate) value_stack: Vec<ProValueMap>,
    value_map_inited: bool,
    pub(crate) function_defs: FunctionDefs,
    return_value: ProStringList,
    pub(crate) current: Location,
    location_stack: Vec<Location>,
    profile_stack: Vec<Arc<ProFile>>,
    pub(crate) output_dir: Bytes,
    pub(crate) qmakespec: Bytes,
    pub(crate) qmakespec_name: Bytes,
    pub(crate) superfile: Bytes,
    pub(crate) conffile: Bytes,
    pub(crate) cachefile: Bytes,
    pub(crate) stashfile: Bytes,
    pub(crate) source_root: Bytes,
    pub(crate) build_root: Bytes,
    pub(crate) qmakepath: Vec<Bytes>,
    pub(crate) qmakefeatures: Vec<Bytes>,
    pub(crate) mkspec_paths: Vec<Bytes>,
    pub(crate) feature_roots: Option<Arc<FeatureRoots>>,
    pub(crate) dir_sep: ProString,
    extra_vars: ProValueMap,
    extra_configs: ProStringList,
    warned_deprecated: HashSet<ProKey>,
    // Set while this evaluator is loading the spec of a base environment.
    pub(crate) loading_base: Option<BaseKey>,
}

impl Evaluator {
    pub fn new(
        globals: Arc<Globals>,
        parser: Arc<QmakeParser>,
        vfs: Arc<Vfs>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let dir_sep = ProString::new(globals.dir_sep.clone());
        Evaluator {
            globals,
            parser,
            vfs,
            handler,
            caller_files: Vec::new(),
            cumulative: false,
            host_build: false,
            skip_level: 0,
            list_count: 0,
            value_stack: vec![ProValueMap::new()],
            value_map_inited: false,
            function_defs: FunctionDefs::default(),
            return_value: ProStringList::new(),
            current: Location::default(),
            location_stack: Vec::new(),
            profile_stack: Vec::new(),
            output_dir: Bytes::new(),
            qmakespec: Bytes::new(),
            qmakespec_name: Bytes::new(),
            superfile: Bytes::new(),
            conffile: Bytes::new(),
            cachefile: Bytes::new(),
            stashfile: Bytes::new(),
            source_root: Bytes::new(),
            build_root: Bytes::new(),
            qmakepath: Vec::new(),
            qmakefeatures: Vec::new(),
            mkspec_paths: Vec::new(),
            feature_roots: None,
            dir_sep,
            extra_vars: ProValueMap::new(),
            extra_configs: ProStringList::new(),
            warned_deprecated: HashSet::new(),
            loading_base: None,
        }
    }

    /// A fresh evaluator sharing this one's collaborators.
    pub(crate) fn sibling(&self) -> Evaluator {
        Evaluator::new(
            self.globals.clone(),
            self.parser.clone(),
            self.vfs.clone(),
            self.handler.clone(),
        )
    }

    /// Best-effort mode: walk both branches of conditionals, never abort on
    /// `error()` and do not run external commands.
    pub fn set_cumulative(&mut self, on: bool) {
        self.cumulative = on;
    }

    pub fn set_output_dir(&mut self, dir: impl Into<Bytes>) {
        self.output_dir = dir.into();
    }

    /// Variables injected into the outermost scope after project setup.
    pub fn set_extra_vars(&mut self, vars: ProValueMap) {
        self.extra_vars = vars;
    }

    /// CONFIG values re-applied around the pre and post commands.
    pub fn set_extra_configs(&mut self, configs: ProStringList) {
        self.extra_configs = configs;
    }

    pub(crate) fn message(&self, kind: MsgType, msg: &str) {
        if self.skip_level != 0 {
            return;
        }
        let loc = match &self.current.pro {
            Some(pro) if self.current.line != 0 => {
                Some(Loc::new(pro.file_name().clone(), self.current.line))
            }
            _ => None,
        };
        self.handler.message(kind, msg, loc.as_ref());
    }

    pub(crate) fn eval_error(&self, msg: &str) {
        self.message(MsgType::EvalError, msg);
    }

    pub(crate) fn language_warning(&self, msg: &str) {
        self.message(MsgType::EvalWarnLanguage, msg);
    }

    pub(crate) fn deprecation_warning(&self, msg: &str) {
        self.message(MsgType::EvalWarnDeprecated, msg);
    }

    pub(crate) fn push_location(&mut self) {
        self.location_stack.push(self.current.clone());
    }

    pub(crate) fn pop_location(&mut self) {
        self.current = self.location_stack.pop().unwrap_or_default();
    }

    pub(crate) fn current_pro_file(&self) -> Option<Arc<ProFile>> {
        self.profile_stack.last().cloned()
    }

    pub(crate) fn current_file_name(&self) -> Bytes {
        self.profile_stack
            .last()
            .map(|pro| pro.file_name().clone())
            .unwrap_or_default()
    }

    pub(crate) fn current_directory(&self) -> Bytes {
        self.profile_stack
            .last()
            .map(|pro| pro.directory_name().clone())
            .unwrap_or_default()
    }

    /// Makes a path absolute relative to the file being evaluated.
    pub(crate) fn resolve_path(&self, file_name: &[u8]) -> Bytes {
        strutil::resolve_path(&self.current_directory(), file_name)
            .unwrap_or_else(|_| clean_path(file_name))
    }

    // Variable access

    pub(crate) fn top_mut(&mut self) -> &mut ProValueMap {
        let n = self.value_stack.len() - 1;
        &mut self.value_stack[n]
    }

    /// The innermost definition of a variable, if it is set.
    pub(crate) fn find_values(&self, name: &ProKey) -> Option<&ProStringList> {
        self.value_stack
            .iter()
            .rev()
            .find_map(|map| map.get(name))
            .and_then(|v| v.as_list())
    }

    /// The variable's list in the innermost scope, copied there from an
    /// outer scope first if necessary.
    pub(crate) fn values_ref(&mut self, name: &ProKey) -> &mut ProStringList {
        let n = self.value_stack.len() - 1;
        if !self.value_stack[n].contains_key(name) {
            let init = self.value_stack[..n]
                .iter()
                .rev()
                .find_map(|map| map.get(name))
                .and_then(|v| v.as_list())
                .cloned()
                .unwrap_or_default();
            self.value_stack[n].insert(name.clone(), ProValue::Set(init));
        }
        self.value_stack[n]
            .entry(name.clone())
            .or_insert(ProValue::Unset)
            .make_set()
    }

    pub fn values(&self, name: &ProKey) -> ProStringList {
        self.find_values(name).cloned().unwrap_or_default()
    }

    pub fn first(&self, name: &ProKey) -> ProString {
        self.find_values(name)
            .and_then(|list| list.first())
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &ProKey, value: &[u8]) -> bool {
        self.find_values(name)
            .is_some_and(|list| list.contains_value(value))
    }

    /// Every visible variable with its value, sorted by name.
    pub fn variables(&self) -> Vec<(ProKey, ProStringList)> {
        let mut merged: HashMap<&ProKey, &ProValue> = HashMap::new();
        for map in self.value_stack.iter().rev() {
            for (k, v) in map {
                merged.entry(k).or_insert(v);
            }
        }
        let mut ret: Vec<(ProKey, ProStringList)> = merged
            .into_iter()
            .filter_map(|(k, v)| v.as_list().map(|list| (k.clone(), list.clone())))
            .collect();
        ret.sort_by(|a, b| a.0.cmp(&b.0));
        ret
    }

    /// Resolves deprecated variable names.
    pub(crate) fn map(&mut self, var: &ProKey) -> ProKey {
        let Some(new) = DEPRECATED_VARS.get(var.as_bytes()) else {
            return var.clone();
        };
        if self.warned_deprecated.insert(var.clone()) {
            self.deprecation_warning(&format!("Variable {var} is deprecated; use {new} instead."));
        }
        ProKey::from_static(new)
    }

    pub(crate) fn property_value(&self, name: &ProKey) -> ProString {
        if *name == "QMAKE_MKSPECS" {
            return ProString::new(self.mkspec_paths.join(&self.globals.dirlist_sep[..]));
        }
        self.globals
            .property_value(name.as_bytes())
            .unwrap_or_default()
    }

    pub fn is_active_config(&self, config: &[u8], regex: bool) -> bool {
        match config {
            b"true" => return true,
            b"false" => return false,
            b"host_build" => return self.host_build,
            _ => {}
        }
        let configs = self.find_values(&key("CONFIG"));
        if regex && config.iter().any(|c| matches!(c, b'*' | b'?')) {
            if crate::fileutil::fnmatch(config, &self.qmakespec_name) {
                return true;
            }
            configs.is_some_and(|list| {
                list.iter()
                    .any(|v| crate::fileutil::fnmatch(config, v.as_bytes()))
            })
        } else {
            self.qmakespec_name == config
                || configs.is_some_and(|list| list.contains_value(config))
        }
    }

    // Expressions

    fn evaluate_expression(
        &mut self,
        cur: &mut TokenCursor,
        ret: &mut ProStringList,
        joined: bool,
    ) -> EvalResult<()> {
        if joined {
            ret.push(ProString::default());
        }
        let mut pending = false;
        loop {
            let tok = cur.next_word();
            if tok & TOK_NEW_STR != 0 {
                pending = false;
            }
            match Tok::from_code(tok) {
                Some(Tok::Line) => self.current.line = cur.get_u32() as i32,
                Some(Tok::Literal) => {
                    let s = cur.get_str();
                    add_str(s, ret, &mut pending, joined);
                }
                Some(Tok::HashLiteral) => {
                    let s = cur.get_hash_str().to_pro_string();
                    add_str(s, ret, &mut pending, joined);
                }
                Some(Tok::Variable) => {
                    let var = cur.get_hash_str();
                    let var = self.map(&var);
                    let vals = self.values(&var);
                    add_str_list(vals, tok, ret, &mut pending, joined);
                }
                Some(Tok::Property) => {
                    let name = cur.get_hash_str();
                    let val = self
                        .property_value(&name)
                        .set_source(self.current_pro_file());
                    add_str(val, ret, &mut pending, joined);
                }
                Some(Tok::EnvVar) => {
                    let name = cur.get_str();
                    let val = ProString::new(self.globals.getenv(name.as_bytes()))
                        .set_source(self.current_pro_file());
                    add_str(val, ret, &mut pending, joined);
                }
                Some(Tok::FuncName) => {
                    let func = cur.get_hash_str();
                    let vals = self.evaluate_expand_function(&func, cur)?;
                    add_str_list(vals, tok, ret, &mut pending, joined);
                }
                _ => {
                    cur.unread();
                    return Ok(());
                }
            }
        }
    }

    fn skip_expression(&mut self, cur: &mut TokenCursor) {
        loop {
            let tok = cur.next_word();
            match Tok::from_code(tok) {
                Some(Tok::Line) => self.current.line = cur.get_u32() as i32,
                Some(Tok::ValueTerminator | Tok::FuncTerminator) => return,
                Some(Tok::ArgSeparator) => {}
                Some(Tok::Literal | Tok::EnvVar) => cur.skip_str(),
                Some(Tok::HashLiteral | Tok::Variable | Tok::Property) => cur.skip_hash_str(),
                Some(Tok::FuncName) => {
                    cur.skip_hash_str();
                    self.skip_expression(cur);
                }
                _ => {
                    cur.unread();
                    return;
                }
            }
        }
    }

    /// Evaluates a value up to its terminator. With `joined`, each
    /// comma separated argument becomes a single string.
    pub(crate) fn expand_variable_references(
        &mut self,
        cur: &mut TokenCursor,
        joined: bool,
    ) -> EvalResult<ProStringList> {
        let mut ret = ProStringList::new();
        loop {
            self.evaluate_expression(cur, &mut ret, joined)?;
            match Tok::from_code(cur.peek()) {
                Some(Tok::ValueTerminator | Tok::FuncTerminator) => {
                    cur.next_word();
                    return Ok(ret);
                }
                Some(Tok::ArgSeparator) if joined => {
                    cur.next_word();
                }
                _ => {
                    log!("unexpected token {:#x} in value", cur.peek());
                    return Ok(ret);
                }
            }
        }
    }

    fn prepare_function_args(&mut self, cur: &mut TokenCursor) -> EvalResult<Vec<ProStringList>> {
        let mut args = Vec::new();
        if Tok::from_code(cur.peek()) != Some(Tok::FuncTerminator) {
            loop {
                let mut arg = ProStringList::new();
                self.evaluate_expression(cur, &mut arg, false)?;
                args.push(arg);
                if Tok::from_code(cur.peek()) != Some(Tok::ArgSeparator) {
                    break;
                }
                cur.next_word();
            }
        }
        cur.next_word();
        Ok(args)
    }

    // Functions

    fn evaluate_function(
        &mut self,
        def: &FunctionDef,
        args: &[ProStringList],
    ) -> (VisitReturn, ProStringList) {
        if self.value_stack.len() >= 100 {
            self.eval_error("Ran into infinite recursion (depth > 100).");
            return (VisitReturn::Error, ProStringList::new());
        }
        let mut frame = ProValueMap::new();
        let mut all = ProStringList::new();
        for (i, arg) in args.iter().enumerate() {
            all.extend(arg.iter().cloned());
            frame.insert(ProKey::new((i + 1).to_string()), ProValue::Set(arg.clone()));
        }
        frame.insert(key("ARGS"), ProValue::Set(all));
        frame.insert(
            key("ARGC"),
            ProValue::Set(vec![ProString::from_int(args.len() as i64)]),
        );
        self.value_stack.push(frame);
        self.push_location();

        let mut vr = self.visit_pro_block_at(&def.pro, def.offset);
        if vr == VisitReturn::Return {
            vr = VisitReturn::True;
        }
        let ret = std::mem::take(&mut self.return_value);

        self.pop_location();
        self.value_stack.pop();
        if vr == VisitReturn::True {
            (vr, ret)
        } else {
            (vr, ProStringList::new())
        }
    }

    fn evaluate_bool_function(
        &mut self,
        def: &FunctionDef,
        args: &[ProStringList],
        name: &ProKey,
    ) -> VisitReturn {
        let (vr, ret) = self.evaluate_function(def, args);
        if vr != VisitReturn::True {
            return vr;
        }
        let Some(first) = ret.first() else {
            return VisitReturn::True;
        };
        if *first != "false" {
            if *first == "true" {
                return VisitReturn::True;
            }
            match first.to_int() {
                Some(0) => {}
                Some(_) => return VisitReturn::True,
                None => self.eval_error(&format!(
                    "Unexpected return value from test '{}': {}.",
                    name,
                    ret.join_values(b" :: ")
                )),
            }
        }
        VisitReturn::False
    }

    fn evaluate_conditional_function(
        &mut self,
        func: &ProKey,
        cur: &mut TokenCursor,
    ) -> VisitReturn {
        if let Some(info) = cond::get_test_func_info(func.as_bytes()) {
            let Ok(args) = self.expand_variable_references(cur, true) else {
                return VisitReturn::Error;
            };
            log!("calling built-in test {func}");
            return cond::evaluate_builtin_conditional(self, info, func, &args);
        }
        if let Some(def) = self.function_defs.test.get(func).cloned() {
            let Ok(args) = self.prepare_function_args(cur) else {
                return VisitReturn::Error;
            };
            log!("calling test {func}");
            return self.evaluate_bool_function(&def, &args, func);
        }
        self.skip_expression(cur);
        self.eval_error(&format!("'{func}' is not a recognized test function."));
        VisitReturn::False
    }

    fn evaluate_expand_function(
        &mut self,
        func: &ProKey,
        cur: &mut TokenCursor,
    ) -> EvalResult<ProStringList> {
        if let Some(info) = func::get_expand_func_info(func.as_bytes()) {
            let args = self.expand_variable_references(cur, true)?;
            log!("calling built-in $${func}");
            return func::evaluate_builtin_expand(self, info, func, &args);
        }
        if let Some(def) = self.function_defs.replace.get(func).cloned() {
            let args = self.prepare_function_args(cur)?;
            log!("calling $${func}");
            return match self.evaluate_function(&def, &args) {
                (VisitReturn::Error, _) => Err(Aborted),
                (_, ret) => Ok(ret),
            };
        }
        self.skip_expression(cur);
        self.eval_error(&format!("'{func}' is not a recognized replace function."));
        Ok(ProStringList::new())
    }

    /// Parses `cond` as a test expression and evaluates it in the current
    /// scope.
    pub fn evaluate_conditional(&mut self, cond: &[u8], where_: &[u8], line: i32) -> bool {
        let pro = self
            .parser
            .parsed_pro_block(cond, where_, line, Grammar::Test);
        if !pro.is_ok() {
            return false;
        }
        self.push_location();
        let ret = self.visit_pro_block_at(&pro, 0) == VisitReturn::True;
        self.pop_location();
        ret
    }

    pub(crate) fn check_requirements(&mut self, deps: &[ProString]) {
        let where_ = self
            .current
            .pro
            .as_ref()
            .map(|pro| pro.file_name().clone())
            .unwrap_or_default();
        let line = self.current.line;
        let mut failed = ProStringList::new();
        for dep in deps {
            if !self.evaluate_conditional(dep.as_bytes(), &where_, line) {
                failed.push(dep.clone());
            }
        }
        self.values_ref(&key("QMAKE_FAILED_REQUIREMENTS"))
            .extend(failed);
    }

    // Statements

    pub(crate) fn visit_pro_block_at(&mut self, pro: &Arc<ProFile>, offset: usize) -> VisitReturn {
        self.current = Location {
            pro: Some(pro.clone()),
            line: 0,
        };
        let mut cur = TokenCursor::new(pro.clone(), offset);
        self.visit_pro_block(&mut cur)
    }

    fn visit_pro_block(&mut self, cur: &mut TokenCursor) -> VisitReturn {
        let mut curr = ProStringList::new();
        let mut okey = true;
        let mut or_op = false;
        let mut invert = false;
        loop {
            let tok = cur.next_word();
            let ret = match Tok::from_code(tok) {
                Some(Tok::Terminator) => break,
                Some(Tok::Line) => {
                    self.current.line = cur.get_u32() as i32;
                    continue;
                }
                Some(
                    op @ (Tok::Assign
                    | Tok::Append
                    | Tok::AppendUnique
                    | Tok::Remove
                    | Tok::Replace),
                ) => {
                    if self.visit_pro_variable(op, &curr, cur).is_err() {
                        return VisitReturn::Error;
                    }
                    curr.clear();
                    continue;
                }
                Some(Tok::Branch) => {
                    let ret = self.visit_branch(cur, okey);
                    okey = true;
                    or_op = false;
                    ret
                }
                Some(Tok::ForLoop) => {
                    let ret = if self.cumulative {
                        // Pretend there is no loop.
                        cur.skip_hash_str();
                        let expr_len = cur.get_block_len();
                        cur.skip(expr_len);
                        let body_len = cur.get_block_len();
                        let ret = self.visit_pro_block(&mut cur.clone());
                        cur.skip(body_len);
                        ret
                    } else if okey != or_op {
                        let var = cur.get_hash_str();
                        let expr_len = cur.get_block_len();
                        let expr = cur.clone();
                        cur.skip(expr_len);
                        let body_len = cur.get_block_len();
                        let ret = self.visit_pro_loop(&var, expr, cur.clone());
                        cur.skip(body_len);
                        ret
                    } else {
                        cur.skip_hash_str();
                        let expr_len = cur.get_block_len();
                        cur.skip(expr_len);
                        let body_len = cur.get_block_len();
                        cur.skip(body_len);
                        log!("skipped loop");
                        VisitReturn::True
                    };
                    okey = true;
                    or_op = false;
                    ret
                }
                Some(def @ (Tok::TestDef | Tok::ReplaceDef)) => {
                    if self.cumulative || okey != or_op {
                        let name = cur.get_hash_str();
                        let len = cur.get_block_len();
                        let def_at = FunctionDef {
                            pro: cur.pro().clone(),
                            offset: cur.pos(),
                        };
                        log!("defined function {name}");
                        if def == Tok::TestDef {
                            self.function_defs.test.insert(name, def_at);
                        } else {
                            self.function_defs.replace.insert(name, def_at);
                        }
                        cur.skip(len);
                    } else {
                        cur.skip_hash_str();
                        let len = cur.get_block_len();
                        cur.skip(len);
                    }
                    okey = true;
                    or_op = false;
                    continue;
                }
                Some(Tok::Not) => {
                    invert ^= true;
                    continue;
                }
                Some(Tok::And) => {
                    or_op = false;
                    continue;
                }
                Some(Tok::Or) => {
                    or_op = true;
                    continue;
                }
                Some(Tok::Condition) => {
                    if self.skip_level == 0 && okey != or_op {
                        if curr.len() != 1 {
                            if !self.cumulative || !curr.is_empty() {
                                self.eval_error("Conditional must expand to exactly one word.");
                            }
                            okey = false;
                        } else {
                            okey = self.is_active_config(curr[0].as_bytes(), true) ^ invert;
                        }
                    }
                    or_op = !okey;
                    invert = false;
                    curr.clear();
                    continue;
                }
                Some(Tok::TestCall) => {
                    if self.skip_level == 0 && okey != or_op {
                        if curr.len() != 1 {
                            if !self.cumulative || !curr.is_empty() {
                                self.eval_error("Test name must expand to exactly one word.");
                            }
                            self.skip_expression(cur);
                            okey = false;
                        } else {
                            match self.evaluate_conditional_function(&curr[0].to_key(), cur) {
                                VisitReturn::True => okey = true,
                                VisitReturn::False => okey = false,
                                ret => {
                                    log!("aborting block, function status: {ret:?}");
                                    return ret;
                                }
                            }
                            okey ^= invert;
                        }
                    } else if self.cumulative {
                        self.skip_level += 1;
                        if curr.len() != 1 {
                            self.skip_expression(cur);
                        } else {
                            self.evaluate_conditional_function(&curr[0].to_key(), cur);
                        }
                        self.skip_level -= 1;
                    } else {
                        self.skip_expression(cur);
                    }
                    or_op = !okey;
                    invert = false;
                    curr.clear();
                    continue;
                }
                Some(ctl @ (Tok::Return | Tok::Break | Tok::Next)) => {
                    let ret = match ctl {
                        Tok::Return => {
                            self.return_value = std::mem::take(&mut curr);
                            VisitReturn::Return
                        }
                        Tok::Break => VisitReturn::Break,
                        _ => VisitReturn::Next,
                    };
                    if self.skip_level == 0 && okey != or_op {
                        return ret;
                    }
                    okey = false;
                    or_op = true;
                    continue;
                }
                _ => {
                    cur.unread();
                    let start = cur.pos();
                    if self.evaluate_expression(cur, &mut curr, false).is_err() {
                        return VisitReturn::Error;
                    }
                    if cur.pos() == start {
                        log!("unexpected token {tok:#x}");
                        cur.skip(2);
                    }
                    continue;
                }
            };
            if !matches!(ret, VisitReturn::True | VisitReturn::False) {
                log!("aborting block, status: {ret:?}");
                return ret;
            }
        }
        VisitReturn::from(okey)
    }

    fn visit_branch(&mut self, cur: &mut TokenCursor, okey: bool) -> VisitReturn {
        let then_len = cur.get_block_len();
        let mut ret = VisitReturn::True;
        if self.cumulative {
            if !okey {
                self.skip_level += 1;
            }
            if then_len > 0 {
                ret = self.visit_pro_block(&mut cur.clone());
            }
            cur.skip(then_len);
            let else_len = cur.get_block_len();
            if !okey {
                self.skip_level -= 1;
            } else {
                self.skip_level += 1;
            }
            if matches!(ret, VisitReturn::True | VisitReturn::False) && else_len > 0 {
                ret = self.visit_pro_block(&mut cur.clone());
            }
            if okey {
                self.skip_level -= 1;
            }
            cur.skip(else_len);
        } else {
            if okey && then_len > 0 {
                ret = self.visit_pro_block(&mut cur.clone());
            }
            cur.skip(then_len);
            let else_len = cur.get_block_len();
            if !okey && else_len > 0 {
                ret = self.visit_pro_block(&mut cur.clone());
            }
            cur.skip(else_len);
        }
        ret
    }

    fn visit_pro_loop(
        &mut self,
        var: &ProKey,
        mut expr: TokenCursor,
        body: TokenCursor,
    ) -> VisitReturn {
        let Ok(it_list) = self.expand_variable_references(&mut expr, true) else {
            return VisitReturn::Error;
        };
        let mut it_list = it_list.into_iter().next().unwrap_or_default();
        let mut variable = None;
        let mut old_value = None;
        if var.is_empty() {
            if it_list != "ever" {
                self.eval_error("Invalid loop expression.");
                return VisitReturn::False;
            }
            it_list = ProString::from_static("forever");
        } else {
            let v = self.map(var);
            old_value = self.top_mut().get(&v).cloned();
            variable = Some(v);
        }

        let mut list = self.values(&it_list.to_key());
        let mut infinite = false;
        if list.is_empty() {
            if it_list == "forever" {
                infinite = true;
            } else if let Some(dotdot) = memchr::memmem::find(it_list.as_bytes(), b"..") {
                let start = it_list.mid(0, dotdot).to_int();
                let end = it_list.mid_from(dotdot + 2).to_int();
                if let (Some(start), Some(end)) = (start, end) {
                    if start < end {
                        list.extend((start..=end).map(ProString::from_int));
                    } else {
                        list.extend((end..=start).rev().map(ProString::from_int));
                    }
                }
            }
        }

        let mut ret = VisitReturn::True;
        let mut index = 0usize;
        loop {
            if infinite {
                if let Some(v) = &variable {
                    let counter = vec![ProString::from_int(index as i64)];
                    self.top_mut().insert(v.clone(), ProValue::Set(counter));
                }
                index += 1;
                if index > 1000 {
                    self.eval_error("Ran into infinite loop (> 1000 iterations).");
                    ret = VisitReturn::Error;
                    break;
                }
            } else {
                // Empty values are skipped.
                let Some(offset) = list
                    .get(index..)
                    .and_then(|rest| rest.iter().position(|v| !v.is_empty()))
                else {
                    break;
                };
                let val = list[index + offset].clone();
                index += offset + 1;
                if let Some(v) = &variable {
                    self.top_mut().insert(v.clone(), ProValue::Set(vec![val]));
                }
            }

            ret = self.visit_pro_block(&mut body.clone());
            match ret {
                VisitReturn::True | VisitReturn::False => {}
                VisitReturn::Next => ret = VisitReturn::True,
                VisitReturn::Break => {
                    ret = VisitReturn::True;
                    break;
                }
                _ => break,
            }
        }

        if let Some(v) = variable {
            match old_value {
                Some(old) => self.top_mut().insert(v, old),
                None => self.top_mut().remove(&v),
            };
        }
        ret
    }

    fn visit_pro_variable(
        &mut self,
        op: Tok,
        curr: &ProStringList,
        cur: &mut TokenCursor,
    ) -> EvalResult<()> {
        // Size hint.
        cur.next_word();

        if curr.len() != 1 {
            self.skip_expression(cur);
            if !self.cumulative || !curr.is_empty() {
                self.eval_error("Left hand side of assignment must expand to exactly one word.");
            }
            return Ok(());
        }
        let var_name = self.map(&curr[0].to_key());

        if op == Tok::Replace {
            let val = self.expand_variable_references(cur, true)?;
            let val = val.into_iter().next().unwrap_or_default();
            let val = val.as_bytes();
            if val.len() < 4 || val[0] != b's' {
                self.eval_error("The ~= operator can handle only the s/// function.");
                return Ok(());
            }
            let sep = val[1];
            let parts: Vec<&[u8]> = val.split(|c| *c == sep).collect();
            if parts.len() < 3 || parts.len() > 4 {
                self.eval_error("The s/// function expects 3 or 4 arguments.");
                return Ok(());
            }
            let flags = parts.get(3).copied().unwrap_or_default();
            let global = flags.contains(&b'g');
            let case_sense = !flags.contains(&b'i');
            let quote = flags.contains(&b'q');
            let pattern = if quote {
                regexp_escape(parts[1])
            } else {
                Bytes::copy_from_slice(parts[1])
            };
            let replace = qt_replacement(parts[2]);
            if let Some(re) = compile_regex(&pattern, case_sense) {
                replace_in_list(self.values_ref(&var_name), &re, &replace, global);
            }
        } else {
            let mut var_val = self.expand_variable_references(cur, false)?;
            match op {
                Tok::AppendUnique => insert_unique(self.values_ref(&var_name), &var_val),
                Tok::Append => {
                    zip_empty(&mut var_val);
                    self.values_ref(&var_name).extend(var_val);
                }
                Tok::Remove => {
                    if !self.cumulative {
                        remove_each(self.values_ref(&var_name), &var_val);
                    }
                }
                _ => {
                    zip_empty(&mut var_val);
                    self.top_mut()
                        .insert(var_name.clone(), ProValue::Set(var_val));
                }
            }
        }
        log!("{} := {:?}", var_name, self.values(&var_name));

        match var_name.as_bytes() {
            b"TEMPLATE" => self.set_template(),
            b"QMAKE_PLATFORM" => self.feature_roots = None,
            b"QMAKESPEC" => {
                let spec = self.first(&var_name);
                if !spec.is_empty() {
                    self.qmakespec = spec.bytes().clone();
                    self.feature_roots = None;
                }
            }
            b"REQUIRES" => {
                let deps = self.values(&var_name);
                self.check_requirements(&deps);
            }
            _ => {}
        }
        Ok(())
    }

    fn set_template(&mut self) {
        let user_template = self.globals.user_template.clone();
        let prefix = self.globals.user_template_prefix.clone();
        let values = self.values_ref(&key("TEMPLATE"));
        if !user_template.is_empty() {
            *values = vec![ProString::new(user_template)];
        } else if values.is_empty() {
            values.push(ProString::from_static("app"));
        } else {
            values.truncate(1);
        }
        if !prefix.is_empty() && !values[0].starts_with(&prefix) {
            *values = vec![ProString::new(concat(&prefix, values[0].as_bytes()))];
        }
    }

    // Files

    fn load_defaults(&mut self) {
        let globals = self.globals.clone();
        let vars = self.top_mut();
        let mut add = |name: &'static str, value: Bytes| {
            vars.entry(key(name))
                .or_insert(ProValue::Unset)
                .make_set()
                .push(ProString::new(value));
        };
        add("DIR_SEPARATOR", globals.dir_sep.clone());
        add("DIRLIST_SEPARATOR", globals.dirlist_sep.clone());
        add("_DATE_", current_date());
        if !globals.qmake_abslocation.is_empty() {
            add("QMAKE_QMAKE", globals.qmake_abslocation.clone());
        }
        if let Some([os, name, version, version_string, arch]) = uname_fields() {
            add("QMAKE_HOST.os", os);
            add("QMAKE_HOST.name", name);
            add("QMAKE_HOST.version", version);
            add("QMAKE_HOST.version_string", version_string);
            add("QMAKE_HOST.arch", arch);
        }
        if !globals.qmake_args.is_empty() {
            let args = globals.qmake_args.iter().cloned().map(ProString::new).collect();
            vars.insert(key("QMAKE_ARGS"), ProValue::Set(args));
        }
        self.value_map_inited = true;
    }

    /// Finds the super cache, the project configuration, the cache and the
    /// stash file by walking up from the output and source directories.
    fn prepare_project(&mut self, in_dir: &Bytes) {
        let mut superdir = Bytes::new();
        'cache: {
            if !self.globals.do_cache {
                break 'cache;
            }
            let mut conffile = Bytes::new();
            let mut cachefile = self.globals.cachefile.clone();
            if cachefile.is_empty() {
                if self.output_dir.is_empty() {
                    break 'cache;
                }
                superdir = self.output_dir.clone();
                loop {
                    let superfile = concat(&superdir, b"/.qmake.super");
                    if self.vfs.exists(&superfile) {
                        self.superfile = clean_path(&superfile);
                        break;
                    }
                    if is_root(&superdir) {
                        superdir = Bytes::new();
                        break;
                    }
                    superdir = dirname(&superdir);
                }
                let mut sdir = in_dir.clone();
                let mut dir = self.output_dir.clone();
                loop {
                    conffile = concat(&sdir, b"/.qmake.conf");
                    if !self.vfs.exists(&conffile) {
                        conffile = Bytes::new();
                    }
                    cachefile = concat(&dir, b"/.qmake.cache");
                    if !self.vfs.exists(&cachefile) {
                        cachefile = Bytes::new();
                    }
                    if !conffile.is_empty() || !cachefile.is_empty() {
                        if dir != sdir {
                            self.source_root = sdir.clone();
                        }
                        self.build_root = dir.clone();
                        break;
                    }
                    if dir == superdir || is_root(&sdir) || is_root(&dir) {
                        break 'cache;
                    }
                    sdir = dirname(&sdir);
                    dir = dirname(&dir);
                }
            } else {
                self.build_root = dirname(&cachefile);
            }
            self.conffile = clean_path(&conffile);
            self.cachefile = clean_path(&cachefile);
        }

        if self.output_dir.is_empty() {
            return;
        }
        let mut dir = self.output_dir.clone();
        loop {
            let stashfile = concat(&dir, b"/.qmake.stash");
            let stop = if superdir.is_empty() {
                &self.build_root
            } else {
                &superdir
            };
            if dir == *stop || self.vfs.exists(&stashfile) {
                self.stashfile = clean_path(&stashfile);
                break;
            }
            if is_root(&dir) {
                break;
            }
            dir = dirname(&dir);
        }
    }

    fn load_spec_internal(&mut self) -> bool {
        if self.evaluate_feature_file(b"spec_pre.prf", false) != VisitReturn::True {
            return false;
        }
        let spec = concat(&self.qmakespec, b"/qmake.conf");
        if self.evaluate_file(&spec, EvalFileType::ConfigFile, LoadFlags::PRO_ONLY)
            != VisitReturn::True
        {
            self.eval_error(&format!(
                "Could not read qmake configuration file {}.",
                String::from_utf8_lossy(&spec)
            ));
            return false;
        }
        let orig_spec = self.first(&key("QMAKESPEC_ORIGINAL"));
        if !orig_spec.is_empty() {
            self.qmakespec = orig_spec.bytes().clone();
        }
        let spec = ProString::new(self.qmakespec.clone());
        *self.values_ref(&key("QMAKESPEC")) = vec![spec];
        self.qmakespec_name = Bytes::copy_from_slice(basename(&self.qmakespec));
        // This also makes sure the feature roots are up to date.
        if self.evaluate_feature_file(b"spec_post.prf", false) != VisitReturn::True {
            return false;
        }
        // Cross-building specs may change the separator.
        let dir_sep = self.first(&key("QMAKE_DIR_SEP"));
        if !dir_sep.is_empty() {
            self.dir_sep = dir_sep;
        }
        true
    }

    fn load_config_file(&mut self, file: &Bytes, var: &'static str, flags: LoadFlags) -> bool {
        self.values_ref(&key(var))
            .push(ProString::new(file.clone()));
        self.evaluate_file(file, EvalFileType::ConfigFile, flags) == VisitReturn::True
    }

    /// Evaluates the cache files and the mkspec into this evaluator, which
    /// becomes a base environment.
    fn load_spec(&mut self) -> bool {
        let spec = if self.host_build {
            &self.globals.qmakespec
        } else {
            &self.globals.xqmakespec
        };
        let mut qmakespec = self.globals.expand_env_vars(spec);

        {
            let mut evaluator = self.sibling();
            evaluator.source_root = self.source_root.clone();
            evaluator.build_root = self.build_root.clone();
            for file in [&self.superfile, &self.conffile, &self.cachefile] {
                if !file.is_empty()
                    && evaluator.evaluate_file(
                        file,
                        EvalFileType::ConfigFile,
                        LoadFlags::PRO_ONLY | LoadFlags::HIDDEN,
                    ) != VisitReturn::True
                {
                    return false;
                }
            }
            if qmakespec.is_empty() {
                if !self.host_build {
                    qmakespec = evaluator.first(&key("XQMAKESPEC")).bytes().clone();
                }
                if qmakespec.is_empty() {
                    qmakespec = evaluator.first(&key("QMAKESPEC")).bytes().clone();
                }
            }
            self.qmakepath = evaluator
                .values(&key("QMAKEPATH"))
                .iter()
                .map(|v| v.bytes().clone())
                .collect();
            self.qmakefeatures = evaluator
                .values(&key("QMAKEFEATURES"))
                .iter()
                .map(|v| v.bytes().clone())
                .collect();
        }

        self.update_mkspec_paths();
        if qmakespec.is_empty() {
            let prop = if self.host_build {
                key("QMAKE_SPEC")
            } else {
                key("QMAKE_XSPEC")
            };
            qmakespec = self.property_value(&prop).bytes().clone();
        }
        if qmakespec.is_empty() {
            qmakespec = Bytes::from_static(if self.host_build {
                b"default-host"
            } else {
                b"default"
            });
        }
        if !is_absolute_path(&qmakespec) {
            let found = self
                .mkspec_paths
                .iter()
                .map(|root| concat(&concat(root, b"/"), &qmakespec))
                .find(|mkspec| exists(mkspec));
            match found {
                Some(mkspec) => qmakespec = mkspec,
                None => {
                    self.eval_error(&format!(
                        "Could not find qmake configuration file {}.",
                        String::from_utf8_lossy(&qmakespec)
                    ));
                    return false;
                }
            }
        }
        self.qmakespec = clean_path(&qmakespec);

        let superfile = self.superfile.clone();
        if !superfile.is_empty()
            && !self.load_config_file(
                &superfile,
                "_QMAKE_SUPER_CACHE_",
                LoadFlags::PRO_ONLY | LoadFlags::HIDDEN,
            )
        {
            return false;
        }
        if !self.load_spec_internal() {
            return false;
        }
        let conffile = self.conffile.clone();
        if !conffile.is_empty() && !self.load_config_file(&conffile, "_QMAKE_CONF_", LoadFlags::PRO_ONLY)
        {
            return false;
        }
        let cachefile = self.cachefile.clone();
        if !cachefile.is_empty()
            && !self.load_config_file(&cachefile, "_QMAKE_CACHE_", LoadFlags::PRO_ONLY)
        {
            return false;
        }
        let stashfile = self.stashfile.clone();
        if !stashfile.is_empty()
            && self.vfs.exists(&stashfile)
            && !self.load_config_file(&stashfile, "_QMAKE_STASH_", LoadFlags::PRO_ONLY)
        {
            return false;
        }
        true
    }

    fn init_from(&mut self, other: &Evaluator) {
        self.function_defs = other.function_defs.clone();
        self.value_stack = other.value_stack.clone();
        self.value_map_inited = true;
        self.qmakespec = other.qmakespec.clone();
        self.qmakespec_name = other.qmakespec_name.clone();
        self.mkspec_paths = other.mkspec_paths.clone();
        self.feature_roots = other.feature_roots.clone();
        self.dir_sep = other.dir_sep.clone();
    }

    /// Starts from the base environment for this project's build root,
    /// creating it if nobody did so yet.
    fn init_from_base_env(&mut self) -> bool {
        let base_key = BaseKey {
            build_root: self.build_root.clone(),
            stash_file: self.stashfile.clone(),
            host_build: self.host_build,
        };
        let env = self
            .globals
            .base_envs
            .lock()
            .entry(base_key.clone())
            .or_default()
            .clone();

        let mut state = env.state.lock();
        if state.in_progress {
            while state.in_progress {
                env.cond.wait(&mut state);
            }
            if !state.is_ok {
                return false;
            }
        } else if state.evaluator.is_none() {
            state.in_progress = true;
            drop(state);

            let mut base = Box::new(self.sibling());
            base.superfile = self.superfile.clone();
            base.conffile = self.conffile.clone();
            base.cachefile = self.cachefile.clone();
            base.stashfile = self.stashfile.clone();
            base.source_root = self.source_root.clone();
            base.build_root = self.build_root.clone();
            base.host_build = self.host_build;
            base.loading_base = Some(base_key);
            let ok = base.load_spec();
            base.loading_base = None;

            state = env.state.lock();
            state.is_ok = ok;
            state.in_progress = false;
            state.evaluator = Some(base);
            env.cond.notify_all();
            if !ok {
                return false;
            }
        } else if !state.is_ok {
            return false;
        }
        match state.evaluator.as_deref() {
            Some(base) => {
                self.init_from(base);
                true
            }
            None => false,
        }
    }

    fn setup_project(&mut self) {
        self.set_template();
        let pro = self.current_pro_file();
        let file = self.current_file_name();
        let values = [
            ("TARGET", Bytes::copy_from_slice(base_name_no_ext(&file))),
            ("_PRO_FILE_", file.clone()),
            ("_PRO_FILE_PWD_", self.current_directory()),
            ("OUT_PWD", self.output_dir.clone()),
        ];
        let vars = self.top_mut();
        for (name, value) in values {
            vars.entry(key(name))
                .or_insert(ProValue::Unset)
                .make_set()
                .push(ProString::new(value).set_source(pro.clone()));
        }
    }

    /// Runs command line statements.
    fn evaluate_command(&mut self, cmds: &[u8], where_: &[u8]) -> VisitReturn {
        if cmds.is_empty() {
            return VisitReturn::True;
        }
        let pro = self
            .parser
            .parsed_pro_block(cmds, where_, -1, Grammar::Full);
        if !pro.is_ok() {
            return VisitReturn::False;
        }
        self.push_location();
        let ret = self.visit_pro_block_at(&pro, 0);
        self.pop_location();
        ret
    }

    fn apply_extra_configs(&mut self) -> VisitReturn {
        if self.extra_configs.is_empty() {
            return VisitReturn::True;
        }
        let cmd = concat(b"CONFIG += ", self.extra_configs.join_values(b" ").as_bytes());
        self.evaluate_command(&cmd, b"(extra configs)")
    }

    /// Loads the feature of every CONFIG value, latest first, until no new
    /// feature turns up.
    fn evaluate_config_features(&mut self) -> VisitReturn {
        let mut processed = HashSet::new();
        loop {
            let mut finished = true;
            let configs = self.values(&key("CONFIG"));
            for config in configs.iter().rev() {
                let config = config.as_bytes().to_ascii_lowercase();
                if !processed.insert(config.clone()) {
                    continue;
                }
                match self.evaluate_feature_file(&config, true) {
                    VisitReturn::Error => return VisitReturn::Error,
                    VisitReturn::True => {
                        finished = false;
                        break;
                    }
                    _ => {}
                }
            }
            if finished {
                return VisitReturn::True;
            }
        }
    }

    /// Evaluates a parsed file. With [`LoadFlags::PRE_FILES`] the project
    /// is set up first and starts from its base environment.
    pub fn visit_pro_file(
        &mut self,
        pro: &Arc<ProFile>,
        kind: EvalFileType,
        flags: LoadFlags,
    ) -> VisitReturn {
        if !self.cumulative && !pro.is_ok() {
            return VisitReturn::False;
        }

        if flags.contains(LoadFlags::PRE_FILES) {
            self.prepare_project(pro.directory_name());
            self.host_build = pro.is_host_build();
            if !self.init_from_base_env() {
                return VisitReturn::False;
            }
        } else if !self.value_map_inited {
            self.load_defaults();
        }

        let parent = self.current_pro_file();
        self.handler.about_to_eval(
            parent.as_ref().map(|p| &p.file_name()[..]),
            pro.file_name(),
            kind,
        );
        self.profile_stack.push(pro.clone());
        let pwd = ProString::new(self.current_directory());
        *self.values_ref(&key("PWD")) = vec![pwd];

        let vr = self.visit_pro_file_body(pro, flags);

        self.profile_stack.pop();
        let pwd = self.current_directory();
        *self.values_ref(&key("PWD")) = if pwd.is_empty() {
            Vec::new()
        } else {
            vec![ProString::new(pwd)]
        };
        self.handler
            .done_with_eval(parent.as_ref().map(|p| &p.file_name()[..]));
        vr
    }

    fn visit_pro_file_body(&mut self, pro: &Arc<ProFile>, flags: LoadFlags) -> VisitReturn {
        if flags.contains(LoadFlags::PRE_FILES) {
            self.setup_project();
            let extra_vars = self.extra_vars.clone();
            self.value_stack[0].extend(extra_vars);

            // default_pre may depend on the build pass configuration.
            if self.apply_extra_configs() == VisitReturn::Error
                || self.evaluate_feature_file(b"default_pre.prf", false) == VisitReturn::Error
            {
                return VisitReturn::Error;
            }
            let precmds = self.globals.precmds.clone();
            if !precmds.is_empty()
                && (self.evaluate_command(&precmds, b"(command line)") == VisitReturn::Error
                    || self.apply_extra_configs() == VisitReturn::Error)
            {
                return VisitReturn::Error;
            }
        }

        log!("visiting file {}", String::from_utf8_lossy(pro.file_name()));
        if self.visit_pro_block_at(pro, 0) == VisitReturn::Error {
            return VisitReturn::Error;
        }
        log!("done visiting file {}", String::from_utf8_lossy(pro.file_name()));

        if flags.contains(LoadFlags::POST_FILES) {
            let postcmds = self.globals.postcmds.clone();
            if self.evaluate_command(&postcmds, b"(command line -after)") == VisitReturn::Error
                || self.apply_extra_configs() == VisitReturn::Error
                || self.evaluate_feature_file(b"default_post.prf", false) == VisitReturn::Error
                || self.evaluate_config_features() == VisitReturn::Error
            {
                return VisitReturn::Error;
            }
        }
        VisitReturn::True
    }

    pub fn evaluate_file(
        &mut self,
        file_name: &[u8],
        kind: EvalFileType,
        flags: LoadFlags,
    ) -> VisitReturn {
        let pflags = ParseFlags {
            use_cache: true,
            report_missing: !flags.contains(LoadFlags::SILENT),
        };
        let Some(pro) = self.parser.parsed_pro_file(file_name, pflags) else {
            return VisitReturn::False;
        };
        crate::collect_stats_with_slow_report!("evaluate file", file_name);
        self.push_location();
        let ok = self.visit_pro_file(&pro, kind, flags);
        self.pop_location();
        if ok == VisitReturn::True && !flags.contains(LoadFlags::HIDDEN) {
            let iif = self.value_stack[0]
                .entry(key("QMAKE_INTERNAL_INCLUDED_FILES"))
                .or_insert(ProValue::Unset)
                .make_set();
            if !iif.contains_value(file_name) {
                iif.push(ProString::new(Bytes::copy_from_slice(file_name)));
            }
        }
        ok
    }

    pub(crate) fn evaluate_file_checked(
        &mut self,
        file_name: &[u8],
        kind: EvalFileType,
        flags: LoadFlags,
    ) -> VisitReturn {
        if file_name.is_empty() {
            return VisitReturn::False;
        }
        let circular = self.caller_files.iter().any(|f| f == file_name)
            || self
                .profile_stack
                .iter()
                .any(|pro| pro.file_name() == file_name);
        if circular {
            self.eval_error(&format!(
                "Circular inclusion of {}.",
                String::from_utf8_lossy(file_name)
            ));
            return VisitReturn::False;
        }
        self.evaluate_file(file_name, kind, flags)
    }

    /// Looks up a feature on the feature roots and evaluates it unless it
    /// was loaded already.
    pub(crate) fn evaluate_feature_file(&mut self, file_name: &[u8], silent: bool) -> VisitReturn {
        let name = if file_name.ends_with(b".prf") {
            Bytes::copy_from_slice(file_name)
        } else {
            concat(file_name, b".prf")
        };

        if self.feature_roots.is_none() {
            self.update_feature_paths();
        }
        let Some(roots) = self.feature_roots.clone() else {
            return VisitReturn::False;
        };
        let mut curr_fn = self.current_file_name();
        if basename(&curr_fn) != basename(&name) {
            curr_fn = Bytes::new();
        }
        let found = {
            collect_stats!("feature lookup");
            let mut cache = roots.cache.lock();
            let cache_key = (name.clone(), curr_fn.clone());
            match cache.get(&cache_key) {
                Some(found) => found.clone(),
                None => {
                    // A feature loading its namesake continues the search
                    // behind its own root.
                    let mut start_root = 0;
                    if !curr_fn.is_empty() {
                        let curr_dir = concat(&dirname(&curr_fn), b"/");
                        if let Some(idx) = roots.paths.iter().position(|p| *p == curr_dir) {
                            start_root = idx + 1;
                        }
                    }
                    let found = roots.paths[start_root..]
                        .iter()
                        .map(|root| concat(root, &name))
                        .find(|path| self.vfs.exists(path))
                        .unwrap_or_default();
                    cache.insert(cache_key, found.clone());
                    found
                }
            }
        };

        if found.is_empty() {
            if !silent {
                self.eval_error(&format!(
                    "Cannot find feature {}",
                    String::from_utf8_lossy(file_name)
                ));
            }
            return VisitReturn::False;
        }
        let included = key("QMAKE_INTERNAL_INCLUDED_FEATURES");
        if self.values_ref(&included).contains_value(&found) {
            if !silent {
                self.language_warning(&format!(
                    "Feature {} already included",
                    String::from_utf8_lossy(file_name)
                ));
            }
            return VisitReturn::True;
        }
        self.values_ref(&included)
            .push(ProString::new(found.clone()));

        let cumulative = std::mem::replace(&mut self.cumulative, false);
        let ok = self.evaluate_file(&found, EvalFileType::Feature, LoadFlags::PRO_ONLY);
        self.cumulative = cumulative;
        ok
    }

    /// Evaluates a file in a separate evaluator and hands back its
    /// variables.
    pub(crate) fn evaluate_file_into(
        &mut self,
        file_name: &[u8],
        flags: LoadFlags,
    ) -> (VisitReturn, ProValueMap) {
        let mut visitor = self.sibling();
        visitor.caller_files = self.caller_files.clone();
        visitor
            .caller_files
            .extend(self.profile_stack.iter().map(|pro| pro.file_name().clone()));
        visitor.output_dir = self.output_dir.clone();
        visitor.feature_roots = self.feature_roots.clone();
        let ret = visitor.evaluate_file_checked(file_name, EvalFileType::Auxiliary, flags);
        if ret != VisitReturn::True {
            return (ret, ProValueMap::new());
        }
        let values = visitor.value_stack.pop().unwrap_or_default();
        let qiif = key("QMAKE_INTERNAL_INCLUDED_FILES");
        if let Some(included) = values.get(&qiif).and_then(|v| v.as_list()) {
            let iif = self.value_stack[0]
                .entry(qiif)
                .or_insert(ProValue::Unset)
                .make_set();
            for ifn in included {
                if !iif.contains(ifn) {
                    iif.push(ifn.clone());
                }
            }
        }
        (VisitReturn::True, values)
    }

    pub(crate) fn update_mkspec_paths(&mut self) {
        let mut ret: Vec<Bytes> = Vec::new();
        for dir in self.globals.get_path_list_env(b"QMAKEPATH") {
            ret.push(concat(&dir, b"/mkspecs"));
        }
        for dir in &self.qmakepath {
            ret.push(concat(dir, b"/mkspecs"));
        }
        if !self.build_root.is_empty() {
            ret.push(concat(&self.build_root, b"/mkspecs"));
        }
        if !self.source_root.is_empty() {
            ret.push(concat(&self.source_root, b"/mkspecs"));
        }
        for prop in [&b"QT_HOST_DATA/get"[..], b"QT_HOST_DATA/src"] {
            if let Some(dir) = self.globals.property_value(prop) {
                ret.push(concat(dir.as_bytes(), b"/mkspecs"));
            }
        }
        let mut seen = HashSet::new();
        ret.retain(|p| seen.insert(p.clone()));
        self.mkspec_paths = ret;
    }

    pub(crate) fn update_feature_paths(&mut self) {
        let mut roots: Vec<Bytes> = self.globals.get_path_list_env(b"QMAKEFEATURES");
        roots.extend(self.qmakefeatures.iter().cloned());
        if let Some(prop) = self.globals.property_value(b"QMAKEFEATURES") {
            roots.extend(self.globals.split_path_list(prop.as_bytes()));
        }

        let mut bases: Vec<Bytes> = Vec::new();
        if !self.build_root.is_empty() {
            bases.push(concat(&self.build_root, b"/mkspecs"));
            bases.push(self.build_root.clone());
        }
        if !self.source_root.is_empty() {
            bases.push(concat(&self.source_root, b"/mkspecs"));
            bases.push(self.source_root.clone());
        }
        for dir in self.globals.get_path_list_env(b"QMAKEPATH") {
            bases.push(concat(&dir, b"/mkspecs"));
        }
        for dir in &self.qmakepath {
            bases.push(concat(dir, b"/mkspecs"));
        }
        if !self.qmakespec.is_empty() {
            // The spec is platform specific already, so no suffixes here.
            roots.push(concat(&self.qmakespec, b"/features/"));
            // The features of the mkspecs collection holding the spec.
            let mut dir = self.qmakespec.clone();
            while !is_root(&dir) {
                dir = dirname(&dir);
                if dir.ends_with(b"/mkspecs") {
                    if exists(&concat(&dir, b"/features/")) {
                        bases.push(dir);
                    }
                    break;
                }
            }
        }
        for prop in [&b"QT_HOST_DATA/get"[..], b"QT_HOST_DATA/src"] {
            if let Some(dir) = self.globals.property_value(prop) {
                bases.push(concat(dir.as_bytes(), b"/mkspecs"));
            }
        }

        let platforms = self.values(&key("QMAKE_PLATFORM"));
        for base in &bases {
            for sfx in &platforms {
                let mut root = concat(base, b"/features/").to_vec();
                root.extend_from_slice(sfx.as_bytes());
                root.push(b'/');
                roots.push(Bytes::from(root));
            }
            roots.push(concat(base, b"/features/"));
        }

        let mut seen = HashSet::new();
        let paths = roots
            .into_iter()
            .map(|root| {
                if root.ends_with(b"/") {
                    root
                } else {
                    concat(&root, b"/")
                }
            })
            .filter(|root| seen.insert(root.clone()))
            .filter(|root| exists(root))
            .collect();
        self.feature_roots = Some(Arc::new(FeatureRoots {
            paths,
            cache: Mutex::new(HashMap::new()),
        }));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::{file_cache::ProFileCache, handler::CollectingHandler, proitem::to_string_list, vfs::WriteMode};

    pub(crate) fn new_evaluator_with(
        globals: Globals,
    ) -> (Evaluator, Arc<CollectingHandler>, Arc<Vfs>) {
        let handler = Arc::new(CollectingHandler::new());
        let vfs = Arc::new(Vfs::new(false));
        let parser = Arc::new(QmakeParser::new(
            Some(Arc::new(ProFileCache::new())),
            vfs.clone(),
            handler.clone(),
        ));
        let ev = Evaluator::new(Arc::new(globals), parser, vfs.clone(), handler.clone());
        (ev, handler, vfs)
    }

    pub(crate) fn new_evaluator() -> (Evaluator, Arc<CollectingHandler>, Arc<Vfs>) {
        new_evaluator_with(Globals::new())
    }

    /// Evaluates `text` as the project file `/virtual/test.pro`.
    pub(crate) fn eval_str(text: &str) -> (Evaluator, Arc<CollectingHandler>, VisitReturn) {
        let (mut ev, handler, vfs) = new_evaluator();
        vfs.write_file(b"/virtual/test.pro", WriteMode::Truncate, text.as_bytes())
            .unwrap();
        let ret = ev.evaluate_file(b"/virtual/test.pro", EvalFileType::Project, LoadFlags::PRO_ONLY);
        (ev, handler, ret)
    }

    /// Like [`eval_str`], but places the project in `dir`, which must exist
    /// on disk. Subprocesses run there.
    pub(crate) fn eval_str_in(dir: &[u8], text: &str) -> (Evaluator, Arc<CollectingHandler>, VisitReturn) {
        let (mut ev, handler, vfs) = new_evaluator();
        let file = crate::strutil::concat_dir(dir, b"test.pro");
        vfs.write_file(&file, WriteMode::Truncate, text.as_bytes())
            .unwrap();
        let ret = ev.evaluate_file(&file, EvalFileType::Project, LoadFlags::PRO_ONLY);
        (ev, handler, ret)
    }

    pub(crate) fn vals(ev: &Evaluator, name: &str) -> Vec<String> {
        to_string_list(&ev.values(&ProKey::from(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_assignments() {
        let (ev, handler, ret) = eval_str(
            "A = a b\nA += c\nA -= b\nB = $$A x\nC = $$A$$A\nD = \"$$A y\"\n",
        );
        assert_eq!(ret, VisitReturn::True);
        assert!(handler.errors().is_empty(), "{:?}", handler.errors());
        assert_eq!(vals(&ev, "A"), ["a", "c"]);
        assert_eq!(vals(&ev, "B"), ["a", "c", "x"]);
        assert_eq!(vals(&ev, "C"), ["a", "ca", "c"]);
        assert_eq!(vals(&ev, "D"), ["a c y"]);
    }

    #[test]
    fn test_append_unique_is_idempotent() {
        let (ev, _, _) = eval_str("A = x y\nA *= y\nA *= x z y w\n");
        assert_eq!(vals(&ev, "A"), ["x", "y", "z", "w"]);
    }

    #[test]
    fn test_quoted_values_read_back() {
        let values: [&[u8]; 11] = [
            b"",
            b"plain",
            b"with space",
            b"say \"hi\"",
            b"it's",
            b"$$x $(HOME)",
            b"a#b",
            b"trailing\\",
            b"tab\there",
            b"two\nlines",
            b"\x01ctl",
        ];
        for value in values {
            let quoted = crate::strutil::quote_value(value);
            let text = format!("V = {}\n", String::from_utf8_lossy(&quoted));
            let (ev, handler, ret) = eval_str(&text);
            assert_eq!(ret, VisitReturn::True, "{text}");
            assert!(handler.errors().is_empty(), "{text}: {:?}", handler.errors());
            let got = ev.values(&ProKey::from("V"));
            assert_eq!(got.len(), 1, "{text}");
            assert_eq!(got[0].as_bytes(), value, "{text}");
        }
    }

    #[test]
    fn test_regex_replace() {
        let (ev, _, _) = eval_str(
            "A = foo bar foo\nA ~= s/foo/baz/\nB = foo bar foo\nB ~= s/o+/0/g\nC = a.b\nC ~= s/./-/q\n",
        );
        assert_eq!(vals(&ev, "A"), ["baz", "bar", "foo"]);
        assert_eq!(vals(&ev, "B"), ["f0", "bar", "f0"]);
        assert_eq!(vals(&ev, "C"), ["a-b"]);
    }

    #[test]
    fn test_regex_replace_with_bad_pattern() {
        let (ev, handler, ret) = eval_str("A = foo\nA ~= s/\\(/x/\nB = after\n");
        assert_eq!(ret, VisitReturn::True);
        assert!(handler.errors().is_empty(), "{:?}", handler.errors());
        assert_eq!(vals(&ev, "A"), ["foo"]);
        assert_eq!(vals(&ev, "B"), ["after"]);
    }

    #[test]
    fn test_conditions() {
        let (ev, _, _) = eval_str(
            "CONFIG = debug foo\ndebug: A = 1\nrelease: B = 1\n!release: C = 1\nrelease|foo: D = 1\ndebug:release: E = 1\nfo*: F = 1\n",
        );
        assert_eq!(vals(&ev, "A"), ["1"]);
        assert!(vals(&ev, "B").is_empty());
        assert_eq!(vals(&ev, "C"), ["1"]);
        assert_eq!(vals(&ev, "D"), ["1"]);
        assert!(vals(&ev, "E").is_empty());
        assert_eq!(vals(&ev, "F"), ["1"]);
    }

    #[test]
    fn test_else_branches() {
        let (ev, _, _) = eval_str("x {\n A = 1\n} else: y {\n A = 2\n} else {\n A = 3\n}\n");
        assert_eq!(vals(&ev, "A"), ["3"]);
    }

    #[test]
    fn test_loop_variable_is_restored() {
        let (ev, _, _) = eval_str("x = old\nfor(x, 1..3): L += $$x\nfor(y, 3..1): M += $$y\n");
        assert_eq!(vals(&ev, "L"), ["1", "2", "3"]);
        assert_eq!(vals(&ev, "M"), ["3", "2", "1"]);
        assert_eq!(vals(&ev, "x"), ["old"]);
        assert!(!ev.variables().iter().any(|(k, _)| *k == "y"));
    }

    #[test]
    fn test_loop_range_at_i64_min() {
        let (ev, handler, _) =
            eval_str("for(i, -9223372036854775808..-9223372036854775807): L += $$i\n");
        assert!(handler.errors().is_empty(), "{:?}", handler.errors());
        assert_eq!(vals(&ev, "L"), ["-9223372036854775808", "-9223372036854775807"]);
    }

    #[test]
    fn test_loop_control() {
        let (ev, _, _) = eval_str(
            "L = a b c d\nfor(v, L) {\n  equals(v, b): next()\n  equals(v, d): break()\n  R += $$v\n}\n",
        );
        assert_eq!(vals(&ev, "R"), ["a", "c"]);
    }

    #[test]
    fn test_infinite_loop_is_an_error() {
        let (_, handler, ret) = eval_str("for(ever) {\n}\n");
        assert_eq!(ret, VisitReturn::Error);
        assert_eq!(handler.errors(), ["Ran into infinite loop (> 1000 iterations)."]);
    }

    #[test]
    fn test_user_functions() {
        let (ev, handler, _) = eval_str(
            r#"defineReplace(wrap) {
    return($$1-$$2 $$ARGC)
}
defineTest(isBig) {
    greaterThan(1, 10): return(true)
    return(false)
}
A = $$wrap(a, b c)
isBig(11): B = yes
isBig(3): C = yes
"#,
        );
        assert!(handler.errors().is_empty(), "{:?}", handler.errors());
        assert_eq!(vals(&ev, "A"), ["a-b", "c", "2"]);
        assert_eq!(vals(&ev, "B"), ["yes"]);
        assert!(vals(&ev, "C").is_empty());
    }

    #[test]
    fn test_unexpected_return_value() {
        let (_, handler, _) = eval_str("defineTest(t) {\n  return(maybe)\n}\nt(): A = 1\n");
        assert_eq!(handler.errors(), ["Unexpected return value from test 't': maybe."]);
    }

    #[test]
    fn test_recursion_limit() {
        let (_, handler, ret) = eval_str("defineTest(r) {\n  r()\n}\nr()\n");
        assert_eq!(ret, VisitReturn::Error);
        assert_eq!(handler.errors(), ["Ran into infinite recursion (depth > 100)."]);
    }

    #[test]
    fn test_export_from_function() {
        let (ev, _, _) = eval_str(
            "defineTest(setit) {\n  V = inner\n  W = local\n  export(V)\n}\nsetit()\n",
        );
        assert_eq!(vals(&ev, "V"), ["inner"]);
        assert!(vals(&ev, "W").is_empty());
    }

    #[test]
    fn test_deprecated_variable_warns_once() {
        let (ev, handler, _) = eval_str("INCPATH = a\nINCPATH += b\n");
        assert_eq!(vals(&ev, "INCLUDEPATH"), ["a", "b"]);
        assert_eq!(
            handler.warnings(),
            ["Variable INCPATH is deprecated; use INCLUDEPATH instead."]
        );
    }

    #[test]
    fn test_error_aborts() {
        let (ev, handler, ret) = eval_str("A = 1\nerror(stop)\nB = 1\n");
        assert_eq!(ret, VisitReturn::Error);
        assert_eq!(vals(&ev, "A"), ["1"]);
        assert!(vals(&ev, "B").is_empty());
        assert_eq!(handler.output(), "Project ERROR: stop\n");
    }

    #[test]
    fn test_error_in_replace_function_aborts() {
        let (ev, _, ret) =
            eval_str("defineReplace(f) {\n  error(bad)\n}\nA = $$f()\nB = 1\n");
        assert_eq!(ret, VisitReturn::Error);
        assert!(vals(&ev, "B").is_empty());
    }

    #[test]
    fn test_cumulative_mode() {
        let (mut ev, _, vfs) = new_evaluator();
        ev.set_cumulative(true);
        vfs.write_file(
            b"/virtual/c.pro",
            crate::vfs::WriteMode::Truncate,
            b"unknown {\n  A = 1\n} else {\n  A += 2\n}\nerror(x)\nB = 1\n",
        )
        .unwrap();
        let ret = ev.evaluate_file(b"/virtual/c.pro", EvalFileType::Project, LoadFlags::PRO_ONLY);
        assert_eq!(ret, VisitReturn::True);
        assert_eq!(vals(&ev, "A"), ["1", "2"]);
        assert_eq!(vals(&ev, "B"), ["1"]);
    }

    #[test]
    fn test_pwd_and_included_files() {
        let (ev, _, _) = eval_str("P = $$PWD\n");
        assert_eq!(vals(&ev, "P"), ["/virtual"]);
        assert_eq!(vals(&ev, "QMAKE_INTERNAL_INCLUDED_FILES"), ["/virtual/test.pro"]);
    }

    #[test]
    fn test_requires_records_failures() {
        let (ev, _, _) = eval_str("CONFIG = a\nREQUIRES = a b\n");
        assert_eq!(vals(&ev, "QMAKE_FAILED_REQUIREMENTS"), ["b"]);
    }

    #[test]
    fn test_template_defaults() {
        let (ev, _, _) = eval_str("TEMPLATE = lib app\n");
        assert_eq!(vals(&ev, "TEMPLATE"), ["lib"]);
        let (ev, _, _) = eval_str("TEMPLATE =\n");
        assert_eq!(vals(&ev, "TEMPLATE"), ["app"]);
    }

    #[test]
    fn test_evaluate_conditional() {
        let (mut ev, _, _) = eval_str("CONFIG = x\n");
        assert!(ev.evaluate_conditional(b"x:!y", b"(host)", 1));
        assert!(!ev.evaluate_conditional(b"y|!x", b"(host)", 1));
        assert!(ev.is_active_config(b"x", false));
        assert!(ev.contains(&key("CONFIG"), b"x"));
    }

    #[test]
    fn test_variables_are_sorted() {
        let (ev, _, _) = eval_str("B = 2\nA = 1\n");
        let names: Vec<String> = ev
            .variables()
            .into_iter()
            .map(|(k, _)| k.to_string())
            .filter(|k| k == "A" || k == "B")
            .collect();
        assert_eq!(names, ["A", "B"]);
    }

    #[test]
    fn test_feature_loading() {
        let dir = std::env::temp_dir().join(format!("proeval-features-{}", std::process::id()));
        let features = dir.join("mkspecs/features");
        std::fs::create_dir_all(&features).unwrap();
        std::fs::write(features.join("hello.prf"), "HELLO += loaded\n").unwrap();

        let mut globals = Globals::new();
        let mut env = HashMap::new();
        env.insert(
            Bytes::from_static(b"QMAKEPATH"),
            Bytes::from(dir.to_string_lossy().into_owned()),
        );
        globals.environment = Some(env);
        let (mut ev, handler, vfs) = new_evaluator_with(globals);
        vfs.write_file(
            b"/virtual/f.pro",
            crate::vfs::WriteMode::Truncate,
            b"load(hello)\nload(hello)\nCONFIG += hello\n!load(missing, true): X = 1\n",
        )
        .unwrap();
        let ret = ev.evaluate_file(b"/virtual/f.pro", EvalFileType::Project, LoadFlags::PRO_ONLY);
        assert_eq!(ret, VisitReturn::True);
        assert_eq!(vals(&ev, "HELLO"), ["loaded"]);
        assert_eq!(handler.warnings(), ["Feature hello already included"]);
        assert!(vals(&ev, "X").is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
