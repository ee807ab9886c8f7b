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

//! The built-in test functions, usable as conditions.

use std::{collections::HashMap, fmt::Debug, sync::Arc, sync::LazyLock};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    collect_stats,
    eval::{Evaluator, FeatureRoots, LoadFlags, VisitReturn},
    fileutil::{self, fnmatch, is_wildcard, list_dir},
    func::is_true,
    globals::BaseKey,
    handler::EvalFileType,
    log,
    parser::Grammar,
    proitem::{ProKey, ProString, ProStringList, ProValue, ProValueMap, ValueList},
    strutil::{clean_path, compile_exact_regex, quote_value, regexp_escape, split_value_list},
    vfs::WriteMode,
};

type TestFuncImpl = fn(&mut Evaluator, &ProKey, &[ProString]) -> VisitReturn;

pub struct FuncInfo {
    pub name: &'static [u8],
    pub func: TestFuncImpl,
    pub min_arity: usize,
    pub arity: usize,
    pub usage: &'static str,
}

impl PartialEq for FuncInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Debug for FuncInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Func({})", String::from_utf8_lossy(self.name))
    }
}

// A query that is not its own regex escape is matched as a regex.
fn value_matcher(qry: &[u8]) -> impl Fn(&ProString) -> bool {
    let regx = if regexp_escape(qry) != qry {
        compile_exact_regex(qry)
    } else {
        None
    };
    let qry = qry.to_vec();
    move |val: &ProString| {
        regx.as_ref().is_some_and(|re| re.is_match(val.as_bytes())) || val.as_bytes() == qry
    }
}

fn mutuals(s: &ProString) -> Vec<Vec<u8>> {
    s.as_bytes()
        .split(|c| *c == b'|')
        .map(|m| m.trim_ascii().to_vec())
        .collect()
}

fn defined_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let var = args[0].to_key();
    let Some(kind) = args.get(1) else {
        return (ev.function_defs.replace.contains_key(&var)
            || ev.function_defs.test.contains_key(&var))
        .into();
    };
    match kind.as_bytes() {
        b"test" => ev.function_defs.test.contains_key(&var).into(),
        b"replace" => ev.function_defs.replace.contains_key(&var).into(),
        b"var" => ev.find_values(&var).is_some().into(),
        _ => {
            ev.eval_error(&format!("defined(function, type): unexpected type [{kind}]."));
            VisitReturn::False
        }
    }
}

fn export_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let var = ev.map(&args[0].to_key());
    let stack = &mut ev.value_stack;
    for level in (1..stack.len()).rev() {
        let Some(value) = stack[level].remove(&var) else {
            continue;
        };
        // Deletions do not propagate; an unset variable exports as empty.
        let list = value.as_list().cloned().unwrap_or_default();
        stack[0].insert(var.clone(), ProValue::Set(list));
        for map in &mut stack[1..level] {
            map.remove(&var);
        }
        break;
    }
    VisitReturn::True
}

fn infile_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let file = ev.globals.expand_env_vars(args[0].as_bytes());
    let file = ev.resolve_path(&file);
    let (ok, vars) = ev.evaluate_file_into(&file, LoadFlags::PRO_ONLY);
    if ok != VisitReturn::True {
        return ok;
    }
    let var = ev.map(&args[1].to_key());
    let Some(qry) = args.get(2) else {
        return vars.contains_key(&var).into();
    };
    let matches = value_matcher(qry.as_bytes());
    vars.get(&var)
        .and_then(|v| v.as_list())
        .is_some_and(|list| list.iter().any(matches))
        .into()
}

fn requires_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    ev.check_requirements(args);
    VisitReturn::False
}

fn eval_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let text = args.to_vec().join_values(b" ");
    let where_ = ev.current_file_name();
    let pro = ev
        .parser
        .parsed_pro_block(text.as_bytes(), &where_, ev.current.line, Grammar::Full);
    if !ev.cumulative && !pro.is_ok() {
        return VisitReturn::False;
    }
    ev.push_location();
    let ret = ev.visit_pro_block_at(&pro, 0);
    ev.pop_location();
    if ret == VisitReturn::Error {
        return ret;
    }
    VisitReturn::True
}

fn if_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let where_ = ev.current_file_name();
    let line = ev.current.line;
    ev.evaluate_conditional(args[0].as_bytes(), &where_, line)
        .into()
}

fn config_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let Some(mutex) = args.get(1) else {
        return ev.is_active_config(args[0].as_bytes(), true).into();
    };
    let mutuals = mutuals(mutex);
    let configs = ev.values(&ProKey::from_static("CONFIG"));
    for config in configs.iter().rev() {
        if mutuals.iter().any(|m| config.as_bytes() == m.as_slice()) {
            return (config == &args[0]).into();
        }
    }
    VisitReturn::False
}

fn contains_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let matches = value_matcher(args[1].as_bytes());
    let var = ev.map(&args[0].to_key());
    let list = ev.values(&var);
    let Some(mutex) = args.get(2) else {
        return list.iter().any(matches).into();
    };
    let mutuals = mutuals(mutex);
    for val in list.iter().rev() {
        if mutuals.iter().any(|m| val.as_bytes() == m.as_slice()) {
            return matches(val).into();
        }
    }
    VisitReturn::False
}

fn count_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let var = ev.map(&args[0].to_key());
    let cnt = ev.values(&var).len() as i64;
    let val = args[1].to_int().unwrap_or(0);
    let Some(comp) = args.get(2) else {
        return (cnt == val).into();
    };
    match comp.as_bytes() {
        b">" | b"greaterThan" => (cnt > val).into(),
        b">=" => (cnt >= val).into(),
        b"<" | b"lessThan" => (cnt < val).into(),
        b"<=" => (cnt <= val).into(),
        b"equals" | b"isEqual" | b"=" | b"==" => (cnt == val).into(),
        _ => {
            ev.eval_error(&format!("Unexpected modifier to count({comp})."));
            VisitReturn::False
        }
    }
}

fn compare_func(ev: &mut Evaluator, func: &ProKey, args: &[ProString]) -> VisitReturn {
    let var = ev.map(&args[0].to_key());
    let lhs = ev.values(&var).join_values(b" ");
    let rhs = &args[1];
    let greater = *func == "greaterThan";
    if let (Some(l), Some(r)) = (lhs.to_int(), rhs.to_int()) {
        return (if greater { l > r } else { l < r }).into();
    }
    if greater {
        (lhs.as_bytes() > rhs.as_bytes()).into()
    } else {
        (lhs.as_bytes() < rhs.as_bytes()).into()
    }
}

fn equals_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let var = ev.map(&args[0].to_key());
    let lhs = ev.values(&var).join_values(b" ");
    (lhs.as_bytes() == args[1].as_bytes()).into()
}

// The index of the innermost scope defining `var`, unless it is unset
// there.
fn find_scope(ev: &Evaluator, var: &ProKey) -> Option<usize> {
    let level = ev
        .value_stack
        .iter()
        .rposition(|map| map.contains_key(var))?;
    ev.value_stack[level]
        .get(var)
        .and_then(|v| v.as_list())
        .map(|_| level)
}

fn clear_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let var = ev.map(&args[0].to_key());
    if find_scope(ev, &var).is_none() {
        return VisitReturn::False;
    }
    ev.top_mut().insert(var, ProValue::Set(ProStringList::new()));
    VisitReturn::True
}

fn unset_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let var = ev.map(&args[0].to_key());
    if find_scope(ev, &var).is_none() {
        return VisitReturn::False;
    }
    if ev.value_stack.len() == 1 {
        ev.top_mut().remove(&var);
    } else {
        ev.top_mut().insert(var, ProValue::Unset);
    }
    VisitReturn::True
}

fn insert_json(map: &mut ProValueMap, key: String, values: Vec<String>) {
    let list = values.into_iter().map(ProString::from).collect();
    map.insert(ProKey::from(key), ProValue::Set(list));
}

fn add_json_value(value: &serde_json::Value, prefix: String, map: &mut ProValueMap) {
    use serde_json::Value;
    match value {
        Value::Bool(b) => insert_json(map, prefix, vec![b.to_string()]),
        Value::Number(n) => {
            let text = match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => i.to_string(),
                (None, Some(f)) if f.fract() == 0.0 && f.abs() < 1e15 => (f as i64).to_string(),
                _ => n.to_string(),
            };
            insert_json(map, prefix, vec![text]);
        }
        Value::String(s) => insert_json(map, prefix, vec![s.clone()]),
        Value::Array(items) => add_json_array(items, prefix + ".", map),
        Value::Object(obj) => add_json_object(obj, prefix + ".", map),
        Value::Null => {}
    }
}

fn add_json_array(items: &[serde_json::Value], prefix: String, map: &mut ProValueMap) {
    let mut keys = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        keys.push(i.to_string());
        add_json_value(item, format!("{prefix}{i}"), map);
    }
    insert_json(map, format!("{prefix}_KEYS_"), keys);
}

fn add_json_object(
    obj: &serde_json::Map<String, serde_json::Value>,
    prefix: String,
    map: &mut ProValueMap,
) {
    let mut keys: Vec<String> = obj.keys().cloned().collect();
    keys.sort();
    for k in &keys {
        if let Some(v) = obj.get(k) {
            add_json_value(v, format!("{prefix}{k}"), map);
        }
    }
    insert_json(map, format!("{prefix}_KEYS_"), keys);
}

fn parse_json_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let json = ev.values(&args[0].to_key()).join_values(b" ");
    let document: serde_json::Value = match serde_json::from_slice(json.as_bytes()) {
        Ok(doc) => doc,
        Err(err) => {
            log!("parseJson: {err}");
            return VisitReturn::False;
        }
    };
    let prefix = format!("{}.", args[1]);
    let map = ev.top_mut();
    match &document {
        serde_json::Value::Array(items) => add_json_array(items, prefix, map),
        serde_json::Value::Object(obj) => add_json_object(obj, prefix, map),
        _ => return VisitReturn::False,
    }
    VisitReturn::True
}

// Replaces the `into` namespace of `top` with the variables of an isolated
// evaluation. Variables starting with a dot are private to the file.
fn merge_into_namespace(top: &mut ProValueMap, into: &[u8], symbols: ProValueMap) {
    top.retain(|k, _| {
        !k.as_bytes()
            .strip_prefix(into)
            .is_some_and(|rest| rest.is_empty() || rest[0] == b'.')
    });
    for (k, v) in symbols {
        if k.starts_with(b".") {
            continue;
        }
        let mut name = BytesMut::from(into);
        name.put_u8(b'.');
        name.put_slice(k.as_bytes());
        top.insert(ProKey::new(name.freeze()), v);
    }
}

fn include_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let into = args.get(1).map(|s| s.bytes().clone()).unwrap_or_default();
    let silent = args.get(2).is_some_and(is_true);
    let flags = if silent {
        LoadFlags::SILENT
    } else {
        LoadFlags::PRO_ONLY
    };
    let file = ev.globals.expand_env_vars(args[0].as_bytes());
    let file = ev.resolve_path(&file);
    let ok = if into.is_empty() {
        ev.evaluate_file_checked(&file, EvalFileType::Include, LoadFlags::PRO_ONLY | flags)
    } else {
        let (ok, symbols) = ev.evaluate_file_into(&file, LoadFlags::ALL | flags);
        if ok == VisitReturn::True {
            merge_into_namespace(ev.top_mut(), &into, symbols);
        }
        ok
    };
    match ok {
        VisitReturn::False if silent => VisitReturn::True,
        ok => ok,
    }
}

fn load_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let ignore_error = args.get(1).is_some_and(is_true);
    let name = ev.globals.expand_env_vars(args[0].as_bytes());
    match ev.evaluate_feature_file(&name, ignore_error) {
        VisitReturn::False if ignore_error => VisitReturn::True,
        ret => ret,
    }
}

fn debug_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let level = args[0].to_int().unwrap_or(0);
    if level <= ev.globals.debug_level as i64 {
        let msg = ev.globals.expand_env_vars(args[1].as_bytes());
        log::debug!("Project DEBUG: {}", String::from_utf8_lossy(&msg));
    }
    VisitReturn::True
}

fn message_func(ev: &mut Evaluator, func: &ProKey, args: &[ProString]) -> VisitReturn {
    let msg = ev.globals.expand_env_vars(args[0].as_bytes());
    let msg = String::from_utf8_lossy(&msg);
    if ev.skip_level == 0 {
        if *func == "log" {
            eprint!("{msg}");
        } else {
            let kind = func.to_str().to_uppercase();
            ev.handler.file_message(&format!("Project {kind}: {msg}\n"));
        }
    }
    if *func == "error" && !ev.cumulative {
        VisitReturn::Error
    } else {
        VisitReturn::True
    }
}

fn system_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    if ev.cumulative {
        return VisitReturn::False;
    }
    collect_stats!("system test");
    match fileutil::run_status(args[0].as_bytes(), &ev.current_directory()) {
        Ok(status) => status.success().into(),
        Err(err) => {
            log!("system({}): {err}", args[0]);
            VisitReturn::False
        }
    }
}

fn is_empty_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let var = ev.map(&args[0].to_key());
    ev.values(&var).is_empty().into()
}

fn exists_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let file = ev.globals.expand_env_vars(args[0].as_bytes());
    let file = ev.resolve_path(&file);
    // Files the project wrote itself are not looked up in the vfs.
    if fileutil::exists(&file) {
        return VisitReturn::True;
    }
    let slash = file.iter().rposition(|c| *c == b'/').map_or(0, |i| i + 1);
    let (dir, pattern) = file.split_at(slash);
    if !is_wildcard(pattern) {
        return VisitReturn::False;
    }
    list_dir(dir)
        .iter()
        .any(|entry| fnmatch(pattern, &entry.name))
        .into()
}

fn mkpath_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    if !ev.vfs.is_full() {
        return VisitReturn::True;
    }
    let path = ev.resolve_path(args[0].as_bytes());
    if let Err(err) = fileutil::mkpath(&path) {
        log!("mkpath: {err}");
        ev.eval_error(&format!(
            "Cannot create directory {}.",
            String::from_utf8_lossy(&path)
        ));
        return VisitReturn::False;
    }
    VisitReturn::True
}

fn write_file(
    ev: &mut Evaluator,
    ctx: &str,
    file: &[u8],
    mode: WriteMode,
    contents: &[u8],
) -> VisitReturn {
    if let Err(err) = ev.vfs.write_file(file, mode, contents) {
        ev.eval_error(&format!(
            "Cannot write {ctx}file {}: {err}.",
            String::from_utf8_lossy(file)
        ));
        return VisitReturn::False;
    }
    ev.parser.discard_file_from_cache(file);
    VisitReturn::True
}

fn write_file_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let mut mode = WriteMode::Truncate;
    let mut contents = Vec::new();
    if let Some(var) = args.get(1) {
        let vals = ev.values(&var.to_key());
        if !vals.is_empty() {
            contents.extend_from_slice(vals.join_values(b"\n").as_bytes());
            contents.push(b'\n');
        }
        if args
            .get(2)
            .is_some_and(|m| m.as_bytes().eq_ignore_ascii_case(b"append"))
        {
            mode = WriteMode::Append;
        }
    }
    let file = ev.resolve_path(args[0].as_bytes());
    write_file(ev, "", &file, mode, &contents)
}

fn touch_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    if !ev.vfs.is_full() {
        return VisitReturn::True;
    }
    let target = ev.resolve_path(args[0].as_bytes());
    let reference = ev.resolve_path(args[1].as_bytes());
    if let Err(err) = fileutil::touch(&target, &reference) {
        ev.eval_error(&format!(
            "Cannot touch {}: {err}.",
            String::from_utf8_lossy(&target)
        ));
        return VisitReturn::False;
    }
    VisitReturn::True
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CacheTarget {
    Stash,
    Cache,
    Super,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CacheMode {
    Set,
    Add,
    Sub,
}

// Applies a cache() update to a base environment. Returns whether the
// value changed, and the new feature roots if the search paths moved.
fn amend_base_env(
    base: &mut Evaluator,
    dstvar: &ProKey,
    diffval: &ProStringList,
    mode: CacheMode,
    target: CacheTarget,
    stash_known: bool,
) -> (bool, Option<Arc<FeatureRoots>>) {
    let oldval = base.values(dstvar);
    let newval = match mode {
        CacheMode::Set => diffval.clone(),
        CacheMode::Add => oldval.iter().chain(diffval).cloned().collect(),
        CacheMode::Sub => oldval
            .iter()
            .filter(|v| !diffval.contains(v))
            .cloned()
            .collect(),
    };
    if oldval == newval {
        return (false, None);
    }
    if target == CacheTarget::Stash && !stash_known {
        return (true, None);
    }
    let paths: Vec<Bytes> = newval.iter().map(|v| v.bytes().clone()).collect();
    *base.values_ref(dstvar) = newval;
    if target != CacheTarget::Super {
        return (true, None);
    }
    if *dstvar == "QMAKEPATH" {
        base.qmakepath = paths;
        base.update_mkspec_paths();
    } else if *dstvar == "QMAKEFEATURES" {
        base.qmakefeatures = paths;
    } else {
        return (true, None);
    }
    base.update_feature_paths();
    (true, base.feature_roots.clone())
}

fn cache_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> VisitReturn {
    let mut persist = true;
    let mut target = CacheTarget::Cache;
    let mut mode = CacheMode::Set;
    let mut srcvar = None;
    if let Some(opts) = args.get(1) {
        for opt in split_value_list(opts.as_bytes()) {
            match &opt[..] {
                b"transient" => persist = false,
                b"super" => target = CacheTarget::Super,
                b"stash" => target = CacheTarget::Stash,
                b"set" => mode = CacheMode::Set,
                b"add" => mode = CacheMode::Add,
                b"sub" => mode = CacheMode::Sub,
                _ => {
                    ev.eval_error(&format!(
                        "cache(): invalid flag {}.",
                        String::from_utf8_lossy(&opt)
                    ));
                    return VisitReturn::False;
                }
            }
        }
        match args.get(2) {
            Some(src) => srcvar = Some(src.to_key()),
            None if mode != CacheMode::Set => {
                ev.eval_error("cache(): modes other than 'set' require a source variable.");
                return VisitReturn::False;
            }
            None => {}
        }
    }

    let mut varstr = Vec::new();
    let dstvar = args[0].to_key();
    if !dstvar.is_empty() {
        let srcvar = srcvar.unwrap_or_else(|| dstvar.clone());
        let Some(diffval) = ev.find_values(&srcvar).cloned() else {
            ev.eval_error(&format!("Variable {srcvar} is not defined."));
            return VisitReturn::False;
        };
        // The host and target caches may differ, so each is amended
        // separately.
        let mut changed = false;
        let stash_known = !ev.stashfile.is_empty();
        for host_build in [false, true] {
            let base_key = BaseKey {
                build_root: ev.build_root.clone(),
                stash_file: ev.stashfile.clone(),
                host_build,
            };
            let (did_change, roots) = if ev.loading_base.as_ref() == Some(&base_key) {
                amend_base_env(ev, &dstvar, &diffval, mode, target, stash_known)
            } else {
                let Some(env) = ev.globals.base_env(&base_key) else {
                    continue;
                };
                let mut state = env.state.lock();
                while state.in_progress {
                    env.cond.wait(&mut state);
                }
                if !state.is_ok {
                    continue;
                }
                let Some(base) = state.evaluator.as_deref_mut() else {
                    continue;
                };
                amend_base_env(base, &dstvar, &diffval, mode, target, stash_known)
            };
            changed |= did_change;
            if let Some(roots) = roots {
                if host_build == ev.host_build {
                    ev.feature_roots = Some(roots);
                }
            }
        }
        if !persist || !changed {
            return VisitReturn::True;
        }
        varstr.extend_from_slice(dstvar.as_bytes());
        varstr.extend_from_slice(match mode {
            CacheMode::Add => b" +=",
            CacheMode::Sub => b" -=",
            CacheMode::Set => b" =",
        });
        if let [single] = diffval.as_slice() {
            varstr.push(b' ');
            varstr.extend_from_slice(&quote_value(single.as_bytes()));
        } else {
            for val in &diffval {
                varstr.extend_from_slice(b" \\\n    ");
                varstr.extend_from_slice(&quote_value(val.as_bytes()));
            }
        }
        varstr.push(b'\n');
    }

    let output_dir = ev.output_dir.clone();
    let under_output = |name: &str| {
        let mut path = output_dir.to_vec();
        path.push(b'/');
        path.extend_from_slice(name.as_bytes());
        clean_path(&path)
    };
    let file = match target {
        CacheTarget::Super => {
            if ev.superfile.is_empty() {
                ev.superfile = under_output(".qmake.super");
                println!(
                    "Info: creating super cache file {}",
                    String::from_utf8_lossy(&ev.superfile)
                );
                let file = ProString::new(ev.superfile.clone());
                ev.values_ref(&ProKey::from_static("_QMAKE_SUPER_CACHE_"))
                    .push(file);
            }
            ev.superfile.clone()
        }
        CacheTarget::Cache => {
            if ev.cachefile.is_empty() {
                ev.cachefile = under_output(".qmake.cache");
                println!(
                    "Info: creating cache file {}",
                    String::from_utf8_lossy(&ev.cachefile)
                );
                let file = ProString::new(ev.cachefile.clone());
                ev.values_ref(&ProKey::from_static("_QMAKE_CACHE_"))
                    .push(file);
            }
            ev.cachefile.clone()
        }
        CacheTarget::Stash => {
            let file = if ev.stashfile.is_empty() {
                under_output(".qmake.stash")
            } else {
                ev.stashfile.clone()
            };
            if !ev.vfs.exists(&file) {
                println!("Info: creating stash file {}", String::from_utf8_lossy(&file));
                ev.values_ref(&ProKey::from_static("_QMAKE_STASH_"))
                    .push(ProString::new(file.clone()));
            }
            file
        }
    };
    write_file(ev, "cache ", &file, WriteMode::Append, &varstr)
}

const ANY: usize = usize::MAX;

const fn func(
    name: &'static [u8],
    f: TestFuncImpl,
    min_arity: usize,
    arity: usize,
    usage: &'static str,
) -> FuncInfo {
    FuncInfo {
        name,
        func: f,
        min_arity,
        arity,
        usage,
    }
}

const FUNC_INFO: &[FuncInfo] = &[
    func(b"requires", requires_func, 0, ANY, ""),
    func(b"greaterThan", compare_func, 2, 2, "%1(variable, value) requires two arguments."),
    func(b"lessThan", compare_func, 2, 2, "%1(variable, value) requires two arguments."),
    func(b"equals", equals_func, 2, 2, "%1(variable, value) requires two arguments."),
    func(b"isEqual", equals_func, 2, 2, "%1(variable, value) requires two arguments."),
    func(b"exists", exists_func, 1, 1, "exists(file) requires one argument."),
    func(b"export", export_func, 1, 1, "export(variable) requires one argument."),
    func(b"clear", clear_func, 1, 1, "%1(variable) requires one argument."),
    func(b"unset", unset_func, 1, 1, "%1(variable) requires one argument."),
    func(b"eval", eval_func, 0, ANY, ""),
    func(b"CONFIG", config_func, 1, 2, "CONFIG(config) requires one or two arguments."),
    func(b"isActiveConfig", config_func, 1, 2, "CONFIG(config) requires one or two arguments."),
    func(b"if", if_func, 1, 1, "if(condition) requires one argument."),
    func(b"system", system_func, 1, 1, "system(exec) requires one argument."),
    func(
        b"defined",
        defined_func,
        1,
        2,
        "defined(function, [\"test\"|\"replace\"]) requires one or two arguments.",
    ),
    func(b"contains", contains_func, 2, 3, "contains(var, val) requires two or three arguments."),
    func(b"infile", infile_func, 2, 3, "infile(file, var, [values]) requires two or three arguments."),
    func(
        b"count",
        count_func,
        2,
        3,
        "count(var, count, op=\"equals\") requires two or three arguments.",
    ),
    func(b"isEmpty", is_empty_func, 1, 1, "isEmpty(var) requires one argument."),
    func(b"parseJson", parse_json_func, 2, 2, "parseJson(variable, into) requires two arguments."),
    func(b"load", load_func, 1, 2, "load(feature) requires one or two arguments."),
    func(
        b"include",
        include_func,
        1,
        3,
        "include(file, [into, [silent]]) requires one, two or three arguments.",
    ),
    func(b"debug", debug_func, 2, 2, "debug(level, message) requires two arguments."),
    func(b"log", message_func, 1, 1, "%1(message) requires one argument."),
    func(b"message", message_func, 1, 1, "%1(message) requires one argument."),
    func(b"warning", message_func, 1, 1, "%1(message) requires one argument."),
    func(b"error", message_func, 1, 1, "%1(message) requires one argument."),
    func(b"mkpath", mkpath_func, 1, 1, "mkpath(file) requires one argument."),
    func(
        b"write_file",
        write_file_func,
        1,
        3,
        "write_file(name, [content var, [append]]) requires one to three arguments.",
    ),
    func(b"touch", touch_func, 2, 2, "touch(file, reffile) requires two arguments."),
    func(
        b"cache",
        cache_func,
        1,
        3,
        "cache(var, [set|add|sub] [transient] [super|stash], [srcvar]) requires one to three arguments.",
    ),
];

static FUNC_INFO_MAP: LazyLock<HashMap<&'static [u8], &'static FuncInfo>> =
    LazyLock::new(|| FUNC_INFO.iter().map(|f| (f.name, f)).collect());

pub fn get_test_func_info(name: &[u8]) -> Option<&'static FuncInfo> {
    FUNC_INFO_MAP.get(name).map(|v| &**v)
}

pub(crate) fn evaluate_builtin_conditional(
    ev: &mut Evaluator,
    info: &FuncInfo,
    func: &ProKey,
    args: &[ProString],
) -> VisitReturn {
    if args.len() < info.min_arity || args.len() > info.arity {
        ev.eval_error(&info.usage.replace("%1", &func.to_str()));
        return VisitReturn::False;
    }
    (info.func)(ev, func, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        eval::{BaseEnv, BaseEnvState, testing::*},
        globals::Globals,
    };
    use parking_lot::Mutex;
    use std::os::unix::ffi::OsStrExt;

    #[test]
    fn test_defined() {
        let (ev, _, _) = eval_str(
            "defineTest(t) {\n  return(true)\n}\nV = 1\ndefined(t): A = 1\ndefined(t, replace): B = 1\ndefined(t, test): C = 1\ndefined(V, var): D = 1\ndefined(W, var): E = 1\n",
        );
        assert_eq!(vals(&ev, "A"), ["1"]);
        assert!(vals(&ev, "B").is_empty());
        assert_eq!(vals(&ev, "C"), ["1"]);
        assert_eq!(vals(&ev, "D"), ["1"]);
        assert!(vals(&ev, "E").is_empty());
    }

    #[test]
    fn test_config_mutuals() {
        let (ev, _, _) = eval_str(
            "CONFIG = debug release shared\nCONFIG(debug, debug|release): A = 1\nCONFIG(release, debug|release): B = 1\nCONFIG(shared): C = 1\nCONFIG(sh*): D = 1\n",
        );
        assert!(vals(&ev, "A").is_empty());
        assert_eq!(vals(&ev, "B"), ["1"]);
        assert_eq!(vals(&ev, "C"), ["1"]);
        assert_eq!(vals(&ev, "D"), ["1"]);
    }

    #[test]
    fn test_contains() {
        let (ev, _, _) = eval_str(
            "L = foo bar\ncontains(L, bar): A = 1\ncontains(L, ba.): B = 1\ncontains(L, ba): C = 1\nM = x y x\ncontains(M, y, x|y): D = 1\ncontains(M, x, x|y): E = 1\n",
        );
        assert_eq!(vals(&ev, "A"), ["1"]);
        assert_eq!(vals(&ev, "B"), ["1"]);
        assert!(vals(&ev, "C").is_empty());
        assert!(vals(&ev, "D").is_empty());
        assert_eq!(vals(&ev, "E"), ["1"]);
    }

    #[test]
    fn test_count_and_compare() {
        let (ev, handler, _) = eval_str(
            "L = a b c\ncount(L, 3): A = 1\ncount(L, 2, >): B = 1\ncount(L, 3, <): C = 1\ncount(L, 2, foo): D = 1\nN = 10\ngreaterThan(N, 9): E = 1\nlessThan(N, 9): F = 1\nS = abc\ngreaterThan(S, abb): G = 1\nequals(L, a b c): H = 1\nisEqual(N, 1): I = 1\n",
        );
        assert_eq!(vals(&ev, "A"), ["1"]);
        assert_eq!(vals(&ev, "B"), ["1"]);
        assert!(vals(&ev, "C").is_empty());
        assert!(vals(&ev, "D").is_empty());
        assert_eq!(vals(&ev, "E"), ["1"]);
        assert!(vals(&ev, "F").is_empty());
        assert_eq!(vals(&ev, "G"), ["1"]);
        assert_eq!(vals(&ev, "H"), ["1"]);
        assert!(vals(&ev, "I").is_empty());
        assert_eq!(handler.errors(), ["Unexpected modifier to count(foo)."]);
    }

    #[test]
    fn test_clear_and_unset() {
        let (ev, _, _) = eval_str(
            "V = 1\nW = 2\nclear(V): A = 1\nunset(W): B = 1\nunset(W): C = 1\nisEmpty(V): D = 1\ndefined(V, var): E = 1\ndefined(W, var): F = 1\n",
        );
        assert_eq!(vals(&ev, "A"), ["1"]);
        assert_eq!(vals(&ev, "B"), ["1"]);
        assert!(vals(&ev, "C").is_empty());
        assert_eq!(vals(&ev, "D"), ["1"]);
        assert_eq!(vals(&ev, "E"), ["1"]);
        assert!(vals(&ev, "F").is_empty());
    }

    #[test]
    fn test_eval_and_if() {
        let (ev, _, _) = eval_str("eval(X = 1 2)\nif(true): A = 1\nif(false): B = 1\n");
        assert_eq!(vals(&ev, "X"), ["1", "2"]);
        assert_eq!(vals(&ev, "A"), ["1"]);
        assert!(vals(&ev, "B").is_empty());
    }

    #[test]
    fn test_messages() {
        let (_, handler, ret) = eval_str("message(hi)\nwarning(careful)\nmessage(a, b)\n");
        assert_eq!(ret, VisitReturn::True);
        assert_eq!(handler.output(), "Project MESSAGE: hi\nProject WARNING: careful\n");
        assert_eq!(handler.errors(), ["message(message) requires one argument."]);
    }

    #[test]
    fn test_infile() {
        let (mut ev, _, vfs) = new_evaluator();
        vfs.write_file(b"/virtual/inc.pri", WriteMode::Truncate, b"V = foo bar\n")
            .unwrap();
        vfs.write_file(
            b"/virtual/t.pro",
            WriteMode::Truncate,
            b"infile(inc.pri, V): A = 1\ninfile(inc.pri, V, bar): B = 1\ninfile(inc.pri, V, ba.): C = 1\ninfile(inc.pri, V, baz): D = 1\ninfile(inc.pri, W): E = 1\n",
        )
        .unwrap();
        ev.evaluate_file(b"/virtual/t.pro", EvalFileType::Project, LoadFlags::PRO_ONLY);
        assert_eq!(vals(&ev, "A"), ["1"]);
        assert_eq!(vals(&ev, "B"), ["1"]);
        assert_eq!(vals(&ev, "C"), ["1"]);
        assert!(vals(&ev, "D").is_empty());
        assert!(vals(&ev, "E").is_empty());
        assert!(vals(&ev, "V").is_empty());
    }

    #[test]
    fn test_include() {
        let (mut ev, _, vfs) = new_evaluator();
        vfs.write_file(b"/virtual/sub.pri", WriteMode::Truncate, b"X = 1\nY = $$PWD\n")
            .unwrap();
        vfs.write_file(
            b"/virtual/t.pro",
            WriteMode::Truncate,
            b"include(sub.pri)\ninclude(nothere.pri, , true): A = 1\n",
        )
        .unwrap();
        ev.evaluate_file(b"/virtual/t.pro", EvalFileType::Project, LoadFlags::PRO_ONLY);
        assert_eq!(vals(&ev, "X"), ["1"]);
        assert_eq!(vals(&ev, "Y"), ["/virtual"]);
        assert_eq!(vals(&ev, "A"), ["1"]);
    }

    #[test]
    fn test_merge_into_namespace() {
        let set = |v: &str| ProValue::Set(vec![ProString::from(v)]);
        let mut top = ProValueMap::new();
        top.insert(ProKey::from("ns"), set("gone"));
        top.insert(ProKey::from("ns.old"), set("gone"));
        top.insert(ProKey::from("nsx"), set("kept"));
        let mut symbols = ProValueMap::new();
        symbols.insert(ProKey::from("X"), set("1"));
        symbols.insert(ProKey::from(".priv"), set("2"));
        merge_into_namespace(&mut top, b"ns", symbols);
        let mut keys: Vec<String> = top.keys().map(|k| k.to_string()).collect();
        keys.sort();
        assert_eq!(keys, ["ns.X", "nsx"]);
    }

    #[test]
    fn test_parse_json() {
        let (mut ev, _, vfs) = new_evaluator();
        vfs.write_file(
            b"/virtual/data.json",
            WriteMode::Truncate,
            br#"{"name": "x", "n": 3, "list": [true, "y"], "obj": {"k": 1.5}}"#,
        )
        .unwrap();
        vfs.write_file(
            b"/virtual/t.pro",
            WriteMode::Truncate,
            b"J = $$cat(data.json, blob)\nparseJson(J, out): OK = 1\nB = $$cat(t.pro, blob)\nparseJson(B, bad): BAD = 1\n",
        )
        .unwrap();
        ev.evaluate_file(b"/virtual/t.pro", EvalFileType::Project, LoadFlags::PRO_ONLY);
        assert_eq!(vals(&ev, "OK"), ["1"]);
        assert!(vals(&ev, "BAD").is_empty());
        assert_eq!(vals(&ev, "out._KEYS_"), ["list", "n", "name", "obj"]);
        assert_eq!(vals(&ev, "out.name"), ["x"]);
        assert_eq!(vals(&ev, "out.n"), ["3"]);
        assert_eq!(vals(&ev, "out.list._KEYS_"), ["0", "1"]);
        assert_eq!(vals(&ev, "out.list.0"), ["true"]);
        assert_eq!(vals(&ev, "out.list.1"), ["y"]);
        assert_eq!(vals(&ev, "out.obj.k"), ["1.5"]);
    }

    #[test]
    fn test_write_file() {
        let (mut ev, _, vfs) = new_evaluator();
        vfs.write_file(
            b"/virtual/t.pro",
            WriteMode::Truncate,
            b"V = a b\nwrite_file(out.txt, V)\nwrite_file(out.txt, V, append)\nwrite_file(empty.txt)\n",
        )
        .unwrap();
        ev.evaluate_file(b"/virtual/t.pro", EvalFileType::Project, LoadFlags::PRO_ONLY);
        assert_eq!(&vfs.read_file(b"/virtual/out.txt").unwrap()[..], b"a\nb\na\nb\n");
        assert_eq!(&vfs.read_file(b"/virtual/empty.txt").unwrap()[..], b"");
    }

    #[test]
    fn test_exists_and_system() {
        let dir = std::env::temp_dir().join(format!("proeval-exists-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("f.txt"), "").unwrap();
        let d = dir.to_string_lossy();
        let (ev, _, _) = eval_str_in(dir.as_os_str().as_bytes(), &format!(
            "exists({d}/f.txt): A = 1\nexists({d}/*.txt): B = 1\nexists({d}/none): C = 1\nsystem(true): D = 1\nsystem(false): E = 1\n"
        ));
        assert_eq!(vals(&ev, "A"), ["1"]);
        assert_eq!(vals(&ev, "B"), ["1"]);
        assert!(vals(&ev, "C").is_empty());
        assert_eq!(vals(&ev, "D"), ["1"]);
        assert!(vals(&ev, "E").is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_cache_errors() {
        let (_, handler, _) = eval_str(
            "cache(V, bogus)\ncache(V, add)\ncache(UNDEFINED)\n",
        );
        assert_eq!(
            handler.errors(),
            [
                "cache(): invalid flag bogus.",
                "cache(): modes other than 'set' require a source variable.",
                "Variable UNDEFINED is not defined.",
            ]
        );
    }

    #[test]
    fn test_cache_amends_base_env() {
        let (mut ev, handler, vfs) = new_evaluator_with(Globals::new());
        ev.set_output_dir("/virtual/out");
        let mut base = ev.sibling();
        base.top_mut().insert(
            ProKey::from("V"),
            ProValue::Set(vec![ProString::from("old")]),
        );
        let base_key = BaseKey {
            build_root: Bytes::new(),
            stash_file: Bytes::new(),
            host_build: false,
        };
        let env = Arc::new(BaseEnv {
            state: Mutex::new(BaseEnvState {
                in_progress: false,
                is_ok: true,
                evaluator: Some(Box::new(base)),
            }),
            ..Default::default()
        });
        ev.globals.base_envs.lock().insert(base_key.clone(), env.clone());

        vfs.write_file(
            b"/virtual/t.pro",
            WriteMode::Truncate,
            b"V = x y\ncache(V)\ncache(V)\nW = z\ncache(V, add transient, W)\n",
        )
        .unwrap();
        ev.evaluate_file(b"/virtual/t.pro", EvalFileType::Project, LoadFlags::PRO_ONLY);
        assert!(handler.errors().is_empty(), "{:?}", handler.errors());
        assert_eq!(vals(&ev, "_QMAKE_CACHE_"), ["/virtual/out/.qmake.cache"]);
        assert_eq!(
            &vfs.read_file(b"/virtual/out/.qmake.cache").unwrap()[..],
            b"V = \\\n    x \\\n    y\n"
        );
        let state = env.state.lock();
        let base = state.evaluator.as_deref().unwrap();
        assert_eq!(vals(base, "V"), ["x", "y", "z"]);
        drop(state);
        ev.globals.reset_base_envs();
    }
}
