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

//! The built-in replace functions, called as `$$name(args)`.

use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    io::Write,
    sync::LazyLock,
};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    collect_stats,
    eval::{EvalResult, Evaluator, LoadFlags, VisitReturn},
    fileutil::{fnmatch, list_dir, run_command},
    log,
    proitem::{ProKey, ProString, ProStringList, ProValue, ValueList},
    strutil::{
        self, abs_path, compile_regex, is_absolute_path, qt_replacement, quote_value,
        regexp_escape, section, shell_quote_unix, shell_quote_win, split_keep_empty,
        split_value_list,
    },
};

type ExpandFuncImpl = fn(&mut Evaluator, &ProKey, &[ProString]) -> EvalResult<ProStringList>;

pub struct FuncInfo {
    pub name: &'static [u8],
    pub func: ExpandFuncImpl,
    pub min_arity: usize,
    pub arity: usize,
    // Reported on an argument count mismatch. `%1` is the function name.
    pub usage: &'static str,
}

// Function pointers are not comparable, so just compare by name
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

/// Case-insensitive "true", or a non-zero number.
pub(crate) fn is_true(s: &ProString) -> bool {
    s.as_bytes().eq_ignore_ascii_case(b"true") || s.to_int().is_some_and(|n| n != 0)
}

fn derived(text: impl Into<Bytes>, from: &ProString) -> ProString {
    let text = text.into();
    if text == from.as_bytes() {
        return from.clone();
    }
    ProString::new(text).set_source_from(from)
}

fn var_values(ev: &mut Evaluator, name: &ProString) -> ProStringList {
    let var = ev.map(&name.to_key());
    ev.values(&var)
}

enum ReadMode {
    Words,
    WordsAndNewlines,
    Blob,
    Lines,
}

fn read_mode(args: &[ProString]) -> ReadMode {
    let Some(mode) = args.get(1) else {
        return ReadMode::Words;
    };
    let mode = mode.as_bytes();
    if mode.eq_ignore_ascii_case(b"false") {
        ReadMode::WordsAndNewlines
    } else if mode.eq_ignore_ascii_case(b"blob") {
        ReadMode::Blob
    } else if mode.eq_ignore_ascii_case(b"lines") {
        ReadMode::Lines
    } else {
        ReadMode::Words
    }
}

fn text_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let data = data.strip_suffix(b"\n").unwrap_or(data);
    data.split(|c| *c == b'\n')
        .filter(move |_| !data.is_empty())
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn split_words(s: &[u8], out: &mut ProStringList) {
    out.extend(split_value_list(s).into_iter().map(ProString::new));
}

// The fields `beg..=end` of a path, split on either kind of slash.
fn path_section(s: &[u8], beg: i64, end: i64) -> Bytes {
    let mut bounds = vec![0];
    for (i, c) in s.iter().enumerate() {
        if matches!(c, b'/' | b'\\') {
            bounds.push(i + 1);
        }
    }
    let n = bounds.len() as i64;
    let beg = if beg < 0 { beg + n } else { beg };
    let end = if end < 0 { end + n } else { end };
    if beg >= n || end < 0 || beg > end {
        return Bytes::new();
    }
    let beg = beg.max(0) as usize;
    let end = end.min(n - 1) as usize;
    let start = bounds[beg];
    let stop = bounds.get(end + 1).map_or(s.len(), |next| next - 1);
    Bytes::copy_from_slice(&s[start..stop])
}

fn basename_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    Ok(var_values(ev, &args[0])
        .iter()
        .map(|s| derived(path_section(s.as_bytes(), -1, -1), s))
        .collect())
}

fn dirname_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    Ok(var_values(ev, &args[0])
        .iter()
        .map(|s| derived(path_section(s.as_bytes(), 0, -2), s))
        .collect())
}

fn section_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let sep = args[1].as_bytes();
    let beg = args[2].to_int().unwrap_or(0);
    let end = args.get(3).map_or(-1, |e| e.to_int().unwrap_or(0));
    Ok(var_values(ev, &args[0])
        .iter()
        .map(|s| derived(section(s.as_bytes(), sep, beg, end), s))
        .collect())
}

/// Replaces the lowest numbered `%N` placeholder everywhere.
fn substitute_arg(fmt: &[u8], arg: &[u8]) -> Vec<u8> {
    let placeholder = |i: usize| -> Option<(u32, usize)> {
        if fmt[i] != b'%' {
            return None;
        }
        let digits = fmt[i + 1..]
            .iter()
            .take(2)
            .take_while(|c| c.is_ascii_digit())
            .count();
        if digits == 0 {
            return None;
        }
        let num = std::str::from_utf8(&fmt[i + 1..i + 1 + digits])
            .ok()?
            .parse::<u32>()
            .ok()?;
        (num > 0).then_some((num, digits + 1))
    };
    let Some(lowest) = (0..fmt.len())
        .filter_map(|i| placeholder(i).map(|(num, _)| num))
        .min()
    else {
        return fmt.to_vec();
    };
    let mut ret = Vec::with_capacity(fmt.len() + arg.len());
    let mut i = 0;
    while i < fmt.len() {
        match placeholder(i) {
            Some((num, len)) if num == lowest => {
                ret.extend_from_slice(arg);
                i += len;
            }
            _ => {
                ret.push(fmt[i]);
                i += 1;
            }
        }
    }
    ret
}

fn sprintf_func(_: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let mut ret = args[0].as_bytes().to_vec();
    for arg in &args[1..] {
        ret = substitute_arg(&ret, arg.as_bytes());
    }
    Ok(vec![ProString::new(ret)])
}

fn to_radix(mut n: u64, base: u32) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        let d = (n % base as u64) as u32;
        digits.push(char::from_digit(d, base).unwrap_or('?'));
        n /= base as u64;
    }
    digits.iter().rev().collect()
}

fn format_number_func(
    ev: &mut Evaluator,
    _: &ProKey,
    args: &[ProString],
) -> EvalResult<ProStringList> {
    let mut ibase = 10;
    let mut obase = 10;
    let mut width = 0;
    let mut zeropad = false;
    let mut leftalign = false;
    let mut sign = "";
    if let Some(opts) = args.get(1) {
        for opt in split_value_list(opts.as_bytes()) {
            let opt = String::from_utf8_lossy(&opt);
            let num = |prefix: &str| opt.strip_prefix(prefix).map(|v| v.parse().unwrap_or(0));
            if let Some(n) = num("ibase=") {
                ibase = n;
            } else if let Some(n) = num("obase=") {
                obase = n;
            } else if let Some(n) = num("width=") {
                width = n;
            } else if opt == "zeropad" {
                zeropad = true;
            } else if opt == "padsign" {
                sign = " ";
            } else if opt == "alwayssign" {
                sign = "+";
            } else if opt == "leftalign" {
                leftalign = true;
            } else {
                ev.eval_error(&format!("format_number(): invalid format option {opt}."));
                return Ok(ProStringList::new());
            }
        }
    }
    if !(2..=36).contains(&obase) {
        ev.eval_error(&format!("format_number(): invalid output base {obase}."));
        return Ok(ProStringList::new());
    }
    let text = args[0].to_str();
    if text.contains('.') {
        ev.eval_error("format_number(): floats are currently not supported.");
        return Ok(ProStringList::new());
    }
    let num = if (2..=36).contains(&ibase) {
        i64::from_str_radix(text.trim(), ibase).ok()
    } else {
        None
    };
    let Some(num) = num else {
        ev.eval_error(&format!(
            "format_number(): malformed number {text} for base {ibase}."
        ));
        return Ok(ProStringList::new());
    };
    let mut outstr = if num < 0 { "-" } else { sign }.to_string();
    let numstr = to_radix(num.unsigned_abs(), obase);
    let space = width as i64 - outstr.len() as i64 - numstr.len() as i64;
    if space <= 0 {
        outstr.push_str(&numstr);
    } else if leftalign {
        outstr.push_str(&numstr);
        outstr.push_str(&" ".repeat(space as usize));
    } else if zeropad {
        outstr.push_str(&"0".repeat(space as usize));
        outstr.push_str(&numstr);
    } else {
        outstr.insert_str(0, &" ".repeat(space as usize));
        outstr.push_str(&numstr);
    }
    Ok(vec![ProString::from(outstr)])
}

fn join_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let var = var_values(ev, &args[0]);
    if var.is_empty() {
        return Ok(ProStringList::new());
    }
    let glue = args.get(1).map(|s| s.as_bytes()).unwrap_or_default();
    let mut ret = BytesMut::new();
    if let Some(before) = args.get(2) {
        ret.put_slice(before.as_bytes());
    }
    ret.put_slice(var.join_values(glue).as_bytes());
    if let Some(after) = args.get(3) {
        ret.put_slice(after.as_bytes());
    }
    let source = var
        .iter()
        .find_map(|v| v.source().cloned())
        .or_else(|| ev.current_pro_file());
    Ok(vec![ProString::with_source(ret.freeze(), source)])
}

fn split_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let sep = args.get(1).map_or(&b" "[..], |s| s.as_bytes());
    let mut ret = ProStringList::new();
    for var in var_values(ev, &args[0]) {
        for part in split_keep_empty(var.as_bytes(), sep) {
            ret.push(derived(part, &var));
        }
    }
    Ok(ret)
}

fn member_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let var = var_values(ev, &args[0]);
    let mut start = 0;
    let mut end = 0;
    if let Some(start_str) = args.get(1) {
        match start_str.to_int() {
            Some(n) => {
                start = n;
                end = n;
                if let Some(end_str) = args.get(2) {
                    let Some(n) = end_str.to_int() else {
                        ev.eval_error(&format!(
                            "member() argument 3 (end) '{end_str}' invalid."
                        ));
                        return Ok(ProStringList::new());
                    };
                    end = n;
                }
            }
            None => {
                let range = (args.len() == 2)
                    .then(|| memchr::memmem::find(start_str.as_bytes(), b".."))
                    .flatten()
                    .and_then(|dotdot| {
                        Some((
                            start_str.mid(0, dotdot).to_int()?,
                            start_str.mid_from(dotdot + 2).to_int()?,
                        ))
                    });
                let Some((s, e)) = range else {
                    ev.eval_error(&format!(
                        "member() argument 2 (start) '{start_str}' invalid."
                    ));
                    return Ok(ProStringList::new());
                };
                start = s;
                end = e;
            }
        }
    }
    let count = var.len() as i64;
    if start < 0 {
        start += count;
    }
    if end < 0 {
        end += count;
    }
    if start < 0 || start >= count || end < 0 || end >= count {
        return Ok(ProStringList::new());
    }
    let (start, end) = (start as usize, end as usize);
    if start < end {
        Ok(var[start..=end].to_vec())
    } else {
        Ok(var[end..=start].iter().rev().cloned().collect())
    }
}

fn first_func(ev: &mut Evaluator, func: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let var = var_values(ev, &args[0]);
    let item = if *func == "first" {
        var.first()
    } else {
        var.last()
    };
    Ok(item.cloned().into_iter().collect())
}

fn size_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let n = var_values(ev, &args[0]).len();
    Ok(vec![ProString::from_int(n as i64)])
}

fn cat_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let file = ev.globals.expand_env_vars(args[0].as_bytes());
    let file = ev.resolve_path(&file);
    let Ok(data) = ev.vfs.read_file(&file) else {
        log!("cat: cannot read {}", String::from_utf8_lossy(&file));
        return Ok(ProStringList::new());
    };
    let mut ret = ProStringList::new();
    match read_mode(args) {
        ReadMode::Blob => ret.push(ProString::new(data)),
        ReadMode::Lines => {
            ret.extend(text_lines(&data).map(|l| ProString::new(Bytes::copy_from_slice(l))))
        }
        mode => {
            for line in text_lines(&data) {
                split_words(strutil::trim_space(line), &mut ret);
                if let ReadMode::WordsAndNewlines = mode {
                    ret.push(ProString::from_static("\n"));
                }
            }
        }
    }
    Ok(ret)
}

fn fromfile_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let file = ev.globals.expand_env_vars(args[0].as_bytes());
    let file = ev.resolve_path(&file);
    let (ret, vars) = ev.evaluate_file_into(&file, LoadFlags::PRO_ONLY);
    if ret != VisitReturn::True {
        return Ok(ProStringList::new());
    }
    let var = ev.map(&args[1].to_key());
    Ok(vars
        .get(&var)
        .and_then(|v| v.as_list())
        .cloned()
        .unwrap_or_default())
}

fn eval_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    Ok(var_values(ev, &args[0]))
}

fn list_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let name = format!(".QMAKE_INTERNAL_TMP_variableName_{}", ev.list_count);
    ev.list_count += 1;
    let mut list = ProStringList::new();
    for arg in args {
        for word in split_value_list(arg.as_bytes()) {
            list.push(ProString::new(word).set_source_from(arg));
        }
    }
    ev.top_mut()
        .insert(ProKey::from(name.as_str()), ProValue::Set(list));
    Ok(vec![ProString::from(name)])
}

fn find_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let Some(re) = compile_regex(args[1].as_bytes(), true) else {
        return Ok(ProStringList::new());
    };
    Ok(var_values(ev, &args[0])
        .into_iter()
        .filter(|v| re.is_match(v.as_bytes()))
        .collect())
}

fn system_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    if ev.skip_level != 0 || ev.cumulative {
        return Ok(ProStringList::new());
    }
    collect_stats!("system");
    let output = match run_command(args[0].as_bytes(), &ev.current_directory()) {
        Ok((_, output)) => output,
        Err(err) => {
            ev.eval_error(&format!("Cannot run command {}: {err}", args[0]));
            return Ok(ProStringList::new());
        }
    };
    let mut ret = ProStringList::new();
    match read_mode(args) {
        ReadMode::Lines => {
            ret.extend(text_lines(&output).map(|l| ProString::new(Bytes::copy_from_slice(l))))
        }
        ReadMode::Blob => ret.push(ProString::new(output)),
        mode => {
            let single_line = matches!(mode, ReadMode::Words);
            let output: Vec<u8> = output
                .into_iter()
                .map(|c| match c {
                    b'\t' => b' ',
                    b'\n' if single_line => b' ',
                    c => c,
                })
                .collect();
            split_words(&output, &mut ret);
        }
    }
    Ok(ret)
}

fn unique_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let mut ret = var_values(ev, &args[0]);
    ret.remove_duplicates();
    Ok(ret)
}

fn reverse_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let mut ret = ev.values(&args[0].to_key());
    ret.reverse();
    Ok(ret)
}

fn quote_func(_: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    Ok(args.to_vec())
}

fn escape_expand_func(
    _: &mut Evaluator,
    _: &ProKey,
    args: &[ProString],
) -> EvalResult<ProStringList> {
    let mut ret = ProStringList::new();
    for arg in args {
        let s = arg.as_bytes();
        let mut out = Vec::with_capacity(s.len());
        let mut x = 0;
        while x < s.len() {
            let c = s[x];
            if c == b'\\' && x + 1 < s.len() {
                let mapped = match s[x + 1] {
                    // A doubled backslash stays as it is.
                    b'\\' => {
                        out.extend_from_slice(b"\\\\");
                        x += 2;
                        continue;
                    }
                    b'n' => Some(b'\n'),
                    b't' => Some(b'\t'),
                    b'r' => Some(b'\r'),
                    // \xNN, as written by quote_value() for other control
                    // characters.
                    b'x' => {
                        let hex = s
                            .get(x + 2..x + 4)
                            .filter(|h| h.iter().all(u8::is_ascii_hexdigit))
                            .and_then(|h| std::str::from_utf8(h).ok());
                        if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                            out.push(b);
                            x += 4;
                            continue;
                        }
                        None
                    }
                    _ => None,
                };
                if let Some(m) = mapped {
                    out.push(m);
                    x += 2;
                    continue;
                }
            }
            out.push(c);
            x += 1;
        }
        ret.push(ProString::new(out).set_source_from(arg));
    }
    Ok(ret)
}

fn re_escape_func(_: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    Ok(args
        .iter()
        .map(|arg| derived(regexp_escape(arg.as_bytes()), arg))
        .collect())
}

fn val_escape_func(
    ev: &mut Evaluator,
    _: &ProKey,
    args: &[ProString],
) -> EvalResult<ProStringList> {
    Ok(ev
        .values(&args[0].to_key())
        .iter()
        .map(|v| ProString::new(quote_value(v.as_bytes())))
        .collect())
}

fn case_func(_: &mut Evaluator, func: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let mut ret = ProStringList::new();
    for arg in args {
        let s = arg.to_str();
        let converted = match func.as_bytes() {
            b"upper" => s.to_uppercase(),
            b"lower" => s.to_lowercase(),
            _ => {
                let lower = s.to_lowercase();
                let mut chars = lower.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => lower,
                }
            }
        };
        ret.push(derived(converted, arg));
    }
    Ok(ret)
}

fn files_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let recursive = args.get(1).is_some_and(is_true);
    let pattern: Vec<u8> = ev
        .globals
        .expand_env_vars(args[0].as_bytes())
        .iter()
        .map(|c| if *c == b'\\' { b'/' } else { *c })
        .collect();
    let mut pfx = Vec::new();
    if !is_absolute_path(&pattern) {
        pfx.extend_from_slice(&ev.current_directory());
        if !pfx.ends_with(b"/") {
            pfx.push(b'/');
        }
    }
    let (first_dir, pattern) = match pattern.iter().rposition(|c| *c == b'/') {
        Some(slash) => (pattern[..=slash].to_vec(), pattern[slash + 1..].to_vec()),
        None => (Vec::new(), pattern),
    };
    let source = ev.current_pro_file();
    let mut ret = ProStringList::new();
    let mut dirs = vec![first_dir];
    let mut d = 0;
    while d < dirs.len() {
        let dir = dirs[d].clone();
        d += 1;
        let mut path = pfx.clone();
        path.extend_from_slice(&dir);
        for entry in list_dir(&path) {
            let mut fname = dir.clone();
            fname.extend_from_slice(&entry.name);
            if entry.is_dir && recursive {
                let mut sub = fname.clone();
                sub.push(b'/');
                dirs.push(sub);
            }
            if fnmatch(&pattern, &entry.name) {
                ret.push(ProString::with_source(fname, source.clone()));
            }
        }
    }
    Ok(ret)
}

fn prompt_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let mut msg = ev.globals.expand_env_vars(args[0].as_bytes()).to_vec();
    if !msg.ends_with(b"?") {
        msg.push(b'?');
    }
    eprint!("Project PROMPT: {} ", String::from_utf8_lossy(&msg));
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return Ok(ProStringList::new());
    }
    let mut ret = ProStringList::new();
    split_words(line.trim_end_matches(['\r', '\n']).as_bytes(), &mut ret);
    Ok(ret)
}

fn replace_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let values = var_values(ev, &args[0]);
    let Some(before) = compile_regex(args[1].as_bytes(), true) else {
        return Ok(values);
    };
    let after = qt_replacement(args[2].as_bytes());
    Ok(values
        .iter()
        .map(|val| derived(before.replace_all(val.as_bytes(), &after[..]).into_owned(), val))
        .collect())
}

#[derive(Default)]
struct DepGraph {
    // Unresolved dependencies per item.
    dependencies: HashMap<ProKey, HashSet<ProKey>>,
    dependees: HashMap<ProKey, ProStringList>,
    root_set: ProStringList,
}

impl DepGraph {
    fn populate(
        &mut self,
        ev: &Evaluator,
        deps: &[ProString],
        prefix: &[u8],
        suffixes: &[Bytes],
    ) {
        for item in deps {
            let key = item.to_key();
            if self.dependencies.contains_key(&key) {
                continue;
            }
            self.dependencies.insert(key, HashSet::new());
            let mut depends = ProStringList::new();
            for suffix in suffixes {
                let mut name = BytesMut::from(prefix);
                name.put_slice(item.as_bytes());
                name.put_slice(suffix);
                depends.extend(ev.values(&ProKey::new(name.freeze())));
            }
            if depends.is_empty() {
                self.root_set.push(item.clone());
                continue;
            }
            for dep in &depends {
                if let Some(dset) = self.dependencies.get_mut(&item.to_key()) {
                    dset.insert(dep.to_key());
                }
                self.dependees
                    .entry(dep.to_key())
                    .or_default()
                    .push(item.clone());
            }
            self.populate(ev, &depends, prefix, suffixes);
        }
    }
}

fn depends_func(ev: &mut Evaluator, func: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let org_list = ev.values(&args[0].to_key());
    let prefix = args.get(1).map(|p| p.as_bytes()).unwrap_or_default();
    let suffixes = match args.get(2) {
        Some(s) => split_value_list(s.as_bytes()),
        None => vec![Bytes::from_static(b".depends")],
    };
    let mut graph = DepGraph::default();
    graph.populate(ev, &org_list, prefix, &suffixes);

    let resolve = *func == "resolve_depends";
    let mut ret = ProStringList::new();
    let mut i = 0;
    while i < graph.root_set.len() {
        let item = graph.root_set[i].clone();
        i += 1;
        if resolve || org_list.contains(&item) {
            ret.push(item.clone());
        }
        let dependees = graph
            .dependees
            .get(&item.to_key())
            .cloned()
            .unwrap_or_default();
        for dep in dependees {
            let Some(dset) = graph.dependencies.get_mut(&dep.to_key()) else {
                continue;
            };
            dset.remove(&item.to_key());
            if dset.is_empty() {
                graph.root_set.push(dep);
            }
        }
    }
    Ok(ret)
}

fn enumerate_vars_func(
    ev: &mut Evaluator,
    _: &ProKey,
    _: &[ProString],
) -> EvalResult<ProStringList> {
    let mut keys: Vec<&ProKey> = ev.value_stack.iter().flat_map(|map| map.keys()).collect();
    keys.sort();
    keys.dedup();
    Ok(keys.into_iter().map(|k| k.to_pro_string()).collect())
}

fn shadowed_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let path = ev.resolve_path(args[0].as_bytes());
    let shadow = ev.globals.shadowed_path(&path);
    if shadow.is_empty() {
        return Ok(ProStringList::new());
    }
    Ok(vec![derived(shadow, &args[0])])
}

fn base_dir(ev: &Evaluator, args: &[ProString]) -> Bytes {
    match args.get(1) {
        Some(base) => abs_path(base.as_bytes()).unwrap_or_else(|_| base.bytes().clone()),
        None => ev.current_directory(),
    }
}

fn absolute_path_func(
    ev: &mut Evaluator,
    _: &ProKey,
    args: &[ProString],
) -> EvalResult<ProStringList> {
    let base = base_dir(ev, args);
    let path = strutil::resolve_path(&base, args[0].as_bytes())
        .unwrap_or_else(|_| args[0].bytes().clone());
    Ok(vec![derived(path, &args[0])])
}

fn relative_path_func(
    ev: &mut Evaluator,
    _: &ProKey,
    args: &[ProString],
) -> EvalResult<ProStringList> {
    let base = base_dir(ev, args);
    let path = strutil::resolve_path(&base, args[0].as_bytes())
        .unwrap_or_else(|_| args[0].bytes().clone());
    Ok(vec![derived(strutil::relative_path(&base, &path), &args[0])])
}

fn clean_path_func(_: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    Ok(vec![derived(strutil::clean_path(args[0].as_bytes()), &args[0])])
}

fn replace_byte(s: &[u8], from: u8, to: u8) -> Vec<u8> {
    s.iter().map(|c| if *c == from { to } else { *c }).collect()
}

fn system_path_func(
    _: &mut Evaluator,
    _: &ProKey,
    args: &[ProString],
) -> EvalResult<ProStringList> {
    Ok(vec![derived(replace_byte(args[0].as_bytes(), b'\\', b'/'), &args[0])])
}

fn shell_path_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    let path = if ev.dir_sep.starts_with(b"\\") {
        replace_byte(args[0].as_bytes(), b'/', b'\\')
    } else {
        replace_byte(args[0].as_bytes(), b'\\', b'/')
    };
    Ok(vec![derived(path, &args[0])])
}

fn system_quote_func(
    _: &mut Evaluator,
    _: &ProKey,
    args: &[ProString],
) -> EvalResult<ProStringList> {
    Ok(vec![derived(shell_quote_unix(args[0].as_bytes()), &args[0])])
}

fn shell_quote_func(
    ev: &mut Evaluator,
    _: &ProKey,
    args: &[ProString],
) -> EvalResult<ProStringList> {
    let quoted = if ev.dir_sep.starts_with(b"\\") {
        shell_quote_win(args[0].as_bytes())
    } else {
        shell_quote_unix(args[0].as_bytes())
    };
    Ok(vec![derived(quoted, &args[0])])
}

fn getenv_func(ev: &mut Evaluator, _: &ProKey, args: &[ProString]) -> EvalResult<ProStringList> {
    Ok(vec![ProString::new(ev.globals.getenv(args[0].as_bytes()))])
}

const ANY: usize = usize::MAX;

const fn func(
    name: &'static [u8],
    f: ExpandFuncImpl,
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
    func(b"member", member_func, 1, 3, "member(var, start, end) requires one to three arguments."),
    func(b"first", first_func, 1, 1, "%1(var) requires one argument."),
    func(b"last", first_func, 1, 1, "%1(var) requires one argument."),
    func(b"size", size_func, 1, 1, "size(var) requires one argument."),
    func(b"cat", cat_func, 1, 2, "cat(file, singleline=true) requires one or two arguments."),
    func(b"fromfile", fromfile_func, 2, 2, "fromfile(file, variable) requires two arguments."),
    func(b"eval", eval_func, 1, 1, "eval(variable) requires one argument."),
    func(b"list", list_func, 0, ANY, ""),
    func(b"sprintf", sprintf_func, 1, ANY, "sprintf(format, ...) requires at least one argument."),
    func(
        b"format_number",
        format_number_func,
        1,
        2,
        "format_number(number[, options...]) requires one or two arguments.",
    ),
    func(b"join", join_func, 1, 4, "join(var, glue, before, after) requires one to four arguments."),
    func(b"split", split_func, 1, 2, "split(var, sep) requires one or two arguments."),
    func(b"basename", basename_func, 1, 1, "%1(var) requires one argument."),
    func(b"dirname", dirname_func, 1, 1, "%1(var) requires one argument."),
    func(
        b"section",
        section_func,
        3,
        4,
        "%1(var) section(var, sep, begin, end) requires three or four arguments.",
    ),
    func(b"find", find_func, 2, 2, "find(var, str) requires two arguments."),
    func(b"system", system_func, 1, 2, "system(execute) requires one or two arguments."),
    func(b"unique", unique_func, 1, 1, "unique(var) requires one argument."),
    func(b"reverse", reverse_func, 1, 1, "reverse(var) requires one argument."),
    func(b"quote", quote_func, 0, ANY, ""),
    func(b"escape_expand", escape_expand_func, 0, ANY, ""),
    func(b"upper", case_func, 0, ANY, ""),
    func(b"lower", case_func, 0, ANY, ""),
    func(b"title", case_func, 0, ANY, ""),
    func(b"re_escape", re_escape_func, 0, ANY, ""),
    func(b"val_escape", val_escape_func, 1, 1, "val_escape(var) requires one argument."),
    func(b"files", files_func, 1, 2, "files(pattern, recursive=false) requires one or two arguments."),
    func(b"prompt", prompt_func, 1, 1, "prompt(question) requires one argument."),
    func(b"replace", replace_func, 3, 3, "replace(var, before, after) requires three arguments."),
    func(
        b"sort_depends",
        depends_func,
        1,
        3,
        "%1(var, [prefix, [suffixes]]) requires one to three arguments.",
    ),
    func(
        b"resolve_depends",
        depends_func,
        1,
        3,
        "%1(var, [prefix, [suffixes]]) requires one to three arguments.",
    ),
    func(b"enumerate_vars", enumerate_vars_func, 0, ANY, ""),
    func(b"shadowed", shadowed_func, 1, 1, "shadowed(path) requires one argument."),
    func(
        b"absolute_path",
        absolute_path_func,
        1,
        2,
        "absolute_path(path[, base]) requires one or two arguments.",
    ),
    func(
        b"relative_path",
        relative_path_func,
        1,
        2,
        "relative_path(path[, base]) requires one or two arguments.",
    ),
    func(b"clean_path", clean_path_func, 1, 1, "clean_path(path) requires one argument."),
    func(b"system_path", system_path_func, 1, 1, "system_path(path) requires one argument."),
    func(b"shell_path", shell_path_func, 1, 1, "shell_path(path) requires one argument."),
    func(b"system_quote", system_quote_func, 1, 1, "system_quote(arg) requires one argument."),
    func(b"shell_quote", shell_quote_func, 1, 1, "shell_quote(arg) requires one argument."),
    func(b"getenv", getenv_func, 1, 1, "getenv(arg) requires one argument."),
];

static FUNC_INFO_MAP: LazyLock<HashMap<&'static [u8], &'static FuncInfo>> =
    LazyLock::new(|| FUNC_INFO.iter().map(|f| (f.name, f)).collect());

pub fn get_expand_func_info(name: &[u8]) -> Option<&'static FuncInfo> {
    FUNC_INFO_MAP.get(name).map(|v| &**v)
}

pub(crate) fn evaluate_builtin_expand(
    ev: &mut Evaluator,
    info: &FuncInfo,
    func: &ProKey,
    args: &[ProString],
) -> EvalResult<ProStringList> {
    if args.len() < info.min_arity || args.len() > info.arity {
        ev.eval_error(&info.usage.replace("%1", &func.to_str()));
        return Ok(ProStringList::new());
    }
    (info.func)(ev, func, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        eval::testing::*,
        globals::Globals,
        handler::EvalFileType,
        vfs::WriteMode,
    };
    use std::os::unix::ffi::OsStrExt;

    #[test]
    fn test_member() {
        let (ev, handler, _) = eval_str(
            "L = a b c d e\nM = $$member(L, -2)\nN = $$member(L, 1, 3)\nO = $$member(L, 3..1)\nP = $$member(L, 9)\nQ = $$member(L)\n",
        );
        assert!(handler.errors().is_empty(), "{:?}", handler.errors());
        assert_eq!(vals(&ev, "M"), ["d"]);
        assert_eq!(vals(&ev, "N"), ["b", "c", "d"]);
        assert_eq!(vals(&ev, "O"), ["d", "c", "b"]);
        assert!(vals(&ev, "P").is_empty());
        assert_eq!(vals(&ev, "Q"), ["a"]);
    }

    #[test]
    fn test_member_bad_start() {
        let (_, handler, _) = eval_str("L = a\nM = $$member(L, x)\n");
        assert_eq!(handler.errors(), ["member() argument 2 (start) 'x' invalid."]);
    }

    #[test]
    fn test_format_number() {
        let (ev, handler, _) = eval_str(
            "A = $$format_number(255, obase=16)\nB = $$format_number(5, width=3 zeropad)\nC = $$format_number(-5, width=4)\nD = $$format_number(ff, ibase=16)\nE = $$format_number(7, alwayssign)\n",
        );
        assert!(handler.errors().is_empty(), "{:?}", handler.errors());
        assert_eq!(vals(&ev, "A"), ["ff"]);
        assert_eq!(vals(&ev, "B"), ["005"]);
        assert_eq!(vals(&ev, "C"), ["  -5"]);
        assert_eq!(vals(&ev, "D"), ["255"]);
        assert_eq!(vals(&ev, "E"), ["+7"]);
    }

    #[test]
    fn test_format_number_errors() {
        let (_, handler, _) = eval_str(
            "A = $$format_number(1.5)\nB = $$format_number(12, foo)\nC = $$format_number(xyz)\nD = $$format_number(12, obase=1)\nE = $$format_number(12, obase=99)\n",
        );
        assert_eq!(
            handler.errors(),
            [
                "format_number(): floats are currently not supported.",
                "format_number(): invalid format option foo.",
                "format_number(): malformed number xyz for base 10.",
                "format_number(): invalid output base 1.",
                "format_number(): invalid output base 99.",
            ]
        );
    }

    #[test]
    fn test_resolve_depends() {
        let (ev, _, _) = eval_str(
            "A.depends = B\nB.depends = C\nL = A\nR = $$resolve_depends(L)\nS = $$sort_depends(L)\n",
        );
        assert_eq!(vals(&ev, "R"), ["C", "B", "A"]);
        assert_eq!(vals(&ev, "S"), ["A"]);
    }

    #[test]
    fn test_depends_with_prefix_and_cycle() {
        let (ev, _, _) = eval_str(
            "m_x.deps = y\nm_y.deps = x\nm_z.deps =\nL = x z\nR = $$resolve_depends(L, m_, .deps)\n",
        );
        assert_eq!(vals(&ev, "R"), ["z"]);
    }

    #[test]
    fn test_join_and_split() {
        let (ev, _, _) = eval_str(
            "L = a b c\nJ = $$join(L, -, <, >)\nE = $$join(NOTHING, -, <, >)\nS = a:b:c\nT = $$split(S, :)\nW = $$split(J, -)\n",
        );
        assert_eq!(vals(&ev, "J"), ["<a-b-c>"]);
        assert!(vals(&ev, "E").is_empty());
        assert_eq!(vals(&ev, "T"), ["a", "b", "c"]);
        assert_eq!(vals(&ev, "W"), ["<a", "b", "c>"]);
    }

    #[test]
    fn test_sections() {
        let (ev, _, _) = eval_str(
            "F = /usr/lib/libfoo.so\nB = $$basename(F)\nD = $$dirname(F)\nX = $$section(F, /, 2, 2)\nY = $$section(F, /, -1)\n",
        );
        assert_eq!(vals(&ev, "B"), ["libfoo.so"]);
        assert_eq!(vals(&ev, "D"), ["/usr/lib"]);
        assert_eq!(vals(&ev, "X"), ["lib"]);
        assert_eq!(vals(&ev, "Y"), ["libfoo.so"]);
    }

    #[test]
    fn test_string_functions() {
        let (ev, handler, _) = eval_str(
            r#"A = $$sprintf(%1-%2-%1, a, b)
B = $$upper(abc)
C = $$title(hELLO)
D = $$lower(ABC)
E = $$re_escape(a.b)
F = $$escape_expand(a\\nb)
F2 = $$escape_expand(\\x41\\x0 \\xzz)
V = "a b" c$$LITERAL_DOLLAR
G = $$val_escape(V)
H = $$shell_quote(a b)
I = $$clean_path(/a/./b/../c)
J = $$system_path(a\\b)
K = $$quote(x y)
"#,
        );
        assert!(handler.errors().is_empty(), "{:?}", handler.errors());
        assert_eq!(vals(&ev, "A"), ["a-b-a"]);
        assert_eq!(vals(&ev, "B"), ["ABC"]);
        assert_eq!(vals(&ev, "C"), ["Hello"]);
        assert_eq!(vals(&ev, "D"), ["abc"]);
        assert_eq!(vals(&ev, "E"), ["a\\.b"]);
        assert_eq!(vals(&ev, "F"), ["a\nb"]);
        assert_eq!(vals(&ev, "F2"), ["A\\x0", "\\xzz"]);
        assert_eq!(vals(&ev, "G"), ["\"a b\"", "c\\$"]);
        assert_eq!(vals(&ev, "H"), ["'a b'"]);
        assert_eq!(vals(&ev, "I"), ["/a/c"]);
        assert_eq!(vals(&ev, "J"), ["a/b"]);
        assert_eq!(vals(&ev, "K"), ["x y"]);
    }

    #[test]
    fn test_list_functions() {
        let (ev, _, _) = eval_str(
            "L = b a b c\nU = $$unique(L)\nR = $$reverse(L)\nS = $$size(L)\nF = $$first(L)\nZ = $$last(L)\nT = $$list(x y, z)\nV = $$eval($$T)\nN = $$find(L, ^[ab]$)\n",
        );
        assert_eq!(vals(&ev, "U"), ["b", "a", "c"]);
        assert_eq!(vals(&ev, "R"), ["c", "b", "a", "b"]);
        assert_eq!(vals(&ev, "S"), ["4"]);
        assert_eq!(vals(&ev, "F"), ["b"]);
        assert_eq!(vals(&ev, "Z"), ["c"]);
        assert_eq!(vals(&ev, "T"), [".QMAKE_INTERNAL_TMP_variableName_0"]);
        assert_eq!(vals(&ev, "V"), ["x", "y", "z"]);
        assert_eq!(vals(&ev, "N"), ["b", "a", "b"]);
    }

    #[test]
    fn test_replace() {
        let (ev, _, _) = eval_str(
            r#"L = foo.cpp bar.h baz.cpp
R = $$replace(L, \\.cpp, .o)
S = $$replace(L, (b)a, \\1o)
"#,
        );
        assert_eq!(vals(&ev, "R"), ["foo.o", "bar.h", "baz.o"]);
        assert_eq!(vals(&ev, "S"), ["foo.cpp", "bor.h", "boz.cpp"]);
    }

    #[test]
    fn test_arity_errors() {
        let (_, handler, _) = eval_str("A = $$size(a, b)\nB = $$first(a, b)\n");
        assert_eq!(
            handler.errors(),
            ["size(var) requires one argument.", "first(var) requires one argument."]
        );
    }

    #[test]
    fn test_paths() {
        let (ev, _, _) = eval_str(
            "A = $$absolute_path(x/y)\nB = $$absolute_path(y, /base)\nC = $$relative_path(/virtual/x/y)\nD = $$relative_path(/a/b, /a/c)\n",
        );
        assert_eq!(vals(&ev, "A"), ["/virtual/x/y"]);
        assert_eq!(vals(&ev, "B"), ["/base/y"]);
        assert_eq!(vals(&ev, "C"), ["x/y"]);
        assert_eq!(vals(&ev, "D"), ["../b"]);
    }

    #[test]
    fn test_shadowed_and_getenv() {
        let mut globals = Globals::new();
        globals.source_root = Bytes::from_static(b"/src");
        globals.build_root = Bytes::from_static(b"/build");
        let mut env = HashMap::new();
        env.insert(Bytes::from_static(b"FOO"), Bytes::from_static(b"bar"));
        globals.environment = Some(env);
        let (mut ev, _, vfs) = new_evaluator_with(globals);
        vfs.write_file(
            b"/src/proj/p.pro",
            WriteMode::Truncate,
            b"S = $$shadowed(sub)\nO = $$shadowed(/elsewhere)\nE = $$getenv(FOO)\n",
        )
        .unwrap();
        ev.evaluate_file(b"/src/proj/p.pro", EvalFileType::Project, LoadFlags::PRO_ONLY);
        assert_eq!(vals(&ev, "S"), ["/build/proj/sub"]);
        assert!(vals(&ev, "O").is_empty());
        assert_eq!(vals(&ev, "E"), ["bar"]);
    }

    #[test]
    fn test_cat_and_fromfile() {
        let (mut ev, handler, vfs) = new_evaluator();
        vfs.write_file(b"/virtual/data.txt", WriteMode::Truncate, b"a b\nc\n")
            .unwrap();
        vfs.write_file(b"/virtual/other.pri", WriteMode::Truncate, b"X = 1 2\nY = 3\n")
            .unwrap();
        vfs.write_file(
            b"/virtual/t.pro",
            WriteMode::Truncate,
            b"W = $$cat(data.txt)\nL = $$cat(data.txt, lines)\nB = $$cat(data.txt, blob)\nF = $$fromfile(other.pri, X)\nM = $$cat(missing.txt)\n",
        )
        .unwrap();
        ev.evaluate_file(b"/virtual/t.pro", EvalFileType::Project, LoadFlags::PRO_ONLY);
        assert!(handler.errors().is_empty(), "{:?}", handler.errors());
        assert_eq!(vals(&ev, "W"), ["a", "b", "c"]);
        assert_eq!(vals(&ev, "L"), ["a b", "c"]);
        assert_eq!(vals(&ev, "B"), ["a b\nc\n"]);
        assert_eq!(vals(&ev, "F"), ["1", "2"]);
        assert!(vals(&ev, "M").is_empty());
        assert!(vals(&ev, "Y").is_empty());
    }

    #[test]
    fn test_system() {
        let tmp = std::env::temp_dir();
        let (ev, _, _) = eval_str_in(tmp.as_os_str().as_bytes(), "A = $$system(echo hi there)\nB = $$system(echo x y, blob)\nC = $$system(echo x y, lines)\n");
        assert_eq!(vals(&ev, "A"), ["hi", "there"]);
        assert_eq!(vals(&ev, "B"), ["x y\n"]);
        assert_eq!(vals(&ev, "C"), ["x y"]);
    }

    #[test]
    fn test_files() {
        let dir = std::env::temp_dir().join(format!("proeval-files-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("a.txt"), "").unwrap();
        std::fs::write(dir.join("b.cpp"), "").unwrap();
        std::fs::write(dir.join("sub/c.txt"), "").unwrap();
        let d = dir.to_string_lossy();
        let (ev, _, _) = eval_str(&format!(
            "F = $$files({d}/*.txt)\nR = $$files({d}/*.txt, true)\n"
        ));
        assert_eq!(vals(&ev, "F"), [format!("{d}/a.txt")]);
        assert_eq!(vals(&ev, "R"), [format!("{d}/a.txt"), format!("{d}/sub/c.txt")]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_enumerate_vars() {
        let (ev, _, _) = eval_str("ZZ_TOP = 1\nV = $$enumerate_vars()\n");
        assert!(vals(&ev, "V").contains(&"ZZ_TOP".to_string()));
    }

    #[test]
    fn test_substitute_arg() {
        assert_eq!(substitute_arg(b"%2 %1 %1", b"x"), b"%2 x x");
        assert_eq!(substitute_arg(b"100%", b"x"), b"100%");
        assert_eq!(to_radix(255, 2), "11111111");
        assert_eq!(path_section(b"a\\b/c", 0, -2), Bytes::from_static(b"a\\b"));
    }
}
