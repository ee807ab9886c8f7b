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

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use memchr::{memchr, memrchr};
use std::{env::current_dir, os::unix::ffi::OsStrExt};

pub fn has_path_prefix(s: &[u8], prefix: &[u8]) -> bool {
    s.starts_with(prefix) && (s.len() == prefix.len() || s[prefix.len()..].starts_with(b"/"))
}

pub fn trim_space(s: &[u8]) -> &[u8] {
    s.trim_ascii()
}

pub fn trim_prefix_str<'a>(s: &'a str, prefix: &str) -> &'a str {
    s.strip_prefix(prefix).unwrap_or(s)
}

pub fn is_absolute_path(s: &[u8]) -> bool {
    s.starts_with(b"/")
}

/// The directory part of a path, without the trailing slash. Unlike
/// `dirname(1)`, a bare file name yields the empty string.
pub fn dirname(s: &Bytes) -> Bytes {
    match memrchr(b'/', s) {
        Some(0) => Bytes::from_static(b"/"),
        Some(idx) => s.slice(..idx),
        None => Bytes::new(),
    }
}

pub fn basename(s: &[u8]) -> &[u8] {
    match memrchr(b'/', s) {
        Some(idx) => &s[idx + 1..],
        None => s,
    }
}

/// The file name up to its first dot.
pub fn base_name_no_ext(s: &[u8]) -> &[u8] {
    let name = basename(s);
    match memchr(b'.', name) {
        Some(idx) => &name[..idx],
        None => name,
    }
}

pub fn normalize_path(mut o: &[u8]) -> Bytes {
    if o.is_empty() {
        return Bytes::new();
    }
    let mut ret = BytesMut::new();
    if o.starts_with(b"/") {
        ret.put_u8(b'/');
        o = &o[1..];
    }
    while !o.is_empty() {
        let (dir, rest) = match memchr(b'/', o) {
            Some(idx) => (&o[..idx], &o[idx + 1..]),
            None => (o, [].as_slice()),
        };
        o = rest;

        if dir == b"." || (dir == b".." && ret.as_ref() == b"/") {
            continue;
        } else if dir == b".." && !ret.is_empty() && ret.as_ref() != b".." && !ret.ends_with(b"/..")
        {
            match memrchr(b'/', ret.as_ref()) {
                Some(0) => ret.truncate(1),
                Some(index) => ret.truncate(index),
                None => ret.truncate(0),
            }
        } else if !dir.is_empty() {
            if !ret.is_empty() && !ret.ends_with(b"/") {
                ret.put_u8(b'/');
            }
            ret.put_slice(dir);
        }
    }
    ret.into()
}

/// Like [`normalize_path`], but a non-empty path never collapses to
/// nothing.
pub fn clean_path(s: &[u8]) -> Bytes {
    let ret = normalize_path(s);
    if ret.is_empty() && !s.is_empty() {
        return Bytes::from_static(b".");
    }
    ret
}

pub fn concat_dir(b: &[u8], n: &[u8]) -> Bytes {
    let mut r = BytesMut::new();
    if !b.is_empty() && !n.starts_with(b"/") {
        r.put_slice(b);
        r.put_u8(b'/');
    }
    r.put_slice(n);
    clean_path(&r)
}

/// Resolves `s` against `base`, which must be absolute, or against the
/// working directory when `base` is empty.
pub fn resolve_path(base: &[u8], s: &[u8]) -> Result<Bytes> {
    if is_absolute_path(s) {
        return Ok(clean_path(s));
    }
    if base.is_empty() {
        return abs_path(s);
    }
    Ok(concat_dir(base, s))
}

pub fn abs_path(s: &[u8]) -> Result<Bytes> {
    if is_absolute_path(s) {
        return Ok(normalize_path(s));
    }
    let mut o = BytesMut::from(current_dir()?.as_os_str().as_bytes());
    if !s.is_empty() {
        o.put_u8(b'/');
        o.put_slice(s);
    }
    Ok(normalize_path(&o))
}

/// The path of `path` relative to the directory `base`. Both must be
/// clean absolute paths.
pub fn relative_path(base: &[u8], path: &[u8]) -> Bytes {
    let split = |s: &'_ [u8]| -> Vec<Vec<u8>> {
        s.split(|c| *c == b'/')
            .filter(|c| !c.is_empty())
            .map(|c| c.to_vec())
            .collect()
    };
    let from = split(base);
    let to = split(path);
    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();
    let mut ret = BytesMut::new();
    for _ in common..from.len() {
        if !ret.is_empty() {
            ret.put_u8(b'/');
        }
        ret.put_slice(b"..");
    }
    for c in &to[common..] {
        if !ret.is_empty() {
            ret.put_u8(b'/');
        }
        ret.put_slice(c);
    }
    if ret.is_empty() {
        return Bytes::from_static(b".");
    }
    ret.freeze()
}

/// Splits an unquoted value into words. Quotes group words and are kept,
/// as are backslashes escaping a quote or another backslash.
pub fn split_value_list(vals: &[u8]) -> Vec<Bytes> {
    let mut ret = Vec::new();
    let mut build = Vec::with_capacity(vals.len());
    let mut quote = 0u8;
    let mut had_word = false;
    let mut x = 0;
    while x < vals.len() {
        let mut c = vals[x];
        x += 1;
        if quote != 0 && c == quote {
            quote = 0;
            had_word = true;
            build.push(c);
            continue;
        }
        match c {
            b'"' | b'\'' => {
                if quote == 0 {
                    quote = c;
                }
                had_word = true;
            }
            b' ' | b'\t' if quote == 0 => {
                if had_word {
                    ret.push(Bytes::from(std::mem::take(&mut build)));
                    had_word = false;
                }
                continue;
            }
            b' ' | b'\t' => {}
            b'\\' => {
                if let Some(&next) = vals.get(x)
                    && matches!(next, b'\'' | b'"' | b'\\')
                {
                    build.push(c);
                    c = next;
                    x += 1;
                }
                had_word = true;
            }
            _ => had_word = true,
        }
        build.push(c);
    }
    if had_word {
        ret.push(Bytes::from(build));
    }
    ret
}

/// Renders a value as qmake source text that evaluates back to the value.
pub fn quote_value(val: &[u8]) -> Bytes {
    let mut ret = BytesMut::with_capacity(val.len() + 2);
    let mut quote = val.is_empty();
    let mut escaping = false;
    for &c in val {
        if c < 32 {
            if !escaping {
                escaping = true;
                ret.put_slice(b"$$escape_expand(");
            }
            match c {
                b'\r' => ret.put_slice(b"\\\\r"),
                b'\n' => ret.put_slice(b"\\\\n"),
                b'\t' => ret.put_slice(b"\\\\t"),
                _ => ret.put_slice(format!("\\\\x{c:02x}").as_bytes()),
            }
            continue;
        }
        if escaping {
            escaping = false;
            ret.put_u8(b')');
        }
        match c {
            b'\\' => ret.put_slice(b"\\\\"),
            b'"' => ret.put_slice(b"\\\""),
            b'\'' => ret.put_slice(b"\\'"),
            b'$' => ret.put_slice(b"\\$"),
            b'#' => ret.put_slice(b"$${LITERAL_HASH}"),
            b' ' => {
                quote = true;
                ret.put_u8(c);
            }
            _ => ret.put_u8(c),
        }
    }
    if escaping {
        ret.put_u8(b')');
    }
    if quote {
        let mut quoted = BytesMut::with_capacity(ret.len() + 2);
        quoted.put_u8(b'"');
        quoted.put_slice(&ret);
        quoted.put_u8(b'"');
        return quoted.freeze();
    }
    ret.freeze()
}

/// Quotes a value for diagnostics and dumps.
pub fn format_value(val: &[u8], force_quote: bool) -> String {
    let mut ret = String::with_capacity(val.len() + 2);
    let mut quote = force_quote || val.is_empty();
    for c in String::from_utf8_lossy(val).chars() {
        match c {
            '\r' => ret.push_str("\\r"),
            '\n' => ret.push_str("\\n"),
            '\t' => ret.push_str("\\t"),
            c if (c as u32) < 32 => ret.push_str(&format!("\\x{:02x}", c as u32)),
            '\\' => ret.push_str("\\\\"),
            '"' => ret.push_str("\\\""),
            '\'' => ret.push_str("\\'"),
            ' ' => {
                quote = true;
                ret.push(c);
            }
            c => ret.push(c),
        }
    }
    if quote {
        ret.insert(0, '"');
        ret.push('"');
    }
    ret
}

pub fn format_value_list<'a>(vals: impl IntoIterator<Item = &'a [u8]>, commas: bool) -> String {
    let mut ret = String::new();
    for val in vals {
        if !ret.is_empty() {
            if commas {
                ret.push(',');
            }
            ret.push(' ');
        }
        ret.push_str(&format_value(val, false));
    }
    ret
}

fn has_special_chars(s: &[u8], table: &[u8; 16]) -> bool {
    s.iter()
        .any(|&c| c < 128 && table[(c >> 3) as usize] & (1 << (c & 7)) != 0)
}

/// Quotes an argument for a POSIX shell.
pub fn shell_quote_unix(arg: &[u8]) -> Bytes {
    // Control chars, space and \'"$`<>|;&(){}*?#!~[]
    const IQM: [u8; 16] = [
        0xff, 0xff, 0xff, 0xff, 0xdf, 0x07, 0x00, 0xd8, 0x00, 0x00, 0x00, 0x38, 0x01, 0x00, 0x00,
        0x78,
    ];
    if arg.is_empty() {
        return Bytes::from_static(b"''");
    }
    if !has_special_chars(arg, &IQM) {
        return Bytes::copy_from_slice(arg);
    }
    let mut ret = BytesMut::with_capacity(arg.len() + 2);
    ret.put_u8(b'\'');
    for &c in arg {
        if c == b'\'' {
            ret.put_slice(b"'\\''");
        } else {
            ret.put_u8(c);
        }
    }
    ret.put_u8(b'\'');
    ret.freeze()
}

/// Quotes an argument for cmd.exe and the usual argv splitting rules.
pub fn shell_quote_win(arg: &[u8]) -> Bytes {
    // Control chars, space and "&()<>^|
    const IQM: [u8; 16] = [
        0xff, 0xff, 0xff, 0xff, 0x45, 0x13, 0x00, 0x78, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00,
        0x10,
    ];
    if arg.is_empty() {
        return Bytes::from_static(b"\"\"");
    }
    if !has_special_chars(arg, &IQM) {
        return Bytes::copy_from_slice(arg);
    }
    let mut ret = Vec::with_capacity(arg.len() + 4);
    ret.push(b'"');
    let mut backslashes = 0;
    for &c in arg {
        match c {
            b'\\' => backslashes += 1,
            b'"' => {
                ret.push(b'"');
                ret.extend(std::iter::repeat_n(b'\\', backslashes * 2));
                ret.extend_from_slice(b"\\^\"\\^\"");
                backslashes = 0;
            }
            _ => {
                ret.extend(std::iter::repeat_n(b'\\', backslashes));
                ret.push(c);
                backslashes = 0;
            }
        }
    }
    // A trailing backslash run stays outside the closing quote.
    ret.push(b'"');
    ret.extend(std::iter::repeat_n(b'\\', backslashes));
    Bytes::from(ret)
}

/// Escapes the characters a QRegExp pattern treats specially.
pub fn regexp_escape(s: &[u8]) -> Bytes {
    let mut ret = BytesMut::with_capacity(s.len());
    for &c in s {
        if b"$()*+.?[\\]^{|}".contains(&c) {
            ret.put_u8(b'\\');
        }
        ret.put_u8(c);
    }
    ret.freeze()
}

/// Converts a Qt style replacement string, which refers to captures as
/// `\1`, into the `$1` syntax of the regex crate.
pub fn qt_replacement(s: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        match s[i] {
            b'\\' if s.get(i + 1).is_some_and(|c| c.is_ascii_digit()) => {
                let start = i + 1;
                let mut end = start;
                while end < s.len() && s[end].is_ascii_digit() && end - start < 2 {
                    end += 1;
                }
                ret.extend_from_slice(b"${");
                ret.extend_from_slice(&s[start..end]);
                ret.push(b'}');
                i = end;
                continue;
            }
            b'$' => ret.extend_from_slice(b"$$"),
            c => ret.push(c),
        }
        i += 1;
    }
    ret
}

/// The fields `begin..=end` of `s` split on `sep`. Negative indices count
/// from the end.
pub fn section(s: &[u8], sep: &[u8], begin: i64, end: i64) -> Bytes {
    if sep.is_empty() {
        return Bytes::new();
    }
    let fields: Vec<&[u8]> = split_on(s, sep);
    let n = fields.len() as i64;
    let begin = if begin < 0 { begin + n } else { begin };
    let end = if end < 0 { end + n } else { end };
    if n == 0 || begin >= n || end < 0 || begin > end {
        return Bytes::new();
    }
    let begin = begin.max(0) as usize;
    let end = end.min(n - 1) as usize;
    Bytes::from(fields[begin..=end].join(sep))
}

fn split_on<'a>(s: &'a [u8], sep: &[u8]) -> Vec<&'a [u8]> {
    let mut ret = Vec::new();
    let mut rest = s;
    while let Some(idx) = memchr::memmem::find(rest, sep) {
        ret.push(&rest[..idx]);
        rest = &rest[idx + sep.len()..];
    }
    ret.push(rest);
    ret
}

/// Splits on `sep`, keeping empty fields. An empty separator splits into
/// single characters.
pub fn split_keep_empty(s: &[u8], sep: &[u8]) -> Vec<Bytes> {
    if sep.is_empty() {
        return String::from_utf8_lossy(s)
            .chars()
            .map(|c| Bytes::from(c.to_string()))
            .collect();
    }
    split_on(s, sep)
        .into_iter()
        .map(Bytes::copy_from_slice)
        .collect()
}

/// Compiles a QRegExp style pattern. Invalid patterns yield `None`.
pub fn compile_regex(pattern: &[u8], case_sensitive: bool) -> Option<regex::bytes::Regex> {
    match regex::bytes::RegexBuilder::new(&String::from_utf8_lossy(pattern))
        .case_insensitive(!case_sensitive)
        .build()
    {
        Ok(re) => Some(re),
        Err(err) => {
            log::warn!("invalid regular expression {:?}: {err}", String::from_utf8_lossy(pattern));
            None
        }
    }
}

/// Like [`compile_regex`], but the pattern has to match the whole input.
pub fn compile_exact_regex(pattern: &[u8]) -> Option<regex::bytes::Regex> {
    let mut anchored = b"^(?:".to_vec();
    anchored.extend_from_slice(pattern);
    anchored.extend_from_slice(b")$");
    compile_regex(&anchored, true)
}

#[cfg(test)]
mod test {
    use super::*;

    fn split(s: &str) -> Vec<String> {
        split_value_list(s.as_bytes())
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    #[test]
    fn test_compile_regex() {
        assert!(compile_regex(b"o+", true).is_some_and(|re| re.is_match(b"foo")));
        assert!(compile_regex(b"FOO", false).is_some_and(|re| re.is_match(b"foo")));
        assert!(compile_regex(b"(", true).is_none());
        assert!(compile_exact_regex(b"o").is_some_and(|re| !re.is_match(b"foo")));
    }

    #[test]
    fn test_has_path_prefix() {
        assert!(has_path_prefix(b"/foo/bar", b"/foo"));
        assert!(has_path_prefix(b"/foo", b"/foo"));
        assert!(!has_path_prefix(b"/foobar/baz", b"/foo"));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(b""), "");
        assert_eq!(normalize_path(b"."), "");
        assert_eq!(normalize_path(b"/"), "/");
        assert_eq!(normalize_path(b"////tmp////"), "/tmp");
        assert_eq!(normalize_path(b"a////b//../c/////"), "a/c");
        assert_eq!(normalize_path(b"../foo"), "../foo");
        assert_eq!(normalize_path(b"./foo"), "foo");
        assert_eq!(normalize_path(b"x/../../foo"), "../foo");
        assert_eq!(normalize_path(b"/../../foo"), "/foo");
        assert_eq!(normalize_path(b"/a/.."), "/");
        assert_eq!(normalize_path(b".././../a/b"), "../../a/b");
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(b""), "");
        assert_eq!(clean_path(b"."), ".");
        assert_eq!(clean_path(b"a/.."), ".");
        assert_eq!(clean_path(b"/a/b/../c/"), "/a/c");
        assert_eq!(concat_dir(b"/src", b"../lib"), "/lib");
        assert_eq!(concat_dir(b"/src", b"/abs"), "/abs");
    }

    #[test]
    fn test_dirname_basename() {
        assert_eq!(dirname(&Bytes::from_static(b"/a/b.pro")), "/a");
        assert_eq!(dirname(&Bytes::from_static(b"/b.pro")), "/");
        assert_eq!(dirname(&Bytes::from_static(b"b.pro")), "");
        assert_eq!(basename(b"/a/b.pro"), b"b.pro");
        assert_eq!(base_name_no_ext(b"/a/b.tar.gz"), b"b");
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(relative_path(b"/a/b", b"/a/c/d"), "../c/d");
        assert_eq!(relative_path(b"/a", b"/a"), ".");
        assert_eq!(relative_path(b"/", b"/x"), "x");
    }

    #[test]
    fn test_split_value_list() {
        assert_eq!(split("a b\tc"), vec!["a", "b", "c"]);
        assert_eq!(split("  a  "), vec!["a"]);
        assert_eq!(split("\"a b\" c"), vec!["\"a b\"", "c"]);
        assert_eq!(split("'x y'z"), vec!["'x y'z"]);
        assert_eq!(split("a\\\"b c"), vec!["a\\\"b", "c"]);
        assert_eq!(split("a\\nb"), vec!["a\\nb"]);
        assert_eq!(split("\"\""), vec!["\"\""]);
        assert!(split("").is_empty());
    }

    #[test]
    fn test_quote_value() {
        assert_eq!(quote_value(b"plain"), "plain");
        assert_eq!(quote_value(b""), "\"\"");
        assert_eq!(quote_value(b"a b"), "\"a b\"");
        assert_eq!(quote_value(b"$x#"), "\\$x$${LITERAL_HASH}");
        assert_eq!(quote_value(b"a\nb"), "a$$escape_expand(\\\\n)b");
        assert_eq!(quote_value(b"it's"), "it\\'s");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(b"abc", false), "abc");
        assert_eq!(format_value(b"", false), "\"\"");
        assert_eq!(format_value(b"a b", false), "\"a b\"");
        assert_eq!(format_value(b"x", true), "\"x\"");
        assert_eq!(format_value(b"a\tb\x01", false), "a\\tb\\x01");
        assert_eq!(
            format_value_list([b"a".as_slice(), b"b c".as_slice()], true),
            "a, \"b c\""
        );
    }

    #[test]
    fn test_shell_quote_unix() {
        assert_eq!(shell_quote_unix(b"plain"), "plain");
        assert_eq!(shell_quote_unix(b"a b"), "'a b'");
        assert_eq!(shell_quote_unix(b"it's"), "'it'\\''s'");
        assert_eq!(shell_quote_unix(b""), "''");
        assert_eq!(shell_quote_unix(b"a/b-c.d"), "a/b-c.d");
        assert_eq!(shell_quote_unix(b"$HOME"), "'$HOME'");
    }

    #[test]
    fn test_shell_quote_win() {
        assert_eq!(shell_quote_win(b"plain"), "plain");
        assert_eq!(shell_quote_win(b"a b"), "\"a b\"");
        assert_eq!(shell_quote_win(b""), "\"\"");
        assert_eq!(shell_quote_win(b"a b\\"), "\"a b\"\\");
        assert_eq!(shell_quote_win(b"a\\b c"), "\"a\\b c\"");
        assert_eq!(shell_quote_win(b"say \"hi\""), "\"say \"\\^\"\\^\"hi\"\\^\"\\^\"\"");
    }

    #[test]
    fn test_regexp_escape() {
        assert_eq!(regexp_escape(b"a.b*c"), "a\\.b\\*c");
        assert_eq!(regexp_escape(b"plain-text"), "plain-text");
    }

    #[test]
    fn test_qt_replacement() {
        assert_eq!(qt_replacement(b"\\1-\\2"), b"${1}-${2}");
        assert_eq!(qt_replacement(b"$x"), b"$$x");
        assert_eq!(qt_replacement(b"a\\b"), b"a\\b");
    }

    #[test]
    fn test_section() {
        assert_eq!(section(b"a/b/c/d", b"/", 1, 2), "b/c");
        assert_eq!(section(b"a/b/c/d", b"/", -1, -1), "d");
        assert_eq!(section(b"a/b/c/d", b"/", 2, 10), "c/d");
        assert_eq!(section(b"a/b", b"/", 5, 6), "");
    }

    #[test]
    fn test_split_keep_empty() {
        assert_eq!(split_keep_empty(b"a,,b", b","), vec!["a", "", "b"]);
        assert_eq!(split_keep_empty(b"ab", b""), vec!["a", "b"]);
    }
}
