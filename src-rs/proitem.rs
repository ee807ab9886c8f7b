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

//! Value types shared by the parser and the evaluator: strings, keys,
//! value maps, parsed files and the token stream reader.

use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::{Debug, Display},
    hash::{Hash, Hasher},
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use bytes::{BufMut, Bytes, BytesMut};

const NO_HASH: u32 = 0x8000_0000;

/// The rolling hash used for keys. It is also baked into the token stream.
pub fn hash_bytes(s: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &c in s {
        h = (h << 4).wrapping_add(c as u32);
        h ^= (h & 0xf000_0000) >> 23;
        h &= 0x0fff_ffff;
    }
    h
}

/// An immutable string value. Literals parsed from a file share the file's
/// token buffer and remember the file they came from.
pub struct ProString {
    text: Bytes,
    source: Option<Arc<ProFile>>,
    hash: AtomicU32,
}

pub type ProStringList = Vec<ProString>;

impl ProString {
    pub fn new(text: impl Into<Bytes>) -> Self {
        ProString {
            text: text.into(),
            source: None,
            hash: AtomicU32::new(NO_HASH),
        }
    }

    pub const fn from_static(text: &'static str) -> Self {
        ProString {
            text: Bytes::from_static(text.as_bytes()),
            source: None,
            hash: AtomicU32::new(NO_HASH),
        }
    }

    pub fn with_source(text: impl Into<Bytes>, source: Option<Arc<ProFile>>) -> Self {
        ProString {
            text: text.into(),
            source,
            hash: AtomicU32::new(NO_HASH),
        }
    }

    fn with_hash(text: Bytes, source: Option<Arc<ProFile>>, hash: u32) -> Self {
        ProString {
            text,
            source,
            hash: AtomicU32::new(hash),
        }
    }

    pub fn from_int(n: i64) -> Self {
        ProString::new(n.to_string())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.text
    }

    pub fn bytes(&self) -> &Bytes {
        &self.text
    }

    pub fn to_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.text)
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn source(&self) -> Option<&Arc<ProFile>> {
        self.source.as_ref()
    }

    pub fn set_source(mut self, source: Option<Arc<ProFile>>) -> Self {
        self.source = source;
        self
    }

    pub fn set_source_from(mut self, other: &ProString) -> Self {
        self.source = other.source.clone();
        self
    }

    pub fn hash_value(&self) -> u32 {
        let h = self.hash.load(Ordering::Relaxed);
        if h != NO_HASH {
            return h;
        }
        let h = hash_bytes(&self.text);
        self.hash.store(h, Ordering::Relaxed);
        h
    }

    pub fn to_key(&self) -> ProKey {
        ProKey::from_pro_string(self.clone())
    }

    /// Shares the backing storage.
    pub fn mid(&self, off: usize, len: usize) -> ProString {
        let off = off.min(self.text.len());
        let end = off.saturating_add(len).min(self.text.len());
        ProString::with_source(self.text.slice(off..end), self.source.clone())
    }

    pub fn mid_from(&self, off: usize) -> ProString {
        self.mid(off, usize::MAX)
    }

    pub fn trimmed(&self) -> ProString {
        let s = crate::strutil::trim_space(&self.text);
        if s.len() == self.text.len() {
            return self.clone();
        }
        let off = s.as_ptr() as usize - self.text.as_ptr() as usize;
        self.mid(off, s.len())
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.text.starts_with(prefix)
    }

    pub fn ends_with(&self, suffix: &[u8]) -> bool {
        self.text.ends_with(suffix)
    }

    /// Parses a decimal integer the way qmake does: surrounding whitespace
    /// and a leading sign are accepted.
    pub fn to_int(&self) -> Option<i64> {
        parse_int(crate::strutil::trim_space(&self.text), 10)
    }

    fn extend(&mut self, extra: usize, f: impl FnOnce(&mut BytesMut)) {
        let text = std::mem::take(&mut self.text);
        let mut buf = match text.try_into_mut() {
            Ok(buf) => buf,
            Err(shared) => {
                let mut buf = BytesMut::with_capacity(shared.len() + extra);
                buf.put_slice(&shared);
                buf
            }
        };
        buf.reserve(extra);
        f(&mut buf);
        self.text = buf.freeze();
        *self.hash.get_mut() = NO_HASH;
    }

    pub fn append_bytes(&mut self, s: &[u8]) {
        if s.is_empty() {
            return;
        }
        self.extend(s.len(), |buf| buf.put_slice(s));
    }

    /// Appends `other`. With a `pending` flag that is still false and a
    /// non-empty value, a separating space is inserted; the flag is set
    /// once anything was appended.
    pub fn append(&mut self, other: &ProString, pending: Option<&mut bool>) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other.clone();
        } else {
            let space = matches!(pending.as_deref(), Some(false));
            self.extend(other.len() + 1, |buf| {
                if space {
                    buf.put_u8(b' ');
                }
                buf.put_slice(&other.text);
            });
            if other.source.is_some() {
                self.source = other.source.clone();
            }
        }
        if let Some(pending) = pending {
            *pending = true;
        }
    }

    /// Appends a space-joined list. See [`ProString::append`] for the
    /// meaning of `pending`. With `skip_empty_first`, a leading empty value
    /// is dropped when nothing is pending yet.
    pub fn append_list(
        &mut self,
        other: &[ProString],
        pending: Option<&mut bool>,
        skip_empty_first: bool,
    ) {
        if other.is_empty() {
            return;
        }
        let not_pending = matches!(pending.as_deref(), Some(false));
        let mut start = 0;
        if not_pending && skip_empty_first && other[0].is_empty() {
            if other.len() == 1 {
                return;
            }
            start = 1;
        }
        if self.is_empty() && other.len() == start + 1 {
            *self = other[start].clone();
        } else {
            let total = other[start..].iter().map(|s| s.len() + 1).sum::<usize>();
            let mut put_space = not_pending && !self.is_empty();
            self.extend(total, |buf| {
                for s in &other[start..] {
                    if put_space {
                        buf.put_u8(b' ');
                    } else {
                        put_space = true;
                    }
                    buf.put_slice(&s.text);
                }
            });
            if let Some(last) = other.last()
                && last.source.is_some()
            {
                self.source = last.source.clone();
            }
        }
        if let Some(pending) = pending {
            *pending = true;
        }
    }
}

/// Integer parsing with an explicit base, accepting a leading sign.
pub fn parse_int(s: &[u8], base: u32) -> Option<i64> {
    let s = std::str::from_utf8(s).ok()?;
    let digits = s.strip_prefix(['-', '+']).unwrap_or(s);
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return None;
    }
    // The sign stays attached so that i64::MIN parses.
    i64::from_str_radix(s, base).ok()
}

impl Clone for ProString {
    fn clone(&self) -> Self {
        ProString::with_hash(
            self.text.clone(),
            self.source.clone(),
            self.hash.load(Ordering::Relaxed),
        )
    }
}

impl Default for ProString {
    fn default() -> Self {
        ProString::new(Bytes::new())
    }
}

impl PartialEq for ProString {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for ProString {}

impl PartialEq<[u8]> for ProString {
    fn eq(&self, other: &[u8]) -> bool {
        self.text == other
    }
}

impl PartialEq<&str> for ProString {
    fn eq(&self, other: &&str) -> bool {
        self.text == other.as_bytes()
    }
}

impl PartialOrd for ProString {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProString {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.text.cmp(&other.text)
    }
}

impl Debug for ProString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.to_str())
    }
}

impl Display for ProString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl From<&str> for ProString {
    fn from(s: &str) -> Self {
        ProString::new(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for ProString {
    fn from(s: String) -> Self {
        ProString::new(s)
    }
}

impl From<&[u8]> for ProString {
    fn from(s: &[u8]) -> Self {
        ProString::new(Bytes::copy_from_slice(s))
    }
}

impl From<Vec<u8>> for ProString {
    fn from(s: Vec<u8>) -> Self {
        ProString::new(s)
    }
}

impl From<Bytes> for ProString {
    fn from(s: Bytes) -> Self {
        ProString::new(s)
    }
}

/// A variable or function name. The hash is computed up front.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProKey(ProString);

impl ProKey {
    pub fn new(name: impl Into<Bytes>) -> Self {
        ProKey::from_pro_string(ProString::new(name))
    }

    pub fn from_pro_string(s: ProString) -> Self {
        s.hash_value();
        ProKey(s)
    }

    pub const fn from_static(name: &'static str) -> Self {
        ProKey(ProString::from_static(name))
    }

    pub fn to_pro_string(&self) -> ProString {
        self.0.clone()
    }

    pub fn as_pro_string(&self) -> &ProString {
        &self.0
    }
}

impl Deref for ProKey {
    type Target = ProString;

    fn deref(&self) -> &ProString {
        &self.0
    }
}

impl Hash for ProKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.0.hash_value());
    }
}

impl Debug for ProKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl Display for ProKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProKey {
    fn from(s: &str) -> Self {
        ProKey::from_pro_string(ProString::from(s))
    }
}

impl From<String> for ProKey {
    fn from(s: String) -> Self {
        ProKey::new(s)
    }
}

impl PartialEq<&str> for ProKey {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// One scope's entry for a variable. `Unset` hides values of outer scopes.
#[derive(Clone, Debug, PartialEq)]
pub enum ProValue {
    Unset,
    Set(ProStringList),
}

impl ProValue {
    pub fn as_list(&self) -> Option<&ProStringList> {
        match self {
            ProValue::Set(list) => Some(list),
            ProValue::Unset => None,
        }
    }

    /// Turns an `Unset` marker into an empty list and returns the list.
    pub fn make_set(&mut self) -> &mut ProStringList {
        if let ProValue::Unset = self {
            *self = ProValue::Set(Vec::new());
        }
        let ProValue::Set(list) = self else {
            unreachable!()
        };
        list
    }
}

pub type ProValueMap = HashMap<ProKey, ProValue>;

pub trait ValueList {
    fn join_values(&self, sep: &[u8]) -> ProString;
    fn contains_value(&self, s: &[u8]) -> bool;
    fn remove_duplicates(&mut self);
    fn remove_all(&mut self, s: &[u8]);
}

impl ValueList for ProStringList {
    fn join_values(&self, sep: &[u8]) -> ProString {
        match self.len() {
            0 => ProString::default(),
            1 => self[0].clone(),
            _ => {
                let mut buf = BytesMut::new();
                for (i, s) in self.iter().enumerate() {
                    if i > 0 {
                        buf.put_slice(sep);
                    }
                    buf.put_slice(s.as_bytes());
                }
                ProString::new(buf.freeze())
            }
        }
    }

    fn contains_value(&self, s: &[u8]) -> bool {
        self.iter().any(|v| v.as_bytes() == s)
    }

    fn remove_duplicates(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.retain(|v| seen.insert(v.bytes().clone()));
    }

    fn remove_all(&mut self, s: &[u8]) {
        self.retain(|v| v.as_bytes() != s);
    }
}

pub fn to_string_list(list: &[ProString]) -> Vec<String> {
    list.iter().map(|s| s.to_str().into_owned()).collect()
}

/// Token codes of the compiled form of a project file.
///
/// The stream consists of little-endian 16-bit words. String payloads are
/// stored as a 16-bit byte length followed by the raw UTF-8 bytes, hashed
/// strings are preceded by the 32-bit hash, and block lengths are 32-bit
/// byte counts stored as two words.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tok {
    /// End of block, or the end of the file.
    Terminator = 0,
    /// Followed by a 32-bit line number.
    Line,
    /// `=`, followed by a size hint word and a value expression.
    Assign,
    /// `+=`
    Append,
    /// `*=`
    AppendUnique,
    /// `-=`
    Remove,
    /// `~=`
    Replace,
    ValueTerminator,
    Literal,
    HashLiteral,
    Variable,
    Property,
    EnvVar,
    /// Hashed name, then arguments up to `FuncTerminator`.
    FuncName,
    ArgSeparator,
    FuncTerminator,
    Not,
    And,
    Or,
    /// The preceding expression names a config flag.
    Condition,
    /// The preceding expression names a test function; arguments follow.
    TestCall,
    Return,
    Break,
    Next,
    /// Then-block length + block, else-block length + block.
    Branch,
    /// Hashed variable, expression block, body block.
    ForLoop,
    /// Hashed name, body block.
    TestDef,
    ReplaceDef,
}

pub const TOK_MASK: u16 = 0xff;
/// The expansion was inside quotes and is joined into one value.
pub const TOK_QUOTED: u16 = 0x100;
/// The item starts a new value instead of extending the previous one.
pub const TOK_NEW_STR: u16 = 0x200;

impl Tok {
    const ALL: [Tok; 28] = [
        Tok::Terminator,
        Tok::Line,
        Tok::Assign,
        Tok::Append,
        Tok::AppendUnique,
        Tok::Remove,
        Tok::Replace,
        Tok::ValueTerminator,
        Tok::Literal,
        Tok::HashLiteral,
        Tok::Variable,
        Tok::Property,
        Tok::EnvVar,
        Tok::FuncName,
        Tok::ArgSeparator,
        Tok::FuncTerminator,
        Tok::Not,
        Tok::And,
        Tok::Or,
        Tok::Condition,
        Tok::TestCall,
        Tok::Return,
        Tok::Break,
        Tok::Next,
        Tok::Branch,
        Tok::ForLoop,
        Tok::TestDef,
        Tok::ReplaceDef,
    ];

    pub fn from_code(code: u16) -> Option<Tok> {
        Tok::ALL.get((code & TOK_MASK) as usize).copied()
    }

    pub const fn code(self) -> u16 {
        self as u16
    }
}

/// A parsed project file.
pub struct ProFile {
    file_name: Bytes,
    directory_name: Bytes,
    tokens: Bytes,
    ok: bool,
    host_build: bool,
}

impl ProFile {
    pub fn new(file_name: Bytes, tokens: Bytes, ok: bool, host_build: bool) -> Self {
        let directory_name = match memchr::memrchr(b'/', &file_name) {
            Some(0) => Bytes::from_static(b"/"),
            Some(idx) => file_name.slice(..idx),
            None => Bytes::new(),
        };
        ProFile {
            file_name,
            directory_name,
            tokens,
            ok,
            host_build,
        }
    }

    pub fn file_name(&self) -> &Bytes {
        &self.file_name
    }

    pub fn directory_name(&self) -> &Bytes {
        &self.directory_name
    }

    pub fn tokens(&self) -> &Bytes {
        &self.tokens
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn is_host_build(&self) -> bool {
        self.host_build
    }
}

impl Debug for ProFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ProFile({}, {} bytes, ok={})",
            String::from_utf8_lossy(&self.file_name),
            self.tokens.len(),
            self.ok
        )
    }
}

/// A read position inside a parsed file's token stream.
#[derive(Clone)]
pub struct TokenCursor {
    pro: Arc<ProFile>,
    pos: usize,
}

impl TokenCursor {
    pub fn new(pro: Arc<ProFile>, pos: usize) -> Self {
        TokenCursor { pro, pos }
    }

    pub fn pro(&self) -> &Arc<ProFile> {
        &self.pro
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn at(&self, pos: usize) -> TokenCursor {
        TokenCursor {
            pro: self.pro.clone(),
            pos,
        }
    }

    fn word_at(&self, pos: usize) -> u16 {
        let t = &self.pro.tokens;
        if pos + 1 < t.len() {
            u16::from_le_bytes([t[pos], t[pos + 1]])
        } else {
            0
        }
    }

    /// The next word without consuming it. Reads past the end yield a
    /// terminator.
    pub fn peek(&self) -> u16 {
        self.word_at(self.pos)
    }

    pub fn next_word(&mut self) -> u16 {
        let w = self.word_at(self.pos);
        self.pos += 2;
        w
    }

    /// Steps back over the word just read.
    pub fn unread(&mut self) {
        self.pos -= 2;
    }

    pub fn get_u32(&mut self) -> u32 {
        let lo = self.next_word() as u32;
        let hi = self.next_word() as u32;
        lo | (hi << 16)
    }

    pub fn get_block_len(&mut self) -> usize {
        self.get_u32() as usize
    }

    pub fn skip(&mut self, len: usize) {
        self.pos += len;
    }

    pub fn get_str(&mut self) -> ProString {
        let len = self.next_word() as usize;
        let end = (self.pos + len).min(self.pro.tokens.len());
        let text = self.pro.tokens.slice(self.pos..end);
        self.pos += len;
        ProString::with_source(text, Some(self.pro.clone()))
    }

    pub fn get_hash_str(&mut self) -> ProKey {
        let hash = self.get_u32();
        let len = self.next_word() as usize;
        let end = (self.pos + len).min(self.pro.tokens.len());
        let text = self.pro.tokens.slice(self.pos..end);
        self.pos += len;
        ProKey(ProString::with_hash(text, Some(self.pro.clone()), hash))
    }

    pub fn skip_str(&mut self) {
        let len = self.next_word() as usize;
        self.pos += len;
    }

    pub fn skip_hash_str(&mut self) {
        self.pos += 4;
        self.skip_str();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_bytes(b""), 0);
        assert_eq!(hash_bytes(b"A"), 65);
        assert_eq!(hash_bytes(b"AB"), (65 << 4) + 66);
        let long = hash_bytes(b"QMAKE_INTERNAL_INCLUDED_FEATURES");
        assert_eq!(long & !0x0fff_ffff, 0);
        assert_eq!(ProKey::from("CONFIG").hash_value(), hash_bytes(b"CONFIG"));
    }

    #[test]
    fn test_equality_ignores_storage() {
        let whole = ProString::from("xfoox");
        let part = whole.mid(1, 3);
        assert_eq!(part, ProString::from("foo"));
        assert_eq!(part.to_key(), ProKey::from("foo"));
        let mut map = ProValueMap::new();
        map.insert(part.to_key(), ProValue::Set(vec![]));
        assert!(map.contains_key(&ProKey::from("foo")));
    }

    #[test]
    fn test_append_pending() {
        let mut s = ProString::from("a");
        let mut pending = false;
        s.append(&ProString::from("b"), Some(&mut pending));
        assert_eq!(s, "a b");
        assert!(pending);
        s.append(&ProString::from("c"), Some(&mut pending));
        assert_eq!(s, "a bc");

        let mut e = ProString::default();
        let mut pending = false;
        e.append(&ProString::from("x"), Some(&mut pending));
        assert_eq!(e, "x");
    }

    #[test]
    fn test_append_list() {
        let list = vec![ProString::from(""), ProString::from("b"), ProString::from("c")];
        let mut s = ProString::default();
        let mut pending = false;
        s.append_list(&list, Some(&mut pending), true);
        assert_eq!(s, "b c");

        let mut s = ProString::from("a");
        s.append_list(&list, None, false);
        assert_eq!(s, "a b c");
    }

    #[test]
    fn test_append_detaches_shared() {
        let base = ProString::from("abc");
        let mut copy = base.clone();
        copy.append_bytes(b"def");
        assert_eq!(base, "abc");
        assert_eq!(copy, "abcdef");
        assert_eq!(copy.hash_value(), hash_bytes(b"abcdef"));
    }

    #[test]
    fn test_to_int() {
        assert_eq!(ProString::from("42").to_int(), Some(42));
        assert_eq!(ProString::from(" -7 ").to_int(), Some(-7));
        assert_eq!(ProString::from("+3").to_int(), Some(3));
        assert_eq!(ProString::from("4x").to_int(), None);
        assert_eq!(ProString::from("").to_int(), None);
        assert_eq!(parse_int(b"ff", 16), Some(255));
        assert_eq!(parse_int(b"-9223372036854775808", 10), Some(i64::MIN));
        assert_eq!(parse_int(b"9223372036854775808", 10), None);
        assert_eq!(parse_int(b"--1", 10), None);
    }

    #[test]
    fn test_unset_marker() {
        let mut v = ProValue::Unset;
        assert!(v.as_list().is_none());
        v.make_set().push(ProString::from("x"));
        assert_eq!(v.as_list().map(|l| l.len()), Some(1));
    }

    #[test]
    fn test_value_list_helpers() {
        let mut list: ProStringList = ["a", "b", "a", "c"].iter().map(|s| (*s).into()).collect();
        assert_eq!(list.join_values(b","), "a,b,a,c");
        list.remove_duplicates();
        assert_eq!(list.join_values(b" "), "a b c");
        list.remove_all(b"b");
        assert!(!list.contains_value(b"b"));
    }

    #[test]
    fn test_directory_name() {
        let pro = ProFile::new(Bytes::from_static(b"/src/a/b.pro"), Bytes::new(), true, false);
        assert_eq!(pro.directory_name().as_ref(), b"/src/a");
        let pro = ProFile::new(Bytes::from_static(b"/b.pro"), Bytes::new(), true, false);
        assert_eq!(pro.directory_name().as_ref(), b"/");
    }
}
