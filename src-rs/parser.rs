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

//! Turns project file text into the token stream described in
//! [`crate::proitem`].
//!
//! The grammar is line oriented. A statement is an assignment or a chain of
//! conditions, optionally followed by a one-line `:` scope or a braced
//! block. Test expressions and left hand sides are collected in a side
//! buffer first, because only the character that ends them tells what they
//! are. Values go straight into the output.

use std::sync::Arc;

use bytes::Bytes;
use memchr::memchr;

use crate::{
    collect_stats,
    file_cache::ProFileCache,
    handler::{MessageHandler, MsgType},
    loc::Loc,
    log,
    proitem::{ProFile, TOK_MASK, TOK_NEW_STR, TOK_QUOTED, Tok, TokenCursor, hash_bytes},
    vfs::Vfs,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    /// A complete project file.
    Full,
    /// A single condition chain. Assignments and scopes are rejected.
    Test,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseFlags {
    pub use_cache: bool,
    /// Report an I/O error even when the file does not exist.
    pub report_missing: bool,
}

pub struct QmakeParser {
    cache: Option<Arc<ProFileCache>>,
    vfs: Arc<Vfs>,
    handler: Arc<dyn MessageHandler>,
}

impl QmakeParser {
    pub fn new(
        cache: Option<Arc<ProFileCache>>,
        vfs: Arc<Vfs>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        QmakeParser {
            cache,
            vfs,
            handler,
        }
    }

    /// Parses a file, or fetches it from the cache. Returns `None` when the
    /// file cannot be read.
    pub fn parsed_pro_file(&self, file_name: &[u8], flags: ParseFlags) -> Option<Arc<ProFile>> {
        let file_name = Bytes::copy_from_slice(file_name);
        match &self.cache {
            Some(cache) if flags.use_cache => {
                cache.get_or_parse(&file_name, || self.read_file(&file_name, flags))
            }
            _ => self.read_file(&file_name, flags),
        }
    }

    /// Parses an in-memory snippet. Line numbers start at `line`.
    pub fn parsed_pro_block(
        &self,
        contents: &[u8],
        name: &[u8],
        line: i32,
        grammar: Grammar,
    ) -> Arc<ProFile> {
        Arc::new(self.parse(
            Bytes::copy_from_slice(name),
            contents,
            line,
            grammar,
        ))
    }

    pub fn discard_file_from_cache(&self, file_name: &[u8]) {
        if let Some(cache) = &self.cache {
            cache.discard_file(file_name);
        }
    }

    fn read_file(&self, file_name: &Bytes, flags: ParseFlags) -> Option<Arc<ProFile>> {
        match self.vfs.read_file(file_name) {
            Ok(contents) => Some(Arc::new(self.parse(
                file_name.clone(),
                &contents,
                1,
                Grammar::Full,
            ))),
            Err(err) => {
                if flags.report_missing || self.vfs.exists(file_name) {
                    let msg = format!(
                        "Cannot read {}: {}",
                        String::from_utf8_lossy(file_name),
                        err
                    );
                    self.handler.message(MsgType::ParserIoError, &msg, None);
                }
                None
            }
        }
    }

    fn parse(&self, file_name: Bytes, contents: &[u8], line: i32, grammar: Grammar) -> ProFile {
        collect_stats!("parse");
        log!("parsing {}", String::from_utf8_lossy(&file_name));
        let mut reader = Reader::new(self.handler.as_ref(), file_name.clone(), grammar, line);
        reader.read(contents);
        ProFile::new(
            file_name,
            Bytes::from(reader.tok),
            reader.ok,
            reader.host_build,
        )
    }
}

const ESCAPABLE: &[u8] = b"[]{}()$\\'\"";

const NEST_LOOP: u8 = 1;
const NEST_FUNCTION: u8 = 2;

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    put_u16(buf, v as u16);
    put_u16(buf, (v >> 16) as u16);
}

fn patch_u16(buf: &mut [u8], pos: usize, v: u16) {
    buf[pos..pos + 2].copy_from_slice(&v.to_le_bytes());
}

fn patch_u32(buf: &mut [u8], pos: usize, v: u32) {
    patch_u16(buf, pos, v as u16);
    patch_u16(buf, pos + 2, (v >> 16) as u16);
}

fn word_at(buf: &[u8], pos: usize) -> u16 {
    if pos + 1 < buf.len() {
        u16::from_le_bytes([buf[pos], buf[pos + 1]])
    } else {
        0
    }
}

fn put_hash_str(buf: &mut Vec<u8>, s: &[u8]) {
    put_u32(buf, hash_bytes(s));
    put_u16(buf, s.len() as u16);
    buf.extend_from_slice(s);
}

fn is_name_char(c: u8, in_braces: bool) -> bool {
    c >= 0x80 || c == b'.' || c == b'_' || c.is_ascii_alphanumeric() || (c == b'/' && in_braces)
}

/// Splits a leading `Literal|NewStr` token off an argument token block.
fn literal_arg(args: &[u8]) -> Option<(&[u8], &[u8])> {
    if word_at(args, 0) != Tok::Literal.code() | TOK_NEW_STR {
        return None;
    }
    let len = word_at(args, 2) as usize;
    Some((&args[4..4 + len], &args[4 + len..]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Test,
    Value,
    Args,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeState {
    /// Fresh statement.
    New,
    /// After a control statement such as `for()` or `else`.
    Ctrl,
    /// After a condition.
    Cond,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    None,
    And,
    Or,
}

struct ParseCtx {
    parens: i32,
    quote: u8,
    terminator: u8,
    context: Context,
    argc: i32,
    word_count: i32,
}

#[derive(Default)]
struct BlockScope {
    // Offset of the block length word, None for the file's root.
    start: Option<usize>,
    brace_level: i32,
    // for() and function definitions.
    special: bool,
    // A branch whose else block is still open.
    in_branch: bool,
    nest: u8,
}

struct Reader<'a> {
    handler: &'a dyn MessageHandler,
    file_name: Bytes,
    grammar: Grammar,
    ok: bool,
    host_build: bool,

    tok: Vec<u8>,
    xpr: Vec<u8>,

    line_no: i32,
    mark_line: i32,
    in_error: bool,

    block_stack: Vec<BlockScope>,
    state: ScopeState,
    operator: Operator,
    invert: u32,
    can_else: bool,

    context: Context,
    // Whether the current expression is written to `tok` instead of `xpr`.
    in_value: bool,
    value_start: usize,
    lit_start: usize,
    lit_hashed: bool,
    lit_open: bool,
    need_sep: u16,
    word_count: i32,
    argc: i32,
    parens: i32,
    quote: u8,
    line_marked: bool,
    xpr_stack: Vec<ParseCtx>,
}

impl<'a> Reader<'a> {
    fn new(handler: &'a dyn MessageHandler, file_name: Bytes, grammar: Grammar, line: i32) -> Self {
        Reader {
            handler,
            file_name,
            grammar,
            ok: true,
            host_build: false,
            tok: Vec::new(),
            xpr: Vec::new(),
            line_no: line,
            mark_line: 0,
            in_error: false,
            block_stack: vec![BlockScope::default()],
            state: ScopeState::New,
            operator: Operator::None,
            invert: 0,
            can_else: false,
            context: Context::Test,
            in_value: false,
            value_start: 0,
            lit_start: 0,
            lit_hashed: false,
            lit_open: false,
            need_sep: TOK_NEW_STR,
            word_count: 0,
            argc: 0,
            parens: 0,
            quote: 0,
            line_marked: true,
            xpr_stack: Vec::new(),
        }
    }

    fn message(&self, kind: MsgType, msg: &str) {
        if !self.in_error {
            let loc = Loc::new(self.file_name.clone(), self.line_no);
            self.handler.message(kind, msg, Some(&loc));
        }
    }

    fn parse_error(&mut self, msg: &str) {
        self.message(MsgType::ParserError, msg);
        self.ok = false;
    }

    fn language_warning(&self, msg: &str) {
        self.message(MsgType::ParserWarnLanguage, msg);
    }

    fn deprecation_warning(&self, msg: &str) {
        self.message(MsgType::ParserWarnDeprecated, msg);
    }

    fn out(&mut self) -> &mut Vec<u8> {
        if self.in_value {
            &mut self.tok
        } else {
            &mut self.xpr
        }
    }

    fn top(&mut self) -> &mut BlockScope {
        let idx = self.block_stack.len() - 1;
        &mut self.block_stack[idx]
    }

    fn at_word_start(&self) -> bool {
        let out = if self.in_value { &self.tok } else { &self.xpr };
        out.len() == self.lit_start
    }

    fn read(&mut self, input: &[u8]) {
        let inend = input.len();
        let mut cur = 0;
        'fresh: loop {
            self.fresh_line();
            let mut last_indent = 0;
            loop {
                let mut indent = 0;
                loop {
                    if cur == inend {
                        self.flush_line();
                        break 'fresh;
                    }
                    match input[cur] {
                        b'\n' => {
                            cur += 1;
                            self.flush_line();
                            self.line_no += 1;
                            continue 'fresh;
                        }
                        b' ' | b'\t' | b'\r' => {
                            cur += 1;
                            indent += 1;
                        }
                        _ => break,
                    }
                }

                let mut cptr = cur;
                let mut end = inend;
                let mut comment_only = false;
                while cptr < inend {
                    match input[cptr] {
                        b'#' => {
                            end = cptr;
                            comment_only = end == cur;
                            cptr = match memchr(b'\n', &input[cptr..]) {
                                Some(idx) => cptr + idx + 1,
                                None => inend,
                            };
                            break;
                        }
                        b'\n' => {
                            end = cptr;
                            cptr += 1;
                            break;
                        }
                        _ => cptr += 1,
                    }
                }
                if comment_only {
                    // Comment lines neither end nor count towards a statement.
                    if self.mark_line == self.line_no {
                        self.mark_line += 1;
                    }
                    cur = cptr;
                    self.line_no += 1;
                    continue;
                }

                let mut line_cont = false;
                while end > cur {
                    match input[end - 1] {
                        b'\\' => {
                            end -= 1;
                            line_cont = true;
                            break;
                        }
                        b' ' | b'\t' | b'\r' => end -= 1,
                        _ => break,
                    }
                }

                self.tokenize(input, cur, end, indent, last_indent);
                cur = cptr;
                if !line_cont {
                    self.flush_line();
                    self.line_no += 1;
                    continue 'fresh;
                }
                if self.quote != 0 {
                    self.out().push(b' ');
                } else {
                    self.flush_literal();
                    self.next_word();
                }
                last_indent = indent;
                self.line_marked = false;
                self.line_no += 1;
            }
        }

        self.flush_scopes();
        if self.block_stack.len() > 1 || self.top().brace_level > 0 {
            self.parse_error("Missing closing brace(s).");
        }
        while !self.block_stack.is_empty() {
            self.leave_scope();
        }
        put_u16(&mut self.tok, Tok::Terminator.code());
    }

    fn tokenize(&mut self, input: &[u8], mut cur: usize, end: usize, indent: i32, last_indent: i32) {
        let at = |i: usize| if i < end { input[i] } else { 0 };
        let mut new_word = true;
        loop {
            if new_word {
                while cur < end && matches!(input[cur], b' ' | b'\t') {
                    cur += 1;
                }
                new_word = false;
            }
            if cur == end {
                return;
            }
            let mut c = input[cur];
            cur += 1;

            if c == b'$' && at(cur) == b'$' {
                let (next, in_call) = self.expansion(input, cur + 1, end);
                cur = next;
                new_word = in_call;
                continue;
            }

            if c == b'\\' {
                let next = at(cur);
                if ESCAPABLE.contains(&next) {
                    c = next;
                    cur += 1;
                } else {
                    self.deprecation_warning("Unescaped backslashes are deprecated");
                }
            } else if self.quote != 0 {
                if c == self.quote {
                    self.quote = 0;
                    continue;
                }
                if c == b'!' && self.context == Context::Test && self.at_word_start() {
                    self.invert += 1;
                    continue;
                }
            } else if c == b'\'' || c == b'"' {
                self.quote = c;
                continue;
            } else {
                match self.context {
                    Context::Args => match c {
                        b' ' | b'\t' => {
                            self.flush_literal();
                            self.next_word();
                            new_word = true;
                            continue;
                        }
                        b'(' => self.parens += 1,
                        b')' => {
                            self.parens -= 1;
                            if self.parens < 0 {
                                self.flush_literal();
                                put_u16(self.out(), Tok::FuncTerminator.code());
                                let argc = self.argc;
                                match self.leave_call() {
                                    b':' => {
                                        self.finalize_call(argc);
                                        self.next_item();
                                        new_word = true;
                                    }
                                    b'}' => {
                                        cur = self.check_term(b'}', at(cur), cur);
                                        self.join_token();
                                    }
                                    _ => self.join_token(),
                                }
                                continue;
                            }
                        }
                        b',' if self.parens == 0 => {
                            self.flush_literal();
                            put_u16(self.out(), Tok::ArgSeparator.code());
                            self.argc += 1;
                            self.next_token();
                            new_word = true;
                            continue;
                        }
                        _ => {}
                    },
                    Context::Test => match c {
                        b' ' | b'\t' => {
                            self.flush_literal();
                            self.next_word();
                            new_word = true;
                            continue;
                        }
                        b'(' => {
                            self.flush_literal();
                            if self.word_count != 1 {
                                if self.word_count > 0 {
                                    self.parse_error("Extra characters after test expression.");
                                } else {
                                    self.parse_error("Opening parenthesis without prior test name.");
                                }
                                self.xpr.clear();
                            }
                            put_u16(&mut self.xpr, Tok::TestCall.code());
                            self.enter_call(b':');
                            new_word = true;
                            continue;
                        }
                        b'!' if self.at_word_start() => {
                            self.invert += 1;
                            continue;
                        }
                        b':' => {
                            self.flush_literal();
                            self.finalize_cond();
                            if self.state == ScopeState::New {
                                self.parse_error("And operator without prior condition.");
                            } else {
                                self.operator = Operator::And;
                            }
                            self.next_item();
                            new_word = true;
                            continue;
                        }
                        b'|' => {
                            self.flush_literal();
                            self.finalize_cond();
                            if self.state != ScopeState::Cond {
                                self.parse_error("Or operator without prior condition.");
                            } else {
                                self.operator = Operator::Or;
                            }
                            self.next_item();
                            new_word = true;
                            continue;
                        }
                        b'{' => {
                            self.flush_literal();
                            self.finalize_cond();
                            if self.grammar == Grammar::Test {
                                self.parse_error("Opening scope not permitted in this context.");
                            }
                            self.flush_cond();
                            self.top().brace_level += 1;
                            self.next_item();
                            new_word = true;
                            continue;
                        }
                        b'}' => {
                            self.flush_literal();
                            self.finalize_cond();
                            self.flush_scopes();
                            self.close_scope();
                            self.next_item();
                            new_word = true;
                            continue;
                        }
                        b'+' | b'-' | b'*' | b'~' if at(cur) == b'=' => {
                            cur += 1;
                            let op = match c {
                                b'+' => Tok::Append,
                                b'-' => Tok::Remove,
                                b'*' => Tok::AppendUnique,
                                _ => Tok::Replace,
                            };
                            self.assignment(op);
                            new_word = true;
                            continue;
                        }
                        b'=' => {
                            self.assignment(Tok::Assign);
                            new_word = true;
                            continue;
                        }
                        _ => {}
                    },
                    Context::Value => match c {
                        b' ' | b'\t' => {
                            self.flush_literal();
                            self.next_word();
                            new_word = true;
                            continue;
                        }
                        b'{' => self.parens += 1,
                        b'}' => {
                            if self.parens == 0 {
                                self.flush_literal();
                                self.flush_value_list();
                                self.context = Context::Test;
                                self.in_value = false;
                                self.close_scope();
                                self.next_item();
                                new_word = true;
                                continue;
                            }
                            self.parens -= 1;
                        }
                        b'=' if indent < last_indent => {
                            self.language_warning("Possible accidental line continuation");
                        }
                        _ => {}
                    },
                }
            }
            self.out().push(c);
        }
    }

    /// Handles a `$$` expansion starting right after the dollars. Returns
    /// the new position and whether a function call was entered.
    fn expansion(&mut self, input: &[u8], mut cur: usize, end: usize) -> (usize, bool) {
        let at = |i: usize| if i < end { input[i] } else { 0 };
        self.flush_literal();
        if !self.line_marked {
            self.line_marked = true;
            let line = self.line_no as u32;
            let out = self.out();
            put_u16(out, Tok::Line.code());
            put_u32(out, line);
        }
        let (tok, term) = match at(cur) {
            b'[' => (Tok::Property, b']'),
            b'{' => (Tok::Variable, b'}'),
            b'(' => (Tok::EnvVar, b')'),
            _ => (Tok::Variable, 0),
        };
        if term != 0 {
            cur += 1;
        }
        let hashed = tok != Tok::EnvVar;
        let header = {
            let out = self.out();
            let header = out.len();
            out.resize(header + if hashed { 8 } else { 4 }, 0);
            header
        };
        let name_start = header + if hashed { 8 } else { 4 };
        let mut c = at(cur);
        while is_name_char(c, term != 0) {
            self.out().push(c);
            cur += 1;
            c = at(cur);
        }

        let mut code = tok.code();
        if tok == Tok::Variable && c == b'(' {
            code = Tok::FuncName.code();
        }
        let mut name = self.out().split_off(name_start);
        if name.is_empty() {
            self.language_warning("Missing name in expansion");
        } else if name.len() > u16::MAX as usize {
            self.parse_error("Literal too long.");
            name.truncate(u16::MAX as usize);
        }
        if self.quote != 0 {
            code |= TOK_QUOTED;
        }
        let need_sep = self.need_sep;
        if need_sep != 0 {
            code |= need_sep;
            self.word_count += 1;
        }
        let resolved = if code & TOK_MASK == Tok::Variable.code() {
            self.resolve_variable(&name)
        } else {
            None
        };
        let out = self.out();
        match resolved {
            Some(text) => {
                let len = text.len().min(u16::MAX as usize);
                out.truncate(header);
                put_u16(out, Tok::Literal.code() | need_sep);
                put_u16(out, len as u16);
                out.extend_from_slice(&text[..len]);
            }
            None if hashed => {
                patch_u16(out, header, code);
                patch_u32(out, header + 2, hash_bytes(&name));
                patch_u16(out, header + 6, name.len() as u16);
                out.extend_from_slice(&name);
            }
            None => {
                patch_u16(out, header, code);
                patch_u16(out, header + 2, name.len() as u16);
                out.extend_from_slice(&name);
            }
        }

        if code & TOK_MASK == Tok::FuncName.code() {
            self.enter_call(term);
            return (cur + 1, true);
        }
        if term != 0 {
            cur = self.check_term(term, c, cur);
        }
        self.join_token();
        (cur, false)
    }

    fn resolve_variable(&self, name: &[u8]) -> Option<Vec<u8>> {
        match name {
            b"_LINE_" => Some(self.line_no.to_string().into_bytes()),
            b"_FILE_" => Some(self.file_name.to_vec()),
            b"LITERAL_HASH" => Some(b"#".to_vec()),
            b"LITERAL_DOLLAR" => Some(b"$".to_vec()),
            b"LITERAL_WHITESPACE" => Some(b"\t".to_vec()),
            _ => None,
        }
    }

    fn check_term(&mut self, term: u8, c: u8, cur: usize) -> usize {
        if c == term {
            return cur + 1;
        }
        let found = if c == 0 {
            "end-of-line".to_string()
        } else {
            (c as char).to_string()
        };
        self.parse_error(&format!(
            "Missing {} terminator [found {}]",
            term as char, found
        ));
        // Carry on as if the terminator was there.
        self.in_error = true;
        cur
    }

    fn reserve_literal(&mut self) {
        self.lit_hashed = self.context == Context::Test;
        let header = if self.lit_hashed { 8 } else { 4 };
        let out = self.out();
        out.resize(out.len() + header, 0);
        let start = out.len();
        self.lit_start = start;
        self.lit_open = true;
    }

    fn next_word(&mut self) {
        self.reserve_literal();
        self.need_sep = TOK_NEW_STR;
    }

    fn next_token(&mut self) {
        self.word_count = 0;
        self.next_word();
    }

    fn join_token(&mut self) {
        self.reserve_literal();
        self.need_sep = 0;
    }

    fn next_item(&mut self) {
        self.xpr.clear();
        self.next_token();
    }

    fn flush_literal(&mut self) {
        if !self.lit_open {
            return;
        }
        self.lit_open = false;
        let start = self.lit_start;
        let header = if self.lit_hashed { 8 } else { 4 };
        let mut len = self.out().len() - start;
        if len == 0 {
            self.out().truncate(start - header);
            return;
        }
        if len > u16::MAX as usize {
            self.parse_error("Literal too long.");
            len = u16::MAX as usize;
            self.out().truncate(start + len);
        }
        let need_sep = self.need_sep;
        let hashed = self.lit_hashed;
        let out = self.out();
        if hashed {
            let hash = hash_bytes(&out[start..]);
            patch_u16(out, start - 8, Tok::HashLiteral.code());
            patch_u32(out, start - 6, hash);
        } else {
            patch_u16(out, start - 4, Tok::Literal.code() | need_sep);
        }
        patch_u16(out, start - 2, len as u16);
        if need_sep != 0 {
            self.word_count += 1;
            self.need_sep = 0;
        }
    }

    fn fresh_line(&mut self) {
        self.state = ScopeState::New;
        self.invert = 0;
        self.operator = Operator::None;
        self.mark_line = self.line_no;
        self.in_error = false;
        self.context = Context::Test;
        self.in_value = false;
        self.quote = 0;
        self.parens = 0;
        self.xpr_stack.clear();
        self.xpr.clear();
        self.line_marked = true;
        self.next_token();
    }

    fn flush_line(&mut self) {
        self.flush_literal();
        if self.quote != 0 {
            let msg = format!("Missing closing {} quote", self.quote as char);
            self.parse_error(&msg);
            if let Some(base) = self.xpr_stack.first() {
                self.context = base.context;
                self.xpr_stack.clear();
            }
            self.flush_error();
        } else if let Some(base) = self.xpr_stack.first() {
            self.context = base.context;
            self.xpr_stack.clear();
            self.parse_error("Missing closing parenthesis in function call");
            self.flush_error();
        } else if self.context == Context::Value {
            self.flush_value_list();
            if self.parens != 0 {
                self.language_warning("Possible braces mismatch");
            }
        } else {
            self.finalize_cond();
            self.warn_operator("at end of line");
        }
    }

    fn flush_error(&mut self) {
        self.ok = false;
        if self.context == Context::Value {
            self.tok.truncate(self.value_start);
            patch_u16(&mut self.tok, self.value_start - 2, 0);
            put_u16(&mut self.tok, Tok::ValueTerminator.code());
        } else {
            self.bogus_test(None);
        }
    }

    fn flush_value_list(&mut self) {
        let word_count = self.word_count;
        let hint = if word_count > 1 {
            let mut pos = self.value_start;
            if word_at(&self.tok, pos) == Tok::Line.code() {
                pos += 6;
            }
            if word_at(&self.tok, pos) & TOK_MASK == Tok::Literal.code() {
                word_count
            } else {
                0
            }
        } else {
            word_count
        };
        let hint_pos = self.value_start - 2;
        patch_u16(&mut self.tok, hint_pos, hint as u16);
        put_u16(&mut self.tok, Tok::ValueTerminator.code());
    }

    fn put_line_marker(&mut self) {
        if self.mark_line != 0 {
            put_u16(&mut self.tok, Tok::Line.code());
            put_u32(&mut self.tok, self.mark_line as u32);
            self.mark_line = 0;
        }
    }

    fn put_operator(&mut self) {
        match self.operator {
            Operator::And => put_u16(&mut self.tok, Tok::And.code()),
            Operator::Or => put_u16(&mut self.tok, Tok::Or.code()),
            Operator::None => {}
        }
        self.operator = Operator::None;
    }

    fn warn_operator(&mut self, msg: &str) {
        if self.invert != 0 {
            self.language_warning(&format!("Stray NOT operator {msg}."));
            self.invert = 0;
        }
        match self.operator {
            Operator::And => self.language_warning(&format!("Stray AND operator {msg}.")),
            Operator::Or => self.language_warning(&format!("Stray OR operator {msg}.")),
            Operator::None => {}
        }
        self.operator = Operator::None;
    }

    fn enter_call(&mut self, terminator: u8) {
        self.xpr_stack.push(ParseCtx {
            parens: self.parens,
            quote: self.quote,
            terminator,
            context: self.context,
            argc: self.argc,
            word_count: self.word_count,
        });
        self.parens = 0;
        self.quote = 0;
        self.argc = 1;
        self.context = Context::Args;
        self.next_token();
    }

    /// Pops a function call context and returns what it expects after the
    /// closing parenthesis.
    fn leave_call(&mut self) -> u8 {
        match self.xpr_stack.pop() {
            Some(ctx) => {
                self.parens = ctx.parens;
                self.quote = ctx.quote;
                self.context = ctx.context;
                self.argc = ctx.argc;
                self.word_count = ctx.word_count;
                ctx.terminator
            }
            None => 0,
        }
    }

    fn assignment(&mut self, op: Tok) {
        self.flush_literal();
        self.flush_cond();
        self.put_line_marker();
        if self.grammar == Grammar::Test {
            self.parse_error("Assignment not permitted in this context.");
        } else if self.word_count != 1 {
            self.parse_error("Assignment needs exactly one word on the left hand side.");
        } else {
            self.tok.extend_from_slice(&self.xpr);
        }
        put_u16(&mut self.tok, op.code());
        put_u16(&mut self.tok, 0);
        self.value_start = self.tok.len();
        self.context = Context::Value;
        self.in_value = true;
        self.next_token();
    }

    fn enter_scope(&mut self, special: bool, state: ScopeState) {
        let nest = self.top().nest;
        let start = self.tok.len();
        put_u32(&mut self.tok, 0);
        self.block_stack.push(BlockScope {
            start: Some(start),
            special,
            nest,
            ..Default::default()
        });
        self.state = state;
        self.can_else = false;
        if special {
            self.mark_line = self.line_no;
        }
    }

    fn leave_scope(&mut self) {
        let Some(scope) = self.block_stack.pop() else {
            return;
        };
        if scope.in_branch {
            put_u32(&mut self.tok, 0);
        }
        if let Some(start) = scope.start {
            put_u16(&mut self.tok, Tok::Terminator.code());
            let len = self.tok.len() - start - 4;
            patch_u32(&mut self.tok, start, len as u32);
        }
    }

    /// Closes the one-line scopes that a new statement ends.
    fn flush_scopes(&mut self) {
        if self.state == ScopeState::New {
            while self.top().brace_level == 0 && self.block_stack.len() > 1 {
                self.leave_scope();
            }
            if std::mem::take(&mut self.top().in_branch) {
                // Empty else block.
                put_u32(&mut self.tok, 0);
            }
            self.can_else = false;
        }
    }

    fn flush_cond(&mut self) {
        if self.state == ScopeState::Cond {
            put_u16(&mut self.tok, Tok::Branch.code());
            self.top().in_branch = true;
            self.enter_scope(false, ScopeState::New);
        } else {
            self.flush_scopes();
        }
    }

    fn close_scope(&mut self) {
        if self.top().brace_level == 0 {
            self.parse_error("Excess closing brace.");
            return;
        }
        self.top().brace_level -= 1;
        if self.top().brace_level == 0 && self.block_stack.len() != 1 {
            self.leave_scope();
            self.state = ScopeState::New;
            self.can_else = false;
            self.mark_line = self.line_no;
        }
    }

    fn finalize_test(&mut self) {
        self.flush_scopes();
        self.put_line_marker();
        self.put_operator();
        if self.invert & 1 != 0 {
            put_u16(&mut self.tok, Tok::Not.code());
        }
        self.invert = 0;
        self.state = ScopeState::Cond;
        self.can_else = true;
    }

    /// Marks the statement as a failed condition without emitting it.
    fn bogus_test(&mut self, msg: Option<&str>) {
        if let Some(msg) = msg {
            self.parse_error(msg);
        }
        self.flush_scopes();
        self.operator = Operator::None;
        self.invert = 0;
        self.state = ScopeState::Cond;
        self.can_else = true;
    }

    fn finalize_cond(&mut self) {
        if self.word_count != 1 {
            if self.word_count > 0 {
                self.bogus_test(Some("Extra characters after test expression."));
            }
            return;
        }
        if word_at(&self.xpr, 0) == Tok::HashLiteral.code() {
            let len = word_at(&self.xpr, 6) as usize;
            if 8 + len == self.xpr.len() && self.xpr[8..].eq_ignore_ascii_case(b"else") {
                self.else_branch();
                return;
            }
        }
        self.finalize_test();
        self.tok.extend_from_slice(&self.xpr);
        put_u16(&mut self.tok, Tok::Condition.code());
    }

    fn else_branch(&mut self) {
        if self.invert != 0 || self.operator != Operator::None {
            self.bogus_test(Some("Unexpected operator in front of else."));
            return;
        }
        let (special, brace_level) = (self.top().special, self.top().brace_level);
        if self.can_else && (!special || brace_level > 0) {
            // A condition without a then block.
            put_u16(&mut self.tok, Tok::Branch.code());
            put_u32(&mut self.tok, 0);
            self.enter_scope(false, ScopeState::Ctrl);
            return;
        }
        loop {
            let top = self.top();
            let open = !top.special || top.brace_level > 0;
            let braced = top.brace_level > 0;
            if top.in_branch && open {
                top.in_branch = false;
                self.enter_scope(false, ScopeState::Ctrl);
                return;
            }
            if braced || self.block_stack.len() == 1 {
                break;
            }
            self.leave_scope();
        }
        self.parse_error("Unexpected 'else'.");
    }

    fn finalize_call(&mut self, argc: i32) {
        let xpr = std::mem::take(&mut self.xpr);
        self.finalize_call_in(&xpr, argc);
        self.xpr = xpr;
    }

    fn finalize_call_in(&mut self, xpr: &[u8], argc: i32) {
        if word_at(xpr, 0) == Tok::HashLiteral.code() {
            let len = word_at(xpr, 6) as usize;
            let name = &xpr[8..8 + len];
            let uce = 8 + len;
            if word_at(xpr, uce) == Tok::TestCall.code() {
                // Arguments without the closing FuncTerminator.
                let args = &xpr[uce + 2..xpr.len() - 2];
                match name {
                    b"for" => return self.for_loop(args, argc),
                    b"defineTest" => return self.function_def(Tok::TestDef, "defineTest", args),
                    b"defineReplace" => {
                        return self.function_def(Tok::ReplaceDef, "defineReplace", args);
                    }
                    b"return" => {
                        if self.top().nest & NEST_FUNCTION != 0 {
                            if argc > 1 {
                                self.bogus_test(Some("return() requires zero or one argument."));
                                return;
                            }
                        } else if !args.is_empty() {
                            self.bogus_test(Some("Top-level return() requires zero arguments."));
                            return;
                        }
                        return self.control_statement(Tok::Return, "return", args);
                    }
                    b"next" | b"break" => {
                        let (tok, fname) = if name == b"next" {
                            (Tok::Next, "next")
                        } else {
                            (Tok::Break, "break")
                        };
                        if !args.is_empty() {
                            self.bogus_test(Some(&format!("{fname}() requires zero arguments.")));
                            return;
                        }
                        if self.top().nest & NEST_LOOP == 0 {
                            self.bogus_test(Some(&format!("Unexpected {fname}().")));
                            return;
                        }
                        return self.control_statement(tok, fname, args);
                    }
                    b"option" => return self.option(args),
                    _ => {}
                }
            }
        }
        self.finalize_test();
        self.tok.extend_from_slice(xpr);
    }

    fn for_loop(&mut self, args: &[u8], argc: i32) {
        if self.invert != 0 || self.operator == Operator::Or {
            self.bogus_test(Some("Unexpected operator in front of for()."));
            return;
        }
        self.flush_cond();
        self.put_line_marker();
        match literal_arg(args) {
            Some((list, [])) => {
                // for(ever) and friends: no loop variable.
                put_u16(&mut self.tok, Tok::ForLoop.code());
                put_hash_str(&mut self.tok, b"");
                put_u32(&mut self.tok, (8 + list.len() + 2) as u32);
                put_u16(&mut self.tok, Tok::HashLiteral.code());
                put_hash_str(&mut self.tok, list);
                put_u16(&mut self.tok, Tok::ValueTerminator.code());
                self.enter_loop();
                return;
            }
            Some((var, rest)) => {
                if word_at(rest, 0) == Tok::ArgSeparator.code() && argc == 2 {
                    self.put_loop(var, &rest[2..]);
                    return;
                }
            }
            None if argc == 1 => {
                self.put_loop(b"", args);
                return;
            }
            None => {}
        }
        self.parse_error("Syntax is for(var, list), for(var, forever) or for(ever).");
    }

    fn put_loop(&mut self, var: &[u8], expr: &[u8]) {
        put_u16(&mut self.tok, Tok::ForLoop.code());
        put_hash_str(&mut self.tok, var);
        put_u32(&mut self.tok, (expr.len() + 2) as u32);
        self.tok.extend_from_slice(expr);
        put_u16(&mut self.tok, Tok::ValueTerminator.code());
        self.enter_loop();
    }

    fn enter_loop(&mut self) {
        self.enter_scope(true, ScopeState::Ctrl);
        self.top().nest |= NEST_LOOP;
    }

    fn function_def(&mut self, def: Tok, def_name: &str, args: &[u8]) {
        if self.invert != 0 {
            self.bogus_test(Some("Unexpected operator in front of function definition."));
            return;
        }
        if let Some((name, [])) = literal_arg(args) {
            self.flush_scopes();
            self.put_line_marker();
            self.put_operator();
            put_u16(&mut self.tok, def.code());
            put_hash_str(&mut self.tok, name);
            self.enter_scope(true, ScopeState::Ctrl);
            self.top().nest = NEST_FUNCTION;
            return;
        }
        self.parse_error(&format!("{def_name}(function) requires one literal argument."));
    }

    fn control_statement(&mut self, tok: Tok, name: &str, args: &[u8]) {
        if self.invert != 0 {
            self.bogus_test(Some(&format!("Unexpected NOT operator in front of {name}().")));
            return;
        }
        self.finalize_test();
        self.tok.extend_from_slice(args);
        put_u16(&mut self.tok, tok.code());
    }

    fn option(&mut self, args: &[u8]) {
        if self.state != ScopeState::New
            || self.block_stack.len() != 1
            || self.top().brace_level > 0
            || self.invert != 0
            || self.operator != Operator::None
        {
            self.bogus_test(Some("option() must appear outside any control structures."));
            return;
        }
        if let Some((opt, [])) = literal_arg(args) {
            if opt == b"host_build" {
                self.host_build = true;
            } else {
                let msg = format!("Unknown option() {}.", String::from_utf8_lossy(opt));
                self.parse_error(&msg);
            }
            return;
        }
        self.parse_error("option() requires one literal argument.");
    }
}

/// Renders a token stream in a compact form, for debugging the parser.
pub fn dump_tokens(pro: &Arc<ProFile>) -> String {
    let mut cur = TokenCursor::new(pro.clone(), 0);
    let mut out = Vec::new();
    dump_block(&mut cur, usize::MAX, &mut out);
    out.join(" ")
}

fn dump_sub_block(cur: &mut TokenCursor) -> String {
    let len = cur.get_block_len();
    let mut out = Vec::new();
    if len > 0 {
        let stop = cur.pos() + len;
        dump_block(cur, stop, &mut out);
    }
    out.join(" ")
}

fn dump_block(cur: &mut TokenCursor, stop: usize, out: &mut Vec<String>) {
    while cur.pos() < stop {
        let code = cur.next_word();
        let mut flags = String::new();
        if code & TOK_NEW_STR != 0 {
            flags.push('+');
        }
        if code & TOK_QUOTED != 0 {
            flags.push('"');
        }
        let Some(tok) = Tok::from_code(code) else {
            out.push(format!("?{code}"));
            return;
        };
        let item = match tok {
            Tok::Terminator => return,
            Tok::Line => format!("L{}", cur.get_u32() as i32),
            Tok::Assign | Tok::Append | Tok::AppendUnique | Tok::Remove | Tok::Replace => {
                let op = match tok {
                    Tok::Assign => "=",
                    Tok::Append => "+=",
                    Tok::AppendUnique => "*=",
                    Tok::Remove => "-=",
                    _ => "~=",
                };
                format!("{op}{}", cur.next_word())
            }
            Tok::ValueTerminator => ";".to_string(),
            Tok::Literal => format!("lit{flags}({})", cur.get_str()),
            Tok::EnvVar => format!("env{flags}({})", cur.get_str()),
            Tok::HashLiteral => format!("hlit{flags}({})", cur.get_hash_str()),
            Tok::Variable => format!("var{flags}({})", cur.get_hash_str()),
            Tok::Property => format!("prop{flags}({})", cur.get_hash_str()),
            Tok::FuncName => format!("func{flags}({})", cur.get_hash_str()),
            Tok::ArgSeparator => ",".to_string(),
            Tok::FuncTerminator => ")".to_string(),
            Tok::Not => "!".to_string(),
            Tok::And => "&".to_string(),
            Tok::Or => "|".to_string(),
            Tok::Condition => "?".to_string(),
            Tok::TestCall => "call".to_string(),
            Tok::Return => "return".to_string(),
            Tok::Break => "break".to_string(),
            Tok::Next => "next".to_string(),
            Tok::Branch => {
                let then = dump_sub_block(cur);
                let otherwise = dump_sub_block(cur);
                format!("branch{{{then}}}{{{otherwise}}}")
            }
            Tok::ForLoop => {
                let var = cur.get_hash_str();
                let len = cur.get_block_len();
                let mut expr = Vec::new();
                let expr_stop = cur.pos() + len;
                dump_block(cur, expr_stop, &mut expr);
                let body = dump_sub_block(cur);
                format!("for({var}){{{}}}{{{body}}}", expr.join(" "))
            }
            Tok::TestDef | Tok::ReplaceDef => {
                let name = cur.get_hash_str();
                let body = dump_sub_block(cur);
                let kind = if tok == Tok::TestDef {
                    "deftest"
                } else {
                    "defreplace"
                };
                format!("{kind}({name}){{{body}}}")
            }
        };
        out.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::CollectingHandler;

    fn parse_with(text: &str, grammar: Grammar) -> (Arc<ProFile>, Arc<CollectingHandler>) {
        let handler = Arc::new(CollectingHandler::new());
        let parser = QmakeParser::new(None, Arc::new(Vfs::new(false)), handler.clone());
        let pro = parser.parsed_pro_block(text.as_bytes(), b"test.pro", 1, grammar);
        (pro, handler)
    }

    fn dump(text: &str) -> String {
        let (pro, handler) = parse_with(text, Grammar::Full);
        assert!(pro.is_ok(), "{:?}", handler.errors());
        dump_tokens(&pro)
    }

    fn errors(text: &str) -> Vec<String> {
        let (pro, handler) = parse_with(text, Grammar::Full);
        assert!(!pro.is_ok());
        handler.errors()
    }

    #[test]
    fn test_assignment() {
        assert_eq!(dump("A = x y\n"), "L1 hlit(A) =2 lit+(x) lit+(y) ;");
        assert_eq!(dump("A += \"a b\" c"), "L1 hlit(A) +=2 lit+(a b) lit+(c) ;");
        assert_eq!(dump("A = x$$y"), "L1 hlit(A) =1 lit+(x) var(y) ;");
        assert_eq!(dump("A = \"$$B x\""), "L1 hlit(A) =1 var+\"(B) lit( x) ;");
        assert_eq!(dump("A = \\$\\$x"), "L1 hlit(A) =1 lit+($$x) ;");
    }

    #[test]
    fn test_continuation_and_comments() {
        assert_eq!(
            dump("A = a \\\n    b\n"),
            "L1 hlit(A) =2 lit+(a) lit+(b) ;"
        );
        assert_eq!(
            dump("A = 1 # c\n# only\nB = 2\n"),
            "L1 hlit(A) =1 lit+(1) ; L3 hlit(B) =1 lit+(2) ;"
        );
    }

    #[test]
    fn test_magic_variables() {
        assert_eq!(dump("\nL = $$_LINE_\n"), "L2 hlit(L) =1 lit+(2) ;");
        assert_eq!(dump("H = $$LITERAL_HASH"), "L1 hlit(H) =1 lit+(#) ;");
    }

    #[test]
    fn test_branch_with_else() {
        assert_eq!(
            dump("a:b {\n X = 1\n} else {\n Y = 2\n}\n"),
            "L1 hlit(a) ? & hlit(b) ? branch{L2 hlit(X) =1 lit+(1) ;}{L4 hlit(Y) =1 lit+(2) ;}"
        );
    }

    #[test]
    fn test_test_call_scope() {
        assert_eq!(
            dump("exists(foo):A=1"),
            "L1 hlit(exists) call lit+(foo) ) branch{hlit(A) =1 lit+(1) ;}{}"
        );
    }

    #[test]
    fn test_for_loop() {
        assert_eq!(
            dump("for(x, 1..3): A += $$x\n"),
            "L1 for(x){lit+(1..3) ;}{L1 hlit(A) +=1 var+(x) ;}"
        );
    }

    #[test]
    fn test_option_host_build() {
        let (pro, handler) = parse_with("option(host_build)\n", Grammar::Full);
        assert!(pro.is_ok());
        assert!(pro.is_host_build());
        assert!(handler.messages.lock().is_empty());
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            errors("A B = 1\n"),
            vec!["Assignment needs exactly one word on the left hand side."]
        );
        assert_eq!(
            errors("foo(bar\n"),
            vec!["Missing closing parenthesis in function call"]
        );
        assert_eq!(errors("}\n"), vec!["Excess closing brace."]);
        assert_eq!(errors("a {\n"), vec!["Missing closing brace(s)."]);
        assert_eq!(errors("break()\n"), vec!["Unexpected break()."]);
        assert_eq!(errors("else: X = 1\n")[0], "Unexpected 'else'.");
        assert_eq!(
            errors("X = $${FOO\n"),
            vec!["Missing } terminator [found end-of-line]"]
        );
        assert_eq!(errors("option(foo)\n"), vec!["Unknown option() foo."]);
    }

    #[test]
    fn test_test_grammar_rejects_assignment() {
        let (pro, handler) = parse_with("a = 1", Grammar::Test);
        assert!(!pro.is_ok());
        assert_eq!(
            handler.errors(),
            vec!["Assignment not permitted in this context."]
        );
    }

    #[test]
    fn test_deprecated_backslash() {
        let (pro, handler) = parse_with("A = a\\b\n", Grammar::Full);
        assert!(pro.is_ok());
        assert_eq!(
            handler.warnings(),
            vec!["Unescaped backslashes are deprecated"]
        );
        assert_eq!(dump_tokens(&pro), "L1 hlit(A) =1 lit+(a\\b) ;");
    }
}
