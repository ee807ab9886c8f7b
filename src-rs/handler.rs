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

//! Where the parser and the evaluator send their diagnostics.

use parking_lot::Mutex;

use crate::loc::Loc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    ParserWarnLanguage,
    ParserWarnDeprecated,
    ParserIoError,
    ParserError,
    EvalWarnLanguage,
    EvalWarnDeprecated,
    EvalError,
}

impl MsgType {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            MsgType::ParserIoError | MsgType::ParserError | MsgType::EvalError
        )
    }

    pub fn is_deprecation(self) -> bool {
        matches!(
            self,
            MsgType::ParserWarnDeprecated | MsgType::EvalWarnDeprecated
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalFileType {
    Project,
    Auxiliary,
    ConfigFile,
    Feature,
    Include,
}

pub trait MessageHandler: Send + Sync {
    fn message(&self, kind: MsgType, msg: &str, loc: Option<&Loc>);

    /// Output of `message()`, `log()` and friends.
    fn file_message(&self, msg: &str);

    fn about_to_eval(&self, _parent: Option<&[u8]>, _file: &[u8], _kind: EvalFileType) {}

    /// Called when a file started by `about_to_eval` is finished. `parent`
    /// is the file that is being evaluated again.
    fn done_with_eval(&self, _parent: Option<&[u8]>) {}
}

/// Prints everything to stderr, file messages go to stdout.
#[derive(Default)]
pub struct StderrHandler {
    pub verbose: bool,
}

impl MessageHandler for StderrHandler {
    fn message(&self, kind: MsgType, msg: &str, loc: Option<&Loc>) {
        if kind.is_error() {
            crate::error_log(loc, msg);
        } else if !kind.is_deprecation() || self.verbose {
            crate::warn_loc!(loc, "warning: {msg}");
        }
    }

    fn file_message(&self, msg: &str) {
        print!("{msg}");
    }

    fn about_to_eval(&self, _parent: Option<&[u8]>, file: &[u8], kind: EvalFileType) {
        crate::log!("evaluating {:?} {}", kind, String::from_utf8_lossy(file));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: MsgType,
    pub msg: String,
    pub loc: Option<Loc>,
}

/// Keeps diagnostics in memory, for library users.
#[derive(Default)]
pub struct CollectingHandler {
    pub messages: Mutex<Vec<Diagnostic>>,
    pub output: Mutex<String>,
    pub evaluated: Mutex<Vec<(EvalFileType, Vec<u8>)>>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|d| d.kind.is_error())
            .map(|d| d.msg.clone())
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|d| !d.kind.is_error())
            .map(|d| d.msg.clone())
            .collect()
    }

    pub fn output(&self) -> String {
        self.output.lock().clone()
    }
}

impl MessageHandler for CollectingHandler {
    fn message(&self, kind: MsgType, msg: &str, loc: Option<&Loc>) {
        self.messages.lock().push(Diagnostic {
            kind,
            msg: msg.to_string(),
            loc: loc.cloned(),
        });
    }

    fn file_message(&self, msg: &str) {
        self.output.lock().push_str(msg);
    }

    fn about_to_eval(&self, _parent: Option<&[u8]>, file: &[u8], kind: EvalFileType) {
        self.evaluated.lock().push((kind, file.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_collecting_handler() {
        let handler = CollectingHandler::new();
        let loc = Loc::new(Bytes::from_static(b"a.pro"), 2);
        handler.message(MsgType::EvalError, "boom", Some(&loc));
        handler.message(MsgType::ParserWarnDeprecated, "old", None);
        handler.file_message("hello\n");
        assert_eq!(handler.errors(), vec!["boom"]);
        assert_eq!(handler.warnings(), vec!["old"]);
        assert_eq!(handler.output(), "hello\n");
        assert_eq!(handler.messages.lock()[0].loc, Some(loc));
    }
}
