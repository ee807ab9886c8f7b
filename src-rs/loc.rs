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

use std::fmt::Display;

use bytes::Bytes;

/// A position in a project file. A line of 0 means no particular line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Loc {
    pub filename: Bytes,
    pub line: i32,
}

impl Loc {
    pub fn new(filename: Bytes, line: i32) -> Self {
        Loc { filename, line }
    }
}

impl Display for Loc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let filename = String::from_utf8_lossy(&self.filename);
        if self.line > 0 {
            write!(f, "{}:{}", filename, self.line)
        } else {
            write!(f, "{filename}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let loc = Loc::new(Bytes::from_static(b"a.pro"), 3);
        assert_eq!(loc.to_string(), "a.pro:3");
        let loc = Loc::new(Bytes::from_static(b"a.pro"), 0);
        assert_eq!(loc.to_string(), "a.pro");
    }
}
