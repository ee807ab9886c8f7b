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

//! Timing of the parser and evaluator hot spots, enabled with `--stats`.
//!
//! Every `collect_stats!` site owns one [`Stats`] record. Sites that pass a
//! key (usually the path of the file being worked on) also keep per-key
//! samples so the report can name the slowest files.

use crate::flags::FLAGS;
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt::Display,
    sync::Arc,
    time::{Duration, Instant},
};

static REGISTRY: Mutex<Vec<Arc<Stats>>> = Mutex::new(Vec::new());

/// Per-key entries printed under each site.
const TOP_KEYS: usize = 10;

/// Keyed executions slower than this are reported immediately.
const SLOW_THRESHOLD: Duration = Duration::from_secs(2);

#[derive(Default, Clone, Copy)]
struct Sample {
    count: u64,
    elapsed: Duration,
}

impl Sample {
    fn add(&mut self, elapsed: Duration) {
        self.count += 1;
        self.elapsed += elapsed;
    }
}

pub struct Stats {
    name: &'static str,
    total: Mutex<Sample>,
    by_key: Mutex<HashMap<Bytes, Sample>>,
}

impl Stats {
    #[doc(hidden)]
    pub fn new(name: &'static str) -> Arc<Self> {
        let stats = Arc::new(Self::unregistered(name));
        REGISTRY.lock().push(stats.clone());
        stats
    }

    fn unregistered(name: &'static str) -> Self {
        Stats {
            name,
            total: Mutex::new(Sample::default()),
            by_key: Mutex::new(HashMap::new()),
        }
    }

    /// The implementation behind [`collect_stats!`] and
    /// [`collect_stats_with_slow_report!`].
    #[doc(hidden)]
    #[must_use]
    pub fn start_scope(&self, key: Option<&[u8]>) -> impl Drop + '_ {
        Recorder {
            stats: self,
            key: key.map(Bytes::copy_from_slice),
            start: Instant::now(),
        }
    }

    fn record(&self, key: Option<Bytes>, elapsed: Duration) {
        self.total.lock().add(elapsed);
        let Some(key) = key else {
            return;
        };
        if elapsed > SLOW_THRESHOLD {
            eprintln!(
                "*proeval*: slow {} ({:.3}s): {}",
                self.name,
                elapsed.as_secs_f64(),
                String::from_utf8_lossy(&key)
            );
        }
        self.by_key.lock().entry(key).or_default().add(elapsed);
    }

    /// The report lines for this site: the summary, then the slowest keys.
    fn report_lines(&self) -> Vec<String> {
        let mut lines = vec![self.to_string()];
        let mut keyed: Vec<(Bytes, Sample)> = self
            .by_key
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        keyed.sort_by(|a, b| b.1.elapsed.cmp(&a.1.elapsed).then_with(|| a.0.cmp(&b.0)));
        keyed.truncate(TOP_KEYS);
        let width = keyed
            .iter()
            .map(|(_, s)| s.count.to_string().len())
            .max()
            .unwrap_or(1);
        for (key, sample) in keyed {
            lines.push(format!(
                "{:>8.3} / {:>width$} {}",
                sample.elapsed.as_secs_f64(),
                sample.count,
                String::from_utf8_lossy(&key)
            ));
        }
        lines
    }
}

impl Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = *self.total.lock();
        write!(
            f,
            "{}: {:.3}s / {}",
            self.name,
            total.elapsed.as_secs_f64(),
            total.count
        )?;
        let keys = self.by_key.lock().len();
        if keys > 0 {
            write!(f, " ({keys} files)")?;
        }
        Ok(())
    }
}

struct Recorder<'a> {
    stats: &'a Stats,
    key: Option<Bytes>,
    start: Instant,
}

impl Drop for Recorder<'_> {
    fn drop(&mut self) {
        self.stats.record(self.key.take(), self.start.elapsed());
    }
}

/// Times the rest of the enclosing block under `name`.
#[macro_export]
macro_rules! collect_stats {
    ($name:literal) => {
        static STATS: std::sync::LazyLock<std::sync::Arc<$crate::stats::Stats>> =
            std::sync::LazyLock::new(|| $crate::stats::Stats::new($name));
        let _recorder = if $crate::flags::FLAGS.enable_stat_logs {
            Some(STATS.start_scope(None))
        } else {
            None
        };
    };
}

/// Like [`collect_stats!`], but also keeps a sample per `key` (a byte
/// string) and reports slow executions as they finish.
#[macro_export]
macro_rules! collect_stats_with_slow_report {
    ($name:literal, $key:expr) => {
        static STATS: std::sync::LazyLock<std::sync::Arc<$crate::stats::Stats>> =
            std::sync::LazyLock::new(|| $crate::stats::Stats::new($name));
        let _recorder = if $crate::flags::FLAGS.enable_stat_logs {
            Some(STATS.start_scope(Some($key)))
        } else {
            None
        };
    };
}

/// Prints every site to stderr when `--stats` is given, and resets the
/// registry.
pub fn report_all_stats() {
    let all = std::mem::take(&mut *REGISTRY.lock());
    if !FLAGS.enable_stat_logs {
        return;
    }
    for stats in all {
        for line in stats.report_lines() {
            eprintln!("*proeval*: {line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals() {
        let stats = Stats::unregistered("parse");
        stats.record(None, Duration::from_millis(5));
        stats.record(None, Duration::from_millis(10));
        assert_eq!(stats.to_string(), "parse: 0.015s / 2");
        assert_eq!(stats.report_lines().len(), 1);
    }

    #[test]
    fn test_keyed_report_is_sorted() {
        let stats = Stats::unregistered("evaluate file");
        let a = Some(Bytes::from_static(b"/src/a.pro"));
        let b = Some(Bytes::from_static(b"/src/b.prf"));
        stats.record(a.clone(), Duration::from_millis(1));
        stats.record(b, Duration::from_millis(30));
        stats.record(a, Duration::from_millis(1));
        let lines = stats.report_lines();
        assert_eq!(lines[0], "evaluate file: 0.032s / 3 (2 files)");
        assert_eq!(lines[1], "   0.030 / 1 /src/b.prf");
        assert_eq!(lines[2], "   0.002 / 2 /src/a.pro");
    }

    #[test]
    fn test_scope_records_on_drop() {
        let stats = Stats::unregistered("system");
        {
            let _recorder = stats.start_scope(Some(&b"echo"[..]));
        }
        assert_eq!(stats.total.lock().count, 1);
        assert_eq!(stats.by_key.lock().len(), 1);
    }
}
