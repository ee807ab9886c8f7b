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

//! Parsed project files shared between evaluations, keyed by path.
//!
//! Concurrent requests for the same file are single-flight: the first
//! caller parses while later ones wait for its result.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::proitem::ProFile;

enum Entry {
    Parsing,
    // None records a file that could not be read.
    Done(Option<Arc<ProFile>>),
}

#[derive(Default)]
pub struct ProFileCache {
    entries: Mutex<HashMap<Bytes, Entry>>,
    done: Condvar,
    parse_count: AtomicUsize,
}

impl ProFileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_parse<F>(&self, path: &Bytes, parse: F) -> Option<Arc<ProFile>>
    where
        F: FnOnce() -> Option<Arc<ProFile>>,
    {
        let mut entries = self.entries.lock();
        loop {
            match entries.get(path) {
                Some(Entry::Done(pro)) => return pro.clone(),
                Some(Entry::Parsing) => self.done.wait(&mut entries),
                None => break,
            }
        }
        entries.insert(path.clone(), Entry::Parsing);
        drop(entries);

        let pro = parse();
        self.parse_count.fetch_add(1, Ordering::Relaxed);

        self.entries
            .lock()
            .insert(path.clone(), Entry::Done(pro.clone()));
        self.done.notify_all();
        pro
    }

    /// Drops a file, waiting for a parse in flight to finish first.
    pub fn discard_file(&self, path: &[u8]) {
        let mut entries = self.entries.lock();
        while matches!(entries.get(path), Some(Entry::Parsing)) {
            self.done.wait(&mut entries);
        }
        entries.remove(path);
    }

    /// Drops every file below `prefix`.
    pub fn discard_files(&self, prefix: &[u8]) {
        let mut entries = self.entries.lock();
        while entries
            .iter()
            .any(|(k, v)| k.starts_with(prefix) && matches!(v, Entry::Parsing))
        {
            self.done.wait(&mut entries);
        }
        entries.retain(|k, _| !k.starts_with(prefix));
    }

    /// How many times a file was actually parsed.
    pub fn parse_count(&self) -> usize {
        self.parse_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pro(name: &'static str) -> Option<Arc<ProFile>> {
        Some(Arc::new(ProFile::new(
            Bytes::from_static(name.as_bytes()),
            Bytes::new(),
            true,
            false,
        )))
    }

    #[test]
    fn test_single_flight() {
        let cache = ProFileCache::new();
        let path = Bytes::from_static(b"/p/a.pro");
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        cache.get_or_parse(&path, || {
                            std::thread::sleep(Duration::from_millis(20));
                            pro("/p/a.pro")
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(cache.parse_count(), 1);
        let first = results[0].clone().unwrap();
        for r in results {
            assert!(Arc::ptr_eq(&first, &r.unwrap()));
        }
    }

    #[test]
    fn test_discard() {
        let cache = ProFileCache::new();
        let a = Bytes::from_static(b"/p/a.pro");
        let b = Bytes::from_static(b"/q/b.pro");
        cache.get_or_parse(&a, || pro("/p/a.pro"));
        cache.get_or_parse(&b, || None);
        assert!(cache.get_or_parse(&b, || pro("/q/b.pro")).is_none());
        assert_eq!(cache.parse_count(), 2);

        cache.discard_file(&b);
        assert!(cache.get_or_parse(&b, || pro("/q/b.pro")).is_some());
        cache.discard_files(b"/p/");
        cache.get_or_parse(&a, || pro("/p/a.pro"));
        assert_eq!(cache.parse_count(), 4);
    }
}
