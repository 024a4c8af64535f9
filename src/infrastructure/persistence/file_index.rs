//! Sidecar index of the file backend.
//!
//! One `key=file` pair per line. Keys are escaped so that any string
//! survives the round trip; the reserved `@next` line holds the next numeric
//! file name to hand out.

use std::collections::HashMap;

use tracing::warn;

use crate::domain::entities::UriUsage;
use crate::domain::errors::{PersistenceError, PersistenceResult};

/// Index file name inside the storage directory.
pub const INDEX_FILE: &str = "index.properties";

const NEXT_FILE_KEY: &str = "@next";

/// In-memory view of the index.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileIndex {
    entries: HashMap<String, UriUsage>,
    next_file: u64,
}

impl FileIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the index file contents.
    ///
    /// # Errors
    /// Returns [`PersistenceError::Corrupted`] on a malformed line.
    pub fn parse(text: &str) -> PersistenceResult<Self> {
        let mut index = Self::new();
        let mut highest_file = None;

        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((raw_key, raw_value)) = split_unescaped(line) else {
                return Err(PersistenceError::corrupted(format!(
                    "index line {} has no separator",
                    number + 1
                )));
            };

            if raw_key == NEXT_FILE_KEY {
                index.next_file = raw_value.trim().parse().map_err(|_| {
                    PersistenceError::corrupted(format!("bad next file index: {raw_value}"))
                })?;
                continue;
            }
            if raw_key.starts_with('@') {
                warn!(key = raw_key, "Ignoring unknown reserved index key");
                continue;
            }

            let key = unescape(raw_key);
            let file = unescape(raw_value);
            let file_number: u64 = file.parse().map_err(|_| {
                PersistenceError::corrupted(format!("bad file name for {key}: {file}"))
            })?;
            highest_file = highest_file.max(Some(file_number));
            index.entries.insert(key.clone(), UriUsage::new(file, key));
        }

        if let Some(highest) = highest_file {
            index.next_file = index.next_file.max(highest + 1);
        }
        Ok(index)
    }

    /// Renders the index file contents, keys sorted.
    #[must_use]
    pub fn render(&self) -> String {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();

        let mut out = format!("{NEXT_FILE_KEY}={}\n", self.next_file);
        for key in keys {
            let usage = &self.entries[key];
            out.push_str(&escape(key));
            out.push('=');
            out.push_str(&escape(&usage.storage_file));
            out.push('\n');
        }
        out
    }

    /// Usage record of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&UriUsage> {
        self.entries.get(key)
    }

    /// Records an access to `key` and returns its file name.
    pub fn touch(&mut self, key: &str) -> Option<String> {
        self.entries.get_mut(key).map(|usage| {
            usage.touch();
            usage.storage_file.clone()
        })
    }

    /// Hands out a fresh file name for `key`.
    pub fn allocate(&mut self, key: &str) -> String {
        let file = self.next_file.to_string();
        self.next_file += 1;
        let mut usage = UriUsage::new(file.clone(), key);
        usage.touch();
        self.entries.insert(key.to_string(), usage);
        file
    }

    /// Removes `key`, returning its record.
    pub fn remove(&mut self, key: &str) -> Option<UriUsage> {
        self.entries.remove(key)
    }

    /// Every indexed key.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Number of indexed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops the least accessed half of the entries and resets the access
    /// counts of the survivors. Returns the dropped records.
    pub fn evict_least_used(&mut self) -> Vec<UriUsage> {
        let mut usages: Vec<UriUsage> = self.entries.drain().map(|(_, usage)| usage).collect();
        usages.sort_by(|a, b| {
            a.access_count
                .cmp(&b.access_count)
                .then(a.last_used.cmp(&b.last_used))
        });

        let evict = (usages.len() / 2).max(1).min(usages.len());
        let survivors = usages.split_off(evict);
        for mut usage in survivors {
            usage.access_count = 0;
            self.entries.insert(usage.uri.clone(), usage);
        }
        usages
    }

    /// Forgets every key. File numbering continues where it was.
    pub fn clear(&mut self) -> Vec<UriUsage> {
        self.entries.drain().map(|(_, usage)| usage).collect()
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, c) in raw.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '=' => out.push_str("\\="),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '@' | '#' if i == 0 => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Splits at the first `=` not preceded by an escaping backslash.
fn split_unescaped(line: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '=' if !escaped => return Some((&line[..i], &line[i + 1..])),
            _ => escaped = false,
        }
    }
    None
}
