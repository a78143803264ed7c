//! Canonical key/value requests identifying a unit of pipeline work.
//!
//! A request is an order-independent bag of `KEY=VALUE` pairs. Its canonical
//! string form sorts the keys and terminates every pair with `;`, so two
//! requests built through different call paths compare and hash equal when
//! they serialize identically:
//!
//! ```text
//! INIT_TIME=2024-01-01T00:00:00Z;MEMBERS=0/1/2;VARIABLE=u;
//! ```
//!
//! Multi-valued fields use `/` as a sub-delimiter.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JetError, JetResult};

/// Delimiter between `KEY=VALUE` pairs.
pub const PAIR_DELIMITER: char = ';';

/// Delimiter between the elements of a multi-valued field.
pub const LIST_DELIMITER: char = '/';

/// Time format used for all time-valued keys.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A normalized set of `KEY=VALUE` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Request {
    pairs: BTreeMap<String, String>,
}

impl Request {
    /// Create an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a request from its string form.
    ///
    /// Empty tokens are ignored. A token without `=` is rejected.
    pub fn parse(s: &str) -> JetResult<Self> {
        let mut request = Request::new();
        for token in s.split(PAIR_DELIMITER) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| JetError::invalid_value(token, "", "expected KEY=VALUE"))?;
            request.insert(key.trim(), value.trim());
        }
        Ok(request)
    }

    /// Canonical string form; identical for equal requests.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Insert a string value, replacing any previous value for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.insert(key.into(), value.into());
    }

    pub fn insert_int(&mut self, key: impl Into<String>, value: i64) {
        self.insert(key, value.to_string());
    }

    pub fn insert_float(&mut self, key: impl Into<String>, value: f32) {
        self.insert(key, value.to_string());
    }

    pub fn insert_time(&mut self, key: impl Into<String>, time: &DateTime<Utc>) {
        self.insert(key, time.format(TIME_FORMAT).to_string());
    }

    /// Insert a set of unsigned values, sorted and `/`-joined.
    ///
    /// An empty set is not inserted.
    pub fn insert_uint_set(&mut self, key: impl Into<String>, values: &BTreeSet<u32>) {
        if values.is_empty() {
            return;
        }
        self.insert(key, join(values.iter()));
    }

    pub fn insert_float_list(&mut self, key: impl Into<String>, values: &[f32]) {
        self.insert(key, join(values.iter()));
    }

    pub fn insert_str_list<S: AsRef<str>>(&mut self, key: impl Into<String>, values: &[S]) {
        let joined = values
            .iter()
            .map(|v| v.as_ref())
            .collect::<Vec<_>>()
            .join("/");
        self.insert(key, joined);
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn value(&self, key: &str) -> Option<&str> {
        self.pairs.get(key).map(String::as_str)
    }

    /// Value for `key`, or a MissingKeys error.
    pub fn required(&self, key: &str) -> JetResult<&str> {
        self.value(key)
            .ok_or_else(|| JetError::missing_keys(self.canonical(), vec![key.to_string()]))
    }

    pub fn int_value(&self, key: &str) -> JetResult<i64> {
        parse_value(key, self.required(key)?)
    }

    pub fn float_value(&self, key: &str) -> JetResult<f32> {
        parse_value(key, self.required(key)?)
    }

    pub fn time_value(&self, key: &str) -> JetResult<DateTime<Utc>> {
        let raw = self.required(key)?;
        parse_time(raw).ok_or_else(|| JetError::invalid_value(key, raw, "expected ISO-8601 time"))
    }

    /// Parse a `/`-separated list of unsigned values into a set.
    pub fn uint_set_value(&self, key: &str) -> JetResult<BTreeSet<u32>> {
        let raw = self.required(key)?;
        split_list(raw).map(|v| parse_value(key, v)).collect()
    }

    pub fn float_list_value(&self, key: &str) -> JetResult<Vec<f32>> {
        let raw = self.required(key)?;
        split_list(raw).map(|v| parse_value(key, v)).collect()
    }

    pub fn str_list_value(&self, key: &str) -> JetResult<Vec<String>> {
        Ok(split_list(self.required(key)?).map(str::to_string).collect())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pairs.contains_key(key)
    }

    pub fn contains_all<S: AsRef<str>>(&self, keys: &[S]) -> bool {
        keys.iter().all(|k| self.contains(k.as_ref()))
    }

    /// Keys from `keys` that are not present.
    pub fn missing_keys<S: AsRef<str>>(&self, keys: &[S]) -> Vec<String> {
        keys.iter()
            .map(|k| k.as_ref())
            .filter(|k| !self.contains(k))
            .map(str::to_string)
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    // ------------------------------------------------------------------
    // Key set operations
    // ------------------------------------------------------------------

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.pairs.remove(key)
    }

    pub fn remove_all<S: AsRef<str>>(&mut self, keys: &[S]) {
        for key in keys {
            self.pairs.remove(key.as_ref());
        }
    }

    /// Copy of this request without `keys`.
    pub fn without<S: AsRef<str>>(&self, keys: &[S]) -> Request {
        let mut copy = self.clone();
        copy.remove_all(keys);
        copy
    }

    /// Keep only the keys contained in `keys`.
    pub fn retain_only<'a, I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let keep: BTreeSet<&str> = keys.into_iter().collect();
        self.pairs.retain(|k, _| keep.contains(k.as_str()));
    }

    /// Merge `other` into this request; values in `other` win.
    pub fn unite(&mut self, other: &Request) {
        for (k, v) in &other.pairs {
            self.pairs.insert(k.clone(), v.clone());
        }
    }

    /// All keys starting with `prefix`, with the prefix stripped.
    pub fn sub_request(&self, prefix: &str) -> Request {
        let pairs = self
            .pairs
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(prefix).map(|s| (s.to_string(), v.clone())))
            .collect();
        Request { pairs }
    }

    pub fn add_key_prefix(&mut self, prefix: &str) {
        self.pairs = std::mem::take(&mut self.pairs)
            .into_iter()
            .map(|(k, v)| (format!("{}{}", prefix, k), v))
            .collect();
    }

    /// Strip `prefix` from every key carrying it; other keys are unchanged.
    pub fn remove_key_prefix(&mut self, prefix: &str) {
        self.pairs = std::mem::take(&mut self.pairs)
            .into_iter()
            .map(|(k, v)| match k.strip_prefix(prefix) {
                Some(stripped) => (stripped.to_string(), v),
                None => (k, v),
            })
            .collect();
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.pairs {
            write!(f, "{}={}{}", k, v, PAIR_DELIMITER)?;
        }
        Ok(())
    }
}

impl FromStr for Request {
    type Err = JetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Request::parse(s)
    }
}

fn join<T: ToString>(values: impl Iterator<Item = T>) -> String {
    values
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(LIST_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> JetResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| JetError::invalid_value(key, raw, "cannot parse value"))
}

/// Parse an ISO-8601 time with or without a trailing `Z`.
pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}
