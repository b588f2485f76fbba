// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Riak HTTP surface used by the adapter.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Binary secondary index carrying the encoded primary key.
pub const KEY_INDEX: &str = "pk_bin";

const VCLOCK_HEADER: &str = "x-riak-vclock";

#[derive(Error, Debug, Clone)]
pub enum RiakError {
    #[error("riak {status}: {message}")]
    Http { status: u16, message: String },
    #[error("riak request failed: {0}")]
    Io(String),
}

impl RiakError {
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Io(_) => None,
        }
    }

    /// An `If-Match`/`If-None-Match` condition did not hold.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        self.status() == Some(412)
    }

    fn precondition() -> Self {
        Self::Http { status: 412, message: "precondition failed".into() }
    }
}

/// Stored value plus its causality metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RiakObject {
    pub value: Value,
    pub vclock: Option<String>,
    pub etag: Option<String>,
}

/// Write guard evaluated by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    Any,
    /// Fail with 412 when the key exists.
    Absent,
    /// Fail with 412 unless the stored object has this etag.
    Match(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexPage {
    pub keys: Vec<String>,
    /// Present when the range has more matches past this page.
    pub continuation: Option<String>,
}

#[async_trait]
pub trait RiakNative: Send + Sync {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Option<RiakObject>, RiakError>;

    /// Store `value` with `term` as its `pk_bin` entry; returns the new
    /// object metadata.
    async fn store(
        &self,
        bucket: &str,
        key: &str,
        value: &Value,
        term: &str,
        vclock: Option<&str>,
        pre: &Precondition,
    ) -> Result<RiakObject, RiakError>;

    /// `false` when the key did not exist.
    async fn delete(&self, bucket: &str, key: &str, vclock: Option<&str>) -> Result<bool, RiakError>;

    /// Keys whose `pk_bin` term lies in `start..=end`, in term order.
    async fn index_range(
        &self,
        bucket: &str,
        start: &str,
        end: &str,
        max: Option<usize>,
        continuation: Option<&str>,
    ) -> Result<IndexPage, RiakError>;
}

/// Riak over its HTTP interface (`/buckets/{b}/keys/{k}`).
pub struct HttpRiak {
    http: reqwest::Client,
    base: String,
}

#[derive(Deserialize)]
struct IndexBody {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    continuation: Option<String>,
}

impl HttpRiak {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, RiakError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RiakError::Io(e.to_string()))?;
        Ok(Self { http, base: base.trim_end_matches('/').to_string() })
    }

    fn key_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/buckets/{}/keys/{}", self.base, urlencoding::encode(bucket), urlencoding::encode(key))
    }

    fn header(headers: &HeaderMap, name: impl reqwest::header::AsHeaderName) -> Option<String> {
        headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
    }

    async fn error(response: reqwest::Response) -> RiakError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        RiakError::Http { status, message: message.trim().to_string() }
    }

    fn io(e: reqwest::Error) -> RiakError {
        RiakError::Io(e.to_string())
    }
}

#[async_trait]
impl RiakNative for HttpRiak {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Option<RiakObject>, RiakError> {
        let response = self.http.get(self.key_url(bucket, key)).send().await.map_err(Self::io)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let vclock = Self::header(response.headers(), VCLOCK_HEADER);
                let etag = Self::header(response.headers(), ETAG);
                let value = response.json().await.map_err(Self::io)?;
                Ok(Some(RiakObject { value, vclock, etag }))
            }
            _ => Err(Self::error(response).await),
        }
    }

    async fn store(
        &self,
        bucket: &str,
        key: &str,
        value: &Value,
        term: &str,
        vclock: Option<&str>,
        pre: &Precondition,
    ) -> Result<RiakObject, RiakError> {
        let mut request = self
            .http
            .put(format!("{}?returnbody=true", self.key_url(bucket, key)))
            .header(CONTENT_TYPE, "application/json")
            .header(format!("x-riak-index-{KEY_INDEX}"), term)
            .body(value.to_string());
        if let Some(vclock) = vclock {
            request = request.header(VCLOCK_HEADER, vclock);
        }
        request = match pre {
            Precondition::Any => request,
            Precondition::Absent => request.header(IF_NONE_MATCH, "*"),
            Precondition::Match(etag) => request.header(IF_MATCH, etag.as_str()),
        };
        let response = request.send().await.map_err(Self::io)?;
        if !response.status().is_success() {
            return Err(Self::error(response).await);
        }
        let vclock = Self::header(response.headers(), VCLOCK_HEADER);
        let etag = Self::header(response.headers(), ETAG);
        Ok(RiakObject { value: value.clone(), vclock, etag })
    }

    async fn delete(&self, bucket: &str, key: &str, vclock: Option<&str>) -> Result<bool, RiakError> {
        let mut request = self.http.delete(self.key_url(bucket, key));
        if let Some(vclock) = vclock {
            request = request.header(VCLOCK_HEADER, vclock);
        }
        let response = request.send().await.map_err(Self::io)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(Self::error(response).await),
        }
    }

    async fn index_range(
        &self,
        bucket: &str,
        start: &str,
        end: &str,
        max: Option<usize>,
        continuation: Option<&str>,
    ) -> Result<IndexPage, RiakError> {
        let mut url = format!(
            "{}/buckets/{}/index/{KEY_INDEX}/{}/{}",
            self.base,
            urlencoding::encode(bucket),
            urlencoding::encode(start),
            urlencoding::encode(end)
        );
        let mut params = Vec::new();
        if let Some(max) = max {
            params.push(format!("max_results={max}"));
        }
        if let Some(c) = continuation {
            params.push(format!("continuation={}", urlencoding::encode(c)));
        }
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        let response = self.http.get(url).send().await.map_err(Self::io)?;
        if !response.status().is_success() {
            return Err(Self::error(response).await);
        }
        let IndexBody { keys, continuation } = response.json().await.map_err(Self::io)?;
        Ok(IndexPage { keys, continuation })
    }
}

#[derive(Debug, Clone)]
struct Stored {
    value: Value,
    term: String,
    vclock: String,
}

/// In-process Riak: last write wins, etags equal vclocks.
#[derive(Clone, Default)]
pub struct MemoryRiak {
    buckets: Arc<Mutex<HashMap<String, HashMap<String, Stored>>>>,
    seq: Arc<AtomicU64>,
}

impl MemoryRiak {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RiakNative for MemoryRiak {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Option<RiakObject>, RiakError> {
        let buckets = self.buckets.lock();
        Ok(buckets.get(bucket).and_then(|b| b.get(key)).map(|s| RiakObject {
            value: s.value.clone(),
            vclock: Some(s.vclock.clone()),
            etag: Some(s.vclock.clone()),
        }))
    }

    async fn store(
        &self,
        bucket: &str,
        key: &str,
        value: &Value,
        term: &str,
        _vclock: Option<&str>,
        pre: &Precondition,
    ) -> Result<RiakObject, RiakError> {
        let mut buckets = self.buckets.lock();
        let objects = buckets.entry(bucket.to_string()).or_default();
        let current = objects.get(key).map(|s| s.vclock.as_str());
        let holds = match pre {
            Precondition::Any => true,
            Precondition::Absent => current.is_none(),
            Precondition::Match(etag) => current == Some(etag.as_str()),
        };
        if !holds {
            return Err(RiakError::precondition());
        }
        let vclock = format!("a85h{:012x}", self.seq.fetch_add(1, AtomicOrdering::Relaxed) + 1);
        objects.insert(
            key.to_string(),
            Stored { value: value.clone(), term: term.to_string(), vclock: vclock.clone() },
        );
        Ok(RiakObject { value: value.clone(), vclock: Some(vclock.clone()), etag: Some(vclock) })
    }

    async fn delete(&self, bucket: &str, key: &str, _vclock: Option<&str>) -> Result<bool, RiakError> {
        Ok(self.buckets.lock().get_mut(bucket).and_then(|b| b.remove(key)).is_some())
    }

    async fn index_range(
        &self,
        bucket: &str,
        start: &str,
        end: &str,
        max: Option<usize>,
        continuation: Option<&str>,
    ) -> Result<IndexPage, RiakError> {
        let buckets = self.buckets.lock();
        let Some(objects) = buckets.get(bucket) else {
            return Ok(IndexPage::default());
        };
        // Continuations are `term\u{0}key` of the last entry returned.
        let after = continuation.map(|c| match c.split_once('\u{0}') {
            Some((term, key)) => (term.to_string(), key.to_string()),
            None => (c.to_string(), String::new()),
        });
        let entries: BTreeSet<(&str, &str)> = objects
            .iter()
            .filter(|(_, s)| s.term.as_str() >= start && s.term.as_str() <= end)
            .map(|(k, s)| (s.term.as_str(), k.as_str()))
            .filter(|(t, k)| after.as_ref().map_or(true, |(at, ak)| (*t, *k) > (at.as_str(), ak.as_str())))
            .collect();
        let limit = max.unwrap_or(usize::MAX);
        let page: Vec<(&str, &str)> = entries.iter().take(limit).copied().collect();
        let continuation = match page.last() {
            Some((term, key)) if entries.len() > page.len() => Some(format!("{term}\u{0}{key}")),
            _ => None,
        };
        Ok(IndexPage { keys: page.into_iter().map(|(_, k)| k.to_string()).collect(), continuation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_preconditions() {
        let r = MemoryRiak::new();
        let first = r.store("b", "k", &json!({"v": 1}), "6b", None, &Precondition::Absent).await.unwrap();
        let again = r.store("b", "k", &json!({"v": 2}), "6b", None, &Precondition::Absent).await;
        assert!(again.unwrap_err().is_precondition());

        let etag = first.etag.clone().unwrap();
        let second = r.store("b", "k", &json!({"v": 2}), "6b", first.vclock.as_deref(), &Precondition::Match(etag.clone())).await.unwrap();
        assert_ne!(second.vclock, first.vclock);
        let stale = r.store("b", "k", &json!({"v": 3}), "6b", None, &Precondition::Match(etag)).await;
        assert!(stale.unwrap_err().is_precondition());
        assert_eq!(r.fetch("b", "k").await.unwrap().unwrap().value, json!({"v": 2}));

        assert!(r.delete("b", "k", None).await.unwrap());
        assert!(!r.delete("b", "k", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_index_range_pages() {
        let r = MemoryRiak::new();
        for (key, term) in [("k1", "a1"), ("k2", "a2"), ("k3", "a3"), ("k4", "b1")] {
            r.store("b", key, &json!({}), term, None, &Precondition::Any).await.unwrap();
        }
        let page = r.index_range("b", "a", "az", Some(2), None).await.unwrap();
        assert_eq!(page.keys, vec!["k1", "k2"]);
        let rest = r.index_range("b", "a", "az", Some(2), page.continuation.as_deref()).await.unwrap();
        assert_eq!(rest.keys, vec!["k3"]);
        assert_eq!(rest.continuation, None);
        assert!(r.index_range("none", "a", "z", None, None).await.unwrap().keys.is_empty());
    }
}
