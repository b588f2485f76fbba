// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! CouchDB HTTP surface used by the adapter.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::emulation::compare_values;

/// Design document holding the primary key view.
pub const DESIGN_ID: &str = "_design/polystore";

/// View emitting `[k1, k2, ...]` for every record.
pub const KEY_VIEW: &str = "pkey";

#[derive(Error, Debug, Clone)]
pub enum CouchError {
    #[error("couchdb {status} {error}: {reason}")]
    Http { status: u16, error: String, reason: String },
    #[error("couchdb request failed: {0}")]
    Io(String),
}

impl CouchError {
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Io(_) => None,
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    fn conflict() -> Self {
        Self::Http { status: 409, error: "conflict".into(), reason: "Document update conflict.".into() }
    }

    fn not_found(reason: &str) -> Self {
        Self::Http { status: 404, error: "not_found".into(), reason: reason.into() }
    }
}

/// `_view` query parameters. Keys are JSON, as CouchDB expects.
#[derive(Debug, Clone, Default)]
pub struct ViewQuery {
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    pub descending: bool,
    pub skip: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewRow {
    pub id: String,
    pub key: Value,
    #[serde(default)]
    pub doc: Value,
}

#[async_trait]
pub trait CouchNative: Send + Sync {
    /// Document with `_id` and `_rev`, `None` when missing or deleted.
    async fn get_doc(&self, db: &str, id: &str) -> Result<Option<Value>, CouchError>;

    /// Store `doc` (carrying `_rev` when updating); returns the new revision.
    async fn put_doc(&self, db: &str, id: &str, doc: Value) -> Result<String, CouchError>;

    async fn delete_doc(&self, db: &str, id: &str, rev: &str) -> Result<(), CouchError>;

    /// Rows of the key view, documents included.
    async fn view(&self, db: &str, query: &ViewQuery) -> Result<Vec<ViewRow>, CouchError>;

    /// Create a database; an existing one is not an error.
    async fn create_db(&self, db: &str) -> Result<(), CouchError>;

    /// Delete a database; a missing one is not an error.
    async fn delete_db(&self, db: &str) -> Result<(), CouchError>;

    async fn all_dbs(&self) -> Result<Vec<String>, CouchError>;
}

/// CouchDB over HTTP.
pub struct HttpCouch {
    http: reqwest::Client,
    base: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct PutBody {
    rev: String,
}

#[derive(Deserialize)]
struct ViewBody {
    rows: Vec<ViewRow>,
}

impl HttpCouch {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, CouchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CouchError::Io(e.to_string()))?;
        Ok(Self { http, base: base.trim_end_matches('/').to_string() })
    }

    fn doc_url(&self, db: &str, id: &str) -> String {
        // Design document ids keep their slash.
        match id.strip_prefix("_design/") {
            Some(name) => format!("{}/{}/_design/{}", self.base, urlencoding::encode(db), urlencoding::encode(name)),
            None => format!("{}/{}/{}", self.base, urlencoding::encode(db), urlencoding::encode(id)),
        }
    }

    async fn send(&self, method: Method, url: String, body: Option<&Value>) -> Result<(StatusCode, Value), CouchError> {
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| CouchError::Io(e.to_string()))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    fn error(status: StatusCode, body: Value) -> CouchError {
        let ErrorBody { error, reason } = serde_json::from_value(body).unwrap_or(ErrorBody {
            error: status.canonical_reason().unwrap_or_default().to_string(),
            reason: String::new(),
        });
        CouchError::Http { status: status.as_u16(), error, reason }
    }
}

#[async_trait]
impl CouchNative for HttpCouch {
    async fn get_doc(&self, db: &str, id: &str) -> Result<Option<Value>, CouchError> {
        let (status, body) = self.send(Method::GET, self.doc_url(db, id), None).await?;
        match status {
            s if s.is_success() => Ok(Some(body)),
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(Self::error(s, body)),
        }
    }

    async fn put_doc(&self, db: &str, id: &str, doc: Value) -> Result<String, CouchError> {
        let (status, body) = self.send(Method::PUT, self.doc_url(db, id), Some(&doc)).await?;
        if !status.is_success() {
            return Err(Self::error(status, body));
        }
        let PutBody { rev } = serde_json::from_value(body).map_err(|e| CouchError::Io(e.to_string()))?;
        Ok(rev)
    }

    async fn delete_doc(&self, db: &str, id: &str, rev: &str) -> Result<(), CouchError> {
        let url = format!("{}?rev={}", self.doc_url(db, id), urlencoding::encode(rev));
        let (status, body) = self.send(Method::DELETE, url, None).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::error(status, body))
        }
    }

    async fn view(&self, db: &str, query: &ViewQuery) -> Result<Vec<ViewRow>, CouchError> {
        let mut url = format!(
            "{}/{}/{}/_view/{}?include_docs=true&skip={}&descending={}",
            self.base,
            urlencoding::encode(db),
            DESIGN_ID,
            KEY_VIEW,
            query.skip,
            query.descending
        );
        if let Some(key) = &query.start_key {
            url.push_str(&format!("&startkey={}", urlencoding::encode(&key.to_string())));
        }
        if let Some(key) = &query.end_key {
            url.push_str(&format!("&endkey={}", urlencoding::encode(&key.to_string())));
        }
        if let Some(limit) = query.limit {
            url.push_str(&format!("&limit={limit}"));
        }
        let (status, body) = self.send(Method::GET, url, None).await?;
        if !status.is_success() {
            return Err(Self::error(status, body));
        }
        let ViewBody { rows } = serde_json::from_value(body).map_err(|e| CouchError::Io(e.to_string()))?;
        Ok(rows)
    }

    async fn create_db(&self, db: &str) -> Result<(), CouchError> {
        let url = format!("{}/{}", self.base, urlencoding::encode(db));
        let (status, body) = self.send(Method::PUT, url, None).await?;
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::PRECONDITION_FAILED => Ok(()),
            s => Err(Self::error(s, body)),
        }
    }

    async fn delete_db(&self, db: &str) -> Result<(), CouchError> {
        let url = format!("{}/{}", self.base, urlencoding::encode(db));
        let (status, body) = self.send(Method::DELETE, url, None).await?;
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            s => Err(Self::error(s, body)),
        }
    }

    async fn all_dbs(&self) -> Result<Vec<String>, CouchError> {
        let (status, body) = self.send(Method::GET, format!("{}/_all_dbs", self.base), None).await?;
        if !status.is_success() {
            return Err(Self::error(status, body));
        }
        serde_json::from_value(body).map_err(|e| CouchError::Io(e.to_string()))
    }
}

/// In-process CouchDB. The key view is computed from the design document's
/// `keys` list instead of running its map function.
#[derive(Clone, Default)]
pub struct MemoryCouch {
    dbs: Arc<Mutex<HashMap<String, BTreeMap<String, Value>>>>,
    seq: Arc<AtomicU64>,
}

fn rev_number(rev: &str) -> u64 {
    rev.split_once('-').and_then(|(n, _)| n.parse().ok()).unwrap_or(0)
}

impl MemoryCouch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn view_key(keys: &[String], doc: &Value) -> Value {
        Value::Array(keys.iter().map(|k| doc.get(k).cloned().unwrap_or(Value::Null)).collect())
    }
}

#[async_trait]
impl CouchNative for MemoryCouch {
    async fn get_doc(&self, db: &str, id: &str) -> Result<Option<Value>, CouchError> {
        Ok(self.dbs.lock().get(db).and_then(|docs| docs.get(id).cloned()))
    }

    async fn put_doc(&self, db: &str, id: &str, mut doc: Value) -> Result<String, CouchError> {
        let mut dbs = self.dbs.lock();
        let docs = dbs.get_mut(db).ok_or_else(|| CouchError::not_found("Database does not exist."))?;
        let given = doc.get("_rev").and_then(Value::as_str).map(str::to_string);
        let current = docs.get(id).and_then(|d| d.get("_rev")).and_then(Value::as_str).map(str::to_string);
        if given != current {
            return Err(CouchError::conflict());
        }
        let n = current.as_deref().map_or(0, rev_number) + 1;
        let rev = format!("{n}-{:032x}", self.seq.fetch_add(1, AtomicOrdering::Relaxed));
        if let Value::Object(map) = &mut doc {
            map.insert("_id".into(), Value::String(id.to_string()));
            map.insert("_rev".into(), Value::String(rev.clone()));
        }
        docs.insert(id.to_string(), doc);
        Ok(rev)
    }

    async fn delete_doc(&self, db: &str, id: &str, rev: &str) -> Result<(), CouchError> {
        let mut dbs = self.dbs.lock();
        let docs = dbs.get_mut(db).ok_or_else(|| CouchError::not_found("Database does not exist."))?;
        match docs.get(id).and_then(|d| d.get("_rev")).and_then(Value::as_str) {
            None => Err(CouchError::not_found("deleted")),
            Some(current) if current != rev => Err(CouchError::conflict()),
            Some(_) => {
                docs.remove(id);
                Ok(())
            }
        }
    }

    async fn view(&self, db: &str, query: &ViewQuery) -> Result<Vec<ViewRow>, CouchError> {
        let dbs = self.dbs.lock();
        let docs = dbs.get(db).ok_or_else(|| CouchError::not_found("Database does not exist."))?;
        let keys: Vec<String> = docs
            .get(DESIGN_ID)
            .and_then(|d| d.get("keys"))
            .and_then(|k| serde_json::from_value(k.clone()).ok())
            .ok_or_else(|| CouchError::not_found("missing"))?;

        let mut rows: Vec<ViewRow> = docs
            .iter()
            .filter(|(id, _)| !id.starts_with("_design/"))
            .map(|(id, doc)| ViewRow { id: id.clone(), key: Self::view_key(&keys, doc), doc: doc.clone() })
            .collect();
        rows.sort_by(|a, b| compare_values(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
        if query.descending {
            rows.reverse();
        }
        let after_start = |key: &Value| {
            query.start_key.as_ref().map_or(true, |start| {
                let ord = compare_values(key, start);
                if query.descending { ord.is_le() } else { ord.is_ge() }
            })
        };
        let before_end = |key: &Value| {
            query.end_key.as_ref().map_or(true, |end| {
                let ord = compare_values(key, end);
                if query.descending { ord.is_ge() } else { ord.is_le() }
            })
        };
        Ok(rows
            .into_iter()
            .filter(|r| after_start(&r.key) && before_end(&r.key))
            .skip(query.skip)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn create_db(&self, db: &str) -> Result<(), CouchError> {
        self.dbs.lock().entry(db.to_string()).or_default();
        Ok(())
    }

    async fn delete_db(&self, db: &str) -> Result<(), CouchError> {
        self.dbs.lock().remove(db);
        Ok(())
    }

    async fn all_dbs(&self) -> Result<Vec<String>, CouchError> {
        let mut names: Vec<String> = self.dbs.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Design document for a table keyed by `keys`.
#[must_use]
pub fn design_doc(keys: &[String], spec: &Value) -> Value {
    let emitted: Vec<String> = keys
        .iter()
        .map(|k| format!("doc[{}]", Value::String(k.clone())))
        .collect();
    let map = format!(
        "function(doc) {{ if (doc._id.indexOf('_design/') !== 0) emit([{}], null); }}",
        emitted.join(", ")
    );
    json!({
        "language": "javascript",
        "views": { KEY_VIEW: { "map": map } },
        "keys": keys,
        "spec": spec,
    })
}
