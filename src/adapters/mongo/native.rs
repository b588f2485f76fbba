// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document-store seam for the MongoDB adapter.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::emulation::{add_numbers, compare_values, values_equal};
use crate::request::Row;

/// Server code for a unique index violation.
pub const DUPLICATE_KEY: i32 = 11000;

#[derive(Error, Debug, Clone)]
pub enum MongoError {
    #[error("E{code} {message}")]
    Server { code: i32, message: String },
    #[error("connection error: {0}")]
    Io(String),
}

impl MongoError {
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Server { code, .. } => Some(*code),
            Self::Io(_) => None,
        }
    }
}

/// `find` arguments.
#[derive(Debug, Clone, Default)]
pub struct FindSpec {
    pub filter: Document,
    pub sort: Option<Document>,
    pub skip: u64,
    pub limit: Option<i64>,
}

#[async_trait]
pub trait MongoNative: Send + Sync {
    async fn find(&self, coll: &str, spec: FindSpec) -> Result<Vec<Document>, MongoError>;

    async fn insert_one(&self, coll: &str, doc: Document) -> Result<(), MongoError>;

    /// Replace or insert; returns matched plus upserted documents.
    async fn replace_one(&self, coll: &str, filter: Document, doc: Document) -> Result<u64, MongoError>;

    /// Apply `$set`/`$unset`/`$inc`; returns matched plus upserted documents.
    async fn update_one(&self, coll: &str, filter: Document, update: Document, upsert: bool)
        -> Result<u64, MongoError>;

    async fn delete_one(&self, coll: &str, filter: Document) -> Result<u64, MongoError>;

    async fn create_index(&self, coll: &str, name: &str, keys: Document, unique: bool) -> Result<(), MongoError>;

    async fn drop_collection(&self, coll: &str) -> Result<(), MongoError>;
}

/// Relaxed extended JSON form of a document.
#[must_use]
pub fn doc_to_row(doc: Document) -> Row {
    match Bson::Document(doc).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// In-process database. Documents are held as JSON and `_id` is unique.
/// `$regex` is understood in the anchored-literal form `^prefix` only.
#[derive(Clone, Default)]
pub struct MemoryMongo {
    collections: Arc<Mutex<HashMap<String, Vec<Row>>>>,
}

fn bad_value(message: impl Into<String>) -> MongoError {
    MongoError::Server { code: 2, message: message.into() }
}

fn is_operator_doc(v: &Value) -> bool {
    v.as_object().is_some_and(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
}

fn eq(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None | Some(Value::Null) => expected.is_null(),
        Some(a) => !expected.is_null() && values_equal(a, expected),
    }
}

fn unescape(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn op_matches(actual: Option<&Value>, op: &str, arg: &Value) -> bool {
    let present = actual.filter(|v| !v.is_null());
    let cmp = |want: fn(Ordering) -> bool| present.is_some_and(|a| want(compare_values(a, arg)));
    let within = |items: &Value| items.as_array().is_some_and(|a| a.iter().any(|v| eq(actual, v)));
    match op {
        "$eq" => eq(actual, arg),
        "$ne" => !eq(actual, arg),
        "$gt" => cmp(Ordering::is_gt),
        "$gte" => cmp(Ordering::is_ge),
        "$lt" => cmp(Ordering::is_lt),
        "$lte" => cmp(Ordering::is_le),
        "$in" => within(arg),
        "$nin" => !within(arg),
        "$exists" => present.is_some() == arg.as_bool().unwrap_or(true),
        "$regex" => match (present, arg.as_str()) {
            (Some(Value::String(s)), Some(pattern)) => match pattern.strip_prefix('^') {
                Some(prefix) => s.starts_with(&unescape(prefix)),
                None => s.contains(&unescape(pattern)),
            },
            _ => false,
        },
        _ => false,
    }
}

fn doc_matches(row: &Row, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(key, cond)| match key.as_str() {
        "$or" => cond
            .as_array()
            .is_some_and(|fs| fs.iter().any(|f| f.as_object().is_some_and(|f| doc_matches(row, f)))),
        "$and" => cond
            .as_array()
            .is_some_and(|fs| fs.iter().all(|f| f.as_object().is_some_and(|f| doc_matches(row, f)))),
        field if is_operator_doc(cond) => cond
            .as_object()
            .is_some_and(|ops| ops.iter().all(|(op, arg)| op_matches(row.get(field), op, arg))),
        field => eq(row.get(field), cond),
    })
}

fn apply_update(row: &mut Row, update: &Map<String, Value>) -> Result<(), MongoError> {
    for (op, fields) in update {
        let fields = fields.as_object().ok_or_else(|| bad_value(format!("{op} needs a document")))?;
        for (field, value) in fields {
            match op.as_str() {
                "$set" => {
                    row.insert(field.clone(), value.clone());
                }
                "$unset" => {
                    row.remove(field);
                }
                "$inc" => {
                    let current = row.get(field).cloned().unwrap_or(Value::from(0));
                    if !current.is_number() || !value.is_number() {
                        return Err(MongoError::Server {
                            code: 14,
                            message: format!("cannot apply $inc to non-numeric field {field}"),
                        });
                    }
                    row.insert(field.clone(), add_numbers(&current, value));
                }
                other => return Err(bad_value(format!("unknown update operator {other}"))),
            }
        }
    }
    Ok(())
}

fn duplicate(id: &Value) -> MongoError {
    MongoError::Server { code: DUPLICATE_KEY, message: format!("duplicate key: {{ _id: {id} }}") }
}

fn is_desc(dir: &Bson) -> bool {
    match dir {
        Bson::Int32(n) => *n < 0,
        Bson::Int64(n) => *n < 0,
        Bson::Double(n) => *n < 0.0,
        _ => false,
    }
}

fn to_doc(row: &Row) -> Result<Document, MongoError> {
    bson::to_document(row).map_err(|e| bad_value(e.to_string()))
}

impl MemoryMongo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Documents in `coll`.
    #[must_use]
    pub fn len(&self, coll: &str) -> usize {
        self.collections.lock().get(coll).map_or(0, Vec::len)
    }

    fn upsert_base(filter: &Map<String, Value>) -> Row {
        filter
            .iter()
            .filter(|(k, v)| !k.starts_with('$') && !is_operator_doc(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn check_unique(docs: &[Row], row: &Row, skip: Option<usize>) -> Result<(), MongoError> {
        let Some(id) = row.get("_id") else {
            return Ok(());
        };
        let clash = docs
            .iter()
            .enumerate()
            .any(|(i, d)| Some(i) != skip && d.get("_id").is_some_and(|other| values_equal(other, id)));
        if clash {
            return Err(duplicate(id));
        }
        Ok(())
    }
}

#[async_trait]
impl MongoNative for MemoryMongo {
    async fn find(&self, coll: &str, spec: FindSpec) -> Result<Vec<Document>, MongoError> {
        let filter = doc_to_row(spec.filter);
        let mut rows: Vec<Row> = {
            let collections = self.collections.lock();
            collections
                .get(coll)
                .map(|docs| docs.iter().filter(|d| doc_matches(d, &filter)).cloned().collect())
                .unwrap_or_default()
        };
        if let Some(sort) = spec.sort {
            // Document order is significant; JSON maps are not ordered.
            let sort: Vec<(String, bool)> = sort.iter().map(|(f, d)| (f.clone(), is_desc(d))).collect();
            rows.sort_by(|a, b| {
                sort.iter()
                    .map(|(field, desc)| {
                        let null = Value::Null;
                        let ord = compare_values(a.get(field).unwrap_or(&null), b.get(field).unwrap_or(&null));
                        if *desc {
                            ord.reverse()
                        } else {
                            ord
                        }
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(Ordering::Equal)
            });
        }
        let skip = usize::try_from(spec.skip).unwrap_or(usize::MAX);
        let limit = spec.limit.filter(|n| *n > 0).map_or(usize::MAX, |n| n as usize);
        rows.into_iter().skip(skip).take(limit).map(|r| to_doc(&r)).collect()
    }

    async fn insert_one(&self, coll: &str, doc: Document) -> Result<(), MongoError> {
        let row = doc_to_row(doc);
        let mut collections = self.collections.lock();
        let docs = collections.entry(coll.to_string()).or_default();
        Self::check_unique(docs, &row, None)?;
        docs.push(row);
        Ok(())
    }

    async fn replace_one(&self, coll: &str, filter: Document, doc: Document) -> Result<u64, MongoError> {
        let filter = doc_to_row(filter);
        let mut row = doc_to_row(doc);
        let mut collections = self.collections.lock();
        let docs = collections.entry(coll.to_string()).or_default();
        match docs.iter().position(|d| doc_matches(d, &filter)) {
            Some(i) => {
                if let (None, Some(id)) = (row.get("_id"), docs[i].get("_id")) {
                    row.insert("_id".to_string(), id.clone());
                }
                Self::check_unique(docs, &row, Some(i))?;
                docs[i] = row;
            }
            None => {
                let mut base = Self::upsert_base(&filter);
                base.extend(row);
                Self::check_unique(docs, &base, None)?;
                docs.push(base);
            }
        }
        Ok(1)
    }

    async fn update_one(
        &self,
        coll: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<u64, MongoError> {
        let filter = doc_to_row(filter);
        let update = doc_to_row(update);
        let mut collections = self.collections.lock();
        let docs = collections.entry(coll.to_string()).or_default();
        match docs.iter().position(|d| doc_matches(d, &filter)) {
            Some(i) => {
                let mut row = docs[i].clone();
                apply_update(&mut row, &update)?;
                docs[i] = row;
                Ok(1)
            }
            None if upsert => {
                let mut row = Self::upsert_base(&filter);
                apply_update(&mut row, &update)?;
                Self::check_unique(docs, &row, None)?;
                docs.push(row);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_one(&self, coll: &str, filter: Document) -> Result<u64, MongoError> {
        let filter = doc_to_row(filter);
        let mut collections = self.collections.lock();
        let Some(docs) = collections.get_mut(coll) else {
            return Ok(0);
        };
        match docs.iter().position(|d| doc_matches(d, &filter)) {
            Some(i) => {
                docs.remove(i);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn create_index(&self, coll: &str, _name: &str, _keys: Document, _unique: bool) -> Result<(), MongoError> {
        self.collections.lock().entry(coll.to_string()).or_default();
        Ok(())
    }

    async fn drop_collection(&self, coll: &str) -> Result<(), MongoError> {
        self.collections.lock().remove(coll);
        Ok(())
    }
}

#[cfg(feature = "mongodb")]
pub use server::ServerMongo;

#[cfg(feature = "mongodb")]
mod server {
    use async_trait::async_trait;
    use bson::Document;
    use futures::TryStreamExt;
    use mongodb::error::{Error, ErrorKind, WriteFailure};
    use mongodb::options::{FindOptions, IndexOptions, ReplaceOptions, UpdateOptions};
    use mongodb::{Client, Database, IndexModel};

    use super::{FindSpec, MongoError, MongoNative};

    const DEFAULT_DATABASE: &str = "polystore";

    /// Server code for dropping a collection that does not exist.
    const NAMESPACE_NOT_FOUND: i32 = 26;

    pub struct ServerMongo {
        db: Database,
    }

    impl ServerMongo {
        /// Connect to `url`; the database is the URL path, `polystore` when absent.
        pub async fn connect(url: &str) -> Result<Self, MongoError> {
            let client = Client::with_uri_str(url).await.map_err(convert)?;
            let db = client.default_database().unwrap_or_else(|| client.database(DEFAULT_DATABASE));
            Ok(Self { db })
        }

        fn coll(&self, name: &str) -> mongodb::Collection<Document> {
            self.db.collection::<Document>(name)
        }
    }

    fn convert(err: Error) -> MongoError {
        match err.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(w)) => {
                MongoError::Server { code: w.code, message: w.message.clone() }
            }
            ErrorKind::Command(c) => MongoError::Server { code: c.code, message: c.message.clone() },
            ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. } => {
                MongoError::Io(err.to_string())
            }
            _ => MongoError::Server { code: -1, message: err.to_string() },
        }
    }

    #[async_trait]
    impl MongoNative for ServerMongo {
        async fn find(&self, coll: &str, spec: FindSpec) -> Result<Vec<Document>, MongoError> {
            let options = FindOptions::builder().sort(spec.sort).skip(Some(spec.skip)).limit(spec.limit).build();
            let cursor = self.coll(coll).find(spec.filter, options).await.map_err(convert)?;
            cursor.try_collect().await.map_err(convert)
        }

        async fn insert_one(&self, coll: &str, doc: Document) -> Result<(), MongoError> {
            self.coll(coll).insert_one(doc, None).await.map_err(convert)?;
            Ok(())
        }

        async fn replace_one(&self, coll: &str, filter: Document, doc: Document) -> Result<u64, MongoError> {
            let options = ReplaceOptions::builder().upsert(true).build();
            let res = self.coll(coll).replace_one(filter, doc, options).await.map_err(convert)?;
            Ok(res.matched_count + u64::from(res.upserted_id.is_some()))
        }

        async fn update_one(
            &self,
            coll: &str,
            filter: Document,
            update: Document,
            upsert: bool,
        ) -> Result<u64, MongoError> {
            let options = UpdateOptions::builder().upsert(upsert).build();
            let res = self.coll(coll).update_one(filter, update, options).await.map_err(convert)?;
            Ok(res.matched_count + u64::from(res.upserted_id.is_some()))
        }

        async fn delete_one(&self, coll: &str, filter: Document) -> Result<u64, MongoError> {
            let res = self.coll(coll).delete_one(filter, None).await.map_err(convert)?;
            Ok(res.deleted_count)
        }

        async fn create_index(&self, coll: &str, name: &str, keys: Document, unique: bool) -> Result<(), MongoError> {
            let options = IndexOptions::builder().name(name.to_string()).unique(unique).build();
            let model = IndexModel::builder().keys(keys).options(options).build();
            self.coll(coll).create_index(model, None).await.map_err(convert)?;
            Ok(())
        }

        async fn drop_collection(&self, coll: &str) -> Result<(), MongoError> {
            match self.coll(coll).drop(None).await.map_err(convert) {
                Err(MongoError::Server { code: NAMESPACE_NOT_FOUND, .. }) | Ok(()) => Ok(()),
                Err(e) => Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[tokio::test]
    async fn test_filter_operators() {
        let m = MemoryMongo::new();
        for (id, n, name) in [(1, 5, "apple"), (2, 10, "apricot"), (3, 15, "banana")] {
            m.insert_one("t", doc! {"_id": id, "n": n, "name": name}).await.unwrap();
        }
        m.insert_one("t", doc! {"_id": 4, "name": "nameless"}).await.unwrap();

        let count = |filter: Document| {
            let m = m.clone();
            async move { m.find("t", FindSpec { filter, ..Default::default() }).await.unwrap().len() }
        };
        assert_eq!(count(doc! {"n": {"$gte": 10}}).await, 2);
        assert_eq!(count(doc! {"n": {"$nin": [5, Bson::Null]}}).await, 2);
        assert_eq!(count(doc! {"name": {"$regex": "^ap"}}).await, 2);
        assert_eq!(count(doc! {"$or": [{"n": 5}, {"n": 15}]}).await, 2);
        assert_eq!(count(doc! {"n": {"$exists": false}}).await, 1);
    }

    #[tokio::test]
    async fn test_sort_skip_limit() {
        let m = MemoryMongo::new();
        for i in 0..10 {
            m.insert_one("t", doc! {"_id": i, "g": i % 2}).await.unwrap();
        }
        let spec = FindSpec {
            filter: doc! {},
            sort: Some(doc! {"g": -1, "_id": 1}),
            skip: 2,
            limit: Some(3),
        };
        let ids: Vec<i64> = m
            .find("t", spec)
            .await
            .unwrap()
            .into_iter()
            .map(|d| doc_to_row(d)["_id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![5, 7, 9]);
    }

    #[tokio::test]
    async fn test_duplicate_id_and_updates() {
        let m = MemoryMongo::new();
        m.insert_one("t", doc! {"_id": "a", "n": 1}).await.unwrap();
        let err = m.insert_one("t", doc! {"_id": "a"}).await.unwrap_err();
        assert_eq!(err.code(), Some(DUPLICATE_KEY));

        let n = m
            .update_one("t", doc! {"_id": "a", "n": 2}, doc! {"$set": {"x": 1}}, false)
            .await
            .unwrap();
        assert_eq!(n, 0);
        m.update_one("t", doc! {"_id": "b"}, doc! {"$inc": {"n": 3}}, true).await.unwrap();
        m.update_one("t", doc! {"_id": "b"}, doc! {"$inc": {"n": 3}, "$unset": {"gone": ""}}, true)
            .await
            .unwrap();
        let found = m.find("t", FindSpec { filter: doc! {"_id": "b"}, ..Default::default() }).await.unwrap();
        assert_eq!(doc_to_row(found[0].clone())["n"], serde_json::json!(6));
        assert_eq!(m.delete_one("t", doc! {"_id": "zz"}).await.unwrap(), 0);
    }
}
