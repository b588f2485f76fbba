// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! MongoDB adapter: one collection per table.
//!
//! Each document carries `_id` = the joined primary key, so uniqueness of
//! the key is enforced by the server even for collections created outside
//! `create`. Filters, sort and pagination are native: `find` with
//! `skip`/`limit`, and the continuation token is the next offset.
//! Table definitions live in the `_polystore_tables` collection.

mod native;

pub use native::{doc_to_row, FindSpec, MemoryMongo, MongoError, MongoNative, DUPLICATE_KEY};
#[cfg(feature = "mongodb")]
pub use native::ServerMongo;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use super::{start_offset, Adapter};
use crate::config::PoolConfig;
use crate::emulation::{join_key, Predicate, KEY_SEP};
use crate::error::{DbError, Result};
use crate::request::{Capabilities, FieldOp, Op, PreparedRequest, QueryResult, Row};
use crate::schema::{ColumnType, TableInfo, TableSpec};

const META_COLLECTION: &str = "_polystore_tables";

const ID: &str = "_id";

enum Backend {
    Memory(MemoryMongo),
    #[cfg(feature = "mongodb")]
    Server(String),
}

pub struct MongoAdapter {
    backend: Backend,
    client: OnceCell<Arc<dyn MongoNative>>,
}

type Client = Arc<dyn MongoNative>;

fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Bson> {
    bson::to_bson(value).map_err(|e| DbError::invalid(e.to_string()))
}

fn document(map: &Map<String, Value>) -> Result<Document> {
    bson::to_document(map).map_err(|e| DbError::invalid(e.to_string()))
}

/// Escape regex metacharacters so `s` matches literally.
fn regex_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Numeric columns compare as numbers; coerce numeric strings so type
/// bracketing on the server does not hide matches.
fn typed(info: &TableInfo, field: &str, value: &Value) -> Value {
    match (info.column_type(field), value) {
        (Some(kind), Value::String(s)) if kind.is_numeric() => {
            serde_json::from_str::<Value>(s.trim()).ok().filter(Value::is_number).unwrap_or_else(|| value.clone())
        }
        (_, Value::Array(items)) => Value::Array(items.iter().map(|v| typed(info, field, v)).collect()),
        _ => value.clone(),
    }
}

fn condition(info: &TableInfo, p: &Predicate) -> Value {
    let v = typed(info, &p.field, &p.value);
    let prefix = |s: &str| serde_json::json!({ "$regex": format!("^{}", regex_escape(s)) });
    match p.op {
        FieldOp::Eq => v,
        FieldOp::Ne => serde_json::json!({ "$nin": [v, Value::Null] }),
        FieldOp::Gt => serde_json::json!({ "$gt": v }),
        FieldOp::Ge => serde_json::json!({ "$gte": v }),
        FieldOp::Lt => serde_json::json!({ "$lt": v }),
        FieldOp::Le => serde_json::json!({ "$lte": v }),
        FieldOp::In => match v {
            Value::Array(items) => serde_json::json!({ "$in": items }),
            single => serde_json::json!({ "$in": [single] }),
        },
        FieldOp::Between => match v.as_array().map(Vec::as_slice) {
            Some([lo, hi]) => serde_json::json!({ "$gte": lo, "$lte": hi }),
            _ => serde_json::json!({ "$in": [] }),
        },
        FieldOp::BeginsWith => prefix(&crate::emulation::key_part(&p.value)),
        FieldOp::Like => {
            let pattern = crate::emulation::key_part(&p.value);
            match pattern.strip_suffix('%') {
                Some(start) => prefix(start),
                None => Value::String(pattern),
            }
        }
    }
}

impl MongoAdapter {
    #[must_use]
    pub fn memory(mongo: MemoryMongo) -> Self {
        Self { backend: Backend::Memory(mongo), client: OnceCell::new() }
    }

    /// `mongodb://` URLs connect to a server; an empty URL or `memory://`
    /// uses an in-process database.
    pub fn from_config(cfg: &PoolConfig) -> Result<Self> {
        if cfg.url.is_empty() || cfg.url.starts_with("memory:") {
            return Ok(Self::memory(MemoryMongo::new()));
        }
        if !cfg.url.starts_with("mongodb://") && !cfg.url.starts_with("mongodb+srv://") {
            return Err(DbError::invalid(format!("unsupported mongodb url '{}'", cfg.url)));
        }
        Self::server(&cfg.url)
    }

    #[cfg(feature = "mongodb")]
    fn server(url: &str) -> Result<Self> {
        Ok(Self { backend: Backend::Server(url.to_string()), client: OnceCell::new() })
    }

    #[cfg(not(feature = "mongodb"))]
    fn server(_url: &str) -> Result<Self> {
        Err(DbError::Unsupported {
            backend: "mongodb".to_string(),
            op: "server connections (built without the `mongodb` feature)".to_string(),
        })
    }

    async fn connect(&self) -> std::result::Result<Client, MongoError> {
        match &self.backend {
            Backend::Memory(mongo) => Ok(Arc::new(mongo.clone())),
            #[cfg(feature = "mongodb")]
            Backend::Server(url) => Ok(Arc::new(ServerMongo::connect(url).await?)),
        }
    }

    fn id_of(req: &PreparedRequest, row: &Row) -> Value {
        Value::String(join_key(&req.keys_of(row), KEY_SEP))
    }

    fn id_filter(req: &PreparedRequest, row: &Row) -> Result<Document> {
        Ok(doc! { ID: encode(&Self::id_of(req, row))? })
    }

    /// `_id` plus the input, JSON columns kept as nested documents.
    fn full_doc(req: &PreparedRequest) -> Result<Document> {
        let mut row: Row = req.object.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), v.clone())).collect();
        row.insert(ID.to_string(), Self::id_of(req, &req.object));
        document(&row)
    }

    fn decode(info: &TableInfo, doc: Document) -> Row {
        let mut row = doc_to_row(doc);
        row.remove(ID);
        for (field, value) in row.iter_mut() {
            if let (Some(ColumnType::Bool), Value::Number(n)) = (info.column_type(field), &*value) {
                *value = Value::Bool(n.as_i64().unwrap_or(0) != 0);
            }
        }
        row
    }

    async fn find(&self, client: &Client, req: &PreparedRequest, spec: FindSpec) -> Result<Vec<Row>> {
        let docs = client.find(&req.table, spec).await.map_err(|e| self.convert_error(req, e))?;
        Ok(docs.into_iter().map(|d| Self::decode(&req.info, d)).collect())
    }

    async fn select(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let mut filter = Map::new();
        for p in req.conditions.iter().chain(&req.filter.predicates) {
            filter.insert(p.field.clone(), condition(&req.info, p));
        }
        let mut sort = Document::new();
        let desc = req.native_sort.as_ref().map_or(req.options.desc, |s| s.desc);
        let dir = if desc { -1 } else { 1 };
        if let Some(s) = &req.native_sort {
            sort.insert(s.field.clone(), dir);
        }
        for key in &req.keys {
            if !sort.contains_key(key) {
                sort.insert(key.clone(), dir);
            }
        }
        let spec = FindSpec {
            filter: document(&filter)?,
            sort: Some(sort),
            skip: start_offset(req)? as u64,
            limit: req.count.filter(|c| *c > 0).map(|c| c as i64),
        };
        let rows = self.find(client, req, spec).await?;
        Ok(QueryResult::rows(req.finish(rows)))
    }

    async fn list(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        if req.list.is_empty() {
            return Ok(QueryResult::rows(Vec::new()));
        }
        let ids = req.list.iter().map(|k| encode(&Self::id_of(req, k))).collect::<Result<Vec<Bson>>>()?;
        let spec = FindSpec { filter: doc! { ID: { "$in": ids } }, ..Default::default() };
        let rows = self.find(client, req, spec).await?;
        Ok(QueryResult::rows(req.finish(rows)))
    }

    async fn update(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let mut set = Map::new();
        let mut unset = Map::new();
        for (field, value) in req.data() {
            if value.is_null() {
                unset.insert(field, Value::String(String::new()));
            } else {
                set.insert(field, value);
            }
        }
        if set.is_empty() && unset.is_empty() {
            return Ok(QueryResult::affected(0));
        }
        let mut filter = Self::id_filter(req, &req.object)?;
        if let Some(expected) = &req.options.expected {
            for (field, want) in expected {
                filter.insert(field.clone(), encode(&typed(&req.info, field, want))?);
            }
        }
        let mut update = Document::new();
        if !set.is_empty() {
            update.insert("$set", document(&set)?);
        }
        if !unset.is_empty() {
            update.insert("$unset", document(&unset)?);
        }
        let n = client
            .update_one(&req.table, filter, update, false)
            .await
            .map_err(|e| self.convert_error(req, e))?;
        Ok(QueryResult::affected(n))
    }

    async fn incr(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let update = doc! {
            "$set": document(&req.key_row())?,
            "$inc": document(&req.data())?,
        };
        let filter = Self::id_filter(req, &req.object)?;
        client
            .update_one(&req.table, filter, update, true)
            .await
            .map_err(|e| self.convert_error(req, e))?;
        Ok(QueryResult::affected(1))
    }

    async fn read_meta(&self, client: &Client, req: &PreparedRequest) -> Result<Option<TableSpec>> {
        let spec = FindSpec { filter: doc! { ID: req.table.as_str() }, limit: Some(1), ..Default::default() };
        let docs = client.find(META_COLLECTION, spec).await.map_err(|e| self.convert_error(req, e))?;
        let Some(doc) = docs.into_iter().next() else {
            return Ok(None);
        };
        let raw = doc.get_str("spec").unwrap_or("{}");
        serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| DbError::backend_code("mongodb", "codec", e, false))
    }

    async fn schema_op(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let meta_filter = doc! { ID: req.table.as_str() };
        if req.op == Op::Drop {
            client.drop_collection(&req.table).await.map_err(|e| self.convert_error(req, e))?;
            client.delete_one(META_COLLECTION, meta_filter).await.map_err(|e| self.convert_error(req, e))?;
            return Ok(QueryResult::affected(0));
        }
        let incoming: TableSpec =
            serde_json::from_value(Value::Object(req.object.clone())).map_err(|e| DbError::invalid(e.to_string()))?;
        let mut spec = self.read_meta(client, req).await?.unwrap_or_default();
        spec.columns.extend(incoming.columns.clone());

        if req.op == Op::Create {
            let keys: Document = incoming.keys().into_iter().map(|k| (k, Bson::Int32(1))).collect();
            if !keys.is_empty() {
                client
                    .create_index(&req.table, "primary", keys, false)
                    .await
                    .map_err(|e| self.convert_error(req, e))?;
            }
        }
        for name in incoming.columns.iter().filter(|(_, c)| c.index).map(|(name, _)| name) {
            client
                .create_index(&req.table, &format!("{name}_idx"), doc! { name.as_str(): 1 }, false)
                .await
                .map_err(|e| self.convert_error(req, e))?;
        }
        let raw = serde_json::to_string(&spec).map_err(|e| DbError::invalid(e.to_string()))?;
        client
            .replace_one(META_COLLECTION, meta_filter, doc! { ID: req.table.as_str(), "spec": raw })
            .await
            .map_err(|e| self.convert_error(req, e))?;
        Ok(QueryResult::affected(0))
    }
}

#[async_trait]
impl Adapter for MongoAdapter {
    type Client = Client;
    type NativeError = MongoError;

    fn kind(&self) -> &'static str {
        "mongodb"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NATIVE
    }

    async fn open(&self) -> Result<Client> {
        let client = self
            .client
            .get_or_try_init(|| self.connect())
            .await
            .map_err(|e| DbError::connect("mongodb", e))?;
        Ok(Arc::clone(client))
    }

    async fn query(&self, client: &mut Client, req: &PreparedRequest) -> Result<QueryResult> {
        match req.op {
            Op::Get => {
                let spec = FindSpec { filter: Self::id_filter(req, &req.object)?, limit: Some(1), ..Default::default() };
                let rows = self.find(client, req, spec).await?;
                Ok(QueryResult::rows(req.finish(rows)))
            }
            Op::Select => self.select(client, req).await,
            Op::List => self.list(client, req).await,
            Op::Add => {
                client
                    .insert_one(&req.table, Self::full_doc(req)?)
                    .await
                    .map_err(|e| self.convert_error(req, e))?;
                Ok(QueryResult::affected(1))
            }
            Op::Put => {
                let n = client
                    .replace_one(&req.table, Self::id_filter(req, &req.object)?, Self::full_doc(req)?)
                    .await
                    .map_err(|e| self.convert_error(req, e))?;
                Ok(QueryResult::affected(n.min(1)))
            }
            Op::Update => self.update(client, req).await,
            Op::Incr => self.incr(client, req).await,
            Op::Del => {
                let mut filter = Self::id_filter(req, &req.object)?;
                if let Some(expected) = &req.options.expected {
                    for (field, want) in expected {
                        filter.insert(field.clone(), encode(want)?);
                    }
                }
                let n = client.delete_one(&req.table, filter).await.map_err(|e| self.convert_error(req, e))?;
                Ok(QueryResult::affected(n))
            }
            Op::Create | Op::Upgrade | Op::Drop => self.schema_op(client, req).await,
        }
    }

    async fn cache_columns(&self, client: &mut Client) -> Result<HashMap<String, TableInfo>> {
        let docs = client
            .find(META_COLLECTION, FindSpec::default())
            .await
            .map_err(|e| DbError::backend("mongodb", e))?;
        let mut tables = HashMap::new();
        for doc in docs {
            let (Ok(table), Ok(raw)) = (doc.get_str(ID), doc.get_str("spec")) else {
                continue;
            };
            let spec: TableSpec =
                serde_json::from_str(raw).map_err(|e| DbError::backend_code("mongodb", "codec", e, false))?;
            tables.insert(table.to_string(), spec.to_info());
        }
        Ok(tables)
    }

    fn convert_error(&self, req: &PreparedRequest, err: MongoError) -> DbError {
        match err {
            MongoError::Server { code: DUPLICATE_KEY, .. } if matches!(req.op, Op::Add | Op::Incr) => {
                DbError::AlreadyExists { table: req.table.clone() }
            }
            MongoError::Io(message) => DbError::Connect { backend: "mongodb".into(), message },
            MongoError::Server { code, message } => {
                // WriteConflict, interrupted, not primary
                let transient = matches!(code, 112 | 11600 | 11602 | 10107 | 13435 | 189 | 91);
                DbError::backend_code("mongodb", code, message, transient)
            }
        }
    }
}
