// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! No-op adapter: every read is empty, every write affects nothing.

use std::collections::HashMap;

use async_trait::async_trait;

use super::Adapter;
use crate::error::{DbError, Result};
use crate::request::{Capabilities, PreparedRequest, QueryResult};
use crate::schema::TableInfo;

#[derive(Debug, Clone, Copy, Default)]
pub struct NoneAdapter;

#[async_trait]
impl Adapter for NoneAdapter {
    type Client = ();
    type NativeError = std::convert::Infallible;

    fn kind(&self) -> &'static str {
        "none"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NATIVE
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn query(&self, _client: &mut (), req: &PreparedRequest) -> Result<QueryResult> {
        if req.op.is_write() {
            return Ok(QueryResult::affected(0));
        }
        Ok(QueryResult::empty())
    }

    async fn cache_columns(&self, _client: &mut ()) -> Result<HashMap<String, TableInfo>> {
        Ok(HashMap::new())
    }

    fn convert_error(&self, _req: &PreparedRequest, err: Self::NativeError) -> DbError {
        match err {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{prepare, Op, Request};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_none_answers_empty() {
        let a = NoneAdapter;
        let info = Arc::new(TableInfo::unknown());
        let get = prepare(&Request::new(Op::Get, "t", json!({"id": 1})), info.clone(), &a.capabilities()).unwrap();
        assert!(a.query(&mut (), &get).await.unwrap().rows.is_empty());

        let put = prepare(&Request::new(Op::Put, "t", json!({"id": 1})), info, &a.capabilities()).unwrap();
        assert_eq!(a.query(&mut (), &put).await.unwrap().affected_rows(), 0);
    }
}
