// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Structured CQL statements.
//!
//! The adapter builds [`CqlStatement`] values; a server session renders them
//! to CQL text with [`CqlStatement::render`], the in-process session
//! interprets them directly.

use serde_json::Value;

use crate::request::Row;
use crate::schema::{ColumnSpec, ColumnType, TableSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }

    #[must_use]
    pub fn holds(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Greater, Less};
        match self {
            Self::Gt => ord == Greater,
            Self::Ge => ord != Less,
            Self::Lt => ord == Less,
            Self::Le => ord != Greater,
        }
    }
}

/// One `WHERE` relation. Only shapes valid on a primary key are built.
#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    Eq(String, Value),
    In(String, Vec<Value>),
    /// Single clustering column slice.
    Cmp(String, CmpOp, Value),
    /// Multi-column clustering slice: `(a, b) > (?, ?)`.
    Tuple(Vec<String>, CmpOp, Vec<Value>),
    /// `token(p) > token(?)`
    TokenAfter(String, Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Set(String, Value),
    /// `c = c + ?`
    Add(String, Value),
}

/// Lightweight-transaction condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    None,
    Exists,
    NotExists,
    Equals(Row),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CqlStatement {
    Select {
        table: String,
        relations: Vec<Relation>,
        /// Clustering order; `true` for `ORDER BY <first clustering> DESC`.
        order: Option<(String, bool)>,
        limit: Option<usize>,
    },
    Insert {
        table: String,
        row: Row,
        condition: Condition,
    },
    Update {
        table: String,
        keys: Row,
        assignments: Vec<Assignment>,
        condition: Condition,
    },
    Delete {
        table: String,
        keys: Row,
        condition: Condition,
    },
    Create {
        table: String,
        spec: TableSpec,
    },
    AddColumns {
        table: String,
        spec: TableSpec,
    },
    Drop {
        table: String,
    },
}

/// Quote an identifier so names are used case-sensitively.
#[must_use]
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[must_use]
pub fn cql_type(col: &ColumnSpec) -> &'static str {
    match col.kind {
        ColumnType::Text | ColumnType::Json => "text",
        ColumnType::Int => "bigint",
        ColumnType::Real => "double",
        ColumnType::Bool => "boolean",
        ColumnType::Counter => "counter",
    }
}

struct Render {
    cql: String,
    values: Vec<Value>,
}

impl Render {
    fn push(&mut self, s: &str) {
        self.cql.push_str(s);
    }

    fn bind(&mut self, v: &Value) {
        self.values.push(v.clone());
        self.cql.push('?');
    }

    fn list(&mut self, items: &[Value]) {
        for (i, v) in items.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.bind(v);
        }
    }

    fn relations(&mut self, relations: &[Relation]) {
        for (i, rel) in relations.iter().enumerate() {
            self.push(if i == 0 { " WHERE " } else { " AND " });
            match rel {
                Relation::Eq(col, v) => {
                    self.push(&format!("{} = ", quote(col)));
                    self.bind(v);
                }
                Relation::In(col, items) => {
                    self.push(&format!("{} IN (", quote(col)));
                    self.list(items);
                    self.push(")");
                }
                Relation::Cmp(col, op, v) => {
                    self.push(&format!("{} {} ", quote(col), op.as_str()));
                    self.bind(v);
                }
                Relation::Tuple(cols, op, values) => {
                    let cols: Vec<String> = cols.iter().map(|c| quote(c)).collect();
                    self.push(&format!("({}) {} (", cols.join(", "), op.as_str()));
                    self.list(values);
                    self.push(")");
                }
                Relation::TokenAfter(col, v) => {
                    self.push(&format!("token({}) > token(", quote(col)));
                    self.bind(v);
                    self.push(")");
                }
            }
        }
    }

    fn keys(&mut self, keys: &Row) {
        let relations: Vec<Relation> = keys.iter().map(|(k, v)| Relation::Eq(k.clone(), v.clone())).collect();
        self.relations(&relations);
    }

    fn condition(&mut self, condition: &Condition) {
        match condition {
            Condition::None => {}
            Condition::Exists => self.push(" IF EXISTS"),
            Condition::NotExists => self.push(" IF NOT EXISTS"),
            Condition::Equals(expected) => {
                for (i, (col, v)) in expected.iter().enumerate() {
                    self.push(if i == 0 { " IF " } else { " AND " });
                    self.push(&format!("{} = ", quote(col)));
                    self.bind(v);
                }
            }
        }
    }
}

fn column_defs(spec: &TableSpec) -> Vec<String> {
    spec.columns
        .iter()
        .map(|(name, col)| format!("{} {}", quote(name), cql_type(col)))
        .collect()
}

impl CqlStatement {
    /// CQL text and bound values in placeholder order. Schema changes may
    /// expand to several statements.
    #[must_use]
    pub fn render(&self) -> Vec<(String, Vec<Value>)> {
        let mut r = Render { cql: String::new(), values: Vec::new() };
        match self {
            Self::Select { table, relations, order, limit } => {
                r.push(&format!("SELECT * FROM {}", quote(table)));
                r.relations(relations);
                if let Some((col, desc)) = order {
                    r.push(&format!(" ORDER BY {} {}", quote(col), if *desc { "DESC" } else { "ASC" }));
                }
                if let Some(n) = limit {
                    r.push(&format!(" LIMIT {n}"));
                }
            }
            Self::Insert { table, row, condition } => {
                let cols: Vec<String> = row.keys().map(|c| quote(c)).collect();
                r.push(&format!("INSERT INTO {} ({}) VALUES (", quote(table), cols.join(", ")));
                let values: Vec<Value> = row.values().cloned().collect();
                r.list(&values);
                r.push(")");
                r.condition(condition);
            }
            Self::Update { table, keys, assignments, condition } => {
                r.push(&format!("UPDATE {} SET ", quote(table)));
                for (i, a) in assignments.iter().enumerate() {
                    if i > 0 {
                        r.push(", ");
                    }
                    match a {
                        Assignment::Set(col, v) => {
                            r.push(&format!("{} = ", quote(col)));
                            r.bind(v);
                        }
                        Assignment::Add(col, v) => {
                            r.push(&format!("{0} = {0} + ", quote(col)));
                            r.bind(v);
                        }
                    }
                }
                r.keys(keys);
                r.condition(condition);
            }
            Self::Delete { table, keys, condition } => {
                r.push(&format!("DELETE FROM {}", quote(table)));
                r.keys(keys);
                r.condition(condition);
            }
            Self::Create { table, spec } => {
                let keys: Vec<String> = spec.to_info().keys.iter().map(|k| quote(k)).collect();
                let (partition, clustering) = keys.split_first().map_or((String::new(), &[][..]), |(p, c)| (p.clone(), c));
                let mut pk = format!("({partition})");
                for c in clustering {
                    pk.push_str(", ");
                    pk.push_str(c);
                }
                let mut defs = column_defs(spec);
                defs.push(format!("PRIMARY KEY ({pk})"));
                r.push(&format!("CREATE TABLE IF NOT EXISTS {} ({})", quote(table), defs.join(", ")));
            }
            Self::AddColumns { table, spec } => {
                return column_defs(spec)
                    .into_iter()
                    .map(|def| (format!("ALTER TABLE {} ADD {def}", quote(table)), Vec::new()))
                    .collect();
            }
            Self::Drop { table } => {
                r.push(&format!("DROP TABLE IF EXISTS {}", quote(table)));
            }
        }
        vec![(r.cql, r.values)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_resume_select() {
        let stmt = CqlStatement::Select {
            table: "messages".into(),
            relations: vec![
                Relation::Eq("account_id".into(), json!("a")),
                Relation::Tuple(vec!["mtime".into()], CmpOp::Gt, vec![json!(10)]),
            ],
            order: Some(("mtime".into(), true)),
            limit: Some(10),
        };
        let (cql, values) = stmt.render().remove(0);
        assert_eq!(
            cql,
            "SELECT * FROM \"messages\" WHERE \"account_id\" = ? AND (\"mtime\") > (?) ORDER BY \"mtime\" DESC LIMIT 10"
        );
        assert_eq!(values, vec![json!("a"), json!(10)]);
    }

    #[test]
    fn test_render_lwt_update() {
        let keys: Row = serde_json::from_value(json!({"id": "1"})).unwrap();
        let expected: Row = serde_json::from_value(json!({"status": "new"})).unwrap();
        let stmt = CqlStatement::Update {
            table: "t".into(),
            keys,
            assignments: vec![Assignment::Set("status".into(), json!("done")), Assignment::Add("n".into(), json!(1))],
            condition: Condition::Equals(expected),
        };
        let (cql, values) = stmt.render().remove(0);
        assert_eq!(
            cql,
            "UPDATE \"t\" SET \"status\" = ?, \"n\" = \"n\" + ? WHERE \"id\" = ? IF \"status\" = ?"
        );
        assert_eq!(values.len(), 4);
    }

    #[test]
    fn test_render_create() {
        let spec = TableSpec::new()
            .primary("account_id", ColumnType::Text)
            .primary("mtime", ColumnType::Int)
            .column("hits", ColumnType::Counter);
        let (cql, _) = CqlStatement::Create { table: "m".into(), spec }.render().remove(0);
        assert_eq!(
            cql,
            "CREATE TABLE IF NOT EXISTS \"m\" (\"account_id\" text, \"hits\" counter, \"mtime\" bigint, \
             PRIMARY KEY ((\"account_id\"), \"mtime\"))"
        );
    }

    #[test]
    fn test_cmp_holds() {
        use std::cmp::Ordering;
        assert!(CmpOp::Gt.holds(Ordering::Greater));
        assert!(!CmpOp::Gt.holds(Ordering::Equal));
        assert!(CmpOp::Ge.holds(Ordering::Equal));
        assert!(CmpOp::Le.holds(Ordering::Less));
    }
}
