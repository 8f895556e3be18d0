// ============================================================================
// Operations and their read/write classification
// ============================================================================

use crate::core::Value;
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::fmt;

/// Whether an operation may change database state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
}

impl OperationKind {
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// A single statement about to be sent to a pool.
///
/// The kind is not stored: `classify` runs again on every dispatch.
#[derive(Debug, Clone)]
pub struct Operation {
    sql: String,
    params: Vec<Value>,
    kind_override: Option<OperationKind>,
}

impl Operation {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            kind_override: None,
        }
    }

    /// Append a positional parameter (`$1`, `$2`, ...).
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Force the classification, for statements the parser cannot judge
    /// (function calls with side effects, vendor syntax).
    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind_override = Some(kind);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Classify the statement. Anything that does not parse as a plain query
    /// counts as a write.
    pub fn classify(&self) -> OperationKind {
        if let Some(kind) = self.kind_override {
            return kind;
        }

        let statements = match Parser::parse_sql(&PostgreSqlDialect {}, &self.sql) {
            Ok(statements) if !statements.is_empty() => statements,
            _ => return OperationKind::Write,
        };

        let read_only = statements.iter().all(|stmt| match stmt {
            Statement::Query(query) => query_is_read_only(query),
            _ => false,
        });

        if read_only {
            OperationKind::Read
        } else {
            OperationKind::Write
        }
    }
}

impl From<&str> for Operation {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Operation {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

fn query_is_read_only(query: &Query) -> bool {
    if !query.locks.is_empty() {
        return false;
    }

    if let Some(with) = &query.with {
        if !with.cte_tables.iter().all(|cte| query_is_read_only(&cte.query)) {
            return false;
        }
    }

    set_expr_is_read_only(&query.body)
}

fn set_expr_is_read_only(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => query_is_read_only(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_is_read_only(left) && set_expr_is_read_only(right)
        }
        SetExpr::Values(_) | SetExpr::Table(_) => true,
        _ => false,
    }
}
