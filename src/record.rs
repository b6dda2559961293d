// Row mapping for reference tables and literal values bound into queries

use crate::models::{Shop, UrgencyCategory, User, WorkCategory};
use rusqlite::Row;
use rusqlite::types::{ToSql, ToSqlOutput};

/// Reference data the store can fetch generically by id
pub trait Record: Sized + Clone + Send + 'static {
    /// Human-readable kind, used in "not found" errors
    fn kind() -> &'static str;

    /// SELECT statement (without WHERE) producing the columns `from_row` reads
    fn select_sql() -> &'static str;

    /// Qualified id column used to look up a single row
    fn id_column() -> &'static str;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

impl Record for UrgencyCategory {
    fn kind() -> &'static str {
        "urgency category"
    }

    fn select_sql() -> &'static str {
        "SELECT id, name, default_days FROM urgency_categories"
    }

    fn id_column() -> &'static str {
        "id"
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            default_days: row.get(2)?,
        })
    }
}

impl Record for Shop {
    fn kind() -> &'static str {
        "shop"
    }

    fn select_sql() -> &'static str {
        "SELECT id, name, manager_id FROM shops"
    }

    fn id_column() -> &'static str {
        "id"
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            manager_id: row.get(2)?,
        })
    }
}

impl Record for WorkCategory {
    fn kind() -> &'static str {
        "work category"
    }

    fn select_sql() -> &'static str {
        "SELECT id, name FROM work_categories"
    }

    fn id_column() -> &'static str {
        "id"
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    }
}

impl Record for User {
    fn kind() -> &'static str {
        "user"
    }

    fn select_sql() -> &'static str {
        "SELECT u.id, u.login, ro.name FROM users u JOIN roles ro ON ro.id = u.role_id"
    }

    fn id_column() -> &'static str {
        "u.id"
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            login: row.get(1)?,
            role_name: row.get(2)?,
        })
    }
}

/// Literal operand of a predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl ToSql for Literal {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Literal::Text(s) => s.to_sql(),
            Literal::Int(i) => i.to_sql(),
            Literal::Bool(b) => b.to_sql(),
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::Text(value.to_string())
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Int(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::Text(s) => write!(f, "{}", s),
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Bool(b) => write!(f, "{}", b),
        }
    }
}
