use crate::catalog::types::Value;
use crate::error::TtlError;
use serde::{Deserialize, Serialize};

/// Maximum nesting depth for expressions to prevent stack overflow
const MAX_EXPR_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expr {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    In(String, Vec<Value>),
    Between(String, Value, Value),
    IsNull(String),
    IsNotNull(String),
    Like(String, String),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn eq(column: &str, value: Value) -> Expr {
        Expr::Eq(column.to_string(), value)
    }

    pub fn and(self, rhs: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    pub fn depth(&self) -> usize {
        match self {
            Expr::Eq(_, _)
            | Expr::Ne(_, _)
            | Expr::Lt(_, _)
            | Expr::Lte(_, _)
            | Expr::Gt(_, _)
            | Expr::Gte(_, _)
            | Expr::In(_, _)
            | Expr::Between(_, _, _)
            | Expr::IsNull(_)
            | Expr::IsNotNull(_)
            | Expr::Like(_, _) => 1,
            Expr::Not(inner) => 1 + inner.depth(),
            Expr::And(left, right) | Expr::Or(left, right) => 1 + left.depth().max(right.depth()),
        }
    }

    pub fn validate_depth(&self) -> Result<(), TtlError> {
        let depth = self.depth();
        if depth > MAX_EXPR_DEPTH {
            return Err(TtlError::Validation(format!(
                "expression depth {depth} exceeds maximum allowed depth of {MAX_EXPR_DEPTH}"
            )));
        }
        Ok(())
    }
}

/// Row locks a read takes on the rows it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadLock {
    #[default]
    None,
    /// `FOR SHARE`
    Share,
    /// `FOR UPDATE`
    Update,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    pub predicate: Option<Expr>,
    pub lock: ReadLock,
    pub limit: Option<usize>,
}

impl Select {
    pub fn from(table: &str) -> Self {
        Self {
            table: table.to_string(),
            predicate: None,
            lock: ReadLock::None,
            limit: None,
        }
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn for_share(mut self) -> Self {
        self.lock = ReadLock::Share;
        self
    }

    pub fn for_update(mut self) -> Self {
        self.lock = ReadLock::Update;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

/// `SET` clause of an UPDATE or upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Set(String, Value),
    /// `col = col + n` on an integer column.
    Add(String, i64),
    /// `col = SYSDATE()`, the statement's clock instant.
    SetNow(String),
}

impl Assignment {
    pub fn column(&self) -> &str {
        match self {
            Assignment::Set(c, _) | Assignment::Add(c, _) | Assignment::SetNow(c) => c,
        }
    }
}
