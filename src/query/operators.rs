use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Row, Value};
use crate::error::TtlError;
use crate::query::plan::{Assignment, Expr};

/// Predicate with column names resolved to positions.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledExpr {
    Eq(usize, Value),
    Ne(usize, Value),
    Lt(usize, Value),
    Lte(usize, Value),
    Gt(usize, Value),
    Gte(usize, Value),
    In(usize, Vec<Value>),
    Between(usize, Value, Value),
    IsNull(usize),
    IsNotNull(usize),
    Like(usize, String),
    And(Box<CompiledExpr>, Box<CompiledExpr>),
    Or(Box<CompiledExpr>, Box<CompiledExpr>),
    Not(Box<CompiledExpr>),
}

pub fn compile_expr(expr: &Expr, schema: &TableSchema) -> Result<CompiledExpr, TtlError> {
    expr.validate_depth()?;
    compile(expr, schema)
}

fn compile(expr: &Expr, schema: &TableSchema) -> Result<CompiledExpr, TtlError> {
    let col = |c: &str| find_col_idx(schema, c);
    Ok(match expr {
        Expr::Eq(c, v) => CompiledExpr::Eq(col(c)?, v.clone()),
        Expr::Ne(c, v) => CompiledExpr::Ne(col(c)?, v.clone()),
        Expr::Lt(c, v) => CompiledExpr::Lt(col(c)?, v.clone()),
        Expr::Lte(c, v) => CompiledExpr::Lte(col(c)?, v.clone()),
        Expr::Gt(c, v) => CompiledExpr::Gt(col(c)?, v.clone()),
        Expr::Gte(c, v) => CompiledExpr::Gte(col(c)?, v.clone()),
        Expr::In(c, values) => CompiledExpr::In(col(c)?, values.clone()),
        Expr::Between(c, lo, hi) => CompiledExpr::Between(col(c)?, lo.clone(), hi.clone()),
        Expr::IsNull(c) => CompiledExpr::IsNull(col(c)?),
        Expr::IsNotNull(c) => CompiledExpr::IsNotNull(col(c)?),
        Expr::Like(c, pattern) => CompiledExpr::Like(col(c)?, pattern.clone()),
        Expr::And(a, b) => {
            CompiledExpr::And(Box::new(compile(a, schema)?), Box::new(compile(b, schema)?))
        }
        Expr::Or(a, b) => {
            CompiledExpr::Or(Box::new(compile(a, schema)?), Box::new(compile(b, schema)?))
        }
        Expr::Not(inner) => CompiledExpr::Not(Box::new(compile(inner, schema)?)),
    })
}

/// Evaluates a predicate; `None` matches every row.
pub fn matches(expr: Option<&CompiledExpr>, row: &Row) -> bool {
    expr.is_none_or(|e| eval_compiled_expr(e, row))
}

pub fn eval_compiled_expr(expr: &CompiledExpr, row: &Row) -> bool {
    match expr {
        CompiledExpr::Eq(idx, v) => {
            get_col(row, *idx).is_some_and(|rv| compare_values(rv, v).is_some_and(|o| o.is_eq()))
        }
        CompiledExpr::Ne(idx, v) => {
            get_col(row, *idx).is_some_and(|rv| compare_values(rv, v).is_some_and(|o| !o.is_eq()))
        }
        CompiledExpr::Lt(idx, v) => {
            get_col(row, *idx).is_some_and(|rv| compare_values(rv, v).is_some_and(|o| o.is_lt()))
        }
        CompiledExpr::Lte(idx, v) => {
            get_col(row, *idx).is_some_and(|rv| compare_values(rv, v).is_some_and(|o| o.is_le()))
        }
        CompiledExpr::Gt(idx, v) => {
            get_col(row, *idx).is_some_and(|rv| compare_values(rv, v).is_some_and(|o| o.is_gt()))
        }
        CompiledExpr::Gte(idx, v) => {
            get_col(row, *idx).is_some_and(|rv| compare_values(rv, v).is_some_and(|o| o.is_ge()))
        }
        CompiledExpr::In(idx, values) => get_col(row, *idx).is_some_and(|rv| {
            values
                .iter()
                .any(|v| compare_values(rv, v).is_some_and(|o| o.is_eq()))
        }),
        CompiledExpr::Between(idx, lo, hi) => get_col(row, *idx).is_some_and(|rv| {
            compare_values(rv, lo).is_some_and(|o| o.is_ge())
                && compare_values(rv, hi).is_some_and(|o| o.is_le())
        }),
        CompiledExpr::IsNull(idx) => get_col(row, *idx).is_some_and(Value::is_null),
        CompiledExpr::IsNotNull(idx) => get_col(row, *idx).is_some_and(|rv| !rv.is_null()),
        CompiledExpr::Like(idx, pattern) => get_col(row, *idx).is_some_and(|rv| match rv {
            Value::Text(s) => like_match(s, pattern),
            _ => false,
        }),
        CompiledExpr::And(a, b) => eval_compiled_expr(a, row) && eval_compiled_expr(b, row),
        CompiledExpr::Or(a, b) => eval_compiled_expr(a, row) || eval_compiled_expr(b, row),
        CompiledExpr::Not(inner) => !eval_compiled_expr(inner, row),
    }
}

/// Column positions and actions of a `SET` clause, checked against the schema.
#[derive(Debug, Clone)]
pub struct CompiledAssignments {
    items: Vec<(usize, Assignment)>,
}

impl CompiledAssignments {
    pub fn compile(assignments: &[Assignment], schema: &TableSchema) -> Result<Self, TtlError> {
        let mut items = Vec::with_capacity(assignments.len());
        for a in assignments {
            let idx = find_col_idx(schema, a.column())?;
            if schema.primary_key.iter().any(|pk| pk == a.column()) {
                return Err(TtlError::Validation(format!(
                    "primary key column '{}' of table '{}' cannot be updated",
                    a.column(),
                    schema.table_name
                )));
            }
            items.push((idx, a.clone()));
        }
        Ok(Self { items })
    }

    /// Applies the assignments to a copy of `row`. `now` feeds `SetNow`.
    pub fn apply(&self, row: &Row, now: i64, schema: &TableSchema) -> Result<Row, TtlError> {
        let mut out = row.clone();
        for (idx, assignment) in &self.items {
            let next = match assignment {
                Assignment::Set(_, v) => v.clone(),
                Assignment::SetNow(_) => Value::Timestamp(now),
                Assignment::Add(column, delta) => match &out.values[*idx] {
                    Value::Integer(v) => Value::Integer(v.saturating_add(*delta)),
                    Value::Null => Value::Null,
                    other => {
                        return Err(TtlError::TypeMismatch {
                            table: schema.table_name.clone(),
                            column: column.clone(),
                            expected: "INTEGER".into(),
                            actual: other
                                .column_type()
                                .map(|t| t.to_string())
                                .unwrap_or_default(),
                        });
                    }
                },
            };
            out.values[*idx] = next;
        }
        schema.validate_row(&out)?;
        Ok(out)
    }
}

fn find_col_idx(schema: &TableSchema, col: &str) -> Result<usize, TtlError> {
    schema
        .column_index(col)
        .ok_or_else(|| TtlError::UnknownColumn {
            table: schema.table_name.clone(),
            column: col.to_string(),
        })
}

fn get_col(row: &Row, idx: usize) -> Option<&Value> {
    row.values.get(idx)
}

fn like_match(value: &str, pattern: &str) -> bool {
    let text = value.as_bytes();
    let pat = pattern.as_bytes();
    let mut ti = 0usize;
    let mut pi = 0usize;
    let mut star_pi: Option<usize> = None;
    let mut star_ti = 0usize;

    while ti < text.len() {
        if pi < pat.len() && (pat[pi] == b'_' || pat[pi] == text[ti]) {
            ti += 1;
            pi += 1;
            continue;
        }
        if pi < pat.len() && pat[pi] == b'%' {
            star_pi = Some(pi);
            pi += 1;
            star_ti = ti;
            continue;
        }
        if let Some(saved_pi) = star_pi {
            pi = saved_pi + 1;
            star_ti += 1;
            ti = star_ti;
            continue;
        }
        return false;
    }

    while pi < pat.len() && pat[pi] == b'%' {
        pi += 1;
    }

    pi == pat.len()
}

fn compare_values(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Timestamp(a), Value::Integer(b)) => a.partial_cmp(b),
        (Value::Integer(a), Value::Timestamp(b)) => a.partial_cmp(b),
        _ => Some(left.cmp(right)),
    }
}
