//! Constraint and ORDER BY pushdown.
//!
//! [`compile`] is a pure function over a [`ScanRequest`], so the planning
//! rules can be tested without SQLite. `best_index` converts the host's
//! `IndexInfo` into a request and writes the resulting [`ScanPlan`] back.

use rusqlite::vtab::{IndexConstraintOp, IndexInfo};
use std::ffi::c_int;

use super::table::{quote_identifier, TableDescriptor};

/// Comparison operator of a host constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Like,
    /// Anything the remote side is not asked to evaluate.
    Other,
}

impl ConstraintOp {
    pub fn from_sqlite(op: IndexConstraintOp) -> Self {
        match op {
            IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ => ConstraintOp::Eq,
            IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GT => ConstraintOp::Gt,
            IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LE => ConstraintOp::Le,
            IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LT => ConstraintOp::Lt,
            IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GE => ConstraintOp::Ge,
            IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LIKE => ConstraintOp::Like,
            _ => ConstraintOp::Other,
        }
    }

    fn as_sql(&self) -> Option<&'static str> {
        match self {
            ConstraintOp::Eq => Some("="),
            ConstraintOp::Gt => Some(">"),
            ConstraintOp::Le => Some("<="),
            ConstraintOp::Lt => Some("<"),
            ConstraintOp::Ge => Some(">="),
            ConstraintOp::Like => Some("LIKE"),
            ConstraintOp::Other => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstraintSpec {
    /// Host column index; `-1` is the rowid.
    pub column: i32,
    pub op: ConstraintOp,
    pub usable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTerm {
    pub column: i32,
    pub desc: bool,
}

/// What the host asks of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRequest {
    pub constraints: Vec<ConstraintSpec>,
    pub order_by: Vec<OrderTerm>,
}

impl ScanRequest {
    pub fn from_index_info(info: &IndexInfo) -> Self {
        let constraints = info
            .constraints()
            .map(|c| ConstraintSpec {
                column: c.column(),
                op: ConstraintOp::from_sqlite(c.operator()),
                usable: c.is_usable(),
            })
            .collect();
        let order_by = info
            .order_bys()
            .map(|o| OrderTerm {
                column: o.column(),
                desc: o.is_order_by_desc(),
            })
            .collect();
        Self {
            constraints,
            order_by,
        }
    }
}

/// A compiled remote scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    /// Remote SQL with `@argN` placeholders.
    pub sql: String,
    /// Placeholder index claimed for each constraint, in request order.
    pub claims: Vec<Option<usize>>,
    pub order_by_consumed: bool,
    pub estimated_rows: i64,
    pub estimated_cost: f64,
}

impl ScanPlan {
    pub fn claimed(&self) -> usize {
        self.claims.iter().filter(|c| c.is_some()).count()
    }

    /// Report the plan to SQLite. The SQL text travels as `idx_str`.
    pub fn apply(&self, info: &mut IndexInfo) {
        for (i, claim) in self.claims.iter().enumerate() {
            if let Some(argv) = claim {
                let mut usage = info.constraint_usage(i);
                usage.set_argv_index(*argv as c_int);
                usage.set_omit(true);
            }
        }
        if self.order_by_consumed {
            info.set_order_by_consumed(true);
        }
        info.set_idx_num(self.claimed() as c_int);
        info.set_idx_str(&self.sql);
        info.set_estimated_rows(self.estimated_rows);
        info.set_estimated_cost(self.estimated_cost);
    }
}

fn column_name(table: &TableDescriptor, column: i32) -> Option<&str> {
    usize::try_from(column)
        .ok()
        .and_then(|i| table.column_names.get(i))
        .map(String::as_str)
}

/// Compile a scan request against a table. Never fails: anything that cannot
/// be pushed down is simply left for the host.
pub fn compile(table: &TableDescriptor, request: &ScanRequest) -> ScanPlan {
    let mut sql = table.base_select();

    let mut terms: Vec<String> = Vec::new();
    let claims: Vec<Option<usize>> = request
        .constraints
        .iter()
        .map(|c| {
            let name = column_name(table, c.column)?;
            let op = c.op.as_sql()?;
            if !c.usable {
                return None;
            }
            let argv = terms.len() + 1;
            terms.push(format!("{} {op} @arg{argv}", quote_identifier(name)));
            Some(argv)
        })
        .collect();
    if !terms.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&terms.join(" AND "));
    }

    // All or nothing.
    let order: Option<Vec<String>> = request
        .order_by
        .iter()
        .map(|term| {
            column_name(table, term.column).map(|name| {
                let quoted = quote_identifier(name);
                if term.desc {
                    format!("{quoted} DESC")
                } else {
                    quoted
                }
            })
        })
        .collect();
    let order_by_consumed = match order {
        Some(order) if !order.is_empty() => {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
            true
        }
        _ => false,
    };

    let estimated_rows = table.initial_row_count / (terms.len() as i64 + 1);
    ScanPlan {
        sql,
        claims,
        order_by_consumed,
        estimated_rows,
        estimated_cost: estimated_rows as f64,
    }
}
