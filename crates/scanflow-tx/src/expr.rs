//! Shared expression types for `Sort`/`Top` (a sort expression list) and
//! `NestedLoopJoin` (a single equality key pair).
//!
//! Grounded on `s3filter/op/sort.py`'s `SortExpression` (`col_index`,
//! `col_type`, `sort_order`, `col_name`).

use scanflow_core::scalar::ColType;

/// Identifies a column either by its header name or by its fixed
/// position, matching the original's `col_index` (which was, despite the
/// name, usually a column *name* against a pandas-style header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    Name(String),
    Index(usize),
}

impl ColumnRef {
    pub fn resolve(&self, header: &[String]) -> Option<usize> {
        match self {
            ColumnRef::Name(n) => header.iter().position(|h| h == n),
            ColumnRef::Index(i) => {
                if *i < header.len() {
                    Some(*i)
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// One `ORDER BY`-style expression: which column, how to cast it before
/// comparing, and in which direction.
#[derive(Debug, Clone)]
pub struct SortExpr {
    pub column: ColumnRef,
    pub col_type: ColType,
    pub order: Order,
    pub display_name: Option<String>,
}

impl SortExpr {
    pub fn new(column: ColumnRef, col_type: ColType, order: Order) -> Self {
        Self {
            column,
            col_type,
            order,
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// A single equality join key pair, left column against right column.
#[derive(Debug, Clone)]
pub struct JoinExpr {
    pub left: ColumnRef,
    pub right: ColumnRef,
}

impl JoinExpr {
    pub fn new(left: ColumnRef, right: ColumnRef) -> Self {
        Self { left, right }
    }
}
