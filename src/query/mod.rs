//! Filter conditions handed to the index by the table engine.

pub mod matcher;

use std::fmt;

use crate::schema::Value;

pub use matcher::{KeyFilter, KeyMatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Equal,
    NotEqual,
    In,
    NotIn,
    Lt,
    Le,
    Gt,
    Ge,
    Range,
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterMode::Equal => "=",
            FilterMode::NotEqual => "!=",
            FilterMode::In => "in",
            FilterMode::NotIn => "nin",
            FilterMode::Lt => "<",
            FilterMode::Le => "<=",
            FilterMode::Gt => ">",
            FilterMode::Ge => ">=",
            FilterMode::Range => "rg",
        };
        f.write_str(s)
    }
}

/// A single condition on one field.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub mode: FilterMode,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, mode: FilterMode, value: Value) -> Self {
        Self {
            field: field.into(),
            mode,
            value,
        }
    }
}

/// A tree of conditions.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Leaf(Filter),
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
}

impl FilterNode {
    pub fn leaf(field: impl Into<String>, mode: FilterMode, value: Value) -> Self {
        FilterNode::Leaf(Filter::new(field, mode, value))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, FilterNode::Leaf(_))
    }

    /// Visits every leaf in the tree.
    pub fn leaves(&self) -> Vec<&Filter> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Filter>) {
        match self {
            FilterNode::Leaf(f) => out.push(f),
            FilterNode::And(children) | FilterNode::Or(children) => {
                for c in children {
                    c.collect_leaves(out);
                }
            }
        }
    }
}

impl fmt::Display for FilterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterNode::Leaf(l) => write!(f, "{} {} {:?}", l.field, l.mode, l.value),
            FilterNode::And(c) | FilterNode::Or(c) => {
                let sep = if matches!(self, FilterNode::And(_)) { " AND " } else { " OR " };
                write!(f, "(")?;
                for (i, child) in c.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    write!(f, "{child}")?;
                }
                write!(f, ")")
            }
        }
    }
}
