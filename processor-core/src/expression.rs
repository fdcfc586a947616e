//! Selection expressions a filter applies to source-data metadata.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
    Contains,
    /// Value is a comma separated list.
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExpressionItem {
    Operator(ExpressionOperator),
    Term(ExpressionTerm),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionOperator {
    pub op: Op,
    pub enabled: bool,
    pub children: Vec<ExpressionItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionTerm {
    pub field: String,
    pub condition: Condition,
    pub value: String,
    pub enabled: bool,
}

/// Anything whose fields an expression can be evaluated against.
pub trait FieldSource {
    fn field(&self, name: &str) -> Option<String>;
}

impl ExpressionOperator {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            enabled: true,
            children: Vec::new(),
        }
    }

    pub fn and() -> Self {
        Self::new(Op::And)
    }

    pub fn with_term(mut self, field: &str, condition: Condition, value: impl Into<String>) -> Self {
        self.children.push(ExpressionItem::Term(ExpressionTerm {
            field: field.to_string(),
            condition,
            value: value.into(),
            enabled: true,
        }));
        self
    }

    pub fn with_operator(mut self, operator: ExpressionOperator) -> Self {
        self.children.push(ExpressionItem::Operator(operator));
        self
    }

    /// Enabled terms anywhere below this operator. Zero means the expression selects everything.
    pub fn term_count(&self) -> usize {
        if !self.enabled {
            return 0;
        }
        self.children
            .iter()
            .map(|child| match child {
                ExpressionItem::Operator(op) => op.term_count(),
                ExpressionItem::Term(term) => usize::from(term.enabled),
            })
            .sum()
    }

    pub fn matches(&self, source: &impl FieldSource) -> bool {
        if !self.enabled {
            return true;
        }
        let mut results = self.children.iter().filter_map(|child| match child {
            ExpressionItem::Operator(op) if op.enabled => Some(op.matches(source)),
            ExpressionItem::Term(term) if term.enabled => Some(term.matches(source)),
            _ => None,
        });
        match self.op {
            Op::And => results.all(|r| r),
            Op::Or => {
                let results: Vec<bool> = results.collect();
                results.is_empty() || results.into_iter().any(|r| r)
            }
            Op::Not => !results.all(|r| r),
        }
    }
}

impl ExpressionTerm {
    fn matches(&self, source: &impl FieldSource) -> bool {
        let Some(actual) = source.field(&self.field) else {
            return matches!(self.condition, Condition::NotEquals);
        };
        let ordering = match (actual.parse::<i64>(), self.value.parse::<i64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => actual.as_str().cmp(self.value.as_str()),
        };
        match self.condition {
            Condition::Equals => ordering.is_eq(),
            Condition::NotEquals => ordering.is_ne(),
            Condition::GreaterThan => ordering.is_gt(),
            Condition::GreaterThanOrEqualTo => ordering.is_ge(),
            Condition::LessThan => ordering.is_lt(),
            Condition::LessThanOrEqualTo => ordering.is_le(),
            Condition::Contains => actual.contains(self.value.as_str()),
            Condition::In => self.value.split(',').any(|v| v.trim() == actual),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct Row(HashMap<&'static str, &'static str>);

    impl FieldSource for Row {
        fn field(&self, name: &str) -> Option<String> {
            self.0.get(name).map(|v| v.to_string())
        }
    }

    #[test]
    fn test_term_count_skips_disabled() {
        let mut nested = ExpressionOperator::new(Op::Or)
            .with_term("Feed", Condition::Equals, "A")
            .with_term("Feed", Condition::Equals, "B");
        nested.enabled = false;
        let expr = ExpressionOperator::and()
            .with_term("Type", Condition::Equals, "Raw Events")
            .with_operator(nested);
        assert_eq!(expr.term_count(), 1);
        assert_eq!(ExpressionOperator::and().term_count(), 0);
    }

    #[test]
    fn test_matches_numeric_and_lists() {
        let row = Row(HashMap::from([("Id", "15"), ("Feed", "TEST_FEED")]));
        let expr = ExpressionOperator::and()
            .with_term("Id", Condition::GreaterThan, "9")
            .with_term("Feed", Condition::In, "OTHER, TEST_FEED");
        assert!(expr.matches(&row));

        let not = ExpressionOperator::new(Op::Not).with_term("Feed", Condition::Contains, "TEST");
        assert!(!not.matches(&row));
    }
}
