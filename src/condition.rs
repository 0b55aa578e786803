use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::ast::Parameter;
use crate::span::Span;

/// An infix or prefix operator usable in `#if` conditions.
#[derive(Debug, PartialEq, Eq)]
pub struct Operator {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
}

pub const IF_OPERATORS: &[Operator] = &[
    Operator { name: "!", aliases: &[] },
    Operator { name: "gt", aliases: &[">"] },
    Operator { name: "ge", aliases: &[">="] },
    Operator { name: "lt", aliases: &["<"] },
    Operator { name: "le", aliases: &["<="] },
    Operator { name: "eq", aliases: &["==", "is"] },
    Operator { name: "ne", aliases: &["!="] },
    Operator { name: "and", aliases: &["&&"] },
    Operator { name: "or", aliases: &["||"] },
];

/// A comparison or membership operator usable as the leading parameter of
/// `#is`/`#case` blocks. Multi-valued operators accept a trailing operand
/// list; the rest accept exactly one operand.
#[derive(Debug, PartialEq, Eq)]
pub struct CaseOperator {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub is_multi: bool,
}

pub const CASE_OPERATORS: &[CaseOperator] = &[
    CaseOperator { name: "gt", aliases: &[">"], is_multi: false },
    CaseOperator { name: "ge", aliases: &[">="], is_multi: false },
    CaseOperator { name: "lt", aliases: &["<"], is_multi: false },
    CaseOperator { name: "le", aliases: &["<="], is_multi: false },
    CaseOperator { name: "eq", aliases: &["==", "is"], is_multi: false },
    CaseOperator { name: "ne", aliases: &["!=", "not"], is_multi: false },
    CaseOperator { name: "in", aliases: &[], is_multi: true },
    CaseOperator { name: "ni", aliases: &["!in"], is_multi: true },
];

static IF_OPERATOR_INDEX: Lazy<HashMap<&'static str, &'static Operator>> = Lazy::new(|| {
    let mut index = HashMap::new();
    for operator in IF_OPERATORS {
        index.insert(operator.name, operator);
        for alias in operator.aliases {
            index.insert(*alias, operator);
        }
    }
    index
});

static CASE_OPERATOR_INDEX: Lazy<HashMap<&'static str, &'static CaseOperator>> =
    Lazy::new(|| {
        let mut index = HashMap::new();
        for operator in CASE_OPERATORS {
            index.insert(operator.name, operator);
            for alias in operator.aliases {
                index.insert(*alias, operator);
            }
        }
        index
    });

pub fn if_operator(token: &str) -> Option<&'static Operator> {
    IF_OPERATOR_INDEX.get(token).copied()
}

pub fn case_operator(token: &str) -> Option<&'static CaseOperator> {
    CASE_OPERATOR_INDEX.get(token).copied()
}

/// The operand set of a condition, with operators already filtered out so
/// downstream consumers never have to guess.
#[derive(Debug, Default)]
pub struct ConditionExpression {
    pub operands: Vec<Parameter>,
}

/// A token sitting in an operator position without being a registered
/// operator. A diagnostic, not a parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionIssue {
    pub token: String,
    pub span: Span,
}

/// Classifies an `#if` parameter list. Parameter positions alternate:
/// even positions are operands (expression-eligible), odd positions must
/// name a registered operator and are never treated as expressions.
pub fn parse_if_condition(parameters: &mut [Parameter]) -> (ConditionExpression, Vec<ConditionIssue>) {
    let mut expression = ConditionExpression::default();
    let mut issues = Vec::new();
    for (index, parameter) in parameters.iter_mut().enumerate() {
        if index % 2 == 0 {
            parameter.can_have_expression = true;
            expression.operands.push(parameter.clone());
        } else {
            parameter.can_have_expression = false;
            let token = parameter.effective_value().unwrap_or_default();
            if if_operator(token).is_none() {
                issues.push(ConditionIssue {
                    token: token.to_string(),
                    span: parameter.effective_span(),
                });
            }
        }
    }
    (expression, issues)
}

/// Classifies an `#is`/`#case` parameter list: only the first parameter may
/// be an operator; everything after it is an operand.
pub fn parse_case_condition(parameters: &mut [Parameter]) -> Option<&'static CaseOperator> {
    let operator = parameters
        .first()
        .and_then(|parameter| parameter.effective_value())
        .and_then(case_operator);
    for (index, parameter) in parameters.iter_mut().enumerate() {
        parameter.can_have_expression = !(index == 0 && operator.is_some());
    }
    operator
}

/// Completion-readiness of an `#is`/`#case` block: whether the cursor may
/// sensibly receive another value.
///
/// No parameters yet: eligible. A single non-operator parameter: already a
/// complete literal match, not eligible. A leading operator: eligible until
/// its arity is satisfied (always, for multi-valued operators).
pub fn should_complete_case_section(parameters: &[Parameter]) -> bool {
    let Some(first) = parameters.first() else {
        return true;
    };
    match first.effective_value().and_then(case_operator) {
        Some(operator) => operator.is_multi || parameters.len() == 1,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(token: &str) -> Parameter {
        Parameter {
            name: Some(token.to_string()),
            value: None,
            span: Span::new(0, token.len()),
            name_span: Some(Span::new(0, token.len())),
            value_span: None,
            can_have_expression: false,
        }
    }

    #[test]
    fn operator_aliases_resolve() {
        assert_eq!(if_operator(">").map(|op| op.name), Some("gt"));
        assert_eq!(if_operator("is").map(|op| op.name), Some("eq"));
        assert_eq!(if_operator("&&").map(|op| op.name), Some("and"));
        assert!(if_operator("xor").is_none());
        assert_eq!(case_operator("!in").map(|op| op.name), Some("ni"));
        assert!(case_operator("in").is_some_and(|op| op.is_multi));
    }

    #[test]
    fn if_positions_alternate() {
        let mut params = vec![param("item.age"), param(">"), param("10")];
        let (expression, issues) = parse_if_condition(&mut params);
        assert!(issues.is_empty());
        assert!(params[0].can_have_expression);
        assert!(!params[1].can_have_expression);
        assert!(params[2].can_have_expression);
        assert_eq!(expression.operands.len(), 2);
    }

    #[test]
    fn unregistered_operator_is_an_issue_not_a_failure() {
        let mut params = vec![param("a"), param("almost"), param("b")];
        let (expression, issues) = parse_if_condition(&mut params);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].token, "almost");
        assert_eq!(expression.operands.len(), 2);
    }

    #[test]
    fn case_operator_only_in_first_position() {
        let mut params = vec![param("gt"), param("10")];
        let operator = parse_case_condition(&mut params);
        assert_eq!(operator.map(|op| op.name), Some("gt"));
        assert!(!params[0].can_have_expression);
        assert!(params[1].can_have_expression);

        let mut params = vec![param("10"), param("gt")];
        assert!(parse_case_condition(&mut params).is_none());
        assert!(params[0].can_have_expression);
    }

    #[test]
    fn case_completion_arity() {
        // `{#is}` — eligible.
        assert!(should_complete_case_section(&[]));
        // `{#is 1}` — a complete literal match.
        assert!(!should_complete_case_section(&[param("1")]));
        // `{#is gt}` — operator awaiting its operand.
        assert!(should_complete_case_section(&[param("gt")]));
        // `{#is gt 10}` — arity satisfied.
        assert!(!should_complete_case_section(&[param("gt"), param("10")]));
        // `{#is in 1 2 3}` — multi-valued operators always accept more.
        assert!(should_complete_case_section(&[
            param("in"),
            param("1"),
            param("2")
        ]));
    }
}
