//! Guard Conditions
//!
//! Evaluates `when` expressions after substitution. Grammar, loosest first:
//!
//! ```text
//! expr  := expr OR expr | expr AND expr | NOT expr | !expr | ( expr ) | cmp
//! cmp   := value (>= | <= | != | == | > | < | contains) value | value
//! ```
//!
//! Ordering operators compare numerically. A bare value is tested for
//! truthiness: empty, `false`, `0`, `no`, `null`, `nil`, `none` and
//! `undefined` are false (case-insensitive).

use super::{ConditionEvaluator, ExprError};

const FALSY: &[&str] = &["", "false", "0", "no", "null", "nil", "none", "undefined"];

/// Default condition evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates an expression to its boolean value.
    pub fn eval(&self, expr: &str) -> Result<bool, ExprError> {
        if expr.trim().is_empty() {
            return Ok(false);
        }

        if let Some((left, right)) = split_logical(expr, "OR") {
            return Ok(self.eval(left)? || self.eval(right)?);
        }
        if let Some((left, right)) = split_logical(expr, "AND") {
            return Ok(self.eval(left)? && self.eval(right)?);
        }

        let expr = expr.trim();
        if let Some(inner) = expr.strip_prefix("NOT ") {
            return Ok(!self.eval(inner)?);
        }
        if let Some(inner) = expr.strip_prefix('!') {
            return Ok(!self.eval(inner)?);
        }
        if let Some(inner) = expr.strip_prefix('(').and_then(|e| e.strip_suffix(')')) {
            return self.eval(inner);
        }

        compare(expr)
    }
}

impl ConditionEvaluator for ExpressionEvaluator {
    fn evaluate(&self, condition: &str) -> Result<bool, ExprError> {
        if condition.trim().is_empty() {
            return Ok(false);
        }
        Ok(!self.eval(condition)?)
    }
}

/// Splits on the first logical operator found outside quotes and parentheses.
fn split_logical<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let spaced = format!(" {} ", op);
    // A dangling operator at the end leaves an empty right side
    let index = find_top_level(expr, &spaced).or_else(|| {
        expr.trim_end()
            .strip_suffix(op)
            .filter(|rest| rest.ends_with(' '))
            .map(|rest| rest.len() - 1)
    })?;

    let right = expr.get(index + spaced.len()..).unwrap_or_default();
    Some((expr[..index].trim(), right.trim()))
}

fn find_top_level(expr: &str, op: &str) -> Option<usize> {
    let bytes = expr.as_bytes();
    let needle = op.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;

    for i in 0..bytes.len() {
        let c = bytes[i];
        match quote {
            Some(q) if c == q && (i == 0 || bytes[i - 1] != b'\\') => {
                quote = None;
                continue;
            }
            Some(_) => continue,
            None => {}
        }
        match c {
            b'"' | b'\'' => quote = Some(c),
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if depth == 0 && bytes[i..].starts_with(needle) => return Some(i),
            _ => {}
        }
    }
    None
}

fn compare(expr: &str) -> Result<bool, ExprError> {
    const OPERATORS: &[&str] = &[">=", "<=", "!=", "==", ">", "<", " contains "];

    for op in OPERATORS {
        let Some(index) = expr.find(op) else {
            continue;
        };
        let left = clean(&expr[..index]);
        let right = clean(&expr[index + op.len()..]);

        return match *op {
            "==" => Ok(left == right),
            "!=" => Ok(left != right),
            " contains " => Ok(left.contains(right)),
            ordering => {
                let (l, r) = numeric_pair(left, right)?;
                Ok(match ordering {
                    ">=" => l >= r,
                    "<=" => l <= r,
                    ">" => l > r,
                    _ => l < r,
                })
            }
        };
    }

    Ok(is_truthy(expr))
}

fn numeric_pair(left: &str, right: &str) -> Result<(f64, f64), ExprError> {
    let parse = |side: &str, value: &str| {
        value.parse::<f64>().map_err(|_| {
            ExprError::Condition(format!("cannot compare: {} operand '{}' is not a number", side, value))
        })
    };
    Ok((parse("left", left)?, parse("right", right)?))
}

/// Trims whitespace and one pair of surrounding quotes.
fn clean(value: &str) -> &str {
    let value = value.trim();
    ['"', '\'']
        .iter()
        .find_map(|q| value.strip_prefix(*q).and_then(|v| v.strip_suffix(*q)))
        .unwrap_or(value)
}

fn is_truthy(value: &str) -> bool {
    let lower = clean(value).to_lowercase();
    !FALSY.contains(&lower.as_str())
}

/// Reports unbalanced parentheses and quotes in a condition.
pub fn check_syntax(condition: &str) -> Vec<String> {
    let mut issues = Vec::new();

    let mut depth = 0i32;
    for c in condition.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            issues.push("unbalanced parentheses: too many closing ')'".to_string());
            break;
        }
    }
    if depth > 0 {
        issues.push("unbalanced parentheses: missing closing ')'".to_string());
    }

    let (mut in_double, mut in_single) = (false, false);
    let mut previous = None;
    for c in condition.chars() {
        let escaped = previous == Some('\\');
        match c {
            '"' if !in_single && !escaped => in_double = !in_double,
            '\'' if !in_double && !escaped => in_single = !in_single,
            _ => {}
        }
        previous = Some(c);
    }
    if in_double {
        issues.push("unbalanced double quotes".to_string());
    }
    if in_single {
        issues.push("unbalanced single quotes".to_string());
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str) -> bool {
        ExpressionEvaluator::new().eval(expr).unwrap()
    }

    #[test]
    fn test_truthiness() {
        assert!(eval("yes"));
        assert!(eval("anything"));
        assert!(!eval("FALSE"));
        assert!(!eval("0"));
        assert!(!eval("'none'"));
        assert!(!eval("   "));
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("ok == ok"));
        assert!(eval("\"a b\" == 'a b'"));
        assert!(eval("ok != fail"));
        assert!(eval("10 > 9"));
        assert!(eval("2.5 <= 2.5"));
        assert!(!eval("3 >= 4"));
        assert!(eval("found 3 issues contains issues"));
    }

    #[test]
    fn test_logical_operators() {
        assert!(eval("1 > 2 OR ok == ok"));
        assert!(!eval("1 > 0 AND no"));
        assert!(eval("NOT false"));
        assert!(eval("!0"));
        assert!(eval("(a == b OR c == c) AND yes"));
        // OR inside quotes is a literal
        assert!(!eval("'x OR y' == z"));
    }

    #[test]
    fn test_non_numeric_ordering_errors() {
        let err = ExpressionEvaluator::new().eval("abc > 3").unwrap_err();
        assert!(matches!(err, ExprError::Condition(msg) if msg.contains("'abc' is not a number")));
    }

    #[test]
    fn test_evaluate_returns_skip() {
        let evaluator = ExpressionEvaluator::new();
        assert!(!evaluator.evaluate("true").unwrap());
        assert!(evaluator.evaluate("false").unwrap());
        assert!(!evaluator.evaluate("").unwrap());
    }

    #[test]
    fn test_check_syntax() {
        assert!(check_syntax("(a == b) AND 'c'").is_empty());
        assert_eq!(check_syntax("(a == b"), vec!["unbalanced parentheses: missing closing ')'"]);
        assert_eq!(check_syntax("a)"), vec!["unbalanced parentheses: too many closing ')'"]);
        assert_eq!(check_syntax("\"open"), vec!["unbalanced double quotes"]);
        assert_eq!(check_syntax("it's"), vec!["unbalanced single quotes"]);
    }
}
