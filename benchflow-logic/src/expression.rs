//! Boolean expression evaluation.
//!
//! Two small dialects are used across the configuration:
//!
//! - *Condition expressions* gate steps, operations, fileset entries, and
//!   result rows. Parameter references are substituted before evaluation, so
//!   the evaluator sees literals: comparisons (`==`, `!=`, `<`, `<=`, `>`,
//!   `>=`), conjunction/disjunction (`&&`, `||`, legacy `and`/`or`),
//!   negation (`!`, `not`), and parentheses. Operands that parse as numbers
//!   compare numerically, otherwise lexically.
//! - *Tag expressions* gate configuration nodes against the active tag set:
//!   `+` (and), `|` (or), `!` (not), parentheses; the legacy comma-separated
//!   form converts to an or-combination where any negated tag dominates.

use benchflow_core::{BenchError, Result};
use std::collections::BTreeSet;

/// Evaluate a condition expression to a boolean.
pub fn eval_condition(expr: &str) -> Result<bool> {
    let mut parser = Parser::new(expr);
    let value = parser.parse_or()?;
    parser.skip_ws();
    if !parser.at_end() {
        return Err(BenchError::Config(format!(
            "trailing input in expression '{expr}'"
        )));
    }
    value.truthy(expr)
}

/// Operand value during evaluation.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Text(String),
}

impl Value {
    fn truthy(&self, expr: &str) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Text(t) => {
                let lowered = t.trim().to_ascii_lowercase();
                match lowered.as_str() {
                    "true" | "1" => Ok(true),
                    "false" | "0" | "" => Ok(false),
                    _ => Err(BenchError::Config(format!(
                        "expression '{expr}': '{t}' is not a boolean"
                    ))),
                }
            }
        }
    }

    fn compare(&self, op: &str, other: &Value) -> Result<bool> {
        let (left, right) = match (self, other) {
            (Value::Text(a), Value::Text(b)) => (a.clone(), b.clone()),
            (a, b) => (render(a), render(b)),
        };
        let numeric = left.trim().parse::<f64>().ok().zip(right.trim().parse::<f64>().ok());
        let ordering = match numeric {
            Some((l, r)) => l.partial_cmp(&r),
            None => Some(left.cmp(&right)),
        };
        let ordering = ordering.ok_or_else(|| {
            BenchError::Config(format!("cannot compare '{left}' and '{right}'"))
        })?;
        Ok(match op {
            "==" => ordering.is_eq(),
            "!=" => !ordering.is_eq(),
            "<" => ordering.is_lt(),
            "<=" => ordering.is_le(),
            ">" => ordering.is_gt(),
            ">=" => ordering.is_ge(),
            _ => unreachable!("unknown comparison operator"),
        })
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::Text(t) => t.clone(),
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Parser { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_ws(&mut self) {
        while self
            .rest()
            .chars()
            .next()
            .map(|c| c.is_whitespace())
            .unwrap_or(false)
        {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        self.skip_ws();
        let rest = self.rest();
        if rest.starts_with(word) {
            let after = rest[word.len()..].chars().next();
            if after.map(|c| !c.is_ascii_alphanumeric() && c != '_').unwrap_or(true) {
                self.pos += word.len();
                return true;
            }
        }
        false
    }

    fn parse_or(&mut self) -> Result<Value> {
        let mut left = self.parse_and()?;
        loop {
            if self.eat("||") || self.eat_word("or") {
                let right = self.parse_and()?;
                let combined =
                    left.truthy(self.input)? || right.truthy(self.input)?;
                left = Value::Bool(combined);
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_and(&mut self) -> Result<Value> {
        let mut left = self.parse_comparison()?;
        loop {
            if self.eat("&&") || self.eat_word("and") {
                let right = self.parse_comparison()?;
                let combined =
                    left.truthy(self.input)? && right.truthy(self.input)?;
                left = Value::Bool(combined);
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_comparison(&mut self) -> Result<Value> {
        let left = self.parse_unary()?;
        for op in ["==", "!=", "<=", ">=", "<", ">"] {
            if self.eat(op) {
                let right = self.parse_unary()?;
                return Ok(Value::Bool(left.compare(op, &right)?));
            }
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Value> {
        self.skip_ws();
        if self.eat_word("not") {
            let inner = self.parse_unary()?;
            return Ok(Value::Bool(!inner.truthy(self.input)?));
        }
        // `!` negation, but not the `!=` operator.
        if self.rest().starts_with('!') && !self.rest().starts_with("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Value::Bool(!inner.truthy(self.input)?));
        }
        if self.eat("(") {
            let inner = self.parse_or()?;
            if !self.eat(")") {
                return Err(BenchError::Config(format!(
                    "unbalanced parentheses in expression '{}'",
                    self.input
                )));
            }
            return Ok(inner);
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Value> {
        self.skip_ws();
        let rest = self.rest();
        let mut chars = rest.chars();
        match chars.next() {
            Some(quote @ ('"' | '\'')) => {
                let closing = rest[1..].find(quote).ok_or_else(|| {
                    BenchError::Config(format!(
                        "unterminated string in expression '{}'",
                        self.input
                    ))
                })?;
                let text = rest[1..1 + closing].to_string();
                self.pos += closing + 2;
                Ok(Value::Text(text))
            }
            Some(c) if !c.is_whitespace() => {
                // Bare token: read until whitespace, operator, or paren.
                let mut len = 0;
                for c in rest.chars() {
                    if c.is_whitespace()
                        || matches!(c, '(' | ')' | '<' | '>' | '=' | '!' | '&' | '|')
                    {
                        break;
                    }
                    len += c.len_utf8();
                }
                if len == 0 {
                    return Err(BenchError::Config(format!(
                        "unexpected character in expression '{}'",
                        self.input
                    )));
                }
                let token = &rest[..len];
                self.pos += len;
                match token.to_ascii_lowercase().as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Ok(Value::Text(token.to_string())),
                }
            }
            _ => Err(BenchError::Config(format!(
                "empty operand in expression '{}'",
                self.input
            ))),
        }
    }
}

/// Evaluate a tag expression against the active tag set.
///
/// The boolean syntax (`+`, `|`, `!`, parentheses) is used when present;
/// otherwise the legacy comma list applies: the node is kept when at least
/// one positive tag is active (or no positive tag is given) and no negated
/// tag is active.
pub fn eval_tag_expr(expr: &str, tags: &BTreeSet<String>) -> Result<bool> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Ok(true);
    }
    if trimmed.contains(['+', '|', '(', ')']) {
        let mut parser = TagParser {
            input: trimmed,
            pos: 0,
            tags,
        };
        let value = parser.parse_or()?;
        parser.skip_ws();
        if parser.pos < trimmed.len() {
            return Err(BenchError::Config(format!(
                "trailing input in tag expression '{trimmed}'"
            )));
        }
        return Ok(value);
    }

    // Legacy comma list: any negated active tag dominates.
    let mut any_positive = false;
    let mut positive_hit = false;
    for entry in trimmed.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        if let Some(negated) = entry.strip_prefix('!') {
            if tags.contains(negated.trim()) {
                return Ok(false);
            }
        } else {
            any_positive = true;
            if tags.contains(entry) {
                positive_hit = true;
            }
        }
    }
    Ok(!any_positive || positive_hit)
}

struct TagParser<'a> {
    input: &'a str,
    pos: usize,
    tags: &'a BTreeSet<String>,
}

impl TagParser<'_> {
    fn rest(&self) -> &str {
        &self.input[self.pos..]
    }

    fn skip_ws(&mut self) {
        while self
            .rest()
            .chars()
            .next()
            .map(|c| c.is_whitespace())
            .unwrap_or(false)
        {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<bool> {
        let mut value = self.parse_and()?;
        while self.eat('|') {
            value |= self.parse_and()?;
        }
        Ok(value)
    }

    fn parse_and(&mut self) -> Result<bool> {
        let mut value = self.parse_unary()?;
        // `,` is accepted as a synonym for `+` inside boolean syntax.
        while self.eat('+') || self.eat(',') {
            value &= self.parse_unary()?;
        }
        Ok(value)
    }

    fn parse_unary(&mut self) -> Result<bool> {
        if self.eat('!') {
            return Ok(!self.parse_unary()?);
        }
        if self.eat('(') {
            let value = self.parse_or()?;
            if !self.eat(')') {
                return Err(BenchError::Config(format!(
                    "unbalanced parentheses in tag expression '{}'",
                    self.input
                )));
            }
            return Ok(value);
        }
        self.skip_ws();
        let mut len = 0;
        for c in self.rest().chars() {
            if c.is_whitespace() || matches!(c, '+' | '|' | '!' | '(' | ')' | ',') {
                break;
            }
            len += c.len_utf8();
        }
        if len == 0 {
            return Err(BenchError::Config(format!(
                "empty tag name in expression '{}'",
                self.input
            )));
        }
        let tag = &self.rest()[..len];
        let active = self.tags.contains(tag);
        self.pos += len;
        Ok(active)
    }
}
