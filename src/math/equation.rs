//! equation.rs
//! User arithmetic over a single variable `x`, evaluated with `evalexpr`.
//!
//! Used by the Math "equation" variant, by measurement rescaling and by unit conversions.
//! Formulas are written with `+ - * / % ( )` and `**` for powers. Before the tree is built
//! the source is normalised: `**` becomes evalexpr's `^` and every numeric literal becomes a
//! float literal, so `9/5` divides as reals. `%` is the remainder of truncated division.
//! Nesting and operator counts are bounded before parsing so a hostile formula is an error
//! instead of a blown stack.

use evalexpr::{ContextWithMutableVariables, HashMapContext, Node, Value, build_operator_tree};

use crate::error::{ControlError, Result};

/// Deepest allowed mix of parentheses, prefix signs and powers.
pub const MAX_NESTING: usize = 64;
/// Most operators and parentheses a formula may contain.
pub const MAX_OPERATORS: usize = 256;

const VARIABLE: &str = "x";
const FUNCTIONS: &[&str] = &[
    "min", "max", "floor", "round", "ceil", "math::ln", "math::log10", "math::exp", "math::sqrt",
];

/// A parsed expression, evaluated any number of times.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    tree: Node,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let normalized = normalize(source)?;
        let tree = build_operator_tree(&normalized)
            .map_err(|e| ControlError::Expression(format!("'{}': {}", source, e)))?;

        if let Some(name) = tree.iter_variable_identifiers().find(|v| *v != VARIABLE) {
            return Err(ControlError::Expression(format!(
                "unknown variable '{}' in '{}'",
                name, source
            )));
        }
        if let Some(name) = tree.iter_function_identifiers().find(|f| !FUNCTIONS.contains(f)) {
            return Err(ControlError::Expression(format!(
                "function '{}' is not allowed in '{}'",
                name, source
            )));
        }
        let expression = Self { source: source.to_string(), tree };
        // operand counts are only checked by evaluation
        expression.eval_raw(1.0)?;
        Ok(expression)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, x: f64) -> Result<f64> {
        let value = self.eval_raw(x)?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ControlError::Expression(format!(
                "'{}' produced a non-finite result for x={}",
                self.source, x
            )))
        }
    }

    fn eval_raw(&self, x: f64) -> Result<f64> {
        let mut context = HashMapContext::new();
        context
            .set_value(VARIABLE.into(), Value::Float(x))
            .map_err(|e| ControlError::Expression(e.to_string()))?;
        self.tree
            .eval_number_with_context(&context)
            .map_err(|e| ControlError::Expression(format!("'{}': {}", self.source, e)))
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(source: &str, x: f64) -> Result<f64> {
    Expression::parse(source)?.eval(x)
}

/// Rewrites `source` into evalexpr syntax and enforces the size bounds.
fn normalize(source: &str) -> Result<String> {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len() + 8);
    let mut depth = 0usize;
    let mut nesting = 0usize;
    let mut deepest = 0usize;
    let mut operators = 0usize;
    // true after an operand, so a following sign is binary
    let mut after_operand = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => {
                out.push(c);
                i += 1;
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == ':') {
                    out.push(chars[i]);
                    i += 1;
                }
                after_operand = true;
                continue;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        while j < chars.len() && chars[j].is_ascii_digit() {
                            j += 1;
                        }
                        i = j;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value: f64 = text
                    .parse()
                    .map_err(|_| ControlError::Expression(format!("invalid number '{}'", text)))?;
                let literal = value.to_string();
                out.push_str(&literal);
                if !literal.contains('.') {
                    out.push_str(".0");
                }
                after_operand = true;
                continue;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                out.push('^');
                nesting += 1;
                operators += 1;
                after_operand = false;
                i += 2;
                continue;
            }
            '^' => {
                nesting += 1;
                operators += 1;
                after_operand = false;
            }
            '(' => {
                depth += 1;
                operators += 1;
                after_operand = false;
            }
            ')' => {
                depth = depth.saturating_sub(1);
                operators += 1;
                after_operand = true;
            }
            '+' | '-' => {
                if !after_operand {
                    nesting += 1;
                }
                operators += 1;
                after_operand = false;
            }
            _ => {
                operators += 1;
                after_operand = false;
            }
        }
        out.push(c);
        deepest = deepest.max(depth + nesting);
        if deepest > MAX_NESTING {
            return Err(ControlError::Expression(format!(
                "expression nests deeper than {} levels",
                MAX_NESTING
            )));
        }
        if operators > MAX_OPERATORS {
            return Err(ControlError::Expression(format!(
                "expression has more than {} operators",
                MAX_OPERATORS
            )));
        }
        i += 1;
    }

    if out.trim().is_empty() {
        return Err(ControlError::Expression("empty expression".into()));
    }
    Ok(out)
}
