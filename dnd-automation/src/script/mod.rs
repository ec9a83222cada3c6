//! The expression language used inside automation strings.
//!
//! A small Python-flavoured language evaluated against a set of variable
//! bindings. Evaluation is a pure function: it never mutates the bindings.

mod parser;
mod value;

pub use parser::{parse, Expr};
pub use value::{BinOp, EffectHandle, RollMetaVar, Value};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Variable bindings visible to an expression.
pub type Names = HashMap<String, Value>;

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("SyntaxError: {0}")]
    Syntax(String),
    #[error("NameError: name '{0}' is not defined")]
    NameNotDefined(String),
    #[error("TypeError: {0}")]
    Type(String),
    #[error("ValueError: {0}")]
    Value(String),
    #[error("ZeroDivisionError: division by zero")]
    ZeroDivision,
    #[error("KeyError: {0}")]
    Key(String),
    #[error("IndexError: {0}")]
    Index(String),
    #[error("AttributeError: '{type_name}' object has no attribute '{attr}'")]
    Attribute { type_name: String, attr: String },
}

/// Parse and evaluate `source` against `names`.
pub fn evaluate(source: &str, names: &Names) -> Result<Value, EvalError> {
    eval_expr(&parse(source)?, names)
}

/// Evaluate an already parsed expression.
pub fn eval_expr(expr: &Expr, names: &Names) -> Result<Value, EvalError> {
    match expr {
        Expr::None => Ok(Value::None),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(i) => Ok(Value::Int(*i)),
        Expr::Float(f) => Ok(Value::Float(*f)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::List(items) => Ok(Value::List(
            items.iter().map(|e| eval_expr(e, names)).collect::<Result<_, _>>()?,
        )),
        Expr::Name(n) => names
            .get(n)
            .cloned()
            .ok_or_else(|| EvalError::NameNotDefined(n.clone())),
        Expr::Attr(obj, attr) => eval_expr(obj, names)?.attr(attr),
        Expr::Index(obj, key) => eval_expr(obj, names)?.index(&eval_expr(key, names)?),
        Expr::Call(func, args) => {
            let args = args
                .iter()
                .map(|a| eval_expr(a, names))
                .collect::<Result<Vec<_>, _>>()?;
            match func.as_ref() {
                Expr::Name(name) if !names.contains_key(name) => call_builtin(name, &args),
                Expr::Attr(obj, method) => call_method(&eval_expr(obj, names)?, method, &args),
                other => {
                    let callee = eval_expr(other, names)?;
                    Err(EvalError::Type(format!("'{}' object is not callable", callee.type_name())))
                }
            }
        }
        Expr::Neg(inner) => match eval_expr(inner, names)? {
            Value::Float(f) => Ok(Value::Float(-f)),
            other => match other.as_int() {
                Some(i) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| EvalError::Value("integer overflow".to_string())),
                None => Err(EvalError::Type(format!(
                    "bad operand type for unary -: '{}'",
                    other.type_name()
                ))),
            },
        },
        Expr::Not(inner) => Ok(Value::Bool(!eval_expr(inner, names)?.truthy())),
        Expr::Binary(op, l, r) => value::binary(*op, &eval_expr(l, names)?, &eval_expr(r, names)?),
        Expr::Compare(first, rest) => {
            let mut left = eval_expr(first, names)?;
            for (op, right) in rest {
                let right = eval_expr(right, names)?;
                if !value::binary(*op, &left, &right)?.truthy() {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Expr::And(l, r) => {
            let left = eval_expr(l, names)?;
            if left.truthy() {
                eval_expr(r, names)
            } else {
                Ok(left)
            }
        }
        Expr::Or(l, r) => {
            let left = eval_expr(l, names)?;
            if left.truthy() {
                Ok(left)
            } else {
                eval_expr(r, names)
            }
        }
        Expr::IfElse { cond, then, otherwise } => {
            if eval_expr(cond, names)?.truthy() {
                eval_expr(then, names)
            } else {
                eval_expr(otherwise, names)
            }
        }
    }
}

fn arity(name: &str, args: &[Value], n: usize) -> Result<(), EvalError> {
    if args.len() != n {
        return Err(EvalError::Type(format!(
            "{name}() takes {n} argument(s) ({} given)",
            args.len()
        )));
    }
    Ok(())
}

/// `min`/`max`/`sum` accept either varargs or a single list.
fn spread(args: &[Value]) -> Vec<Value> {
    match args {
        [Value::List(items)] => items.clone(),
        other => other.to_vec(),
    }
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "min" | "max" => {
            let items = spread(args);
            let mut iter = items.into_iter();
            let mut best = iter
                .next()
                .ok_or_else(|| EvalError::Value(format!("{name}() arg is an empty sequence")))?;
            let op = if name == "min" { BinOp::Lt } else { BinOp::Gt };
            for item in iter {
                if value::binary(op, &item, &best)?.truthy() {
                    best = item;
                }
            }
            Ok(best)
        }
        "sum" => spread(args)
            .iter()
            .try_fold(Value::Int(0), |acc, v| value::binary(BinOp::Add, &acc, v)),
        "floor" | "ceil" | "round" => {
            arity(name, args, 1)?;
            let x = args[0].to_float()?;
            let rounded = match name {
                "floor" => x.floor(),
                "ceil" => x.ceil(),
                // banker's rounding like Python 3
                _ => {
                    let r = x.round();
                    if (x - x.trunc()).abs() == 0.5 && r % 2.0 != 0.0 {
                        r - x.signum()
                    } else {
                        r
                    }
                }
            };
            Ok(Value::Int(rounded as i64))
        }
        "abs" => {
            arity(name, args, 1)?;
            match &args[0] {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Ok(Value::Int(other.to_int()?.abs())),
            }
        }
        "int" => {
            arity(name, args, 1)?;
            Ok(Value::Int(args[0].to_int()?))
        }
        "float" => {
            arity(name, args, 1)?;
            Ok(Value::Float(args[0].to_float()?))
        }
        "str" => {
            arity(name, args, 1)?;
            Ok(Value::Str(args[0].to_string()))
        }
        "bool" => {
            arity(name, args, 1)?;
            Ok(Value::Bool(args[0].truthy()))
        }
        "len" => {
            arity(name, args, 1)?;
            Ok(Value::Int(args[0].len()? as i64))
        }
        _ => Err(EvalError::NameNotDefined(name.to_string())),
    }
}

fn call_method(receiver: &Value, method: &str, args: &[Value]) -> Result<Value, EvalError> {
    match (receiver, method) {
        (Value::Str(s), "lower") => Ok(Value::Str(s.to_lowercase())),
        (Value::Str(s), "upper") => Ok(Value::Str(s.to_uppercase())),
        (Value::Str(s), "strip") => Ok(Value::Str(s.trim().to_string())),
        (Value::Str(s), "title") => Ok(Value::Str(title_case(s))),
        (Value::Str(s), "startswith" | "endswith") => {
            arity(method, args, 1)?;
            let Value::Str(affix) = &args[0] else {
                return Err(EvalError::Type(format!("{method} arg must be str")));
            };
            Ok(Value::Bool(if method == "startswith" {
                s.starts_with(affix.as_str())
            } else {
                s.ends_with(affix.as_str())
            }))
        }
        (Value::Map(map), "get") => {
            let key = args
                .first()
                .ok_or_else(|| EvalError::Type("get expected at least 1 argument".to_string()))?;
            let default = args.get(1).cloned().unwrap_or(Value::None);
            Ok(match key {
                Value::Str(k) => map.get(k).cloned().unwrap_or(default),
                _ => default,
            })
        }
        (Value::Map(map), "keys") => {
            Ok(Value::List(map.keys().map(|k| Value::Str(k.clone())).collect()))
        }
        _ => Err(EvalError::Attribute {
            type_name: receiver.type_name().to_string(),
            attr: method.to_string(),
        }),
    }
}

/// Python's `str.title()`.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

// ============================================================================
// Annotated strings
// ============================================================================

#[derive(Debug, Clone)]
enum Segment {
    Text(String),
    Expr {
        source: String,
        parsed: Result<Expr, EvalError>,
    },
}

/// A string with `{expression}` (or legacy `{{expression}}`) interpolations.
///
/// Parsing never fails; malformed expressions surface when the string is
/// evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct AnnotatedString {
    raw: String,
    #[serde(skip)]
    segments: Vec<Segment>,
}

impl AnnotatedString {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let segments = split_segments(&raw);
        Self { raw, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// If the whole string is one interpolated variable, e.g. `{damage}`,
    /// return that variable's name.
    pub fn single_reference(&self) -> Option<&str> {
        let mut found = None;
        for segment in &self.segments {
            match segment {
                Segment::Text(t) if t.trim().is_empty() => {}
                Segment::Expr {
                    parsed: Ok(Expr::Name(name)),
                    ..
                } if found.is_none() => found = Some(name.as_str()),
                _ => return None,
            }
        }
        found
    }

    /// Whether any interpolation reads one of `names`.
    pub fn references_any(&self, names: &[&str]) -> bool {
        self.referenced_names().iter().any(|n| names.contains(&n.as_str()))
    }

    /// Every variable read by the interpolations.
    pub fn referenced_names(&self) -> Vec<String> {
        let mut out = Vec::new();
        for segment in &self.segments {
            if let Segment::Expr { parsed: Ok(expr), .. } = segment {
                expr.names(&mut out);
            }
        }
        out
    }

    /// Substitute every interpolation with the string form of its value.
    pub fn transformed(&self, names: &Names) -> Result<String, EvalError> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Expr { parsed, .. } => {
                    let expr = parsed.as_ref().map_err(Clone::clone)?;
                    out.push_str(&eval_expr(expr, names)?.to_string());
                }
            }
        }
        Ok(out)
    }

    /// The first interpolation source that fails to parse, for error messages.
    pub fn syntax_error(&self) -> Option<(&str, &EvalError)> {
        self.segments.iter().find_map(|s| match s {
            Segment::Expr {
                source,
                parsed: Err(e),
            } => Some((source.as_str(), e)),
            _ => None,
        })
    }
}

fn split_segments(raw: &str) -> Vec<Segment> {
    let chars: Vec<char> = raw.chars().collect();
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '{' {
            text.push(chars[i]);
            i += 1;
            continue;
        }
        let double = chars.get(i + 1) == Some(&'{');
        let open = if double { 2 } else { 1 };
        let mut depth = 0usize;
        let mut j = i + open;
        let mut end = None;
        while j < chars.len() {
            match chars[j] {
                '{' => depth += 1,
                '}' if depth > 0 => depth -= 1,
                '}' => {
                    if !double || chars.get(j + 1) == Some(&'}') {
                        end = Some(j);
                    }
                    break;
                }
                _ => {}
            }
            j += 1;
        }
        match end {
            Some(end) => {
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                let source: String = chars[i + open..end].iter().collect();
                let parsed = parse(source.trim());
                segments.push(Segment::Expr { source, parsed });
                i = end + open;
            }
            None => {
                text.push(chars[i]);
                i += 1;
            }
        }
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    segments
}

impl From<String> for AnnotatedString {
    fn from(raw: String) -> Self {
        AnnotatedString::new(raw)
    }
}

impl From<&str> for AnnotatedString {
    fn from(raw: &str) -> Self {
        AnnotatedString::new(raw)
    }
}

impl From<AnnotatedString> for String {
    fn from(s: AnnotatedString) -> Self {
        s.raw
    }
}

impl PartialEq for AnnotatedString {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl fmt::Display for AnnotatedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Names {
        let mut names = Names::new();
        names.insert("strengthMod".into(), Value::Int(3));
        names.insert("name".into(), Value::str("Tordek"));
        names.insert("spell_level".into(), Value::Int(2));
        names.insert(
            "dmg".into(),
            Value::Roll(RollMetaVar {
                text: "7 [fire]".into(),
                total: 7,
            }),
        );
        names
    }

    #[test]
    fn test_evaluate_arithmetic() {
        let n = names();
        assert_eq!(evaluate("strengthMod + 2 * 3", &n).unwrap(), Value::Int(9));
        assert_eq!(evaluate("(strengthMod + 2) // 2", &n).unwrap(), Value::Int(2));
        assert_eq!(evaluate("dmg * 2", &n).unwrap(), Value::Int(14));
        assert_eq!(evaluate("max(1, spell_level - 1, 0)", &n).unwrap(), Value::Int(1));
        assert_eq!(evaluate("sum([1, 2, 3])", &n).unwrap(), Value::Int(6));
        assert_eq!(evaluate("round(2.5)", &n).unwrap(), Value::Int(2));
        assert_eq!(evaluate("ceil(7 / 2)", &n).unwrap(), Value::Int(4));
    }

    #[test]
    fn test_evaluate_logic() {
        let n = names();
        assert_eq!(evaluate("1 < spell_level <= 2", &n).unwrap(), Value::Bool(true));
        assert_eq!(evaluate("not strengthMod", &n).unwrap(), Value::Bool(false));
        assert_eq!(evaluate("0 or 'fallback'", &n).unwrap(), Value::str("fallback"));
        assert_eq!(evaluate("'tor' in name.lower()", &n).unwrap(), Value::Bool(true));
        assert_eq!(evaluate("3 if spell_level > 1 else 1", &n).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_evaluate_errors() {
        let n = names();
        assert_eq!(
            evaluate("missing + 1", &n).unwrap_err(),
            EvalError::NameNotDefined("missing".into())
        );
        assert_eq!(evaluate("1 / 0", &n).unwrap_err(), EvalError::ZeroDivision);
        assert!(matches!(evaluate("name + 1", &n), Err(EvalError::Type(_))));
        assert!(matches!(evaluate("1 +", &n), Err(EvalError::Syntax(_))));

        let min = "(-9223372036854775807 - 1)";
        for expr in [format!("-{min}"), format!("{min} // -1"), format!("{min} * 2")] {
            assert!(matches!(evaluate(&expr, &n), Err(EvalError::Value(_))), "{expr}");
        }
        assert_eq!(evaluate(&format!("{min} % -1"), &n).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_annotated_transform() {
        let n = names();
        let s = AnnotatedString::new("{dmg} + {strengthMod}");
        assert_eq!(s.transformed(&n).unwrap(), "7 [fire] + 3");
        let legacy = AnnotatedString::new("{{strengthMod * 2}}d6");
        assert_eq!(legacy.transformed(&n).unwrap(), "6d6");
        let plain = AnnotatedString::new("no braces {here");
        assert_eq!(plain.transformed(&n).unwrap(), "no braces {here");
    }

    #[test]
    fn test_single_reference() {
        assert_eq!(AnnotatedString::new("{dmg}").single_reference(), Some("dmg"));
        assert_eq!(AnnotatedString::new(" { dmg } ").single_reference(), Some("dmg"));
        assert_eq!(AnnotatedString::new("{dmg} + 1").single_reference(), None);
        assert_eq!(AnnotatedString::new("{dmg + 1}").single_reference(), None);
        assert_eq!(AnnotatedString::new("1d6").single_reference(), None);
    }

    #[test]
    fn test_referenced_names() {
        let s = AnnotatedString::new("{a + b}d6 [{c}]");
        assert_eq!(s.referenced_names(), vec!["a", "b", "c"]);
        assert!(s.references_any(&["c"]));
        assert!(!s.references_any(&["d"]));
    }

    #[test]
    fn test_deferred_syntax_error() {
        let s = AnnotatedString::new("{1 +}");
        assert!(s.syntax_error().is_some());
        assert!(matches!(s.transformed(&Names::new()), Err(EvalError::Syntax(_))));
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("divine smite"), "Divine Smite");
        assert_eq!(title_case("FIRE bolt"), "Fire Bolt");
    }
}
