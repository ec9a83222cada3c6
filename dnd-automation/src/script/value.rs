//! Runtime values of the scripting language.

use super::EvalError;
use crate::initiative::EffectRef;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A rolled dice expression bound as a variable.
///
/// Acts as its total in arithmetic and as a rerollable dice string when
/// interpolated, so `{roll}` inside a damage string keeps its annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct RollMetaVar {
    pub text: String,
    pub total: i64,
}

/// An initiative effect bound as a variable (`ieffect`, `save_as`).
#[derive(Debug, Clone, PartialEq)]
pub struct EffectHandle {
    pub effect: EffectRef,
    pub name: String,
}

/// A dynamically typed script value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Roll(RollMetaVar),
    Effect(EffectHandle),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "dict",
            Value::Roll(_) => "RollEffectMetaVar",
            Value::Effect(_) => "SimpleEffect",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Roll(r) => r.total != 0,
            Value::Effect(_) => true,
        }
    }

    /// Numeric view: ints, bools and roll totals are integers.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(i) => Some(*i),
            Value::Roll(r) => Some(r.total),
            _ => None,
        }
    }

    fn as_number(&self) -> Option<Number> {
        match self {
            Value::Float(f) => Some(Number::Float(*f)),
            other => other.as_int().map(Number::Int),
        }
    }

    /// Python `int()` conversion.
    pub fn to_int(&self) -> Result<i64, EvalError> {
        match self {
            Value::Float(f) if f.is_finite() => Ok(f.trunc() as i64),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| EvalError::Value(format!("invalid literal for int(): '{s}'"))),
            other => other.as_int().ok_or_else(|| {
                EvalError::Type(format!(
                    "int() argument must be a number, not '{}'",
                    other.type_name()
                ))
            }),
        }
    }

    /// Python `float()` conversion.
    pub fn to_float(&self) -> Result<f64, EvalError> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| EvalError::Value(format!("could not convert string to float: '{s}'"))),
            other => other.as_int().map(|i| i as f64).ok_or_else(|| {
                EvalError::Type(format!(
                    "float() argument must be a number, not '{}'",
                    other.type_name()
                ))
            }),
        }
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    /// Python `repr()`, used for strings nested inside containers.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", s.replace('\'', "\\'")),
            other => other.to_string(),
        }
    }

    fn equals(&self, other: &Value) -> bool {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a.to_f64() == b.to_f64(),
            _ => match (self, other) {
                (Value::Str(a), Value::Str(b)) => a == b,
                (Value::List(a), Value::List(b)) => {
                    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
                }
                (Value::Effect(a), Value::Effect(b)) => a.effect == b.effect,
                (a, b) => a == b,
            },
        }
    }

    fn compare(&self, other: &Value) -> Result<Ordering, EvalError> {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a
                .to_f64()
                .partial_cmp(&b.to_f64())
                .ok_or_else(|| EvalError::Value("cannot compare NaN".to_string()));
        }
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        ord => return Ok(ord),
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            (a, b) => Err(EvalError::Type(format!(
                "'<' not supported between instances of '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn contains(&self, needle: &Value) -> Result<bool, EvalError> {
        match self {
            Value::Str(hay) => match needle {
                Value::Str(n) => Ok(hay.contains(n.as_str())),
                other => Err(EvalError::Type(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            Value::List(items) => Ok(items.iter().any(|v| v.equals(needle))),
            Value::Map(map) => Ok(match needle {
                Value::Str(key) => map.contains_key(key),
                _ => false,
            }),
            other => Err(EvalError::Type(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Attribute access: map keys, effect fields, roll fields.
    pub fn attr(&self, name: &str) -> Result<Value, EvalError> {
        let missing = || EvalError::Attribute {
            type_name: self.type_name().to_string(),
            attr: name.to_string(),
        };
        match self {
            Value::Map(map) => map.get(name).cloned().ok_or_else(missing),
            Value::Effect(handle) => match name {
                "name" => Ok(Value::Str(handle.name.clone())),
                _ => Err(missing()),
            },
            Value::Roll(roll) => match name {
                "total" => Ok(Value::Int(roll.total)),
                "dice" => Ok(Value::Str(roll.text.clone())),
                _ => Err(missing()),
            },
            _ => Err(missing()),
        }
    }

    pub fn index(&self, key: &Value) -> Result<Value, EvalError> {
        match self {
            Value::List(items) => {
                let i = key
                    .as_int()
                    .ok_or_else(|| EvalError::Type("list indices must be integers".to_string()))?;
                let idx = if i < 0 { items.len() as i64 + i } else { i };
                usize::try_from(idx)
                    .ok()
                    .and_then(|idx| items.get(idx))
                    .cloned()
                    .ok_or_else(|| EvalError::Index("list index out of range".to_string()))
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let i = key
                    .as_int()
                    .ok_or_else(|| EvalError::Type("string indices must be integers".to_string()))?;
                let idx = if i < 0 { chars.len() as i64 + i } else { i };
                usize::try_from(idx)
                    .ok()
                    .and_then(|idx| chars.get(idx))
                    .map(|c| Value::Str(c.to_string()))
                    .ok_or_else(|| EvalError::Index("string index out of range".to_string()))
            }
            Value::Map(map) => match key {
                Value::Str(k) => map.get(k).cloned().ok_or_else(|| EvalError::Key(k.clone())),
                other => Err(EvalError::Key(other.repr())),
            },
            other => Err(EvalError::Type(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    pub fn len(&self) -> Result<usize, EvalError> {
        match self {
            Value::Str(s) => Ok(s.chars().count()),
            Value::List(l) => Ok(l.len()),
            Value::Map(m) => Ok(m.len()),
            other => Err(EvalError::Type(format!(
                "object of type '{}' has no len()",
                other.type_name()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn to_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

/// Binary operators on values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::In => "in",
            BinOp::NotIn => "not in",
        }
    }
}

pub(crate) fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    let unsupported = || {
        EvalError::Type(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))
    };

    match op {
        BinOp::Eq => return Ok(Value::Bool(left.equals(right))),
        BinOp::Ne => return Ok(Value::Bool(!left.equals(right))),
        BinOp::Lt => return Ok(Value::Bool(left.compare(right)? == Ordering::Less)),
        BinOp::Le => return Ok(Value::Bool(left.compare(right)? != Ordering::Greater)),
        BinOp::Gt => return Ok(Value::Bool(left.compare(right)? == Ordering::Greater)),
        BinOp::Ge => return Ok(Value::Bool(left.compare(right)? != Ordering::Less)),
        BinOp::In => return Ok(Value::Bool(right.contains(left)?)),
        BinOp::NotIn => return Ok(Value::Bool(!right.contains(left)?)),
        _ => {}
    }

    // sequence operators
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{a}{b}"))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            return Ok(Value::List(a.iter().chain(b).cloned().collect()))
        }
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if n.as_int().is_some() => {
            let count = n.as_int().unwrap_or(0).max(0) as usize;
            return Ok(Value::Str(s.repeat(count)));
        }
        _ => {}
    }

    let (a, b) = match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(unsupported()),
    };

    match (a, b) {
        (Number::Int(a), Number::Int(b)) => int_op(op, a, b),
        (a, b) => float_op(op, a.to_f64(), b.to_f64()),
    }
}

fn int_op(op: BinOp, a: i64, b: i64) -> Result<Value, EvalError> {
    let overflow = || EvalError::Value("integer overflow".to_string());
    Ok(match op {
        BinOp::Add => Value::Int(a.checked_add(b).ok_or_else(overflow)?),
        BinOp::Sub => Value::Int(a.checked_sub(b).ok_or_else(overflow)?),
        BinOp::Mul => Value::Int(a.checked_mul(b).ok_or_else(overflow)?),
        BinOp::Div => {
            if b == 0 {
                return Err(EvalError::ZeroDivision);
            }
            Value::Float(a as f64 / b as f64)
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(EvalError::ZeroDivision);
            }
            if a == i64::MIN && b == -1 {
                return Err(overflow());
            }
            Value::Int(crate::dice::floor_div(a, b))
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(EvalError::ZeroDivision);
            }
            if b == -1 {
                return Ok(Value::Int(0));
            }
            Value::Int(a - b * crate::dice::floor_div(a, b))
        }
        BinOp::Pow => {
            if b < 0 {
                Value::Float((a as f64).powf(b as f64))
            } else {
                let exp = u32::try_from(b).map_err(|_| overflow())?;
                Value::Int(a.checked_pow(exp).ok_or_else(overflow)?)
            }
        }
        other => return Err(EvalError::Type(format!("unsupported operator {}", other.symbol()))),
    })
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<Value, EvalError> {
    Ok(Value::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => {
            return Err(EvalError::ZeroDivision)
        }
        BinOp::Div => a / b,
        BinOp::FloorDiv => (a / b).floor(),
        BinOp::Mod => a - b * (a / b).floor(),
        BinOp::Pow => a.powf(b),
        other => return Err(EvalError::Type(format!("unsupported operator {}", other.symbol()))),
    }))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
                    write!(f, "{x:.1}")
                } else if x.is_nan() {
                    write!(f, "nan")
                } else {
                    write!(f, "{x}")
                }
            }
            Value::Str(s) => write!(f, "{s}"),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(Value::repr).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Map(map) => {
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("'{k}': {}", v.repr()))
                    .collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Value::Roll(roll) => write!(f, "{}", roll.text),
            Value::Effect(handle) => write!(f, "{}", handle.name),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::None)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}
