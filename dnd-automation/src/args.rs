//! Command-style argument bag passed into automation runs.
//!
//! Arguments look like `-b 2 adv -d "1d6 [fire]" -d1 2d8 -t "goblin|-resist fire"`:
//! `-key value` pairs, bare words as boolean flags, quoted values, ephemeral
//! arguments (`-d1`) that expire after a number of reads, and per-target
//! argument contexts.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgError {
    #[error("{value} cannot be cast to {ty} (in `{arg}`)")]
    CastFailed {
        value: String,
        ty: &'static str,
        arg: String,
    },
}

/// Flag spellings normalized on parse.
const ALIASES: &[(&str, &str)] = &[("ea", "eadv")];

/// Value recorded for bare flags.
pub const FLAG_VALUE: &str = "True";

#[derive(Debug, Clone, PartialEq, Eq)]
struct EphemeralValue {
    value: String,
    remaining: u32,
}

/// A multi-valued argument bag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgBag {
    base: BTreeMap<String, Vec<String>>,
    ephemeral: BTreeMap<String, Vec<EphemeralValue>>,
    contexts: BTreeMap<String, ArgBag>,
    context: Option<String>,
}

fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

fn is_key(token: &str) -> bool {
    match token.strip_prefix('-') {
        Some(rest) => !rest.is_empty() && rest.parse::<f64>().is_err(),
        None => false,
    }
}

/// Split `d1` into (`d`, 1). Keys without a trailing count are persistent.
fn split_ephemeral(key: &str) -> Option<(&str, u32)> {
    let digits = key.len() - key.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 || digits == key.len() {
        return None;
    }
    let (name, count) = key.split_at(key.len() - digits);
    if !name.chars().all(char::is_alphabetic) {
        return None;
    }
    count.parse().ok().map(|n| (name, n))
}

fn normalize(key: &str) -> String {
    let key = key.to_lowercase();
    ALIASES
        .iter()
        .find(|(from, _)| *from == key)
        .map(|(_, to)| to.to_string())
        .unwrap_or(key)
}

fn truthy(value: &str) -> bool {
    !matches!(value.to_lowercase().as_str(), "false" | "0" | "no" | "")
}

impl ArgBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a command-style argument string.
    pub fn parse(input: &str) -> Self {
        Self::from_tokens(&tokenize(input))
    }

    pub fn from_tokens(tokens: &[String]) -> Self {
        let mut bag = ArgBag::new();
        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];
            if is_key(token) {
                let key = normalize(token.trim_start_matches('-'));
                let value = match tokens.get(i + 1) {
                    Some(next) if !is_key(next) => {
                        i += 1;
                        next.clone()
                    }
                    _ => FLAG_VALUE.to_string(),
                };
                bag.push(&key, value);
            } else {
                bag.push(&normalize(token), FLAG_VALUE.to_string());
            }
            i += 1;
        }

        // per-target contexts: -t "name|args"
        if let Some(targets) = bag.base.get("t").cloned() {
            for target in targets {
                if let Some((name, args)) = target.split_once('|') {
                    bag.contexts
                        .entry(name.trim().to_lowercase())
                        .or_default()
                        .merge(ArgBag::parse(args));
                }
            }
        }
        bag
    }

    fn push(&mut self, key: &str, value: String) {
        match split_ephemeral(key) {
            Some((name, remaining)) => self
                .ephemeral
                .entry(normalize(name))
                .or_default()
                .push(EphemeralValue { value, remaining }),
            None => self.base.entry(key.to_string()).or_default().push(value),
        }
    }

    fn merge(&mut self, other: ArgBag) {
        for (k, values) in other.base {
            self.base.entry(k).or_default().extend(values);
        }
        for (k, values) in other.ephemeral {
            self.ephemeral.entry(k).or_default().extend(values);
        }
    }

    /// Builder-style insert, mostly for callers constructing bags in code.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.push(&normalize(key), value.into());
        self
    }

    /// Builder-style bare flag.
    pub fn with_flag(self, key: &str) -> Self {
        self.with(key, FLAG_VALUE)
    }

    /// Replace every value of `key`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.base.insert(normalize(key), vec![value.into()]);
    }

    /// Attach a per-target argument context.
    pub fn add_context(&mut self, target: &str, args: ArgBag) {
        self.contexts.entry(target.to_lowercase()).or_default().merge(args);
    }

    /// Make the arguments given for `target` visible (or clear with `None`).
    pub fn set_context(&mut self, target: Option<&str>) {
        self.context = target.map(str::to_lowercase);
    }

    /// Target names given with `-t`, without their per-target arguments.
    pub fn target_names(&self) -> Vec<String> {
        self.base
            .get("t")
            .map(|ts| {
                ts.iter()
                    .map(|t| t.split('|').next().unwrap_or(t).trim().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn collect(&mut self, key: &str, ephem: bool) -> Vec<String> {
        let mut out = self.base.get(key).cloned().unwrap_or_default();
        let context = self.context.clone();
        if let Some(ctx) = context.as_ref().and_then(|c| self.contexts.get(c)) {
            out.extend(ctx.base.get(key).cloned().unwrap_or_default());
        }
        if ephem {
            out.extend(consume(&mut self.ephemeral, key));
            if let Some(ctx) = context.as_ref().and_then(|c| self.contexts.get_mut(c)) {
                out.extend(consume(&mut ctx.ephemeral, key));
            }
        }
        out
    }

    /// Every value of `key`. Ephemeral reads consume one use of each
    /// ephemeral value.
    pub fn get(&mut self, key: &str, ephem: bool) -> Vec<String> {
        self.collect(key, ephem)
    }

    /// Every value of `key`, parsed.
    pub fn get_parsed<T: FromStr>(&mut self, key: &str, ephem: bool) -> Result<Vec<T>, ArgError> {
        self.collect(key, ephem)
            .into_iter()
            .map(|v| parse_value(key, v))
            .collect()
    }

    /// The last value of `key`.
    pub fn last(&mut self, key: &str, ephem: bool) -> Option<String> {
        self.collect(key, ephem).pop()
    }

    /// The last value of `key`, parsed.
    pub fn last_parsed<T: FromStr>(
        &mut self,
        key: &str,
        ephem: bool,
    ) -> Result<Option<T>, ArgError> {
        self.last(key, ephem).map(|v| parse_value(key, v)).transpose()
    }

    /// Whether `key` is present with a truthy last value.
    pub fn last_bool(&mut self, key: &str, ephem: bool) -> bool {
        self.last(key, ephem).is_some_and(|v| truthy(&v))
    }

    /// All values of `key` joined with `sep`, or `None` if absent.
    pub fn join(&mut self, key: &str, sep: &str, ephem: bool) -> Option<String> {
        let values = self.collect(key, ephem);
        if values.is_empty() {
            None
        } else {
            Some(values.join(sep))
        }
    }

    /// Whether `key` has any value (ephemeral ones included, without consuming).
    pub fn contains(&self, key: &str) -> bool {
        let has = |bag: &ArgBag| {
            bag.base.contains_key(key) || bag.ephemeral.get(key).is_some_and(|v| !v.is_empty())
        };
        has(self)
            || self
                .context
                .as_ref()
                .and_then(|c| self.contexts.get(c))
                .is_some_and(has)
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty() && self.ephemeral.is_empty() && self.contexts.is_empty()
    }
}

fn consume(ephemeral: &mut BTreeMap<String, Vec<EphemeralValue>>, key: &str) -> Vec<String> {
    let Some(values) = ephemeral.get_mut(key) else {
        return Vec::new();
    };
    let out = values.iter().map(|v| v.value.clone()).collect();
    for v in values.iter_mut() {
        v.remaining = v.remaining.saturating_sub(1);
    }
    values.retain(|v| v.remaining > 0);
    if values.is_empty() {
        ephemeral.remove(key);
    }
    out
}

fn parse_value<T: FromStr>(key: &str, value: String) -> Result<T, ArgError> {
    // bare flags read as 1 when asked for a number
    let candidate = if value == FLAG_VALUE { "1" } else { value.trim() };
    candidate.parse().map_err(|_| ArgError::CastFailed {
        value,
        ty: std::any::type_name::<T>().rsplit("::").next().unwrap_or("value"),
        arg: key.to_string(),
    })
}

impl fmt::Display for ArgBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (k, values) in &self.base {
            for v in values {
                if v == FLAG_VALUE {
                    parts.push(k.clone());
                } else {
                    parts.push(format!("-{k} \"{v}\""));
                }
            }
        }
        write!(f, "{}", parts.join(" "))
    }
}
