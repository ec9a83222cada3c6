//! Damage resistances and their application to rolled damage.
//!
//! A [`Resistance`] is conditional: `nonmagical slashing` resists slashing
//! damage unless it is also magical. Resistances are matched against the
//! whitespace-separated tags of each annotated term in a rolled damage tree;
//! matching terms are wrapped in `* 0`, `/ 2` or `* 2`.

use crate::args::ArgBag;
use crate::dice::{BinaryOp, DiceNode, RollResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// Resistance
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ResistanceRepr")]
pub struct Resistance {
    pub dtype: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unless: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub only: BTreeSet<String>,
}

/// Resistances are stored either as a bare string or in full form.
#[derive(Deserialize)]
#[serde(untagged)]
enum ResistanceRepr {
    Str(String),
    Full {
        dtype: String,
        #[serde(default)]
        unless: Vec<String>,
        #[serde(default)]
        only: Vec<String>,
    },
}

impl From<ResistanceRepr> for Resistance {
    fn from(repr: ResistanceRepr) -> Self {
        match repr {
            ResistanceRepr::Str(s) => Resistance::from_str_spec(&s),
            ResistanceRepr::Full { dtype, unless, only } => Resistance::new(&dtype, unless, only),
        }
    }
}

impl Resistance {
    pub fn new<U, O>(dtype: &str, unless: U, only: O) -> Self
    where
        U: IntoIterator,
        U::Item: AsRef<str>,
        O: IntoIterator,
        O::Item: AsRef<str>,
    {
        Self {
            dtype: dtype.to_lowercase(),
            unless: unless.into_iter().map(|t| t.as_ref().to_lowercase()).collect(),
            only: only.into_iter().map(|t| t.as_ref().to_lowercase()).collect(),
        }
    }

    pub fn simple(dtype: &str) -> Self {
        Self::new(dtype, Vec::<String>::new(), Vec::<String>::new())
    }

    /// Parse `"nonmagical cold fire"`: the last word is the damage type,
    /// `non`-prefixed words are exclusions and the rest are requirements.
    pub fn from_str_spec(spec: &str) -> Self {
        let lower = spec.to_lowercase();
        let mut words: Vec<&str> = lower.split_whitespace().collect();
        let Some(dtype) = words.pop() else {
            return Self::simple("");
        };
        let mut unless = BTreeSet::new();
        let mut only = BTreeSet::new();
        for word in words {
            match word.strip_prefix("non") {
                Some(rest) if !rest.is_empty() => {
                    unless.insert(rest.trim_start_matches('-').to_string());
                }
                _ => {
                    only.insert(word.to_string());
                }
            }
        }
        Self {
            dtype: dtype.to_string(),
            unless,
            only,
        }
    }

    /// Whether this resistance covers the given lowercase tag set.
    pub fn applies_to(&self, tokens: &BTreeSet<String>) -> bool {
        tokens.contains(&self.dtype)
            && self.unless.is_disjoint(tokens)
            && self.only.is_subset(tokens)
    }

    pub fn applies_to_str(&self, text: &str) -> bool {
        self.applies_to(&tokenize(text))
    }
}

impl fmt::Display for Resistance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.unless.iter().map(|u| format!("non{u}")).collect();
        parts.extend(self.only.iter().cloned());
        parts.push(self.dtype.clone());
        write!(f, "{}", parts.join(" "))
    }
}

/// Lowercase word tokens of a damage type string.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

// ============================================================================
// Resistances
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Resistances {
    #[serde(default)]
    pub resist: Vec<Resistance>,
    #[serde(default)]
    pub immune: Vec<Resistance>,
    #[serde(default)]
    pub vuln: Vec<Resistance>,
    /// Damage types whose resistances, immunities and vulnerabilities are
    /// ignored.
    #[serde(default)]
    pub neutral: Vec<Resistance>,
}

impl Resistances {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `-resist`, `-immune`, `-vuln` and `-neutral` arguments.
    pub fn from_args(args: &mut ArgBag, ephem: bool) -> Self {
        let mut parse = |key: &str| {
            args.get(key, ephem)
                .iter()
                .map(|v| Resistance::from_str_spec(v))
                .collect::<Vec<_>>()
        };
        Self {
            resist: parse("resist"),
            immune: parse("immune"),
            vuln: parse("vuln"),
            neutral: parse("neutral"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resist.is_empty()
            && self.immune.is_empty()
            && self.vuln.is_empty()
            && self.neutral.is_empty()
    }

    pub fn update(&mut self, other: Resistances) {
        self.resist.extend(other.resist);
        self.immune.extend(other.immune);
        self.vuln.extend(other.vuln);
        self.neutral.extend(other.neutral);
    }

    pub fn is_resistant(&self, dtype: &str) -> bool {
        let tokens = tokenize(dtype);
        !self.is_neutral_tokens(&tokens) && self.resist.iter().any(|r| r.applies_to(&tokens))
    }

    pub fn is_immune(&self, dtype: &str) -> bool {
        let tokens = tokenize(dtype);
        !self.is_neutral_tokens(&tokens) && self.immune.iter().any(|r| r.applies_to(&tokens))
    }

    pub fn is_vulnerable(&self, dtype: &str) -> bool {
        let tokens = tokenize(dtype);
        !self.is_neutral_tokens(&tokens) && self.vuln.iter().any(|r| r.applies_to(&tokens))
    }

    pub fn is_neutral(&self, dtype: &str) -> bool {
        self.is_neutral_tokens(&tokenize(dtype))
    }

    fn is_neutral_tokens(&self, tokens: &BTreeSet<String>) -> bool {
        self.neutral.iter().any(|r| r.applies_to(tokens))
    }

    /// Wrap a term tagged with `tokens` in the matching multiplier.
    fn apply(&self, node: DiceNode, tokens: &BTreeSet<String>) -> DiceNode {
        if self.is_neutral_tokens(tokens) {
            return node;
        }
        let node = if self.immune.iter().any(|r| r.applies_to(tokens)) {
            node.wrap_literal(BinaryOp::Mul, 0)
        } else if self.resist.iter().any(|r| r.applies_to(tokens)) {
            node.wrap_literal(BinaryOp::Div, 2)
        } else {
            node
        };
        if self.vuln.iter().any(|r| r.applies_to(tokens)) {
            node.wrap_literal(BinaryOp::Mul, 2)
        } else {
            node
        }
    }
}

impl fmt::Display for Resistances {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |list: &[Resistance]| {
            list.iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut out = Vec::new();
        if !self.resist.is_empty() {
            out.push(format!("**Resistances**: {}", join(&self.resist)));
        }
        if !self.immune.is_empty() {
            out.push(format!("**Immunities**: {}", join(&self.immune)));
        }
        if !self.vuln.is_empty() {
            out.push(format!("**Vulnerabilities**: {}", join(&self.vuln)));
        }
        write!(f, "{}", out.join("\n"))
    }
}

// ============================================================================
// Damage type transforms
// ============================================================================

/// Damage type rewrites from `-dtype` arguments: `fire>cold` maps one
/// type to another, a bare `necrotic` overrides every type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DamageTransforms {
    pub overrides: BTreeMap<String, String>,
    pub replace_all: Option<String>,
}

impl DamageTransforms {
    pub fn from_args<S: AsRef<str>>(dtype_args: &[S]) -> Self {
        let mut out = Self::default();
        for arg in dtype_args {
            let arg = arg.as_ref();
            if arg.contains('>') {
                let parts: Vec<&str> = arg.split('>').collect();
                if let Some((to, froms)) = parts.split_last() {
                    for from in froms {
                        out.overrides.insert(from.trim().to_lowercase(), to.trim().to_string());
                    }
                }
            } else {
                out.replace_all = Some(arg.to_string());
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty() && self.replace_all.is_none()
    }

    /// Meta lines announcing the transforms.
    pub fn describe(&self) -> Vec<String> {
        if let Some(to) = &self.replace_all {
            return vec![format!("**Damage Type**: {to}")];
        }
        self.overrides
            .iter()
            .map(|(from, to)| format!("**Damage Change**: {from} > {to}"))
            .collect()
    }

    fn transform(&self, annotations: &[String]) -> Vec<String> {
        if let Some(to) = &self.replace_all {
            return vec![to.clone()];
        }
        annotations
            .iter()
            .map(|ann| {
                ann.split_whitespace()
                    .map(|word| {
                        self.overrides
                            .get(&word.to_lowercase())
                            .cloned()
                            .unwrap_or_else(|| word.to_string())
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }
}

/// Apply resistances and damage type transforms to a rolled damage tree in
/// place, then recompute its total.
///
/// Unannotated terms inherit the annotation to their left first. Tags in
/// `always` (such as `magical`) count as present on every term.
pub fn do_resistances(
    roll: &mut RollResult,
    resistances: &Resistances,
    always: &BTreeSet<String>,
    transforms: &DamageTransforms,
) {
    roll.expr.inherit_annotations_left();
    if let (Some(to), false) = (&transforms.replace_all, roll.expr.has_annotation()) {
        let root = std::mem::replace(&mut roll.expr, DiceNode::Literal(0));
        roll.expr = DiceNode::Annotated {
            value: Box::new(root),
            annotations: vec![to.clone()],
        };
    }

    let root = std::mem::replace(&mut roll.expr, DiceNode::Literal(0));
    roll.expr = root.map_annotated(&mut |node| match node {
        DiceNode::Annotated { value, annotations } => {
            let annotations = transforms.transform(&annotations);
            let mut tokens: BTreeSet<String> = annotations
                .iter()
                .flat_map(|a| tokenize(a))
                .collect();
            tokens.extend(always.iter().cloned());
            let node = DiceNode::Annotated { value, annotations };
            resistances.apply(node, &tokens)
        }
        other => other,
    });
    roll.recompute();
}
