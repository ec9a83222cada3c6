//! D&D dice rolling system.
//!
//! Supports standard dice notation with annotations: `XdY+Z`, keep
//! highest/lowest, reroll-once, minimum and maximum die values, arithmetic
//! with parentheses, and damage-type tags such as `2d6 [fire]`.
//!
//! Parsed expressions are kept as a syntax tree so the automation engine can
//! rewrite them before rolling (doubling dice on a crit, adding a floor to
//! each die) and after rolling (halving resisted damage in place).

use rand::rngs::ThreadRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum number of dice a single roll may throw.
pub const DEFAULT_MAX_DICE: u32 = 1000;

/// Error type for dice parsing and rolling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiceError {
    #[error("Invalid dice notation: {0}")]
    InvalidNotation(String),
    #[error("Invalid die size: {0}")]
    InvalidDieSize(u32),
    #[error("No dice specified")]
    NoDice,
    #[error("Cannot keep {keep} dice when only rolling {count} (in {notation})")]
    InvalidKeepCount {
        keep: u32,
        count: u32,
        notation: String,
    },
    #[error("Too many dice rolled (limit {0})")]
    TooManyDice(u32),
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Number too large")]
    Overflow,
}

// ============================================================================
// Advantage
// ============================================================================

/// Advantage state for d20 rolls.
///
/// Serialized as the integers -1 (disadvantage), 0, 1 (advantage) and
/// 2 (elven accuracy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "i64", into = "i64")]
pub enum Advantage {
    #[default]
    Normal,
    Advantage,
    Disadvantage,
    /// Roll three d20s and keep the highest.
    Elven,
}

impl Advantage {
    /// Combine two advantage states (advantage + disadvantage = normal).
    pub fn combine(self, other: Advantage) -> Advantage {
        match (self, other) {
            (Advantage::Normal, x) | (x, Advantage::Normal) => x,
            (Advantage::Disadvantage, Advantage::Disadvantage) => Advantage::Disadvantage,
            (Advantage::Disadvantage, _) | (_, Advantage::Disadvantage) => Advantage::Normal,
            (Advantage::Elven, _) | (_, Advantage::Elven) => Advantage::Elven,
            (Advantage::Advantage, Advantage::Advantage) => Advantage::Advantage,
        }
    }

    /// Reconcile independent advantage sources into a single state.
    ///
    /// One advantage and one disadvantage cancel out. Elven accuracy wins over
    /// plain advantage as long as there is no disadvantage.
    pub fn reconcile(adv: bool, dis: bool, elven: bool) -> Advantage {
        if elven && !dis {
            return Advantage::Elven;
        }
        match ((adv || elven) as i8) - (dis as i8) {
            1 => Advantage::Advantage,
            -1 => Advantage::Disadvantage,
            _ => Advantage::Normal,
        }
    }

    /// Build the d20 part of a roll, e.g. `2d20ro1kh1`.
    ///
    /// Reroll and minimum operators are placed before keep so they apply to
    /// every die thrown.
    pub fn d20_notation(self, reroll: Option<i64>, minimum: Option<i64>) -> String {
        let mut ops = String::new();
        if let Some(reroll) = reroll.filter(|r| *r != 0) {
            ops.push_str(&format!("ro{reroll}"));
        }
        if let Some(minimum) = minimum.filter(|m| *m != 0) {
            ops.push_str(&format!("mi{minimum}"));
        }
        match self {
            Advantage::Normal => format!("1d20{ops}"),
            Advantage::Advantage => format!("2d20{ops}kh1"),
            Advantage::Disadvantage => format!("2d20{ops}kl1"),
            Advantage::Elven => format!("3d20{ops}kh1"),
        }
    }

    /// The three-valued form used by skill and save definitions.
    pub fn from_bool(adv: Option<bool>) -> Advantage {
        match adv {
            Some(true) => Advantage::Advantage,
            Some(false) => Advantage::Disadvantage,
            None => Advantage::Normal,
        }
    }
}

impl TryFrom<i64> for Advantage {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Advantage::Disadvantage),
            0 => Ok(Advantage::Normal),
            1 => Ok(Advantage::Advantage),
            2 => Ok(Advantage::Elven),
            other => Err(format!("{other} is not a valid advantage type")),
        }
    }
}

impl From<Advantage> for i64 {
    fn from(adv: Advantage) -> i64 {
        match adv {
            Advantage::Disadvantage => -1,
            Advantage::Normal => 0,
            Advantage::Advantage => 1,
            Advantage::Elven => 2,
        }
    }
}

// ============================================================================
// Dice sources
// ============================================================================

/// Where die faces come from. Implemented for any RNG and by the scripted
/// source in [`crate::testing`].
pub trait DiceSource {
    /// Roll one die with the given number of sides, returning 1..=sides.
    fn roll_die(&mut self, sides: u32) -> i64;
}

/// A dice source backed by a random number generator.
#[derive(Debug, Clone)]
pub struct RandomDice<R: Rng = ThreadRng> {
    rng: R,
}

impl RandomDice<ThreadRng> {
    pub fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
        }
    }
}

impl Default for RandomDice<ThreadRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> RandomDice<R> {
    /// Roll with a specific RNG (useful for seeded simulations).
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }
}

impl<R: Rng> DiceSource for RandomDice<R> {
    fn roll_die(&mut self, sides: u32) -> i64 {
        self.rng.gen_range(1..=sides as i64)
    }
}

// ============================================================================
// Syntax tree
// ============================================================================

/// Which dice a set operator applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selector {
    Exactly(i64),
    LessThan(i64),
    GreaterThan(i64),
}

impl Selector {
    pub fn matches(&self, value: i64) -> bool {
        match *self {
            Selector::Exactly(n) => value == n,
            Selector::LessThan(n) => value < n,
            Selector::GreaterThan(n) => value > n,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Exactly(n) => write!(f, "{n}"),
            Selector::LessThan(n) => write!(f, "<{n}"),
            Selector::GreaterThan(n) => write!(f, ">{n}"),
        }
    }
}

/// An operator attached to a set of dice, applied left to right.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiceOperation {
    KeepHighest(u32),
    KeepLowest(u32),
    RerollOnce(Selector),
    Minimum(i64),
    Maximum(i64),
}

impl fmt::Display for DiceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiceOperation::KeepHighest(n) => write!(f, "kh{n}"),
            DiceOperation::KeepLowest(n) => write!(f, "kl{n}"),
            DiceOperation::RerollOnce(sel) => write!(f, "ro{sel}"),
            DiceOperation::Minimum(n) => write!(f, "mi{n}"),
            DiceOperation::Maximum(n) => write!(f, "ma{n}"),
        }
    }
}

/// A single thrown die.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Die {
    pub value: i64,
    pub kept: bool,
}

/// `XdY` plus its operators, and the dice thrown once rolled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceSet {
    pub count: u32,
    pub sides: u32,
    pub operations: Vec<DiceOperation>,
    #[serde(default)]
    pub results: Vec<Die>,
}

impl DiceSet {
    pub fn new(count: u32, sides: u32) -> Self {
        Self {
            count,
            sides,
            operations: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn total(&self) -> i64 {
        self.results.iter().filter(|d| d.kept).map(|d| d.value).sum()
    }

    fn kept_values(&self) -> impl Iterator<Item = i64> + '_ {
        self.results.iter().filter(|d| d.kept).map(|d| d.value)
    }

    fn roll(&mut self, source: &mut dyn DiceSource, budget: &mut u32) -> Result<(), DiceError> {
        let mut throw = |budget: &mut u32| -> Result<Die, DiceError> {
            if *budget == 0 {
                return Err(DiceError::TooManyDice(DEFAULT_MAX_DICE));
            }
            *budget -= 1;
            let value = source.roll_die(self.sides).clamp(1, self.sides as i64);
            Ok(Die { value, kept: true })
        };

        if self.count > *budget {
            return Err(DiceError::TooManyDice(DEFAULT_MAX_DICE));
        }
        let mut results = Vec::with_capacity(self.count as usize);
        for _ in 0..self.count {
            results.push(throw(budget)?);
        }

        for op in &self.operations {
            match op {
                DiceOperation::RerollOnce(selector) => {
                    let rolled = results.len();
                    for i in 0..rolled {
                        if results[i].kept && selector.matches(results[i].value) {
                            results[i].kept = false;
                            results.push(throw(budget)?);
                        }
                    }
                }
                DiceOperation::Minimum(min) => {
                    for die in results.iter_mut().filter(|d| d.kept) {
                        die.value = die.value.max(*min);
                    }
                }
                DiceOperation::Maximum(max) => {
                    for die in results.iter_mut().filter(|d| d.kept) {
                        die.value = die.value.min(*max);
                    }
                }
                DiceOperation::KeepHighest(n) | DiceOperation::KeepLowest(n) => {
                    let mut kept: Vec<usize> = (0..results.len())
                        .filter(|i| results[*i].kept)
                        .collect();
                    if matches!(op, DiceOperation::KeepHighest(_)) {
                        kept.sort_by(|a, b| results[*b].value.cmp(&results[*a].value));
                    } else {
                        kept.sort_by(|a, b| results[*a].value.cmp(&results[*b].value));
                    }
                    for idx in kept.into_iter().skip(*n as usize) {
                        results[idx].kept = false;
                    }
                }
            }
        }

        self.results = results;
        Ok(())
    }

    fn notation(&self) -> String {
        let ops: String = self.operations.iter().map(|o| o.to_string()).collect();
        format!("{}d{}{}", self.count, self.sides, ops)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Floor division.
    Div,
    Mod,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }
}

/// A node of a dice expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiceNode {
    Literal(i64),
    Dice(DiceSet),
    Unary {
        op: UnaryOp,
        operand: Box<DiceNode>,
    },
    Binary {
        op: BinaryOp,
        left: Box<DiceNode>,
        right: Box<DiceNode>,
    },
    Parenthetical(Box<DiceNode>),
    /// A value tagged with one or more bracketed annotations, e.g. `1d6 [fire]`.
    Annotated {
        value: Box<DiceNode>,
        annotations: Vec<String>,
    },
}

impl DiceNode {
    pub fn binary(op: BinaryOp, left: DiceNode, right: DiceNode) -> DiceNode {
        DiceNode::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Wrap this node as `(self) op literal`.
    pub fn wrap_literal(self, op: BinaryOp, literal: i64) -> DiceNode {
        DiceNode::binary(
            op,
            DiceNode::Parenthetical(Box::new(self)),
            DiceNode::Literal(literal),
        )
    }

    /// Total of this node. Unrolled dice count as zero; division by zero
    /// yields zero (rolling reports it as an error first).
    pub fn total(&self) -> i64 {
        self.checked_total().unwrap_or(0)
    }

    fn checked_total(&self) -> Result<i64, DiceError> {
        Ok(match self {
            DiceNode::Literal(n) => *n,
            DiceNode::Dice(set) => set.total(),
            DiceNode::Unary { op, operand } => match op {
                UnaryOp::Neg => operand
                    .checked_total()?
                    .checked_neg()
                    .ok_or(DiceError::Overflow)?,
                UnaryOp::Pos => operand.checked_total()?,
            },
            DiceNode::Binary { op, left, right } => {
                let l = left.checked_total()?;
                let r = right.checked_total()?;
                match op {
                    BinaryOp::Add => l.checked_add(r).ok_or(DiceError::Overflow)?,
                    BinaryOp::Sub => l.checked_sub(r).ok_or(DiceError::Overflow)?,
                    BinaryOp::Mul => l.checked_mul(r).ok_or(DiceError::Overflow)?,
                    BinaryOp::Div => {
                        if r == 0 {
                            return Err(DiceError::DivisionByZero);
                        }
                        if l == i64::MIN && r == -1 {
                            return Err(DiceError::Overflow);
                        }
                        floor_div(l, r)
                    }
                    BinaryOp::Mod => {
                        if r == 0 {
                            return Err(DiceError::DivisionByZero);
                        }
                        if r == -1 {
                            return Ok(0);
                        }
                        l - r * floor_div(l, r)
                    }
                }
            }
            DiceNode::Parenthetical(inner) => inner.checked_total()?,
            DiceNode::Annotated { value, .. } => value.checked_total()?,
        })
    }

    /// Direct children, left to right.
    pub fn children(&self) -> Vec<&DiceNode> {
        match self {
            DiceNode::Literal(_) | DiceNode::Dice(_) => Vec::new(),
            DiceNode::Unary { operand, .. } => vec![operand],
            DiceNode::Binary { left, right, .. } => vec![left, right],
            DiceNode::Parenthetical(inner) => vec![inner],
            DiceNode::Annotated { value, .. } => vec![value],
        }
    }

    /// The leftmost leaf: the first die set or literal of the expression.
    pub fn leftmost(&self) -> &DiceNode {
        match self {
            DiceNode::Literal(_) | DiceNode::Dice(_) => self,
            DiceNode::Unary { operand, .. } => operand.leftmost(),
            DiceNode::Binary { left, .. } => left.leftmost(),
            DiceNode::Parenthetical(inner) => inner.leftmost(),
            DiceNode::Annotated { value, .. } => value.leftmost(),
        }
    }

    fn leftmost_mut(&mut self) -> &mut DiceNode {
        match self {
            DiceNode::Unary { operand, .. } => operand.leftmost_mut(),
            DiceNode::Binary { left, .. } => left.leftmost_mut(),
            DiceNode::Parenthetical(inner) => inner.leftmost_mut(),
            DiceNode::Annotated { value, .. } => value.leftmost_mut(),
            DiceNode::Literal(_) | DiceNode::Dice(_) => self,
        }
    }

    /// Apply `f` to every die set in the tree.
    pub fn for_each_dice_mut(&mut self, f: &mut dyn FnMut(&mut DiceSet)) {
        match self {
            DiceNode::Literal(_) => {}
            DiceNode::Dice(set) => f(set),
            DiceNode::Unary { operand, .. } => operand.for_each_dice_mut(f),
            DiceNode::Binary { left, right, .. } => {
                left.for_each_dice_mut(f);
                right.for_each_dice_mut(f);
            }
            DiceNode::Parenthetical(inner) => inner.for_each_dice_mut(f),
            DiceNode::Annotated { value, .. } => value.for_each_dice_mut(f),
        }
    }

    /// Count of every die set in the tree (the `X` of each `XdY`).
    pub fn dice_count(&self) -> u32 {
        match self {
            DiceNode::Dice(set) => set.count,
            other => other
                .children()
                .iter()
                .fold(0, |n, c| n.saturating_add(c.dice_count())),
        }
    }

    fn roll(&mut self, source: &mut dyn DiceSource, budget: &mut u32) -> Result<(), DiceError> {
        match self {
            DiceNode::Literal(_) => Ok(()),
            DiceNode::Dice(set) => set.roll(source, budget),
            DiceNode::Unary { operand, .. } => operand.roll(source, budget),
            DiceNode::Binary { left, right, .. } => {
                left.roll(source, budget)?;
                right.roll(source, budget)
            }
            DiceNode::Parenthetical(inner) => inner.roll(source, budget),
            DiceNode::Annotated { value, .. } => value.roll(source, budget),
        }
    }

    /// True if this node or any descendant carries an annotation.
    pub fn has_annotation(&self) -> bool {
        match self {
            DiceNode::Annotated { .. } => true,
            other => other.children().iter().any(|c| c.has_annotation()),
        }
    }

    /// Markdown rendering with bolded crits/fumbles and struck-out dropped dice.
    pub fn markdown(&self) -> String {
        self.render(true)
    }

    /// Plain rendering suitable for re-parsing (dice collapse to their totals).
    pub fn plain(&self) -> String {
        self.render(false)
    }

    fn render(&self, markdown: bool) -> String {
        match self {
            DiceNode::Literal(n) => n.to_string(),
            DiceNode::Dice(set) => {
                if !markdown {
                    return set.total().to_string();
                }
                if set.results.is_empty() {
                    return set.notation();
                }
                let faces: Vec<String> = set
                    .results
                    .iter()
                    .map(|die| {
                        let face = if die.value == 1 || die.value == set.sides as i64 {
                            format!("**{}**", die.value)
                        } else {
                            die.value.to_string()
                        };
                        if die.kept {
                            face
                        } else {
                            format!("~~{face}~~")
                        }
                    })
                    .collect();
                format!("{} ({})", set.notation(), faces.join(", "))
            }
            DiceNode::Unary { op, operand } => match op {
                UnaryOp::Neg => format!("-{}", operand.render(markdown)),
                UnaryOp::Pos => format!("+{}", operand.render(markdown)),
            },
            DiceNode::Binary { op, left, right } => format!(
                "{} {} {}",
                left.render(markdown),
                op.symbol(),
                right.render(markdown)
            ),
            DiceNode::Parenthetical(inner) => format!("({})", inner.render(markdown)),
            DiceNode::Annotated { value, annotations } => {
                let tags: Vec<String> = annotations.iter().map(|a| format!("[{a}]")).collect();
                format!("{} {}", value.render(markdown), tags.join(" "))
            }
        }
    }

    /// Flatten a top-level `a + b - c` chain into signed terms.
    fn additive_terms(&self, sign: i64, out: &mut Vec<(i64, DiceNode)>) {
        match self {
            DiceNode::Binary {
                op: BinaryOp::Add,
                left,
                right,
            } => {
                left.additive_terms(sign, out);
                right.additive_terms(sign, out);
            }
            DiceNode::Binary {
                op: BinaryOp::Sub,
                left,
                right,
            } => {
                left.additive_terms(sign, out);
                right.additive_terms(-sign, out);
            }
            other => out.push((sign, other.clone())),
        }
    }

    /// Build an additive chain back out of signed terms.
    fn from_terms(terms: Vec<(i64, DiceNode)>) -> DiceNode {
        let mut iter = terms.into_iter();
        let Some((first_sign, first)) = iter.next() else {
            return DiceNode::Literal(0);
        };
        let mut node = if first_sign < 0 {
            DiceNode::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(first),
            }
        } else {
            first
        };
        for (sign, term) in iter {
            let op = if sign < 0 { BinaryOp::Sub } else { BinaryOp::Add };
            node = DiceNode::binary(op, node, term);
        }
        node
    }

    /// Collapse a rolled tree into literals, keeping top-level annotated terms
    /// and summing everything unannotated into one trailing literal.
    pub fn simplified(&self) -> DiceNode {
        let mut terms = Vec::new();
        self.additive_terms(1, &mut terms);

        let mut out = Vec::new();
        let mut loose = 0i64;
        let mut saw_loose = false;
        for (sign, term) in terms {
            match &term {
                DiceNode::Annotated { annotations, .. } => {
                    let value = term.total();
                    let literal = DiceNode::Annotated {
                        value: Box::new(DiceNode::Literal(value.abs())),
                        annotations: annotations.clone(),
                    };
                    let sign = if value < 0 { -sign } else { sign };
                    out.push((sign, literal));
                }
                _ => {
                    loose += sign * term.total();
                    saw_loose = true;
                }
            }
        }
        if saw_loose && (loose != 0 || out.is_empty()) {
            let sign = if loose < 0 { -1 } else { 1 };
            out.push((sign, DiceNode::Literal(loose.abs())));
        }
        DiceNode::from_terms(out)
    }

    /// Give unannotated top-level terms the annotation of the nearest
    /// annotated term to their left.
    pub fn inherit_annotations_left(&mut self) {
        let mut terms = Vec::new();
        self.additive_terms(1, &mut terms);
        if terms.len() < 2 || !terms.iter().any(|(_, t)| t.has_annotation()) {
            return;
        }
        let mut current: Option<Vec<String>> = None;
        let terms = terms
            .into_iter()
            .map(|(sign, term)| match term {
                DiceNode::Annotated { value, annotations } => {
                    current = Some(annotations.clone());
                    (sign, DiceNode::Annotated { value, annotations })
                }
                other => match &current {
                    Some(annotations) if !other.has_annotation() => (
                        sign,
                        DiceNode::Annotated {
                            value: Box::new(other),
                            annotations: annotations.clone(),
                        },
                    ),
                    _ => (sign, other),
                },
            })
            .collect();
        *self = DiceNode::from_terms(terms);
    }

    /// Visit annotated nodes depth-first, letting `f` replace each one.
    /// Nodes returned by `f` are not revisited.
    pub fn map_annotated(self, f: &mut dyn FnMut(DiceNode) -> DiceNode) -> DiceNode {
        match self {
            node @ DiceNode::Annotated { .. } => f(node),
            DiceNode::Unary { op, operand } => DiceNode::Unary {
                op,
                operand: Box::new(operand.map_annotated(f)),
            },
            DiceNode::Binary { op, left, right } => DiceNode::Binary {
                op,
                left: Box::new(left.map_annotated(f)),
                right: Box::new(right.map_annotated(f)),
            },
            DiceNode::Parenthetical(inner) => {
                DiceNode::Parenthetical(Box::new(inner.map_annotated(f)))
            }
            leaf => leaf,
        }
    }
}

/// Integer division rounding toward negative infinity.
pub fn floor_div(l: i64, r: i64) -> i64 {
    let q = l / r;
    if l % r != 0 && ((l < 0) != (r < 0)) {
        q - 1
    } else {
        q
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// A parsed (and possibly rewritten) dice expression, not yet rolled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceExpression {
    pub root: DiceNode,
}

impl DiceExpression {
    /// Parse a dice notation string.
    pub fn parse(notation: &str) -> Result<Self, DiceError> {
        if notation.trim().is_empty() {
            return Err(DiceError::NoDice);
        }
        let mut parser = Parser::new(notation);
        let root = parser.parse_expr()?;
        parser.skip_ws();
        if !parser.at_end() {
            return Err(DiceError::InvalidNotation(notation.trim().to_string()));
        }
        Ok(Self { root })
    }

    /// Append `+ other` to the expression.
    pub fn append(&mut self, other: DiceExpression) {
        let left = std::mem::replace(&mut self.root, DiceNode::Literal(0));
        self.root = DiceNode::binary(BinaryOp::Add, left, other.root);
    }

    /// Attach a `miN` floor to every die set.
    pub fn set_minimum(&mut self, minimum: i64) {
        self.root
            .for_each_dice_mut(&mut |set| set.operations.push(DiceOperation::Minimum(minimum)));
    }

    /// Force every die to its maximum face.
    pub fn maximize(&mut self) {
        self.root.for_each_dice_mut(&mut |set| {
            let sides = set.sides as i64;
            set.operations.push(DiceOperation::Minimum(sides));
        });
    }

    /// Double the count of every die set (critical hits).
    pub fn double_dice(&mut self) -> Result<(), DiceError> {
        let mut overflow = false;
        self.root.for_each_dice_mut(&mut |set| match set.count.checked_mul(2) {
            Some(count) => set.count = count,
            None => overflow = true,
        });
        if overflow {
            return Err(DiceError::Overflow);
        }
        Ok(())
    }

    /// Replace the count of every die set (cantrip scaling).
    pub fn set_dice_count(&mut self, count: u32) {
        self.root.for_each_dice_mut(&mut |set| set.count = count);
    }

    /// Add extra dice to the leftmost die set, if the expression starts with one.
    pub fn add_leftmost_dice(&mut self, extra: u32) -> Result<(), DiceError> {
        if let DiceNode::Dice(set) = self.root.leftmost_mut() {
            set.count = set.count.checked_add(extra).ok_or(DiceError::Overflow)?;
        }
        Ok(())
    }

    /// Roll the dice expression and return the result.
    pub fn roll(&self) -> Result<RollResult, DiceError> {
        self.roll_with(&mut RandomDice::new())
    }

    /// Roll with a specific dice source (useful for testing).
    pub fn roll_with(&self, source: &mut dyn DiceSource) -> Result<RollResult, DiceError> {
        self.roll_limited(source, DEFAULT_MAX_DICE)
    }

    pub fn roll_limited(
        &self,
        source: &mut dyn DiceSource,
        max_dice: u32,
    ) -> Result<RollResult, DiceError> {
        let mut root = self.root.clone();
        let mut budget = max_dice;
        root.roll(source, &mut budget).map_err(|e| match e {
            DiceError::TooManyDice(_) => DiceError::TooManyDice(max_dice),
            other => other,
        })?;
        let total = root.checked_total()?;
        let crit = CritType::of(&root);
        Ok(RollResult { expr: root, total, crit })
    }
}

impl FromStr for DiceExpression {
    type Err = DiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DiceExpression::parse(s)
    }
}

impl fmt::Display for DiceExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.markdown())
    }
}

/// Critical state of a roll, read off its leftmost d20.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CritType {
    #[default]
    None,
    Crit,
    Fail,
}

impl CritType {
    fn of(root: &DiceNode) -> CritType {
        match root.leftmost() {
            DiceNode::Dice(set) if set.sides == 20 => {
                let kept: Vec<i64> = set.kept_values().collect();
                if kept.len() != 1 {
                    CritType::None
                } else if kept[0] == 20 {
                    CritType::Crit
                } else if kept[0] == 1 {
                    CritType::Fail
                } else {
                    CritType::None
                }
            }
            _ => CritType::None,
        }
    }
}

/// Complete result of a dice roll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollResult {
    pub expr: DiceNode,
    pub total: i64,
    pub crit: CritType,
}

impl RollResult {
    /// Markdown form: `1d20 (12) + 5 = `17``.
    pub fn result(&self) -> String {
        format!("{} = `{}`", self.expr.markdown(), self.total)
    }

    /// Total of the leftmost term: the kept d20 of an attack or save.
    pub fn natural(&self) -> i64 {
        self.expr.leftmost().total()
    }

    /// Recompute the total after the tree has been rewritten in place.
    pub fn recompute(&mut self) {
        self.total = self.expr.total();
    }

    /// A copy collapsed to literals, see [`DiceNode::simplified`].
    pub fn simplified(&self) -> RollResult {
        RollResult {
            expr: self.expr.simplified(),
            total: self.total,
            crit: self.crit,
        }
    }
}

impl fmt::Display for RollResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.result())
    }
}

/// Convenience function to roll dice from a notation string.
pub fn roll(notation: &str) -> Result<RollResult, DiceError> {
    DiceExpression::parse(notation)?.roll()
}

/// Parse and roll with the given source.
pub fn roll_with(notation: &str, source: &mut dyn DiceSource) -> Result<RollResult, DiceError> {
    DiceExpression::parse(notation)?.roll_with(source)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser<'s> {
    src: &'s str,
    chars: Vec<char>,
    pos: usize,
}

impl<'s> Parser<'s> {
    fn new(src: &'s str) -> Self {
        Self {
            src,
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self) -> DiceError {
        DiceError::InvalidNotation(self.src.trim().to_string())
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_pair(&self) -> Option<(char, char)> {
        Some((*self.chars.get(self.pos)?, *self.chars.get(self.pos + 1)?))
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn parse_expr(&mut self) -> Result<DiceNode, DiceError> {
        let mut left = self.parse_term()?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some('+') => BinaryOp::Add,
                Some('-') => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = DiceNode::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<DiceNode, DiceError> {
        let mut left = self.parse_unary()?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some('*') => BinaryOp::Mul,
                Some('/') => BinaryOp::Div,
                Some('%') => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            // `//` is accepted as floor division too
            if op == BinaryOp::Div && self.peek() == Some('/') {
                self.pos += 1;
            }
            let right = self.parse_unary()?;
            left = DiceNode::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<DiceNode, DiceError> {
        self.skip_ws();
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                Ok(DiceNode::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(self.parse_unary()?),
                })
            }
            Some('+') => {
                self.pos += 1;
                Ok(DiceNode::Unary {
                    op: UnaryOp::Pos,
                    operand: Box::new(self.parse_unary()?),
                })
            }
            _ => self.parse_annotated(),
        }
    }

    fn parse_annotated(&mut self) -> Result<DiceNode, DiceError> {
        let atom = self.parse_atom()?;
        let mut annotations = Vec::new();
        loop {
            let save = self.pos;
            self.skip_ws();
            if self.peek() != Some('[') {
                self.pos = save;
                break;
            }
            self.pos += 1;
            let start = self.pos;
            while self.peek().is_some_and(|c| c != ']') {
                self.pos += 1;
            }
            if self.at_end() {
                return Err(self.error());
            }
            let text: String = self.chars[start..self.pos].iter().collect();
            self.pos += 1;
            annotations.push(text.trim().to_string());
        }
        if annotations.is_empty() {
            Ok(atom)
        } else {
            Ok(DiceNode::Annotated {
                value: Box::new(atom),
                annotations,
            })
        }
    }

    fn parse_atom(&mut self) -> Result<DiceNode, DiceError> {
        self.skip_ws();
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                self.skip_ws();
                if self.peek() != Some(')') {
                    return Err(self.error());
                }
                self.pos += 1;
                Ok(DiceNode::Parenthetical(Box::new(inner)))
            }
            Some(c) if c.is_ascii_digit() => {
                let n = self.parse_number()?;
                if matches!(self.peek(), Some('d' | 'D')) {
                    let count = u32::try_from(n).map_err(|_| self.error())?;
                    self.parse_dice(count)
                } else {
                    Ok(DiceNode::Literal(n))
                }
            }
            Some('d' | 'D') => self.parse_dice(1),
            _ => Err(self.error()),
        }
    }

    fn parse_number(&mut self) -> Result<i64, DiceError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error());
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        digits.parse().map_err(|_| self.error())
    }

    fn parse_selector(&mut self) -> Result<Selector, DiceError> {
        match self.peek() {
            Some('<') => {
                self.pos += 1;
                Ok(Selector::LessThan(self.parse_number()?))
            }
            Some('>') => {
                self.pos += 1;
                Ok(Selector::GreaterThan(self.parse_number()?))
            }
            _ => Ok(Selector::Exactly(self.parse_number()?)),
        }
    }

    fn parse_dice(&mut self, count: u32) -> Result<DiceNode, DiceError> {
        // consume the 'd'
        self.pos += 1;
        let sides = self.parse_number()?;
        let sides = u32::try_from(sides).map_err(|_| self.error())?;
        if sides == 0 {
            return Err(DiceError::InvalidDieSize(sides));
        }

        let mut set = DiceSet::new(count, sides);
        while let Some(pair) = self.peek_pair() {
            let op = match pair {
                ('k', 'h') | ('k', 'l') => {
                    self.pos += 2;
                    let keep = u32::try_from(self.parse_number()?).map_err(|_| self.error())?;
                    // Validate keep count doesn't exceed dice count
                    if keep > count {
                        return Err(DiceError::InvalidKeepCount {
                            keep,
                            count,
                            notation: self.src.trim().to_string(),
                        });
                    }
                    if pair.1 == 'h' {
                        DiceOperation::KeepHighest(keep)
                    } else {
                        DiceOperation::KeepLowest(keep)
                    }
                }
                ('r', 'o') => {
                    self.pos += 2;
                    DiceOperation::RerollOnce(self.parse_selector()?)
                }
                ('m', 'i') => {
                    self.pos += 2;
                    DiceOperation::Minimum(self.parse_number()?)
                }
                ('m', 'a') => {
                    self.pos += 2;
                    DiceOperation::Maximum(self.parse_number()?)
                }
                _ => break,
            };
            set.operations.push(op);
        }
        Ok(DiceNode::Dice(set))
    }
}
