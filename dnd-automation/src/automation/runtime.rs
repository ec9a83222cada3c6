//! Per-run execution state: the caster, the current target, scripting
//! variables and the output queues effects write into.

use super::errors::AutomationError;
use super::utils::{chunk_text, IntExpr};
use crate::args::ArgBag;
use crate::config::AutomationConfig;
use crate::dice::{Advantage, DiceExpression, DiceSource, RollResult};
use crate::gamedata::{Compendium, Spell};
use crate::initiative::{EffectRef, PassiveEffects};
use crate::resistance::Resistances;
use crate::script::{self, AnnotatedString, EffectHandle, Names, Value};
use crate::world::{Ability, CharacterOptions, Creature, CreatureId, Encounter, TargetRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Title given to fields that continue a longer field.
const CONTINUATION_TITLE: &str = "** **";

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl EmbedField {
    pub fn new(name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            inline,
        }
    }
}

/// Rendered output of a run, ready for the caller to format.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AutomationOutput {
    /// `>>> *phrase*` when a `-phrase` argument was given.
    pub description: Option<String>,
    pub fields: Vec<EmbedField>,
    pub footer: String,
    /// Messages for individual users, keyed by user id.
    pub private_messages: BTreeMap<String, Vec<String>>,
}

impl AutomationOutput {
    pub fn field(&self, name: &str) -> Option<&EmbedField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Every field value and the footer, one block of text.
    pub fn to_text(&self) -> String {
        let mut out = Vec::new();
        if let Some(description) = &self.description {
            out.push(description.clone());
        }
        for field in &self.fields {
            out.push(format!("{}\n{}", field.name, field.value));
        }
        if !self.footer.is_empty() {
            out.push(self.footer.clone());
        }
        out.join("\n\n")
    }
}

// ============================================================================
// Run options
// ============================================================================

/// Caller-supplied settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// The invoking user; hidden rolls are sent to them.
    pub user_id: String,
    pub spell: Option<Spell>,
    /// The caster's concentration effect, used to parent new effects.
    pub conc_effect: Option<EffectRef>,
    pub ab_override: Option<i64>,
    pub dc_override: Option<i64>,
    /// Spellcasting modifier bound as `spell`.
    pub spell_override: Option<i64>,
    pub spell_level_override: Option<i64>,
    /// The effect whose button triggered this run.
    pub ieffect: Option<EffectRef>,
    pub allow_caster_ieffects: bool,
    pub allow_target_ieffects: bool,
    pub from_button: bool,
    pub original_choice: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            spell: None,
            conc_effect: None,
            ab_override: None,
            dc_override: None,
            spell_override: None,
            spell_level_override: None,
            ieffect: None,
            allow_caster_ieffects: true,
            allow_target_ieffects: true,
            from_button: false,
            original_choice: String::new(),
        }
    }
}

impl RunOptions {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_spell(mut self, spell: Spell) -> Self {
        self.spell = Some(spell);
        self
    }

    pub fn with_conc_effect(mut self, effect: EffectRef) -> Self {
        self.conc_effect = Some(effect);
        self
    }

    pub fn with_ab_override(mut self, ab: i64) -> Self {
        self.ab_override = Some(ab);
        self
    }

    pub fn with_dc_override(mut self, dc: i64) -> Self {
        self.dc_override = Some(dc);
        self
    }

    pub fn with_spell_override(mut self, casting_mod: i64) -> Self {
        self.spell_override = Some(casting_mod);
        self
    }

    pub fn with_spell_level_override(mut self, level: i64) -> Self {
        self.spell_level_override = Some(level);
        self
    }

    /// Run as the response to a button on `effect`.
    pub fn from_ieffect_button(mut self, effect: EffectRef) -> Self {
        self.ieffect = Some(effect);
        self.from_button = true;
        self
    }

    pub fn with_ieffects_allowed(mut self, caster: bool, target: bool) -> Self {
        self.allow_caster_ieffects = caster;
        self.allow_target_ieffects = target;
        self
    }

    pub fn with_choice(mut self, choice: impl Into<String>) -> Self {
        self.original_choice = choice.into();
        self
    }
}

// ============================================================================
// Targets
// ============================================================================

/// The target an effect subtree is currently running against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationTarget {
    pub target: TargetRef,
    /// A name-only or absent target: narrated, never resolved mechanically.
    pub is_simple: bool,
}

impl AutomationTarget {
    pub fn new(target: TargetRef, encounter: &Encounter) -> Self {
        let is_simple = match &target {
            TargetRef::Creature(id) => encounter.get(*id).is_none(),
            _ => true,
        };
        Self { target, is_simple }
    }

    pub fn creature_id(&self) -> Option<CreatureId> {
        match (&self.target, self.is_simple) {
            (TargetRef::Creature(id), false) => Some(*id),
            _ => None,
        }
    }

    pub fn creature<'e>(&self, encounter: &'e Encounter) -> Option<&'e Creature> {
        self.creature_id().and_then(|id| encounter.get(id))
    }

    /// Display name, `None` for an absent target.
    pub fn name(&self, encounter: &Encounter) -> Option<String> {
        match &self.target {
            TargetRef::Creature(id) => encounter.get(*id).map(|c| c.name.clone()),
            TargetRef::Named(name) => Some(name.clone()),
            TargetRef::Nobody => None,
        }
    }
}

/// Script value of a target: its stat block, its name, or `None`.
pub fn target_value(target: &TargetRef, encounter: &Encounter) -> Value {
    match target {
        TargetRef::Creature(id) => encounter.get(*id).map(Creature::to_value).unwrap_or_default(),
        TargetRef::Named(name) => Value::str(name.clone()),
        TargetRef::Nobody => Value::None,
    }
}

/// State restored when a nested node returns, whether or not it succeeded.
struct Frame {
    target: Option<AutomationTarget>,
    target_var: Option<Value>,
    in_crit: bool,
    in_save: bool,
}

// ============================================================================
// Context
// ============================================================================

/// Everything one automation run reads and mutates.
pub struct AutomationContext<'a> {
    pub encounter: &'a mut Encounter,
    pub compendium: &'a dyn Compendium,
    pub config: &'a AutomationConfig,
    dice: &'a mut dyn DiceSource,
    caster_index: usize,

    pub targets: Vec<TargetRef>,
    pub args: ArgBag,
    pub user_id: String,

    base_names: Names,
    pub metavars: Names,

    pub(crate) spell: Option<Spell>,
    pub(crate) ab_override: Option<i64>,
    pub(crate) dc_override: Option<i64>,
    pub(crate) spell_override: Option<i64>,
    pub(crate) spell_level_override: Option<i64>,
    pub(crate) conc_effect: Option<EffectRef>,

    pub ieffect: Option<EffectRef>,
    pub from_button: bool,
    pub allow_caster_ieffects: bool,
    pub allow_target_ieffects: bool,

    pub target: Option<AutomationTarget>,
    pub in_crit: bool,
    pub in_save: bool,
    pub caster_needs_commit: bool,

    meta_queue: Vec<String>,
    embed_queue: Vec<String>,
    effect_queue: Vec<(String, String)>,
    footer_queue: Vec<String>,
    postflight_queue: Vec<EmbedField>,
    field_queue: Vec<EmbedField>,
    pm_queue: BTreeMap<String, Vec<String>>,
}

impl<'a> AutomationContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        encounter: &'a mut Encounter,
        compendium: &'a dyn Compendium,
        dice: &'a mut dyn DiceSource,
        config: &'a AutomationConfig,
        caster: CreatureId,
        targets: Vec<TargetRef>,
        mut args: ArgBag,
        options: RunOptions,
    ) -> Result<Self, AutomationError> {
        let caster_index = encounter
            .creatures
            .iter()
            .position(|c| c.id == caster)
            .ok_or_else(|| {
                AutomationError::automation("The caster is not part of the encounter.")
            })?;
        let caster_creature = &encounter.creatures[caster_index];

        let mut base_names = caster_creature.names();
        if let Some(casting_mod) = options.spell_override {
            base_names.insert("spell".into(), Value::Int(casting_mod));
        }

        let choice = args
            .last("choice", false)
            .unwrap_or(options.original_choice.clone())
            .to_lowercase();

        let mut metavars = Names::new();
        metavars.insert("caster".into(), caster_creature.to_value());
        metavars.insert(
            "targets".into(),
            Value::List(targets.iter().map(|t| target_value(t, encounter)).collect()),
        );
        metavars.insert("choice".into(), Value::Str(choice));
        metavars.insert(
            "spell_attack_bonus".into(),
            Value::from(options.ab_override.or(caster_creature.spellbook.sab)),
        );
        metavars.insert(
            "spell_dc".into(),
            Value::from(options.dc_override.or(caster_creature.spellbook.dc)),
        );
        metavars.insert("spell_level".into(), Value::from(options.spell_level_override));
        if let Some(effect) = options.ieffect.and_then(|r| encounter.get_effect(r)) {
            metavars.insert(
                "ieffect".into(),
                Value::Effect(EffectHandle {
                    effect: effect.reference(),
                    name: effect.name.clone(),
                }),
            );
        }

        Ok(Self {
            encounter,
            compendium,
            config,
            dice,
            caster_index,
            targets,
            args,
            user_id: options.user_id,
            base_names,
            metavars,
            spell: options.spell,
            ab_override: options.ab_override,
            dc_override: options.dc_override,
            spell_override: options.spell_override,
            spell_level_override: options.spell_level_override,
            conc_effect: options.conc_effect,
            ieffect: options.ieffect,
            from_button: options.from_button,
            allow_caster_ieffects: options.allow_caster_ieffects,
            allow_target_ieffects: options.allow_target_ieffects,
            target: None,
            in_crit: false,
            in_save: false,
            caster_needs_commit: false,
            meta_queue: Vec::new(),
            embed_queue: Vec::new(),
            effect_queue: Vec::new(),
            footer_queue: Vec::new(),
            postflight_queue: Vec::new(),
            field_queue: Vec::new(),
            pm_queue: BTreeMap::new(),
        })
    }

    // ---------- caster ----------

    pub fn caster(&self) -> &Creature {
        &self.encounter.creatures[self.caster_index]
    }

    pub fn caster_mut(&mut self) -> &mut Creature {
        &mut self.encounter.creatures[self.caster_index]
    }

    pub fn caster_id(&self) -> CreatureId {
        self.caster().id
    }

    /// Roll options, for player-character casters only.
    pub fn caster_options(&self) -> Option<&CharacterOptions> {
        let caster = self.caster();
        if caster.is_character() {
            caster.options.as_ref()
        } else {
            None
        }
    }

    /// Passive effects active on the caster, if the caster is a combatant
    /// and caster effects are allowed.
    pub fn caster_effects(&self) -> Vec<&PassiveEffects> {
        if !self.allow_caster_ieffects {
            return Vec::new();
        }
        self.caster().effects().iter().map(|e| &e.effects).collect()
    }

    // ---------- spells ----------

    pub fn is_spell(&self) -> bool {
        self.spell.is_some()
    }

    pub fn spell(&self) -> Option<&Spell> {
        self.spell.as_ref()
    }

    /// Level the origin spell is cast at: `-l`, then the level override,
    /// then the spell's own level, else 0.
    pub fn get_cast_level(&mut self) -> Result<i64, AutomationError> {
        let mut default = self.spell_level_override.filter(|l| *l != 0).unwrap_or(0);
        if let Some(spell) = &self.spell {
            if default == 0 {
                default = spell.level as i64;
            }
        }
        Ok(self.args.last_parsed::<i64>("l", false)?.unwrap_or(default))
    }

    pub(crate) fn base_name(&self, name: &str) -> Option<&Value> {
        self.base_names.get(name)
    }

    /// Swap a caster-derived name such as `spell`, returning what it held.
    pub(crate) fn replace_base_name(&mut self, name: &str, value: Option<Value>) -> Option<Value> {
        match value {
            Some(value) => self.base_names.insert(name.to_string(), value),
            None => self.base_names.remove(name),
        }
    }

    // ---------- scripting ----------

    /// Every name visible to expressions: the caster's stats overlaid with
    /// the run's variables.
    pub fn names(&self) -> Names {
        let mut names = self.base_names.clone();
        names.extend(self.metavars.iter().map(|(k, v)| (k.clone(), v.clone())));
        names
    }

    pub fn set_metavar(&mut self, name: &str, value: impl Into<Value>) {
        self.metavars.insert(name.to_string(), value.into());
    }

    /// Interpolate every `{expression}` in an annotated string.
    pub fn parse_annostr(&self, annostr: &str) -> Result<String, AutomationError> {
        AnnotatedString::new(annostr)
            .transformed(&self.names())
            .map_err(|e| AutomationError::evaluation(annostr, e))
    }

    /// Evaluate a whole string as one expression. Surrounding braces are
    /// ignored.
    pub fn parse_expression(&self, expression: &str) -> Result<Value, AutomationError> {
        let expr = expression.trim_matches(|c| c == '{' || c == '}');
        script::evaluate(expr, &self.names()).map_err(|e| AutomationError::evaluation(expr, e))
    }

    pub fn parse_intexpression(&self, intexpr: &IntExpr) -> Result<i64, AutomationError> {
        let source = match intexpr {
            IntExpr::Int(i) => return Ok(*i),
            IntExpr::Expr(s) => s,
        };
        if let Ok(i) = source.trim().parse::<i64>() {
            return Ok(i);
        }
        self.parse_expression(source)?.to_int().map_err(|_| {
            AutomationError::InvalidIntExpression(format!(
                "{} cannot be interpreted as an IntExpression.",
                super::errors::quoted(source)
            ))
        })
    }

    // ---------- dice ----------

    pub fn roll(&mut self, expr: &DiceExpression) -> Result<RollResult, AutomationError> {
        Ok(expr.roll_limited(&mut *self.dice, self.config.max_dice)?)
    }

    pub fn roll_str(&mut self, notation: &str) -> Result<RollResult, AutomationError> {
        let expr = DiceExpression::parse(notation)?;
        self.roll(&expr)
    }

    // ---------- frames ----------

    /// Run `f`, then restore the current target, the `target` variable and
    /// the crit/save flags however `f` returned.
    pub fn scoped<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, AutomationError>,
    ) -> Result<T, AutomationError> {
        let frame = Frame {
            target: self.target.clone(),
            target_var: self.metavars.get("target").cloned(),
            in_crit: self.in_crit,
            in_save: self.in_save,
        };
        let out = f(self);
        self.target = frame.target;
        match frame.target_var {
            Some(value) => self.metavars.insert("target".into(), value),
            None => self.metavars.remove("target"),
        };
        self.in_crit = frame.in_crit;
        self.in_save = frame.in_save;
        out
    }

    /// Make `target` current and bind it as the `target` variable.
    pub fn set_target(&mut self, target: TargetRef) {
        let value = target_value(&target, self.encounter);
        self.target = Some(AutomationTarget::new(target, self.encounter));
        self.metavars.insert("target".into(), value);
    }

    // ---------- target helpers ----------

    pub fn target_creature(&self) -> Option<&Creature> {
        self.target.as_ref()?.creature(self.encounter)
    }

    pub fn target_name(&self) -> Option<String> {
        self.target.as_ref()?.name(self.encounter)
    }

    pub fn target_is_simple(&self) -> bool {
        self.target.as_ref().map_or(true, |t| t.is_simple)
    }

    /// Passive effects on the current target, when target effects are allowed.
    pub fn target_effects(&self) -> Vec<&PassiveEffects> {
        if !self.allow_target_ieffects {
            return Vec::new();
        }
        self.target_creature()
            .map(|c| c.effects().iter().map(|e| &e.effects).collect())
            .unwrap_or_default()
    }

    pub fn target_ac(&self) -> Option<i64> {
        let creature = self.target_creature()?;
        if self.allow_target_ieffects {
            creature.effective_ac()
        } else {
            creature.base_ac()
        }
    }

    pub fn target_resists(&self) -> Resistances {
        match self.target_creature() {
            Some(c) if self.allow_target_ieffects => c.effective_resistances(),
            Some(c) => c.resistances.clone(),
            None => Resistances::default(),
        }
    }

    /// The current target's saving throw, e.g. `2d20kh1+3+1d4`.
    pub fn target_save_dice(
        &self,
        ability: Ability,
        adv: Advantage,
        mut sb: Vec<String>,
    ) -> Result<String, AutomationError> {
        let creature = self
            .target_creature()
            .ok_or_else(|| {
                AutomationError::target("Cannot get the save dice of a simple target.")
            })?;
        sb.extend(self.target_effects().into_iter().filter_map(|e| e.save_bonus.clone()));

        let reroll = if creature.is_character() {
            creature.options.as_ref().and_then(|o| o.reroll)
        } else {
            None
        };
        let mut dice = creature.save(ability).d20(adv, reroll, None);
        if !sb.is_empty() {
            dice = format!("{dice}+{}", sb.join("+"));
        }
        Ok(dice)
    }

    /// Deal `amount` damage (negative heals) to the current target and
    /// narrate the change.
    pub fn damage_target(&mut self, amount: i64, allow_overheal: bool) {
        let name = self.target_name().unwrap_or_else(|| "<No Target>".to_string());
        let dealt = format!("{name}: Dealt {amount} damage!");
        let Some(id) = self.target.as_ref().and_then(AutomationTarget::creature_id) else {
            self.footer_queue(dealt);
            return;
        };
        let Some(creature) = self.encounter.get_mut(id) else {
            self.footer_queue(dealt);
            return;
        };

        let initial_hp = creature.current_hp().unwrap_or(0);
        let initial_temp = creature.temp_hp();
        let Some(result) = creature.modify_hp(-amount, allow_overheal) else {
            self.footer_queue(dealt);
            return;
        };
        let hp = creature.current_hp().unwrap_or(0);
        let temp = creature.temp_hp();

        let mut deltas = Vec::new();
        if temp != initial_temp {
            deltas.push(format!("{:+} temp", temp - initial_temp));
        }
        if hp != initial_hp {
            deltas.push(format!("{:+} HP", hp - initial_hp));
        }
        let total_delta = temp + hp - initial_temp - initial_hp;
        if -amount != total_delta {
            deltas.push(format!("{} overflow", (amount + total_delta).abs()));
        }
        let mut delta_str = if deltas.is_empty() {
            String::new()
        } else {
            format!(" ({})", deltas.join(", "))
        };

        let private_pm = if creature.is_private() {
            creature.controller_id().map(|controller| {
                let hp = format!("{}'s HP: {}{delta_str}", creature.name, creature.hp_str(true));
                (controller.to_string(), hp)
            })
        } else {
            None
        };
        let concentrating = creature.is_combatant() && creature.is_concentrating();
        let line = format!("{}: {result}", creature.name);

        if creature.is_private() && !delta_str.is_empty() {
            delta_str = format!(" ({total_delta:+})");
        }
        if let Some((controller, message)) = private_pm {
            self.add_pm(&controller, message);
        }
        if concentrating && amount > 0 {
            self.queue(format!("**Concentration**: DC {}", (amount / 2).max(10)));
        }
        self.footer_queue(format!("{line}{delta_str}"));
    }

    // ---------- output queues ----------

    /// Add a line to the field being built.
    pub fn queue(&mut self, text: impl Into<String>) {
        self.embed_queue.push(text.into());
    }

    /// Add a unique line to the run-wide Meta field.
    pub fn meta_queue(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !self.meta_queue.contains(&text) {
            self.meta_queue.push(text);
        }
    }

    pub fn footer_queue(&mut self, text: impl Into<String>) {
        self.footer_queue.push(text.into());
    }

    /// Add a unique entry to the Effect fields.
    pub fn effect_queue(&mut self, text: impl Into<String>) {
        self.effect_queue_titled("Effect", text);
    }

    pub fn effect_queue_titled(&mut self, title: impl Into<String>, text: impl Into<String>) {
        let entry = (title.into(), text.into());
        if !self.effect_queue.contains(&entry) {
            self.effect_queue.push(entry);
        }
    }

    /// Queue a field shown after every other field. With `merge`, a field of
    /// the same name gains a line instead.
    pub fn postflight_queue_field(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        merge: bool,
    ) {
        let (name, value) = (name.into(), value.into());
        if merge {
            if let Some(existing) = self.postflight_queue.iter_mut().find(|f| f.name == name) {
                if existing.value != value {
                    existing.value = format!("{}\n{value}", existing.value);
                }
                return;
            }
        }
        let field = EmbedField::new(name, value, false);
        if !self.postflight_queue.contains(&field) {
            self.postflight_queue.push(field);
        }
    }

    /// Close the field being built under `title`, or move its lines to Meta.
    pub fn push_embed_field(&mut self, title: &str, inline: bool, to_meta: bool) {
        if self.embed_queue.is_empty() {
            return;
        }
        let lines = std::mem::take(&mut self.embed_queue);
        if to_meta {
            self.meta_queue.extend(lines);
            return;
        }
        for (i, chunk) in chunk_text(&lines.join("\n"), self.config.field_max_len)
            .into_iter()
            .enumerate()
        {
            if i == 0 {
                self.field_queue.push(EmbedField::new(title, chunk, inline));
            } else {
                self.field_queue.push(EmbedField::new(CONTINUATION_TITLE, chunk, false));
            }
        }
    }

    pub fn add_pm(&mut self, user: &str, message: impl Into<String>) {
        self.pm_queue.entry(user.to_string()).or_default().push(message.into());
    }

    /// Privately send `message` to the user running the automation.
    pub fn pm_invoker(&mut self, message: impl Into<String>) {
        let user = self.user_id.clone();
        self.add_pm(&user, message);
    }

    /// Drain every queue into the rendered output.
    pub fn build_output(&mut self) -> AutomationOutput {
        let description = self.args.join("phrase", "\n", false).map(|p| format!(">>> *{p}*"));

        for line in std::mem::take(&mut self.embed_queue) {
            if !self.meta_queue.contains(&line) {
                self.meta_queue.push(line);
            }
        }

        let mut fields = Vec::new();
        if !self.meta_queue.is_empty() {
            let meta = std::mem::take(&mut self.meta_queue).join("\n");
            fields.push(EmbedField::new("Meta", meta, false));
        }
        fields.append(&mut self.field_queue);
        for (title, text) in self.effect_queue.drain(..) {
            fields.push(EmbedField::new(title, text, false));
        }
        fields.append(&mut self.postflight_queue);

        AutomationOutput {
            description,
            fields,
            footer: std::mem::take(&mut self.footer_queue).join("\n"),
            private_messages: std::mem::take(&mut self.pm_queue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamedata::StaticCompendium;
    use crate::testing::{sample_goblin, sample_wizard, ScriptedDice};

    struct Fixture {
        encounter: Encounter,
        compendium: StaticCompendium,
        dice: ScriptedDice,
        config: AutomationConfig,
        wizard: CreatureId,
        goblin: CreatureId,
    }

    fn fixture() -> Fixture {
        let mut encounter = Encounter::new();
        let wizard = encounter.add(sample_wizard());
        let goblin = encounter.add(sample_goblin().in_combat());
        Fixture {
            encounter,
            compendium: StaticCompendium::new(),
            dice: ScriptedDice::fixed(10),
            config: AutomationConfig::default(),
            wizard,
            goblin,
        }
    }

    #[test]
    fn test_names_and_intexpressions() {
        let mut f = fixture();
        let ctx = AutomationContext::new(
            &mut f.encounter,
            &f.compendium,
            &mut f.dice,
            &f.config,
            f.wizard,
            vec![],
            ArgBag::new(),
            RunOptions::new("user"),
        )
        .unwrap();
        assert_eq!(ctx.parse_intexpression(&IntExpr::Int(4)).unwrap(), 4);
        assert_eq!(ctx.parse_intexpression(&"proficiencyBonus + 1".into()).unwrap(), 4);
        assert_eq!(ctx.parse_annostr("{intelligenceMod}d6").unwrap(), "3d6");
        let err = ctx.parse_intexpression(&"'abc'".into()).unwrap_err();
        assert!(matches!(err, AutomationError::InvalidIntExpression(_)));
        assert!(ctx.parse_expression("nope + 1").is_err());
    }

    #[test]
    fn test_scoped_restores_on_error() {
        let mut f = fixture();
        let goblin = f.goblin;
        let mut ctx = AutomationContext::new(
            &mut f.encounter,
            &f.compendium,
            &mut f.dice,
            &f.config,
            f.wizard,
            vec![TargetRef::Creature(goblin)],
            ArgBag::new(),
            RunOptions::new("user"),
        )
        .unwrap();
        let out: Result<(), _> = ctx.scoped(|ctx| {
            ctx.set_target(TargetRef::Creature(goblin));
            ctx.in_crit = true;
            Err(AutomationError::automation("boom"))
        });
        assert!(out.is_err());
        assert!(ctx.target.is_none());
        assert!(!ctx.in_crit);
        assert!(!ctx.metavars.contains_key("target"));
    }

    #[test]
    fn test_damage_target_footer_and_concentration() {
        let mut f = fixture();
        let goblin = f.goblin;
        let mut ctx = AutomationContext::new(
            &mut f.encounter,
            &f.compendium,
            &mut f.dice,
            &f.config,
            f.wizard,
            vec![TargetRef::Creature(goblin)],
            ArgBag::new(),
            RunOptions::new("user"),
        )
        .unwrap();
        ctx.set_target(TargetRef::Creature(goblin));
        ctx.damage_target(4, false);
        let output = ctx.build_output();
        assert_eq!(output.footer, "Goblin: <3/7 HP> (-4 HP)");
    }

    #[test]
    fn test_simple_target_damage_and_fields() {
        let mut f = fixture();
        let mut ctx = AutomationContext::new(
            &mut f.encounter,
            &f.compendium,
            &mut f.dice,
            &f.config,
            f.wizard,
            vec![],
            ArgBag::parse("-phrase \"Feel the burn\""),
            RunOptions::new("user"),
        )
        .unwrap();
        ctx.set_target(TargetRef::Named("Dummy".into()));
        ctx.damage_target(5, false);
        ctx.queue("line one");
        ctx.push_embed_field("Dummy", false, false);
        ctx.meta_queue("**DC**: 13");
        ctx.meta_queue("**DC**: 13");
        ctx.effect_queue("Burning");
        ctx.postflight_queue_field("Spell Slots", "1st", true);
        ctx.postflight_queue_field("Spell Slots", "2nd", true);
        ctx.queue("lingering");
        ctx.pm_invoker("secret");

        let output = ctx.build_output();
        assert_eq!(output.description.as_deref(), Some(">>> *Feel the burn*"));
        let names: Vec<&str> = output.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Meta", "Dummy", "Effect", "Spell Slots"]);
        assert_eq!(output.fields[0].value, "**DC**: 13\nlingering");
        assert_eq!(output.fields[3].value, "1st\n2nd");
        assert_eq!(output.footer, "Dummy: Dealt 5 damage!");
        assert_eq!(output.private_messages["user"], vec!["secret".to_string()]);
    }

    #[test]
    fn test_long_fields_are_chunked() {
        let mut f = fixture();
        f.config = AutomationConfig::default().with_field_max_len(20);
        let mut ctx = AutomationContext::new(
            &mut f.encounter,
            &f.compendium,
            &mut f.dice,
            &f.config,
            f.wizard,
            vec![],
            ArgBag::new(),
            RunOptions::new("user"),
        )
        .unwrap();
        ctx.queue("aaaaaaaaaaaaaaa");
        ctx.queue("bbbbbbbbbbbbbbb");
        ctx.push_embed_field("Long", false, false);
        let output = ctx.build_output();
        assert_eq!(output.fields.len(), 2);
        assert_eq!(output.fields[0].name, "Long");
        assert_eq!(output.fields[1].name, CONTINUATION_TITLE);
    }
}
