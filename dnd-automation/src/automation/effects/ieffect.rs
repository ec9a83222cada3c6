use super::{is_false, Effect};
use crate::args::ArgBag;
use crate::automation::errors::AutomationError;
use crate::automation::results::IEffectResult;
use crate::automation::runtime::AutomationContext;
use crate::automation::utils::{trim_with_ellipsis, IntExpr};
use crate::automation::Automation;
use crate::dice::Advantage;
use crate::initiative::{
    resolve_check_advs, resolve_save_advs, resolve_value_or_bonus, AttackInteraction,
    ButtonInteraction, EffectAttack, EffectRef, InitiativeEffect, PassiveEffects,
};
use crate::resistance::Resistance;
use crate::script::{EffectHandle, Value};
use crate::world::CreatureId;
use serde::{Deserialize, Serialize};

/// Passive effects whose string fields are annotated strings, resolved
/// against the run when the effect is created.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PassiveEffectsTemplate {
    /// Evaluates to -1, 0, 1 or 2.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack_advantage: Option<IntExpr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_hit_bonus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damage_bonus: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub magical_damage: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub silvered_damage: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resistances: Vec<Resistance>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub immunities: Vec<Resistance>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vulnerabilities: Vec<Resistance>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ignored_resistances: Vec<Resistance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ac_value: Option<IntExpr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ac_bonus: Option<IntExpr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_hp_value: Option<IntExpr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_hp_bonus: Option<IntExpr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_bonus: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub save_adv: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub save_dis: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_bonus: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub check_adv: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub check_dis: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dc_bonus: Option<IntExpr>,
}

impl PassiveEffectsTemplate {
    fn resolve(&self, ctx: &AutomationContext<'_>) -> Result<PassiveEffects, AutomationError> {
        let annotated = |s: &Option<String>| -> Result<Option<String>, AutomationError> {
            s.as_deref().map(|s| ctx.parse_annostr(s)).transpose()
        };
        let int = |e: &Option<IntExpr>| -> Result<Option<i64>, AutomationError> {
            e.as_ref().map(|e| ctx.parse_intexpression(e)).transpose()
        };
        let attack_advantage = int(&self.attack_advantage)?
            .map(Advantage::try_from)
            .transpose()
            .map_err(AutomationError::InvalidArgument)?
            .filter(|adv| *adv != Advantage::Normal);

        Ok(PassiveEffects {
            attack_advantage,
            to_hit_bonus: annotated(&self.to_hit_bonus)?,
            damage_bonus: annotated(&self.damage_bonus)?,
            magical_damage: self.magical_damage,
            silvered_damage: self.silvered_damage,
            resistances: self.resistances.clone(),
            immunities: self.immunities.clone(),
            vulnerabilities: self.vulnerabilities.clone(),
            ignored_resistances: self.ignored_resistances.clone(),
            ac_value: int(&self.ac_value)?,
            ac_bonus: int(&self.ac_bonus)?,
            max_hp_value: int(&self.max_hp_value)?,
            max_hp_bonus: int(&self.max_hp_bonus)?,
            save_bonus: annotated(&self.save_bonus)?,
            save_adv: resolve_save_advs(&self.save_adv)?,
            save_dis: resolve_save_advs(&self.save_dis)?,
            check_bonus: annotated(&self.check_bonus)?,
            check_adv: resolve_check_advs(&self.check_adv)?,
            check_dis: resolve_check_advs(&self.check_dis)?,
            dc_bonus: int(&self.dc_bonus)?,
        })
    }
}

/// The effects of an [`IEffect`]: a passive-effect template, or the legacy
/// argument string (`-ac +2 -resist fire`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IEffectEffects {
    Legacy(String),
    Template(PassiveEffectsTemplate),
}

impl Default for IEffectEffects {
    fn default() -> Self {
        IEffectEffects::Template(PassiveEffectsTemplate::default())
    }
}

impl IEffectEffects {
    fn resolve(&self, ctx: &AutomationContext<'_>) -> Result<PassiveEffects, AutomationError> {
        match self {
            IEffectEffects::Template(template) => template.resolve(ctx),
            IEffectEffects::Legacy(args) => {
                passive_effects_from_args(&mut ArgBag::parse(&ctx.parse_annostr(args)?))
            }
        }
    }
}

/// Passive effects from an initiative effect argument string.
fn passive_effects_from_args(args: &mut ArgBag) -> Result<PassiveEffects, AutomationError> {
    let (ac_value, ac_bonus) = resolve_value_or_bonus(&args.get("ac", false));
    let (max_hp_value, max_hp_bonus) = resolve_value_or_bonus(&args.get("maxhp", false));
    let resistances = |args: &mut ArgBag, key: &str| -> Vec<Resistance> {
        args.get(key, false).iter().map(|r| Resistance::from_str_spec(r)).collect()
    };
    let attack_advantage = Advantage::reconcile(
        args.contains("adv"),
        args.contains("dis"),
        args.contains("eadv"),
    );

    Ok(PassiveEffects {
        attack_advantage: Some(attack_advantage).filter(|adv| *adv != Advantage::Normal),
        to_hit_bonus: args.join("b", "+", false),
        damage_bonus: args.join("d", "+", false),
        magical_damage: args.contains("magical"),
        silvered_damage: args.contains("silvered"),
        resistances: resistances(args, "resist"),
        immunities: resistances(args, "immune"),
        vulnerabilities: resistances(args, "vuln"),
        ignored_resistances: resistances(args, "neutral"),
        ac_value,
        ac_bonus,
        max_hp_value,
        max_hp_bonus,
        save_bonus: args.join("sb", "+", false),
        save_adv: resolve_save_advs(&args.get("sadv", false))?,
        save_dis: resolve_save_advs(&args.get("sdis", false))?,
        check_bonus: args.join("cb", "+", false),
        check_adv: resolve_check_advs(&args.get("cadv", false))?,
        check_dis: resolve_check_advs(&args.get("cdis", false))?,
        dc_bonus: None,
    })
}

/// Default DC, attack bonus and casting modifier for granted automation.
/// Missing values fall back to the run's overrides, then the caster's
/// spellcasting.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InteractionDefaults {
    #[serde(rename = "defaultDC", default, skip_serializing_if = "Option::is_none")]
    pub default_dc: Option<IntExpr>,
    #[serde(rename = "defaultAttackBonus", default, skip_serializing_if = "Option::is_none")]
    pub default_attack_bonus: Option<IntExpr>,
    #[serde(rename = "defaultCastingMod", default, skip_serializing_if = "Option::is_none")]
    pub default_casting_mod: Option<IntExpr>,
}

impl InteractionDefaults {
    fn resolve(
        &self,
        ctx: &AutomationContext<'_>,
    ) -> Result<(Option<i64>, Option<i64>, Option<i64>), AutomationError> {
        let spellbook = &ctx.caster().spellbook;
        let value = |expr: &Option<IntExpr>,
                     fallback: Option<i64>|
         -> Result<Option<i64>, AutomationError> {
            match expr {
                Some(e) => ctx.parse_intexpression(e).map(Some),
                None => Ok(fallback),
            }
        };
        Ok((
            value(&self.default_dc, ctx.dc_override.or(spellbook.dc))?,
            value(&self.default_attack_bonus, ctx.ab_override.or(spellbook.sab))?,
            value(&self.default_casting_mod, ctx.spell_override.or(spellbook.spell_mod))?,
        ))
    }
}

/// An attack granted by an effect; its name is an annotated string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackInteractionTemplate {
    pub attack: EffectAttack,
    #[serde(flatten)]
    pub defaults: InteractionDefaults,
}

impl AttackInteractionTemplate {
    fn resolve(&self, ctx: &AutomationContext<'_>) -> Result<AttackInteraction, AutomationError> {
        let (dc, ab, casting_mod) = self.defaults.resolve(ctx)?;
        Ok(AttackInteraction {
            attack: EffectAttack {
                name: ctx.parse_annostr(&self.attack.name)?,
                automation: self.attack.automation.clone(),
                verb: self.attack.verb.as_deref().map(|v| ctx.parse_annostr(v)).transpose()?,
            },
            override_default_dc: dc,
            override_default_attack_bonus: ab,
            override_default_casting_mod: casting_mod,
        })
    }
}

/// A button granted by an effect; label and verb are annotated strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonInteractionTemplate {
    pub label: String,
    pub automation: Automation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<u8>,
    #[serde(flatten)]
    pub defaults: InteractionDefaults,
}

impl ButtonInteractionTemplate {
    fn resolve(&self, ctx: &AutomationContext<'_>) -> Result<ButtonInteraction, AutomationError> {
        let (dc, ab, casting_mod) = self.defaults.resolve(ctx)?;
        Ok(ButtonInteraction {
            label: ctx.parse_annostr(&self.label)?,
            automation: self.automation.clone(),
            verb: self.verb.as_deref().map(|v| ctx.parse_annostr(v)).transpose()?,
            style: self.style,
            override_default_dc: dc,
            override_default_attack_bonus: ab,
            override_default_casting_mod: casting_mod,
        })
    }
}

/// Add an initiative effect to the current target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IEffect {
    pub name: String,
    /// Rounds; `None` or negative is indefinite. Overridden by `-dur`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<IntExpr>,
    #[serde(default)]
    pub effects: IEffectEffects,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attacks: Vec<AttackInteractionTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<ButtonInteractionTemplate>,
    /// Tick at the end of the turn rather than the start.
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub conc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    /// Add a renamed child effect instead of a duplicate.
    #[serde(default, skip_serializing_if = "is_false")]
    pub stacking: bool,
    /// Bind the new effect to this variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
    /// Variable holding the parent effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Apply to the caster instead of the target.
    #[serde(default, skip_serializing_if = "is_false")]
    pub target_self: bool,
    /// Tick on the caster's turns instead of the owner's.
    #[serde(default, skip_serializing_if = "is_false")]
    pub tick_on_caster: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

impl IEffect {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            duration: None,
            effects: IEffectEffects::default(),
            attacks: Vec::new(),
            buttons: Vec::new(),
            end: false,
            conc: false,
            desc: None,
            stacking: false,
            save_as: None,
            parent: None,
            target_self: false,
            tick_on_caster: false,
            meta: Vec::new(),
        }
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<IEffectResult, AutomationError> {
        if ctx.target.is_none() {
            return Err(AutomationError::target(
                "Tried to add an effect without a target! Make sure all IEffect effects are inside of a Target effect.",
            ));
        }

        let duration = match &self.duration {
            Some(expr) => Some(ctx.parse_intexpression(expr).map_err(|_| {
                AutomationError::automation(format!(
                    "{expr} is not an integer (in effect duration)"
                ))
            })?),
            None => None,
        };
        let duration = ctx.args.last_parsed::<i64>("dur", false)?.or(duration);
        let desc = match &self.desc {
            Some(desc) => Some(trim_with_ellipsis(
                &ctx.parse_annostr(desc)?,
                ctx.config.effect_desc_max_len,
            )),
            None => None,
        };
        let name = ctx.parse_annostr(&self.name)?;
        let effects = self.effects.resolve(ctx)?;
        let attacks = self.attacks.iter().map(|a| a.resolve(ctx)).collect::<Result<Vec<_>, _>>()?;
        let buttons = self.buttons.iter().map(|b| b.resolve(ctx)).collect::<Result<Vec<_>, _>>()?;

        let caster = ctx.caster();
        let owner = if self.target_self {
            Some(caster)
        } else {
            ctx.target_creature()
        };
        let owner_id = owner.filter(|c| c.is_combatant()).map(|c| c.id);
        let tick_on = Some(caster)
            .filter(|c| self.tick_on_caster && c.is_combatant())
            .map(|c| c.id);

        let mut effect = InitiativeEffect::new(owner_id.unwrap_or_default(), name, effects)
            .with_duration(duration, ctx.encounter.round_num, self.end);
        effect.attacks = attacks;
        effect.buttons = buttons;
        effect.concentration = self.conc;
        effect.desc = desc;
        effect.tick_on = tick_on;

        let Some(owner_id) = owner_id else {
            let line = format!("**Effect**: {}", effect.get_str(None, false));
            ctx.queue(line);
            return Ok(IEffectResult {
                effect,
                conc_conflict: Vec::new(),
            });
        };

        let conc_parent = match ctx.conc_effect {
            Some(conc) if conc.combatant_id == owner_id && self.conc => {
                return Err(AutomationError::InvalidArgument(
                    "Concentration spells cannot add concentration effects to the caster.".to_string(),
                ))
            }
            other => other,
        };

        let stack_parent = if self.stacking {
            self.stack(ctx, owner_id, &mut effect)
        } else {
            None
        };

        let explicit_parent = match &self.parent {
            Some(var) => match ctx.metavars.get(var) {
                Some(Value::Effect(handle)) => Some(handle.effect),
                Some(other) => {
                    return Err(AutomationError::InvalidArgument(format!(
                        "Could not set IEffect parent: The variable `{var}` is not an IEffectMetaVar (got `{}`).",
                        other.type_name()
                    )))
                }
                None => None,
            },
            None => None,
        };
        effect.parent = stack_parent.or(explicit_parent).or(conc_parent);

        let reference = effect.reference();
        let conc_conflict = ctx.encounter.add_effect(effect);
        let effect = ctx
            .encounter
            .get_effect(reference)
            .cloned()
            .ok_or_else(|| AutomationError::automation("The effect could not be added."))?;

        let line = format!("**Effect**: {}", effect.get_str(Some(&*ctx.encounter), false));
        ctx.queue(line);
        if !conc_conflict.is_empty() {
            let names: Vec<&str> = conc_conflict.iter().map(|e| e.name.as_str()).collect();
            ctx.queue(format!("**Concentration**: dropped {}", names.join(", ")));
        }
        if let Some(save_as) = &self.save_as {
            ctx.set_metavar(
                save_as,
                Value::Effect(EffectHandle {
                    effect: reference,
                    name: effect.name.clone(),
                }),
            );
        }

        Ok(IEffectResult { effect, conc_conflict })
    }

    /// When the owner already has an effect of this name, turn `effect` into
    /// an indefinite `Name xN` child of it.
    fn stack(
        &self,
        ctx: &AutomationContext<'_>,
        owner: CreatureId,
        effect: &mut InitiativeEffect,
    ) -> Option<EffectRef> {
        let parent = ctx.encounter.get_effect_by_name(owner, &effect.name, true)?;
        effect.desc = None;
        effect.duration = None;
        effect.end_round = None;
        effect.concentration = false;

        let original = effect.name.clone();
        let mut count = 2;
        effect.name = format!("{original} x{count}");
        while ctx.encounter.get_effect_by_name(owner, &effect.name, true).is_some() {
            count += 1;
            effect.name = format!("{original} x{count}");
        }
        Some(parent)
    }

    pub(super) fn build_str(&self) -> String {
        String::new()
    }
}
