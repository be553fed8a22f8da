//! Combat handlers: encounter units, initiative, the dice pool, d20 checks,
//! damage and the action economy.
//!
//! Every resolution step appends a `CombatResolutionEvent`; the event list
//! keeps the newest `RESOLUTION_LIMIT` entries. Checks draw pre-rolled dice
//! from the pool first and roll fresh for any shortfall.

use serde_json::{Map, Value};

use taverndb_domain::{
    ActionEconomy, Command, CombatResolutionEvent, CombatUnit, D20Check, DiceExpression, DiceKind,
    DiceRow, DomainError, GameState, HitPoints, InitiativeEntry, ResolutionStep, RollMode,
    StepKind, UnitResources,
};

use super::payload::{as_int, as_text, clamp_i32, Payload};
use super::{generated_id, HandlerContext};

pub(crate) const RESOLUTION_LIMIT: usize = 60;

/// Upper bound on dice generated per kind by one refill.
const MAX_REFILL_PER_KIND: i64 = 50;

const UNIT_ID_KEYS: [&str; 5] = ["unitId", "unit_id", "UNIT_ID", "id", "单位名称"];
const UNIT_NAME_KEYS: [&str; 3] = ["name", "名称", "单位名称"];
const HP_KEYS: [&str; 2] = ["hp", "生命值"];
const TARGET_UNIT_KEYS: [&str; 3] = ["targetUnitId", "target_unit_id", "目标UNIT_ID"];
const USE_POOL_KEYS: [&str; 3] = ["usePool", "use_pool", "消耗骰池"];

// =============================================================================
// Units and map
// =============================================================================

pub(super) fn set_encounter_rows(state: &mut GameState, command: &Command) -> Result<(), DomainError> {
    let action = command.action.as_str();
    let units = unit_rows(command)?
        .into_iter()
        .map(|row| unit_from_row(action, row))
        .collect::<Result<Vec<_>, _>>()?;
    state.combat.units = units;
    Ok(())
}

pub(super) fn upsert_battle_map_rows(state: &mut GameState, command: &Command) -> Result<(), DomainError> {
    let action = command.action.as_str();
    for row in unit_rows(command)? {
        let incoming = unit_from_row(action, row)?;
        let has_name = Payload::new(action, row).text(&UNIT_NAME_KEYS).is_some();
        match state.combat.unit_mut(&incoming.unit_id) {
            Some(existing) => {
                if has_name {
                    existing.name = incoming.name;
                }
                if incoming.hp.is_some() {
                    existing.hp = incoming.hp;
                }
                existing.extra.extend(incoming.extra);
            }
            None => state.combat.units.push(incoming),
        }
    }
    Ok(())
}

pub(super) fn set_map_visuals(state: &mut GameState, command: &Command) -> Result<(), DomainError> {
    match command.fields_payload() {
        Some(value @ Value::Object(_)) => {
            state.combat.map_visuals = Some(value.clone());
            Ok(())
        }
        _ => Err(DomainError::validation(format!(
            "{} requires an object value",
            command.action
        ))),
    }
}

pub(super) fn set_initiative(state: &mut GameState, command: &Command) -> Result<(), DomainError> {
    let action = command.action.as_str();
    let (entries, current_actor) = match command.fields_payload() {
        Some(Value::Array(items)) => (items, None),
        Some(Value::Object(map)) => {
            let payload = Payload::new(action, map);
            let keys = ["order", "initiative", "initiative_order", "先攻"];
            let items = payload.array(&keys)?.ok_or_else(|| payload.missing(&keys))?;
            (items, payload.text(&["currentActor", "current_actor", "当前行动者"]))
        }
        _ => return Err(DomainError::validation(format!("{} missing field order", action))),
    };

    let total = entries.len();
    let mut order = Vec::with_capacity(total);
    for (position, entry) in entries.iter().enumerate() {
        let parsed = match entry {
            Value::Object(map) => {
                let payload = Payload::new(action, map);
                let unit_id = payload.require_text(&UNIT_ID_KEYS)?;
                InitiativeEntry {
                    name: payload.text(&UNIT_NAME_KEYS).unwrap_or_else(|| unit_id.clone()),
                    initiative: clamp_i32(payload.require_int(&["initiative", "先攻值", "值"])?),
                    unit_id,
                }
            }
            // A bare id list is already in turn order.
            other => {
                let unit_id = as_text(other).ok_or_else(|| {
                    DomainError::validation(format!("{} order entry {} is invalid", action, position))
                })?;
                InitiativeEntry {
                    name: unit_id.clone(),
                    initiative: clamp_i32((total - position) as i64),
                    unit_id,
                }
            }
        };
        order.push(parsed);
    }

    let known: Vec<&str> = state.combat.units.iter().map(|u| u.unit_id.as_str()).collect();
    let unknown: Vec<&str> = order
        .iter()
        .map(|entry| entry.unit_id.as_str())
        .filter(|id| !known.is_empty() && !known.contains(id))
        .collect();
    if !unknown.is_empty() {
        tracing::debug!(units = ?unknown, "Initiative references units not on the map");
    }

    order.sort_by(|a, b| b.initiative.cmp(&a.initiative));
    state.combat.initiative = order;
    if let (Some(actor), Some(economy)) = (current_actor, state.combat.action_economy.as_mut()) {
        economy.current_actor = actor;
    }
    Ok(())
}

// =============================================================================
// Dice pool
// =============================================================================

pub(super) fn consume_dice_rows(state: &mut GameState, command: &Command) -> Result<(), DomainError> {
    let payload = Payload::of(command)?;
    let ids = payload.text_list(&["ids", "rowIds", "ID"]);

    let consumed = if !ids.is_empty() {
        let before = state.dice_pool.len();
        state.dice_pool.retain(|die| !ids.contains(&die.id));
        before - state.dice_pool.len()
    } else {
        let count = payload
            .int(&["count", "数量"])?
            .filter(|count| *count > 0)
            .ok_or_else(|| {
                DomainError::validation(format!("{} requires ids or a positive count", payload.action()))
            })?;
        let take = (count as usize).min(state.dice_pool.len());
        state.dice_pool.drain(..take);
        take
    };

    if consumed == 0 {
        return Err(DomainError::validation(format!(
            "{} consumed nothing: no matching dice in pool",
            payload.action()
        )));
    }
    Ok(())
}

pub(super) fn refill_dice_pool(
    state: &mut GameState,
    command: &Command,
    ctx: &HandlerContext<'_>,
) -> Result<(), DomainError> {
    let payload = Payload::of(command)?;
    let count = payload.require_int(&["count", "数量"])?;
    if !(1..=MAX_REFILL_PER_KIND).contains(&count) {
        return Err(DomainError::validation(format!(
            "{} count must be between 1 and {}",
            payload.action(),
            MAX_REFILL_PER_KIND
        )));
    }

    let kind_names = payload.text_list(&["kinds", "types", "类型"]);
    let kinds = if kind_names.is_empty() {
        DiceKind::STANDARD.to_vec()
    } else {
        kind_names
            .iter()
            .map(|name| name.parse::<DiceKind>())
            .collect::<Result<Vec<_>, _>>()?
    };
    let purpose = payload
        .text(&["purpose", "用途"])
        .unwrap_or_else(|| "预生成骰池".to_string());
    let rolled_at = ctx.clock.now().to_rfc3339();

    for _ in 0..count {
        for kind in &kinds {
            state.dice_pool.push(DiceRow {
                id: generated_id("DIE", ctx),
                kind: *kind,
                value: ctx.roll_die(kind.sides()),
                purpose: purpose.clone(),
                rolled_at: rolled_at.clone(),
                used: false,
            });
        }
    }
    Ok(())
}

/// Remove up to `amount` unused dice of `kind` from the front of the pool.
fn draw_from_pool(state: &mut GameState, kind: DiceKind, amount: usize) -> Vec<i32> {
    let mut drawn = Vec::new();
    state.dice_pool.retain(|die| {
        if drawn.len() < amount && die.kind == kind && !die.used {
            drawn.push(die.value);
            false
        } else {
            true
        }
    });
    drawn
}

/// Pool faces for a whole expression, or none when the pool cannot cover it.
fn draw_for_expression(state: &mut GameState, expression: &DiceExpression) -> Vec<i32> {
    let Some(kind) = expression.kind() else {
        return Vec::new();
    };
    let needed = expression.count as usize;
    let available = state
        .dice_pool
        .iter()
        .filter(|die| die.kind == kind && !die.used)
        .count();
    if available < needed {
        return Vec::new();
    }
    draw_from_pool(state, kind, needed)
}

fn d20_check(
    state: &mut GameState,
    ctx: &HandlerContext<'_>,
    payload: &Payload<'_>,
    modifier: i32,
    dc: Option<i32>,
) -> D20Check {
    let mode = RollMode::from_flags(
        payload.flag(&["advantage", "优势"]),
        payload.flag(&["disadvantage", "劣势"]),
    );
    let forced = if payload.flag_or(&USE_POOL_KEYS, true) {
        draw_from_pool(state, DiceKind::D20, mode.dice_needed())
    } else {
        Vec::new()
    };
    D20Check::resolve(mode, modifier, dc, &forced, &mut |sides| ctx.roll_die(sides))
}

fn format_modifier(modifier: i32) -> String {
    if modifier >= 0 {
        format!("+{}", modifier)
    } else {
        modifier.to_string()
    }
}

fn check_step(label: impl Into<String>, check: &D20Check) -> ResolutionStep {
    let rolls: Vec<String> = check.rolls.iter().map(i32::to_string).collect();
    ResolutionStep::new(label, check.selected, StepKind::Roll).note(format!(
        "候选 [{}]，修正 {}",
        rolls.join(", "),
        format_modifier(check.modifier)
    ))
}

// =============================================================================
// Checks
// =============================================================================

pub(super) fn roll_dice_check(
    state: &mut GameState,
    command: &Command,
    ctx: &HandlerContext<'_>,
) -> Result<(), DomainError> {
    let payload = Payload::of(command)?;
    let ability = payload.int_or(&["abilityMod", "ability_mod", "属性调整"], 0)?;
    let proficiency = payload.int_or(&["proficiency", "熟练加值"], 0)?;
    let bonus = payload.int_or(&["bonus", "额外加值"], 0)?;
    let modifier = clamp_i32(ability + proficiency + bonus);
    let dc = payload.int(&["dc", "DC"])?.map(clamp_i32);
    let dice_kind = match payload.text(&["diceKind", "dice_kind", "骰子类型"]) {
        Some(name) => name.parse::<DiceKind>()?,
        None => DiceKind::D20,
    };

    let mut steps = Vec::new();
    let (dice_label, roll, total) = if let Some(raw) = payload.text(&["expression", "表达式"]) {
        let expression = DiceExpression::parse(&raw)?;
        let forced = if payload.flag_or(&USE_POOL_KEYS, true) {
            draw_for_expression(state, &expression)
        } else {
            Vec::new()
        };
        let result = expression.roll_with(&forced, &mut |sides| ctx.roll_die(sides));
        let rolls: Vec<String> = result.rolls.iter().map(i32::to_string).collect();
        steps.push(
            ResolutionStep::new(format!("表达式 {}", raw), result.total, StepKind::Roll).note(format!(
                "掷骰结果 [{}] + 修正 {}",
                rolls.join(", "),
                expression.modifier
            )),
        );
        (raw, result.total, result.total + modifier)
    } else if dice_kind == DiceKind::D20 {
        let check = d20_check(state, ctx, &payload, modifier, dc);
        steps.push(check_step(format!("{} d20", check.mode_label()), &check));
        (dice_kind.to_string(), check.selected, check.total)
    } else {
        let forced = if payload.flag_or(&USE_POOL_KEYS, true) {
            draw_from_pool(state, dice_kind, 1)
        } else {
            Vec::new()
        };
        let face = forced
            .first()
            .copied()
            .unwrap_or_else(|| ctx.roll_die(dice_kind.sides()));
        steps.push(ResolutionStep::new(format!("{} 掷骰", dice_kind), face, StepKind::Roll));
        (dice_kind.to_string(), face, face + modifier)
    };

    if modifier != 0 {
        steps.push(
            ResolutionStep::new("修正值", modifier, StepKind::Contest).note(format!(
                "属性 {} / 熟练 {} / 其他 {}",
                ability, proficiency, bonus
            )),
        );
    }
    let success = dc.map(|dc| total >= dc);
    if let (Some(dc), Some(passed)) = (dc, success) {
        steps.push(
            ResolutionStep::new("对抗 DC", dc, StepKind::Contest)
                .note(if passed { "判定通过" } else { "判定未通过" }),
        );
    }

    let mut tags = payload.text_list(&["tags", "标签"]);
    tags.push("dnd_check".to_string());
    let result = match success {
        Some(true) => "成功".to_string(),
        Some(false) => "未通过".to_string(),
        None => format!("总值 {}", total),
    };
    let event = CombatResolutionEvent {
        actor: payload.text(&["actor", "行动者"]),
        target: payload.text(&["target", "目标"]),
        action: payload.text(&["label", "action", "动作"]),
        dice: Some(dice_label),
        roll: Some(roll),
        modifier: Some(modifier),
        dc,
        success,
        result,
        steps,
        tags,
        ..new_event(state, ctx)
    };
    push_resolution(state, event);
    Ok(())
}

pub(super) fn resolve_attack_check(
    state: &mut GameState,
    command: &Command,
    ctx: &HandlerContext<'_>,
) -> Result<(), DomainError> {
    let payload = Payload::of(command)?;
    let hit_dc = clamp_i32(payload.require_int(&["hitDc", "hit_dc", "命中DC", "dc", "DC"])?);
    let attack_bonus = clamp_i32(payload.int_or(&["attackBonus", "attack_bonus", "命中加值"], 0)?);
    let damage_expression = payload
        .text(&["damageExpression", "damage_expression", "伤害表达式"])
        .map(|raw| DiceExpression::parse(&raw).map(|expr| (raw, expr)))
        .transpose()?;
    let damage_bonus = clamp_i32(payload.int_or(&["damageBonus", "damage_bonus", "伤害加值"], 0)?);
    let target_unit = payload.text(&TARGET_UNIT_KEYS);

    let check = d20_check(state, ctx, &payload, attack_bonus, Some(hit_dc));
    let hit = check.success.unwrap_or(false);
    let mut steps = vec![
        check_step("攻击检定", &check),
        ResolutionStep::new("命中DC", hit_dc, StepKind::Contest).note(if hit { "命中" } else { "未命中" }),
    ];

    let mut damage = 0;
    let mut hp_change = None;
    if let (true, Some((raw, expression))) = (hit, damage_expression.as_ref()) {
        let forced = if payload.flag_or(&USE_POOL_KEYS, true) {
            draw_for_expression(state, expression)
        } else {
            Vec::new()
        };
        let rolled = expression.roll_with(&forced, &mut |sides| ctx.roll_die(sides));
        damage = (rolled.total + damage_bonus).max(0);
        hp_change = apply_damage(state, target_unit.as_deref(), damage);
        let note = if damage_bonus != 0 {
            format!("{} {}", raw, format_modifier(damage_bonus))
        } else {
            raw.clone()
        };
        steps.push(ResolutionStep::new("伤害", damage, StepKind::Damage).note(note));
    }

    let result = match (hit, hp_change) {
        (false, _) => "攻击未命中".to_string(),
        (true, Some(hp)) => format!("命中并造成 {} 伤害（HP {} -> {}）", damage, hp.current_before, hp.current_after),
        (true, None) => format!("命中并造成 {} 伤害", damage),
    };
    let mut tags = payload.text_list(&["tags", "标签"]);
    tags.push("attack_check".to_string());
    let event = CombatResolutionEvent {
        actor: payload.text(&["actor", "行动者"]),
        target: payload.text(&["target", "目标"]).or(target_unit),
        action: payload.text(&["action", "动作"]),
        dice: Some("d20".to_string()),
        roll: Some(check.selected),
        modifier: Some(check.modifier),
        dc: Some(hit_dc),
        success: Some(hit),
        damage: (damage > 0).then_some(damage),
        result,
        steps,
        tags,
        ..new_event(state, ctx)
    };
    push_resolution(state, event);
    Ok(())
}

pub(super) fn resolve_saving_throw(
    state: &mut GameState,
    command: &Command,
    ctx: &HandlerContext<'_>,
) -> Result<(), DomainError> {
    let payload = Payload::of(command)?;
    let dc = clamp_i32(payload.require_int(&["dc", "DC"])?);
    let save_bonus = clamp_i32(payload.int_or(&["saveBonus", "save_bonus", "豁免加值"], 0)?);
    let success_damage = optional_damage(&payload, &["successDamage", "success_damage", "成功伤害表达式"])?;
    let failure_damage = optional_damage(&payload, &["failureDamage", "failure_damage", "失败伤害表达式"])?;
    let damage_bonus = clamp_i32(payload.int_or(&["damageBonus", "damage_bonus", "伤害加值"], 0)?);
    let save_type = payload.text(&["saveType", "save_type", "豁免类型"]);
    let target_unit = payload.text(&TARGET_UNIT_KEYS);

    let check = d20_check(state, ctx, &payload, save_bonus, Some(dc));
    let saved = check.success.unwrap_or(false);

    let chosen = if saved { success_damage } else { failure_damage };
    let mut damage = 0;
    let mut hp_change = None;
    if let Some(expression) = chosen {
        let rolled = expression.roll(&mut |sides| ctx.roll_die(sides));
        damage = (rolled.total + damage_bonus).max(0);
        hp_change = apply_damage(state, target_unit.as_deref(), damage);
    }

    let label = match &save_type {
        Some(kind) => format!("豁免({})", kind),
        None => "豁免".to_string(),
    };
    let mut steps = vec![
        check_step(label, &check),
        ResolutionStep::new("豁免DC", dc, StepKind::Contest).note(if saved { "通过" } else { "未通过" }),
    ];
    if damage > 0 {
        let mut step = ResolutionStep::new("伤害", damage, StepKind::Damage);
        if let Some(hp) = hp_change {
            step = step.note(format!("HP {} -> {}", hp.current_before, hp.current_after));
        }
        steps.push(step);
    }

    let result = match (saved, damage > 0) {
        (true, true) => format!("豁免成功，仍受 {} 伤害", damage),
        (true, false) => "豁免成功".to_string(),
        (false, true) => format!("豁免未通过，受到 {} 伤害", damage),
        (false, false) => "豁免未通过".to_string(),
    };
    let mut tags = payload.text_list(&["tags", "标签"]);
    tags.push("saving_throw".to_string());
    let event = CombatResolutionEvent {
        actor: payload.text(&["actor", "行动者"]),
        target: payload.text(&["target", "目标", "来源"]).or(target_unit),
        action: payload.text(&["action", "动作"]),
        dice: Some("d20".to_string()),
        roll: Some(check.selected),
        modifier: Some(check.modifier),
        dc: Some(dc),
        success: Some(saved),
        damage: (damage > 0).then_some(damage),
        result,
        steps,
        tags,
        ..new_event(state, ctx)
    };
    push_resolution(state, event);
    Ok(())
}

pub(super) fn resolve_damage_roll(
    state: &mut GameState,
    command: &Command,
    ctx: &HandlerContext<'_>,
) -> Result<(), DomainError> {
    let payload = Payload::of(command)?;
    let keys = ["damageExpression", "damage_expression", "伤害表达式"];
    let raw = payload.require_text(&keys)?;
    let expression = DiceExpression::parse(&raw)?;
    let damage_bonus = clamp_i32(payload.int_or(&["damageBonus", "damage_bonus", "伤害加值"], 0)?);
    let target_unit = payload.text(&TARGET_UNIT_KEYS);

    let forced = if payload.flag_or(&USE_POOL_KEYS, true) {
        draw_for_expression(state, &expression)
    } else {
        Vec::new()
    };
    let rolled = expression.roll_with(&forced, &mut |sides| ctx.roll_die(sides));
    let damage = (rolled.total + damage_bonus).max(0);
    let hp_change = apply_damage(state, target_unit.as_deref(), damage);

    let result = match hp_change {
        Some(hp) => format!("造成 {} 伤害（HP {} -> {}）", damage, hp.current_before, hp.current_after),
        None => format!("造成 {} 伤害", damage),
    };
    let note = if damage_bonus != 0 {
        format!("{} {}", raw, format_modifier(damage_bonus))
    } else {
        raw.clone()
    };
    let mut tags = payload.text_list(&["tags", "标签"]);
    tags.push("damage_roll".to_string());
    let event = CombatResolutionEvent {
        actor: payload.text(&["actor", "行动者"]),
        target: payload.text(&["target", "目标"]).or(target_unit),
        action: payload.text(&["action", "动作"]),
        dice: Some(raw),
        roll: Some(rolled.total),
        modifier: Some(damage_bonus),
        damage: Some(damage),
        success: Some(true),
        result,
        steps: vec![ResolutionStep::new("伤害掷骰", damage, StepKind::Damage).note(note)],
        tags,
        ..new_event(state, ctx)
    };
    push_resolution(state, event);
    Ok(())
}

/// A damage field given as a dice expression or a flat number.
fn optional_damage(payload: &Payload<'_>, keys: &[&str]) -> Result<Option<DiceExpression>, DomainError> {
    match payload.value(keys) {
        None => Ok(None),
        Some(value) => {
            let raw = as_text(value).ok_or_else(|| {
                DomainError::validation(format!(
                    "{} field {} must be a dice expression",
                    payload.action(),
                    keys[0]
                ))
            })?;
            Ok(Some(DiceExpression::parse(&raw)?))
        }
    }
}

// =============================================================================
// Action economy
// =============================================================================

pub(super) fn set_action_economy(state: &mut GameState, command: &Command) -> Result<(), DomainError> {
    let payload = Payload::of(command)?;
    let round = payload.require_int(&["round", "回合"])?;
    let round = u32::try_from(round).map_err(|_| {
        DomainError::validation(format!("{} field round must be non-negative", payload.action()))
    })?;
    let current_actor = payload
        .text(&["currentActor", "current_actor", "当前行动者"])
        .unwrap_or_default();

    let mut resources = Vec::new();
    for row in payload.array(&["resources", "资源"])?.into_iter().flatten() {
        let Value::Object(map) = row else {
            return Err(DomainError::validation(format!(
                "{} resource rows must be objects",
                payload.action()
            )));
        };
        let row = Payload::new(payload.action(), map);
        resources.push(UnitResources {
            unit_id: row.require_text(&["unitId", "unit_id", "单位ID"])?,
            action: clamp_i32(row.int_or(&["action", "动作"], 1)?),
            bonus_action: clamp_i32(row.int_or(&["bonusAction", "bonus_action", "附赠动作"], 1)?),
            reaction: clamp_i32(row.int_or(&["reaction", "反应"], 1)?),
            movement: clamp_i32(row.int_or(&["movement", "移动"], 0)?),
        });
    }

    state.combat.action_economy = Some(ActionEconomy {
        round,
        current_actor,
        resources,
    });
    Ok(())
}

pub(super) fn spend_action_resource(
    state: &mut GameState,
    command: &Command,
    ctx: &HandlerContext<'_>,
) -> Result<(), DomainError> {
    let payload = Payload::of(command)?;
    let unit_id = payload.require_text(&["unitId", "unit_id", "单位ID"])?;
    let resource = payload.require_text(&["resource", "资源"])?;
    let cost = clamp_i32(payload.int_or(&["cost", "消耗"], 1)?.max(0));
    let reason = payload
        .text(&["reason", "原因"])
        .unwrap_or_else(|| "行动经济扣减".to_string());

    let economy = state
        .combat
        .action_economy
        .as_mut()
        .ok_or_else(|| DomainError::constraint("行动经济未初始化 (action economy not initialized)"))?;
    let row = economy
        .resources
        .iter_mut()
        .find(|row| row.unit_id == unit_id)
        .ok_or_else(|| DomainError::not_found("UnitResources", unit_id.clone()))?;
    let slot = row.resource_mut(&resource).ok_or_else(|| {
        DomainError::validation(format!("{} unknown resource {}", payload.action(), resource))
    })?;

    let before = *slot;
    let after = (before - cost).max(0);
    *slot = after;
    let sufficient = before >= cost;

    let result = if sufficient {
        format!("{} {} -> {}", resource, before, after)
    } else {
        format!("{}不足（{}）", resource, before)
    };
    let event = CombatResolutionEvent {
        actor: Some(unit_id),
        action: Some(format!("{}消耗", resource)),
        success: Some(sufficient),
        result,
        steps: vec![ResolutionStep::new(resource, after, StepKind::Status).note(reason)],
        tags: vec!["action_economy".to_string()],
        ..new_event(state, ctx)
    };
    push_resolution(state, event);
    Ok(())
}

pub(super) fn append_combat_resolution(
    state: &mut GameState,
    command: &Command,
    ctx: &HandlerContext<'_>,
) -> Result<(), DomainError> {
    let entries: Vec<&Value> = match command.fields_payload() {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(value @ Value::Object(_)) => vec![value],
        _ => Vec::new(),
    };
    if entries.is_empty() {
        return Err(DomainError::validation(format!(
            "{} requires a non-empty value",
            command.action
        )));
    }

    let mut events = Vec::with_capacity(entries.len());
    for (position, entry) in entries.into_iter().enumerate() {
        let mut object = entry.as_object().cloned().unwrap_or_default();
        if !object.contains_key("id") {
            object.insert("id".to_string(), Value::String(generated_id("RES", ctx)));
        }
        let event: CombatResolutionEvent = serde_json::from_value(Value::Object(object)).map_err(|e| {
            DomainError::validation(format!("{} entry {} is invalid: {}", command.action, position, e))
        })?;
        if event.result.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "{} entry {} missing field result",
                command.action, position
            )));
        }
        events.push(event);
    }

    for event in events {
        push_resolution(state, event);
    }
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn new_event(state: &GameState, ctx: &HandlerContext<'_>) -> CombatResolutionEvent {
    CombatResolutionEvent {
        id: generated_id("RES", ctx),
        time: ctx.time_label(state),
        turn: state.turn,
        ..CombatResolutionEvent::default()
    }
}

fn push_resolution(state: &mut GameState, event: CombatResolutionEvent) {
    let resolutions = &mut state.combat.resolutions;
    resolutions.push(event);
    if resolutions.len() > RESOLUTION_LIMIT {
        let overflow = resolutions.len() - RESOLUTION_LIMIT;
        resolutions.drain(..overflow);
    }
}

#[derive(Debug, Clone, Copy)]
struct HpChange {
    current_before: i32,
    current_after: i32,
}

/// Subtract damage from a unit's hit points, flooring at 0; unknown units and units without HP are untouched.
fn apply_damage(state: &mut GameState, unit_id: Option<&str>, damage: i32) -> Option<HpChange> {
    if damage <= 0 {
        return None;
    }
    let unit = state.combat.unit_mut(unit_id?)?;
    let hp = unit.hp.as_mut()?;
    let before = hp.current;
    hp.current = (before - damage).max(0);
    Some(HpChange {
        current_before: before,
        current_after: hp.current,
    })
}

fn unit_rows(command: &Command) -> Result<Vec<&Map<String, Value>>, DomainError> {
    let items = match command.fields_payload() {
        Some(Value::Array(items)) => items,
        Some(Value::Object(map)) => {
            let payload = Payload::new(command.action.as_str(), map);
            match payload.array(&["rows", "units", "单位"])? {
                Some(items) => items,
                None => return Ok(vec![map]),
            }
        }
        _ => {
            return Err(DomainError::validation(format!(
                "{} missing field rows",
                command.action
            )))
        }
    };
    items
        .iter()
        .map(|item| {
            item.as_object().ok_or_else(|| {
                DomainError::validation(format!("{} rows must be objects", command.action))
            })
        })
        .collect()
}

fn unit_from_row(action: &str, row: &Map<String, Value>) -> Result<CombatUnit, DomainError> {
    let payload = Payload::new(action, row);
    let unit_id = payload.require_text(&UNIT_ID_KEYS)?;
    let name = payload.text(&UNIT_NAME_KEYS).unwrap_or_else(|| unit_id.clone());
    let hp = parse_hp(&payload);

    let mut extra = row.clone();
    for key in UNIT_ID_KEYS.iter().chain(&UNIT_NAME_KEYS).chain(&HP_KEYS) {
        extra.remove(*key);
    }
    extra.remove("maxHp");

    Ok(CombatUnit {
        unit_id,
        name,
        hp,
        extra,
    })
}

/// `{current,max}`, `{当前,最大}`, `"12/20"`, or a bare number with optional `maxHp`.
fn parse_hp(payload: &Payload<'_>) -> Option<HitPoints> {
    let value = payload.value(&HP_KEYS)?;
    match value {
        Value::Object(map) => {
            let current = map.get("current").or_else(|| map.get("当前")).and_then(as_int)?;
            let max = map
                .get("max")
                .or_else(|| map.get("最大"))
                .and_then(as_int)
                .unwrap_or(current);
            Some(HitPoints {
                current: clamp_i32(current),
                max: clamp_i32(max),
            })
        }
        Value::String(text) if text.contains('/') => {
            let (current, max) = text.split_once('/')?;
            Some(HitPoints {
                current: clamp_i32(current.trim().parse().ok()?),
                max: clamp_i32(max.trim().parse().ok()?),
            })
        }
        other => {
            let current = as_int(other)?;
            let max = payload.map().get("maxHp").and_then(as_int).unwrap_or(current);
            Some(HitPoints {
                current: clamp_i32(current),
                max: clamp_i32(max),
            })
        }
    }
}
