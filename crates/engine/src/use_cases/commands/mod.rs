//! Command dispatch.
//!
//! `run_handlers` folds a normalized command batch over a copy of the game
//! state. Each command runs against its own working copy: a handler that
//! fails leaves the state exactly as the previous command left it, reports
//! `has_error`, and adds a system log naming the action. The dispatch `match`
//! is total; unknown actions log and change nothing.

mod combat;
mod economy;
mod path;
mod payload;
mod sheets;
mod social;

use taverndb_domain::{
    Action, Command, DomainError, GameState, SheetPatch, SystemLogEntry, TavernCommand,
};

use crate::infrastructure::ports::{ClockPort, RandomPort};

pub use economy::EconomyPolicy;

/// Services a handler may use; handlers never touch the wall clock or RNG directly.
pub struct HandlerContext<'a> {
    pub clock: &'a dyn ClockPort,
    pub random: &'a dyn RandomPort,
    pub economy: &'a EconomyPolicy,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        clock: &'a dyn ClockPort,
        random: &'a dyn RandomPort,
        economy: &'a EconomyPolicy,
    ) -> Self {
        Self {
            clock,
            random,
            economy,
        }
    }

    /// Label stamped on generated records: game time when set, else wall-clock RFC 3339.
    pub(crate) fn time_label(&self, state: &GameState) -> String {
        state.time_label(&self.clock.now().to_rfc3339())
    }

    /// Roll one die with `sides` faces.
    pub(crate) fn roll_die(&self, sides: u32) -> i32 {
        let max = i32::try_from(sides).unwrap_or(i32::MAX).max(1);
        self.random.gen_range(1, max)
    }
}

/// Outcome of running a command batch through the handlers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerResult {
    pub new_state: GameState,
    pub has_error: bool,
    pub logs: Vec<SystemLogEntry>,
    pub sheet_patches: Vec<SheetPatch>,
}

/// Normalize wire commands into batch-ordered `Command`s.
pub fn normalize_commands(commands: &[TavernCommand]) -> Vec<Command> {
    commands
        .iter()
        .enumerate()
        .map(|(index, wire)| Command::from_wire(index, wire))
        .collect()
}

/// Apply every command in order, collecting logs and sheet patches.
pub fn run_handlers(state: &GameState, commands: &[Command], ctx: &HandlerContext<'_>) -> HandlerResult {
    let mut result = HandlerResult {
        new_state: state.clone(),
        ..HandlerResult::default()
    };
    let now_ms = ctx.clock.now_millis();

    for command in commands {
        if let Action::Unknown(name) = &command.action {
            tracing::debug!(action = %name, index = command.index, "Unknown command skipped");
            result.logs.push(SystemLogEntry::system(
                format!("cmd-{}-{}", now_ms, command.index),
                format!("未知指令: {}", name),
                now_ms,
            ));
            continue;
        }

        let mut working = result.new_state.clone();
        match apply_command(&mut working, command, ctx) {
            Ok(patches) => {
                tracing::debug!(
                    action = %command.action,
                    index = command.index,
                    patches = patches.len(),
                    "Command applied"
                );
                result.new_state = working;
                result.sheet_patches.extend(patches);
            }
            Err(e) => {
                tracing::warn!(
                    action = %command.action,
                    index = command.index,
                    error = %e,
                    "Command rejected"
                );
                result.has_error = true;
                result.logs.push(SystemLogEntry::system(
                    format!("cmd-{}-{}", now_ms, command.index),
                    format!("指令执行失败 [{}]: {}", command.action, e),
                    now_ms,
                ));
            }
        }
    }

    result
}

/// Apply one command to `state` in place, returning the sheet patches it proposes.
///
/// On error `state` may be partially modified; callers discard it.
pub fn apply_command(
    state: &mut GameState,
    command: &Command,
    ctx: &HandlerContext<'_>,
) -> Result<Vec<SheetPatch>, DomainError> {
    match &command.action {
        Action::Set | Action::Add | Action::Push | Action::Delete => {
            path::apply(state, command)?;
            Ok(Vec::new())
        }
        Action::SetEncounterRows => combat::set_encounter_rows(state, command).map(no_patches),
        Action::UpsertBattleMapRows => combat::upsert_battle_map_rows(state, command).map(no_patches),
        Action::SetMapVisuals => combat::set_map_visuals(state, command).map(no_patches),
        Action::SetInitiative => combat::set_initiative(state, command).map(no_patches),
        Action::ConsumeDiceRows => combat::consume_dice_rows(state, command).map(no_patches),
        Action::RefillDicePool => combat::refill_dice_pool(state, command, ctx).map(no_patches),
        Action::RollDiceCheck => combat::roll_dice_check(state, command, ctx).map(no_patches),
        Action::SetActionEconomy => combat::set_action_economy(state, command).map(no_patches),
        Action::SpendActionResource => {
            combat::spend_action_resource(state, command, ctx).map(no_patches)
        }
        Action::ResolveAttackCheck => combat::resolve_attack_check(state, command, ctx).map(no_patches),
        Action::ResolveSavingThrow => combat::resolve_saving_throw(state, command, ctx).map(no_patches),
        Action::ResolveDamageRoll => combat::resolve_damage_roll(state, command, ctx).map(no_patches),
        Action::AppendCombatResolution => {
            combat::append_combat_resolution(state, command, ctx).map(no_patches)
        }
        Action::AppendLogSummary => social::append_log_summary(state, command, ctx).map(no_patches),
        Action::AppendLogOutline => social::append_log_outline(state, command, ctx).map(no_patches),
        Action::SetActionOptions => social::set_action_options(state, command).map(no_patches),
        Action::UpsertNpc => social::upsert_npc(state, command).map(no_patches),
        Action::UpsertInventory => social::upsert_inventory(state, command).map(no_patches),
        Action::ApplyEconDelta => economy::apply_econ_delta(state, command, ctx).map(no_patches),
        Action::AppendEconLedger => economy::append_econ_ledger(state, command, ctx).map(no_patches),
        Action::UpsertSheetRows => sheets::upsert_sheet_rows(state, command),
        Action::DeleteSheetRows => sheets::delete_sheet_rows(state, command),
        Action::Unknown(name) => {
            tracing::debug!(action = %name, "Unknown command ignored");
            Ok(Vec::new())
        }
    }
}

fn no_patches(_: ()) -> Vec<SheetPatch> {
    Vec::new()
}

/// Short unique id: `<PREFIX>_<ms base36>_<6 base36>`.
pub(crate) fn generated_id(prefix: &str, ctx: &HandlerContext<'_>) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        to_base36(ctx.clock.now_millis().max(0) as u64),
        crate::infrastructure::clock::base36_suffix(ctx.random, 6)
    )
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::infrastructure::clock::{FixedClock, FixedRandom};

    pub struct Fixture {
        pub clock: FixedClock,
        pub random: Box<dyn RandomPort>,
        pub economy: EconomyPolicy,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_random(Box::new(FixedRandom(10)))
        }

        pub fn with_random(random: Box<dyn RandomPort>) -> Self {
            Self {
                clock: FixedClock::at_millis(1_700_000_000_000),
                random,
                economy: EconomyPolicy::default(),
            }
        }

        pub fn ctx(&self) -> HandlerContext<'_> {
            HandlerContext::new(&self.clock, self.random.as_ref(), &self.economy)
        }
    }

    pub fn command(wire: TavernCommand) -> Command {
        Command::from_wire(0, &wire)
    }
}
