//! Dice value objects and parsing
//!
//! Supports expressions like "1d20+5", "2d6-1", "d8" and bare constants ("4").
//! Randomness is injected: every roll takes a closure returning a face in
//! `1..=sides`, so handlers stay deterministic under test.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error when parsing a dice expression
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiceParseError {
    /// The expression string is empty
    #[error("Empty dice expression")]
    Empty,
    /// Invalid format - expected XdY, XdY+Z or an integer
    #[error("Invalid dice format: {0}")]
    InvalidFormat(String),
    /// Die size must be at least 2
    #[error("Die size must be at least 2")]
    InvalidDieSize,
    /// Dice count above the supported maximum
    #[error("Too many dice: {0}")]
    TooManyDice(u32),
}

/// Upper bound on dice per expression; anything larger is an AI hallucination.
const MAX_DICE: u32 = 100;

/// Standard polyhedral die kinds kept in the dice pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiceKind {
    D4,
    D6,
    D8,
    D10,
    D12,
    D20,
    D100,
}

impl DiceKind {
    /// Kinds generated by a refill when the payload names none.
    pub const STANDARD: [DiceKind; 7] = [
        DiceKind::D4,
        DiceKind::D6,
        DiceKind::D8,
        DiceKind::D10,
        DiceKind::D12,
        DiceKind::D20,
        DiceKind::D100,
    ];

    pub fn sides(self) -> u32 {
        match self {
            DiceKind::D4 => 4,
            DiceKind::D6 => 6,
            DiceKind::D8 => 8,
            DiceKind::D10 => 10,
            DiceKind::D12 => 12,
            DiceKind::D20 => 20,
            DiceKind::D100 => 100,
        }
    }

    pub fn from_sides(sides: u32) -> Option<Self> {
        Self::STANDARD.into_iter().find(|kind| kind.sides() == sides)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DiceKind::D4 => "d4",
            DiceKind::D6 => "d6",
            DiceKind::D8 => "d8",
            DiceKind::D10 => "d10",
            DiceKind::D12 => "d12",
            DiceKind::D20 => "d20",
            DiceKind::D100 => "d100",
        }
    }
}

impl fmt::Display for DiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiceKind {
    type Err = DiceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let sides = normalized
            .strip_prefix('d')
            .and_then(|rest| rest.parse::<u32>().ok())
            .ok_or_else(|| DiceParseError::InvalidFormat(s.to_string()))?;
        Self::from_sides(sides).ok_or_else(|| DiceParseError::InvalidFormat(s.to_string()))
    }
}

/// A parsed dice expression like "2d6+3"
///
/// `count == 0` represents a constant expression whose total is the modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiceExpression {
    /// Number of dice to roll (X in XdY)
    pub count: u32,
    /// Size of each die (Y in XdY)
    pub sides: u32,
    /// Modifier to add/subtract after rolling (+Z or -Z)
    pub modifier: i32,
}

impl DiceExpression {
    /// Parse a dice expression string like "1d20+5", "2d6-1", "d8" or "7"
    pub fn parse(input: &str) -> Result<Self, DiceParseError> {
        let input = input.trim().to_lowercase().replace(' ', "");
        if input.is_empty() {
            return Err(DiceParseError::Empty);
        }

        if let Ok(constant) = input.parse::<i32>() {
            return Ok(Self {
                count: 0,
                sides: 0,
                modifier: constant,
            });
        }

        let d_pos = input.find('d').ok_or_else(|| {
            DiceParseError::InvalidFormat(format!("Missing 'd' separator in '{}'", input))
        })?;

        let count_str = &input[..d_pos];
        let count: u32 = if count_str.is_empty() {
            1
        } else {
            count_str.parse().map_err(|_| {
                DiceParseError::InvalidFormat(format!("Invalid dice count: '{}'", count_str))
            })?
        };
        if count > MAX_DICE {
            return Err(DiceParseError::TooManyDice(count));
        }

        let after_d = &input[d_pos + 1..];
        let (sides_str, modifier) = match after_d.find(['+', '-']) {
            Some(0) => {
                return Err(DiceParseError::InvalidFormat(format!(
                    "Invalid die size: '{}'",
                    after_d
                )))
            }
            Some(pos) => {
                let modifier: i32 = after_d[pos..].trim_start_matches('+').parse().map_err(|_| {
                    DiceParseError::InvalidFormat(format!("Invalid modifier: '{}'", &after_d[pos..]))
                })?;
                (&after_d[..pos], modifier)
            }
            None => (after_d, 0),
        };

        let sides: u32 = sides_str.parse().map_err(|_| {
            DiceParseError::InvalidFormat(format!("Invalid die size: '{}'", sides_str))
        })?;
        if sides < 2 {
            return Err(DiceParseError::InvalidDieSize);
        }

        Ok(Self {
            count,
            sides,
            modifier,
        })
    }

    /// Pool kind matching this expression's die, if it is a standard one.
    pub fn kind(&self) -> Option<DiceKind> {
        if self.count == 0 {
            return None;
        }
        DiceKind::from_sides(self.sides)
    }

    /// Roll using pre-drawn faces first, rolling fresh for any shortfall.
    pub fn roll_with(&self, forced: &[i32], roll_die: &mut dyn FnMut(u32) -> i32) -> DiceRollResult {
        let mut rolls = Vec::with_capacity(self.count as usize);
        for index in 0..self.count as usize {
            let face = forced
                .get(index)
                .copied()
                .unwrap_or_else(|| roll_die(self.sides));
            rolls.push(face);
        }
        let dice_total: i32 = rolls.iter().sum();
        DiceRollResult {
            expression: *self,
            rolls,
            dice_total,
            total: dice_total + self.modifier,
        }
    }

    pub fn roll(&self, roll_die: &mut dyn FnMut(u32) -> i32) -> DiceRollResult {
        self.roll_with(&[], roll_die)
    }
}

impl fmt::Display for DiceExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count == 0 {
            return write!(f, "{}", self.modifier);
        }
        match self.modifier {
            0 => write!(f, "{}d{}", self.count, self.sides),
            m if m > 0 => write!(f, "{}d{}+{}", self.count, self.sides, m),
            m => write!(f, "{}d{}{}", self.count, self.sides, m),
        }
    }
}

impl FromStr for DiceExpression {
    type Err = DiceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Result of rolling a dice expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiceRollResult {
    pub expression: DiceExpression,
    /// Individual die faces
    pub rolls: Vec<i32>,
    /// Sum of dice before modifier
    pub dice_total: i32,
    /// Final total (dice_total + modifier)
    pub total: i32,
}

/// Advantage state of a d20 check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollMode {
    Normal,
    Advantage,
    Disadvantage,
}

impl RollMode {
    /// Advantage and disadvantage cancel each other out.
    pub fn from_flags(advantage: bool, disadvantage: bool) -> Self {
        match (advantage, disadvantage) {
            (true, false) => RollMode::Advantage,
            (false, true) => RollMode::Disadvantage,
            _ => RollMode::Normal,
        }
    }

    pub fn dice_needed(self) -> usize {
        match self {
            RollMode::Normal => 1,
            RollMode::Advantage | RollMode::Disadvantage => 2,
        }
    }
}

/// Outcome of a d20 check against an optional DC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct D20Check {
    pub mode: RollMode,
    /// Candidate faces (two under advantage/disadvantage)
    pub rolls: Vec<i32>,
    /// Face kept after applying the mode
    pub selected: i32,
    pub modifier: i32,
    pub total: i32,
    /// `None` when no DC was given
    pub success: Option<bool>,
}

impl D20Check {
    /// Resolve a d20 check, consuming `forced` faces before rolling fresh ones.
    pub fn resolve(
        mode: RollMode,
        modifier: i32,
        dc: Option<i32>,
        forced: &[i32],
        roll_die: &mut dyn FnMut(u32) -> i32,
    ) -> Self {
        let rolls: Vec<i32> = (0..mode.dice_needed())
            .map(|index| {
                forced
                    .get(index)
                    .copied()
                    .map(|face| face.clamp(1, 20))
                    .unwrap_or_else(|| roll_die(20))
            })
            .collect();
        let selected = match mode {
            RollMode::Normal => rolls[0],
            RollMode::Advantage => rolls.iter().copied().max().unwrap_or(rolls[0]),
            RollMode::Disadvantage => rolls.iter().copied().min().unwrap_or(rolls[0]),
        };
        let total = selected + modifier;
        Self {
            mode,
            rolls,
            selected,
            modifier,
            total,
            success: dc.map(|dc| total >= dc),
        }
    }

    /// Short mode label used in resolution step descriptions.
    pub fn mode_label(&self) -> &'static str {
        match self.mode {
            RollMode::Normal => "普通",
            RollMode::Advantage => "优势",
            RollMode::Disadvantage => "劣势",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(face: i32) -> impl FnMut(u32) -> i32 {
        move |_| face
    }

    #[test]
    fn test_parse_basic() {
        let expr = DiceExpression::parse("2d6+3").expect("valid");
        assert_eq!(expr.count, 2);
        assert_eq!(expr.sides, 6);
        assert_eq!(expr.modifier, 3);
        assert_eq!(expr.kind(), Some(DiceKind::D6));
    }

    #[test]
    fn test_parse_shorthand_and_negative() {
        let expr = DiceExpression::parse("d20-2").expect("valid");
        assert_eq!(expr.count, 1);
        assert_eq!(expr.modifier, -2);
        assert_eq!(expr.to_string(), "1d20-2");
    }

    #[test]
    fn test_parse_constant() {
        let expr = DiceExpression::parse("7").expect("valid");
        assert_eq!(expr.count, 0);
        let result = expr.roll(&mut fixed(3));
        assert_eq!(result.total, 7);
        assert!(result.rolls.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(DiceExpression::parse("  "), Err(DiceParseError::Empty));
        assert_eq!(DiceExpression::parse("2d1"), Err(DiceParseError::InvalidDieSize));
        assert!(matches!(
            DiceExpression::parse("abc"),
            Err(DiceParseError::InvalidFormat(_))
        ));
        assert_eq!(
            DiceExpression::parse("500d6"),
            Err(DiceParseError::TooManyDice(500))
        );
    }

    #[test]
    fn test_roll_with_forced_faces_then_fresh() {
        let expr = DiceExpression::parse("3d8+1").expect("valid");
        let result = expr.roll_with(&[8, 2], &mut fixed(5));
        assert_eq!(result.rolls, vec![8, 2, 5]);
        assert_eq!(result.total, 16);
    }

    #[test]
    fn test_d20_advantage_takes_max() {
        let check = D20Check::resolve(RollMode::Advantage, 2, Some(15), &[7, 14], &mut fixed(1));
        assert_eq!(check.selected, 14);
        assert_eq!(check.total, 16);
        assert_eq!(check.success, Some(true));
    }

    #[test]
    fn test_d20_disadvantage_takes_min() {
        let check = D20Check::resolve(RollMode::Disadvantage, 0, Some(10), &[7, 14], &mut fixed(1));
        assert_eq!(check.selected, 7);
        assert_eq!(check.success, Some(false));
    }

    #[test]
    fn test_roll_mode_flags_cancel() {
        assert_eq!(RollMode::from_flags(true, true), RollMode::Normal);
        assert_eq!(RollMode::from_flags(true, false).dice_needed(), 2);
    }

    #[test]
    fn test_dice_kind_from_str() {
        assert_eq!("D12".parse::<DiceKind>(), Ok(DiceKind::D12));
        assert!("d7".parse::<DiceKind>().is_err());
    }
}
