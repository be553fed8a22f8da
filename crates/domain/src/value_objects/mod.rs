//! Value objects - Immutable objects defined by their attributes

mod dice;

pub use dice::{D20Check, DiceExpression, DiceKind, DiceParseError, DiceRollResult, RollMode};
