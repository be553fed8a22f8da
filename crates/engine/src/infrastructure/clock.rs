//! Clock and random implementations.

use crate::infrastructure::ports::{ClockPort, RandomPort};
use chrono::{DateTime, Utc};

/// System clock - uses real time.
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockPort for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// System random - uses real randomness.
pub struct SystemRandom;

impl SystemRandom {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomPort for SystemRandom {
    fn gen_range(&self, min: i32, max: i32) -> i32 {
        use rand::Rng;
        if max <= min {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }
}

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `len` lowercase base36 characters drawn from `random`.
pub fn base36_suffix(random: &dyn RandomPort, len: usize) -> String {
    (0..len)
        .map(|_| {
            let index = random.gen_range(0, 35).clamp(0, 35) as usize;
            BASE36[index] as char
        })
        .collect()
}

/// Fixed clock for testing.
#[cfg(test)]
pub struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl FixedClock {
    pub fn at_millis(millis: i64) -> Self {
        Self(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }
}

#[cfg(test)]
impl ClockPort for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Fixed random for testing.
#[cfg(test)]
pub struct FixedRandom(pub i32);

#[cfg(test)]
impl RandomPort for FixedRandom {
    fn gen_range(&self, min: i32, max: i32) -> i32 {
        self.0.clamp(min, max.max(min))
    }
}

/// Replays a script of values in order, then repeats the last one.
#[cfg(test)]
pub struct ScriptedRandom {
    values: std::sync::Mutex<std::collections::VecDeque<i32>>,
    last: std::sync::atomic::AtomicI32,
}

#[cfg(test)]
impl ScriptedRandom {
    pub fn new(values: impl IntoIterator<Item = i32>) -> Self {
        Self {
            values: std::sync::Mutex::new(values.into_iter().collect()),
            last: std::sync::atomic::AtomicI32::new(1),
        }
    }
}

#[cfg(test)]
impl RandomPort for ScriptedRandom {
    fn gen_range(&self, min: i32, max: i32) -> i32 {
        use std::sync::atomic::Ordering;
        let next = self
            .values
            .lock()
            .ok()
            .and_then(|mut values| values.pop_front());
        let value = match next {
            Some(value) => {
                self.last.store(value, Ordering::SeqCst);
                value
            }
            None => self.last.load(Ordering::SeqCst),
        };
        value.clamp(min, max.max(min))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::ports::MockRandomPort;

    #[test]
    fn test_fixed_clock_millis() {
        let clock = FixedClock::at_millis(1_700_000_000_123);
        assert_eq!(clock.now_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_base36_suffix_uses_random_source() {
        let mut random = MockRandomPort::new();
        random.expect_gen_range().times(6).returning(|_, _| 35);
        assert_eq!(base36_suffix(&random, 6), "zzzzzz");
    }

    #[test]
    fn test_system_random_stays_in_range() {
        let random = SystemRandom::new();
        for _ in 0..100 {
            let value = random.gen_range(1, 6);
            assert!((1..=6).contains(&value));
        }
        assert_eq!(random.gen_range(4, 4), 4);
    }

    #[test]
    fn test_scripted_random_repeats_last_value() {
        let random = ScriptedRandom::new([3, 17]);
        assert_eq!(random.gen_range(1, 20), 3);
        assert_eq!(random.gen_range(1, 20), 17);
        assert_eq!(random.gen_range(1, 20), 17);
        assert_eq!(random.gen_range(1, 6), 6);
    }
}
