use std::collections::BTreeMap;

use arc_swap::ArcSwap;

use crate::error::AppError;

/// The delay applied to messages whose delay level is unknown.
pub const DEFAULT_UNKNOWN_LEVEL_DELAY_MS: i64 = 1000;

/// A single parsed delay level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DelayLevel {
    pub delay_ms: i64,
    /// The original token of this level, e.g. `10s`, used for naming the level's topic.
    pub token: String,
}

/// The table of configured delay levels, keyed by 1-based level.
///
/// Readers always observe a complete table. Parsing publishes a new table only on success, and
/// levels which are already present keep their existing values.
#[derive(Default)]
pub struct DelayLevelTable {
    levels: ArcSwap<BTreeMap<i32, DelayLevel>>,
}

impl DelayLevelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a whitespace separated list of delay tokens into the table.
    ///
    /// Each token is a positive integer followed by one of the units `s`, `m`, `h` or `d`. If any
    /// token is invalid the table is left untouched.
    pub fn parse(&self, raw: &str) -> Result<(), AppError> {
        let parsed = parse_levels(raw)?;
        self.levels.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            for (level, delay) in parsed.iter() {
                next.entry(*level).or_insert_with(|| delay.clone());
            }
            next
        });
        Ok(())
    }

    /// Get the delay of the given level in milliseconds.
    pub fn delay_millis(&self, level: i32) -> Option<i64> {
        self.levels.load().get(&level).map(|level| level.delay_ms)
    }

    /// Get the token of the given level.
    pub fn token(&self, level: i32) -> Option<String> {
        self.levels.load().get(&level).map(|level| level.token.clone())
    }

    /// The highest configured level, or 0 if no levels are configured.
    pub fn max_level(&self) -> i32 {
        self.levels.load().keys().next_back().copied().unwrap_or(0)
    }

    /// A snapshot of all configured levels.
    pub fn levels(&self) -> Vec<(i32, DelayLevel)> {
        self.levels.load().iter().map(|(level, delay)| (*level, delay.clone())).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.load().is_empty()
    }

    /// Compute the timestamp at which a message stored at `store_timestamp` is due.
    ///
    /// Unknown levels fall back to a one second delay.
    pub fn compute_deliver_timestamp(&self, level: i32, store_timestamp: i64) -> i64 {
        let delay = self.delay_millis(level).unwrap_or(DEFAULT_UNKNOWN_LEVEL_DELAY_MS);
        store_timestamp.saturating_add(delay)
    }
}

/// The name of the topic holding messages of the given level token.
pub fn schedule_topic_name(prefix: &str, token: &str) -> String {
    format!("{}_{}", prefix, token)
}

fn parse_levels(raw: &str) -> Result<BTreeMap<i32, DelayLevel>, AppError> {
    let mut levels = BTreeMap::new();
    for (idx, token) in raw.split_whitespace().enumerate() {
        let unit_pos = token
            .char_indices()
            .last()
            .map(|(pos, _)| pos)
            .ok_or_else(|| AppError::InvalidInput("empty delay level token".into()))?;
        let (count, unit) = token.split_at(unit_pos);
        let unit_ms: i64 = match unit {
            "s" => 1000,
            "m" => 1000 * 60,
            "h" => 1000 * 60 * 60,
            "d" => 1000 * 60 * 60 * 24,
            _ => return Err(AppError::InvalidInput(format!("unknown time unit in delay level token {:?}", token))),
        };
        let count: i64 = count
            .parse()
            .map_err(|_| AppError::InvalidInput(format!("invalid count in delay level token {:?}", token)))?;
        if count < 0 {
            return Err(AppError::InvalidInput(format!("delay level token {:?} must not be negative", token)));
        }
        let delay_ms = count
            .checked_mul(unit_ms)
            .ok_or_else(|| AppError::InvalidInput(format!("delay level token {:?} overflows", token)))?;
        levels.insert(
            idx as i32 + 1,
            DelayLevel {
                delay_ms,
                token: token.to_string(),
            },
        );
    }
    if levels.is_empty() {
        return Err(AppError::InvalidInput("no delay levels given".into()));
    }
    Ok(levels)
}
