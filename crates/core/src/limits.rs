//! Row-limit option sets shared by the message and results-table bindings.

pub const DEFAULT_LIMIT: u32 = 100;

/// Options offered by the compact limit button, which cycles through them.
pub const CYCLE_LIMIT_OPTIONS: [u32; 7] = [1, 5, 10, 25, 50, 100, 250];

/// Options offered when a result set looks truncated.
pub const TRUNCATION_LIMIT_OPTIONS: [u32; 4] = [100, 500, 1000, 5000];

/// Next option after `current`, wrapping around. Limits outside the set
/// restart at the first option.
#[must_use]
pub fn cycle_limit(current: u32) -> u32 {
    match CYCLE_LIMIT_OPTIONS
        .iter()
        .position(|option| *option == current)
    {
        Some(index) => CYCLE_LIMIT_OPTIONS[(index + 1) % CYCLE_LIMIT_OPTIONS.len()],
        None => CYCLE_LIMIT_OPTIONS[0],
    }
}

/// Smallest truncation option strictly above `current`, if any.
#[must_use]
pub fn next_truncation_limit(current: u32) -> Option<u32> {
    TRUNCATION_LIMIT_OPTIONS
        .iter()
        .copied()
        .find(|option| *option > current)
}

#[must_use]
pub fn limit_label(limit: u32) -> String {
    if limit == 1 {
        "1 result".to_string()
    } else {
        format!("{limit} results")
    }
}
