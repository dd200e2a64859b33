//! Instance names and host ports, derived from what the engine currently shows.

use std::collections::HashSet;

use devvm_common::{DevVmError, Result};

/// Ordinal of a name shaped `<prefix><ordinal>-<epoch secs>`.
pub fn parse_ordinal(name: &str, prefix: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?;
    let (ordinal, stamp) = rest.split_once('-')?;
    if ordinal.is_empty() || stamp.is_empty() || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !ordinal.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    ordinal.parse().ok()
}

/// Lowest positive ordinal not used by any of `names`.
pub fn next_ordinal<'a, I>(names: I, prefix: &str) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    let used: HashSet<u32> = names
        .into_iter()
        .filter_map(|name| parse_ordinal(name, prefix))
        .collect();
    (1..).find(|n| !used.contains(n)).unwrap_or(1)
}

pub fn instance_name(prefix: &str, ordinal: u32, epoch_secs: i64) -> String {
    format!("{prefix}{ordinal}-{epoch_secs}")
}

/// Whether `name` is instance `ordinal` (given as the user typed it) under `prefix`.
pub fn matches_ordinal(name: &str, prefix: &str, ordinal: &str) -> bool {
    let Some(rest) = name.strip_prefix(prefix) else {
        return false;
    };
    let Some(stamp) = rest.strip_prefix(ordinal).and_then(|r| r.strip_prefix('-')) else {
        return false;
    };
    !stamp.is_empty() && stamp.bytes().all(|b| b.is_ascii_digit())
}

/// First port at or above `base` that is not in `used`.
pub fn next_free_port<I>(used: I, base: u16) -> Result<u16>
where
    I: IntoIterator<Item = u16>,
{
    let used: HashSet<u16> = used.into_iter().collect();
    (base..=u16::MAX)
        .find(|port| !used.contains(port))
        .ok_or_else(|| {
            DevVmError::validation(
                format!("No free host port at or above {base}"),
                "Remove unused instances, or lower DEVVM_BASE_PORT",
            )
        })
}
