//! Human-readable size and duration literals
//!
//! Sizes accept `B`, `K[B]`, `KiB`, `M[B]`, `MiB`, `G[B]`, `GiB`, `T[B]`,
//! `TiB`; `iB` suffixes and bare letters are powers of 1024, `B` suffixes
//! are powers of 1000. Durations accept `s`, `m`, `h`, `d`, `w`, `y` and
//! may be compound (`4w2d`). A bare `0` is zero in both grammars; an
//! absent value is "unspecified" and is represented by `Option` at the
//! call sites, never by a sentinel.

use crate::error::{ImagerError, ImagerResult};

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

const KB: u64 = 1000;
const MB: u64 = KB * 1000;
const GB: u64 = MB * 1000;
const TB: u64 = GB * 1000;

const MINUTE: u64 = 60;
const HOUR: u64 = MINUTE * 60;
const DAY: u64 = HOUR * 24;
const WEEK: u64 = DAY * 7;
const YEAR: u64 = DAY * 365;

fn size_unit_multiplier(unit: &str) -> Option<u64> {
    match unit {
        "" | "B" => Some(1),
        "K" | "KIB" => Some(KIB),
        "M" | "MIB" => Some(MIB),
        "G" | "GIB" => Some(GIB),
        "T" | "TIB" => Some(TIB),
        "KB" => Some(KB),
        "MB" => Some(MB),
        "GB" => Some(GB),
        "TB" => Some(TB),
        _ => None,
    }
}

/// Parse a human size literal (`1G`, `2.4GiB`, `500MB`, `0`) into bytes
pub fn parse_size(text: &str) -> ImagerResult<u64> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ImagerError::InvalidFormat("empty size".to_string()));
    }

    let split = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let multiplier = size_unit_multiplier(&unit.trim().to_ascii_uppercase())
        .ok_or_else(|| ImagerError::InvalidFormat(text.to_string()))?;

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| ImagerError::InvalidFormat(text.to_string()));
    }

    let fractional: f64 = number
        .parse()
        .map_err(|_| ImagerError::InvalidFormat(text.to_string()))?;
    if !fractional.is_finite() || fractional < 0.0 {
        return Err(ImagerError::InvalidFormat(text.to_string()));
    }
    Ok((fractional * multiplier as f64).round() as u64)
}

/// Human-readable representation of a size in bytes (binary units)
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (multiplier, unit) in [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")] {
        if bytes % multiplier == 0 {
            return format!("{}{}", bytes / multiplier, unit);
        }
    }
    for (multiplier, unit) in [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")] {
        if bytes >= multiplier {
            return format!("{:.1}{}", bytes as f64 / multiplier as f64, unit);
        }
    }
    format!("{bytes}B")
}

/// Human-readable representation of a size using decimal units
pub fn format_size_decimal(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (multiplier, unit) in [(TB, "TB"), (GB, "GB"), (MB, "MB"), (KB, "KB")] {
        if bytes % multiplier == 0 {
            return format!("{}{}", bytes / multiplier, unit);
        }
    }
    format!("{bytes}B")
}

fn duration_unit_seconds(unit: char) -> Option<u64> {
    match unit {
        's' => Some(1),
        'm' => Some(MINUTE),
        'h' => Some(HOUR),
        'd' => Some(DAY),
        'w' => Some(WEEK),
        'y' => Some(YEAR),
        _ => None,
    }
}

/// Parse a duration literal (`30d`, `4w2d`, `90s`, `0`) into seconds
pub fn parse_duration(text: &str) -> ImagerResult<u64> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ImagerError::InvalidFormat("empty duration".to_string()));
    }
    if text == "0" {
        return Ok(0);
    }

    let mut total: u64 = 0;
    let mut number = String::new();
    let mut seen_component = false;

    for c in text.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        if c.is_whitespace() && number.is_empty() {
            continue;
        }
        let seconds =
            duration_unit_seconds(c).ok_or_else(|| ImagerError::InvalidFormat(text.to_string()))?;
        let value: u64 = number
            .parse()
            .map_err(|_| ImagerError::InvalidFormat(text.to_string()))?;
        total = value
            .checked_mul(seconds)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| ImagerError::InvalidFormat(text.to_string()))?;
        number.clear();
        seen_component = true;
    }

    if !number.is_empty() || !seen_component {
        // trailing bare number (no unit) or no component at all
        return Err(ImagerError::InvalidFormat(text.to_string()));
    }
    Ok(total)
}

/// Human-readable duration from seconds (`30d`, `4w2d`)
pub fn format_duration(seconds: u64) -> String {
    if seconds == 0 {
        return "0".to_string();
    }
    let mut remaining = seconds;
    let mut out = String::new();
    for (unit_seconds, unit) in [
        (YEAR, 'y'),
        (WEEK, 'w'),
        (DAY, 'd'),
        (HOUR, 'h'),
        (MINUTE, 'm'),
        (1, 's'),
    ] {
        let count = remaining / unit_seconds;
        if count > 0 {
            out.push_str(&format!("{count}{unit}"));
            remaining -= count * unit_seconds;
        }
    }
    out
}
