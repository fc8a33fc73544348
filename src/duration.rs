//! Duration string parsing shared by test plans, ramp phases and CLI flags.
//!
//! Supports a single numeric value with a unit suffix: `ms` milliseconds,
//! `s` seconds, `m` minutes, `h` hours, `d` days (e.g. `"250ms"`, `"30s"`,
//! `"5m"`, `"2h"`). A bare integer is treated as seconds.

use std::time::Duration;

pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string cannot be empty".to_string());
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    if let Some(value_str) = s.strip_suffix("ms") {
        let value: u64 = value_str
            .parse()
            .map_err(|_| format!("invalid numeric value in duration: '{value_str}'"))?;
        return Ok(Duration::from_millis(value));
    }

    let unit_char = s
        .chars()
        .last()
        .ok_or_else(|| "duration string cannot be empty".to_string())?;
    let value_str = &s[..s.len() - unit_char.len_utf8()];
    let value: u64 = value_str
        .parse()
        .map_err(|_| format!("invalid numeric value in duration: '{value_str}'"))?;

    match unit_char {
        's' => Ok(Duration::from_secs(value)),
        'm' => Ok(Duration::from_secs(value * 60)),
        'h' => Ok(Duration::from_secs(value * 60 * 60)),
        'd' => Ok(Duration::from_secs(value * 24 * 60 * 60)),
        _ => Err(format!(
            "unknown duration unit '{unit_char}'; use 'ms', 's', 'm', 'h' or 'd'"
        )),
    }
}

/// Renders a duration back to the compact form used on `TestRun.duration`
/// and phase splits. Picks the coarsest unit that divides evenly, falling
/// back to milliseconds for sub-second remainders so a phase duration split
/// across N agents never silently rounds to zero.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    if secs % (24 * 60 * 60) == 0 {
        return format!("{}d", secs / (24 * 60 * 60));
    }
    if secs % (60 * 60) == 0 {
        return format!("{}h", secs / (60 * 60));
    }
    if secs % 60 == 0 {
        return format!("{}m", secs / 60);
    }
    format!("{secs}s")
}
