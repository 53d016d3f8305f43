//! Human-readable sizes and percentage math

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Format a byte count with a binary (1024) unit, two decimals above bytes.
///
/// Negative values mean "unknown" and render as `--`.
pub fn format_size(bytes: i64) -> String {
    if bytes < 0 {
        return "--".to_string();
    }
    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Ratio of `part` to `whole` as a percentage rounded to two decimals.
///
/// Returns 0.0 for a non-positive `whole` and clamps the result to
/// `[0.0, 100.0]`.
pub fn ratio_percent(part: i64, whole: i64) -> f64 {
    if whole <= 0 || part <= 0 {
        return 0.0;
    }
    let part = part.min(whole);
    // fixed-point: hundredths of a percent
    let hundredths = (part as u128 * 10_000 + whole as u128 / 2) / whole as u128;
    hundredths as f64 / 100.0
}

/// `ratio_percent` rendered as `"42.50%"`.
pub fn percent_str(part: i64, whole: i64) -> String {
    format!("{:.2}%", ratio_percent(part, whole))
}
