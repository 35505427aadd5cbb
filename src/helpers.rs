use std::time::Duration;

/// `H:MM:SS`, prefixed with the day count once past 24 hours.
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let (days, rest) = (total / 86_400, total % 86_400);
    let clock = format!("{}:{:02}:{:02}", rest / 3600, rest % 3600 / 60, rest % 60);
    match days {
        0 => clock,
        1 => format!("1 day, {clock}"),
        n => format!("{n} days, {clock}"),
    }
}

// Bytes in Hex-String umwandeln
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
