//! 格式化工具：大小、时长

use std::time::Duration;
use crate::utils::{DiagError, Result};

pub fn fmt_kb(kb: u64) -> String {
    if kb >= 1024 * 1024 {
        format!("{:.1}GiB", kb as f64 / 1024.0 / 1024.0)
    } else if kb >= 1024 {
        format!("{:.1}MiB", kb as f64 / 1024.0)
    } else {
        format!("{}KiB", kb)
    }
}

pub fn fmt_bytes(b: u64) -> String {
    if b >= 1 << 30 {
        format!("{:.1}GiB", b as f64 / (1u64 << 30) as f64)
    } else if b >= 1 << 20 {
        format!("{:.1}MiB", b as f64 / (1u64 << 20) as f64)
    } else if b >= 1 << 10 {
        format!("{:.1}KiB", b as f64 / (1u64 << 10) as f64)
    } else {
        format!("{}B", b)
    }
}

pub fn format_uptime(seconds: u64) -> String {
    let d = seconds / 86400;
    let h = (seconds % 86400) / 3600;
    let m = (seconds % 3600) / 60;
    if d > 0 {
        format!("{}d {}h {}m", d, h, m)
    } else if h > 0 {
        format!("{}h {}m", h, m)
    } else {
        format!("{}m", m)
    }
}

/// 解析 "90s" / "30m" / "24h" / "2d" → Duration
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);

    let n: u64 = num
        .parse()
        .map_err(|_| DiagError::Config(format!("invalid duration: {:?}", s)))?;

    let secs = match unit {
        "" | "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86400,
        other => {
            return Err(DiagError::Config(format!(
                "invalid duration unit {:?} in {:?}",
                other, s
            )))
        }
    };
    Ok(Duration::from_secs(secs))
}

/// 解析 "1.5GiB" → bytes
pub fn parse_size_to_bytes(s: &str) -> u64 {
    let s = s.trim();
    if s == "0B" || s.is_empty() { return 0; }
    let (num_part, unit) = s.split_at(
        s.find(|c: char| c.is_alphabetic()).unwrap_or(s.len())
    );
    let num: f64 = num_part.trim().parse().unwrap_or(0.0);
    match unit.to_uppercase().trim_end_matches('B') {
        "KI" | "K" => (num * 1024.0) as u64,
        "MI" | "M" => (num * 1024.0 * 1024.0) as u64,
        "GI" | "G" => (num * 1024.0 * 1024.0 * 1024.0) as u64,
        "TI" | "T" => (num * 1024.0 * 1024.0 * 1024.0 * 1024.0) as u64,
        _ => num as u64,
    }
}

/// 解析 "1.5%" → f64
pub fn parse_pct(s: &str) -> f64 {
    s.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}
