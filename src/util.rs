use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tracing_subscriber::{EnvFilter, fmt};

pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

pub fn format_cost(cost_usd: f64) -> String {
    if !cost_usd.is_finite() || cost_usd <= 0.0 {
        return "$0.00".to_string();
    }
    if cost_usd < 0.01 {
        format!("${cost_usd:.4}")
    } else if cost_usd < 1.0 {
        format!("${cost_usd:.3}")
    } else {
        format!("${cost_usd:.2}")
    }
}

pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if secs > 0 {
        format!("{seconds}s")
    } else {
        format!("{}ms", duration.as_millis())
    }
}

pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    if max_chars <= 3 {
        return input.chars().take(max_chars).collect();
    }
    let kept: String = input.chars().take(max_chars - 3).collect();
    format!("{kept}...")
}

pub fn format_counts(counts: &BTreeMap<String, u64>) -> String {
    if counts.is_empty() {
        return "none".to_string();
    }
    let mut entries: Vec<(&String, &u64)> = counts.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    entries
        .into_iter()
        .map(|(name, count)| format!("{name} x{count}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn format_local_time(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|value| {
        value
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    })
    .unwrap_or_else(|| "n/a".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_formatting() {
        assert_eq!(format_tokens(999), "999");
        assert_eq!(format_tokens(1_500), "1.5K");
        assert_eq!(format_tokens(1_500_000), "1.5M");
    }

    #[test]
    fn cost_formatting() {
        assert_eq!(format_cost(0.0), "$0.00");
        assert_eq!(format_cost(0.0009), "$0.0009");
        assert_eq!(format_cost(0.1234), "$0.123");
        assert_eq!(format_cost(12.3456), "$12.35");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("héllo wörld", 8), "héllo...");
        assert_eq!(truncate_chars("abcdef", 2), "ab");
    }

    #[test]
    fn counts_sorted_by_frequency() {
        let counts = BTreeMap::from([
            ("search".to_string(), 1),
            ("browser".to_string(), 3),
            ("alpha".to_string(), 1),
        ]);
        assert_eq!(format_counts(&counts), "browser x3, alpha x1, search x1");
        assert_eq!(format_counts(&BTreeMap::new()), "none");
    }

    #[test]
    fn durations_are_compact() {
        assert_eq!(human_duration(Duration::from_millis(750)), "750ms");
        assert_eq!(human_duration(Duration::from_secs(10)), "10s");
        assert_eq!(human_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(human_duration(Duration::from_secs(3_725)), "1h 2m");
    }
}
