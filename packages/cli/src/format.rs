// ABOUTME: Text helpers for CLI tables
// ABOUTME: Port mappings, relative ages and truncation

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// `external->internal/tcp` pairs, as `docker ps` prints them.
pub fn format_ports(mapped: &BTreeMap<u16, u16>) -> String {
    mapped
        .iter()
        .map(|(external, internal)| format!("{}->{}/tcp", external, internal))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn format_age(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(created_at);
    if elapsed.num_days() > 0 {
        format!("{}d ago", elapsed.num_days())
    } else if elapsed.num_hours() > 0 {
        format!("{}h ago", elapsed.num_hours())
    } else if elapsed.num_minutes() > 0 {
        format!("{}m ago", elapsed.num_minutes())
    } else {
        "just now".to_string()
    }
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_format_ports() {
        assert_eq!(format_ports(&BTreeMap::new()), "");
        let mapped = BTreeMap::from([(30001, 443), (30000, 80)]);
        assert_eq!(format_ports(&mapped), "30000->80/tcp, 30001->443/tcp");
    }

    #[rstest]
    #[case(Duration::seconds(5), "just now")]
    #[case(Duration::minutes(7), "7m ago")]
    #[case(Duration::hours(3), "3h ago")]
    #[case(Duration::days(2), "2d ago")]
    fn test_format_age(#[case] elapsed: Duration, #[case] expected: &str) {
        let now = Utc::now();
        assert_eq!(format_age(now - elapsed, now), expected);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("nginx:alpine", 20), "nginx:alpine");
        assert_eq!(truncate("registry.example.com/team/app:1.2.3", 12), "registry....");
    }
}
