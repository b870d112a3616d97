//! JIRA timestamp handling.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Current wall clock as milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parse a JIRA `updated`/`created` timestamp into milliseconds since epoch.
///
/// JIRA emits `2025-01-08T03:45:23.000+0000`. The offset form is parsed
/// directly; anything else has fractional seconds and the timezone suffix
/// stripped and is interpreted as UTC. Returns `None` when nothing parses.
pub fn parse_jira_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.timestamp_millis());
    }

    let mut s = raw.strip_suffix('Z').unwrap_or(raw);
    if s.len() > 5 {
        let (head, tail) = s.split_at(s.len() - 5);
        if (tail.starts_with('+') || tail.starts_with('-'))
            && tail[1..].chars().all(|c| c.is_ascii_digit())
        {
            s = head;
        }
    }
    let s = s.split('.').next().unwrap_or(s).replace('T', " ");

    NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Extract the `fields.updated` timestamp of an issue as epoch milliseconds.
pub fn issue_updated_ms(issue: &serde_json::Value) -> Option<i64> {
    issue
        .get("fields")
        .and_then(|f| f.get("updated"))
        .and_then(|u| u.as_str())
        .and_then(parse_jira_timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_jira_offset_format() {
        // 2023-01-01T00:00:00 UTC
        assert_eq!(
            parse_jira_timestamp("2023-01-01T00:00:00.000+0000"),
            Some(1672531200000)
        );
    }

    #[test]
    fn test_parse_jira_offset_is_applied() {
        // +0800 is eight hours ahead of UTC
        assert_eq!(
            parse_jira_timestamp("2023-01-01T08:00:00.000+0800"),
            Some(1672531200000)
        );
    }

    #[test]
    fn test_parse_jira_millisecond_precision() {
        assert_eq!(
            parse_jira_timestamp("2023-01-01T00:00:00.123+0000"),
            Some(1672531200123)
        );
    }

    #[test]
    fn test_parse_bare_and_zulu_forms() {
        assert_eq!(
            parse_jira_timestamp("2023-01-01T00:00:00"),
            Some(1672531200000)
        );
        assert_eq!(
            parse_jira_timestamp("2023-01-01T00:00:00Z"),
            Some(1672531200000)
        );
    }

    #[test]
    fn test_parse_garbage_returns_none() {
        assert_eq!(parse_jira_timestamp(""), None);
        assert_eq!(parse_jira_timestamp("not a timestamp"), None);
        assert_eq!(parse_jira_timestamp("2023-13-45T99:00:00"), None);
    }

    #[test]
    fn test_issue_updated_ms() {
        let issue = json!({
            "key": "TP-1",
            "fields": {"updated": "2023-01-01T00:00:00.000+0000"}
        });
        assert_eq!(issue_updated_ms(&issue), Some(1672531200000));

        let missing = json!({"key": "TP-2", "fields": {}});
        assert_eq!(issue_updated_ms(&missing), None);
    }
}
