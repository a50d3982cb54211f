//! Extraction of the FAIR score and evaluation time from FUJI responses.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::error::ScoringError;

/// Naive timestamp layouts FUJI has been seen to emit.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// A successful evaluation of one record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FujiScore {
    /// FAIR percentage, 0.0 to 100.0.
    pub score: f64,
    pub evaluated_at: DateTime<Utc>,
}

/// Parses an evaluation response body.
///
/// The score is `summary.score_percent.FAIR`; its absence is a permanent
/// failure. The evaluation time is `end_timestamp`, falling back to `now`.
pub fn parse_evaluation(body: &Value, now: DateTime<Utc>) -> Result<FujiScore, ScoringError> {
    if !body.is_object() {
        return Err(ScoringError::ParseError(
            "response body is not a JSON object".to_string(),
        ));
    }

    let score = fair_score(body).ok_or(ScoringError::MissingScore)?;
    let evaluated_at = end_timestamp(body).unwrap_or(now);

    Ok(FujiScore {
        score,
        evaluated_at,
    })
}

fn fair_score(body: &Value) -> Option<f64> {
    let raw = body.pointer("/summary/score_percent/FAIR")?;
    let score = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    score.is_finite().then_some(score)
}

fn end_timestamp(body: &Value) -> Option<DateTime<Utc>> {
    match body.get("end_timestamp")? {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9) as u32;
            DateTime::from_timestamp(whole, nanos)
        }
        _ => None,
    }
}

/// Parses RFC 3339 timestamps, or naive ones which are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_full_response() {
        let body = json!({
            "summary": {"score_percent": {"FAIR": 62.5, "F": 80.0}},
            "end_timestamp": "2023-05-11T10:13:48Z"
        });
        let parsed = parse_evaluation(&body, now()).expect("parse");
        assert_eq!(parsed.score, 62.5);
        assert_eq!(
            parsed.evaluated_at,
            Utc.with_ymd_and_hms(2023, 5, 11, 10, 13, 48).unwrap()
        );
    }

    #[test]
    fn test_string_score_is_accepted() {
        let body = json!({"summary": {"score_percent": {"FAIR": "41.67"}}});
        let parsed = parse_evaluation(&body, now()).expect("parse");
        assert_eq!(parsed.score, 41.67);
    }

    #[test]
    fn test_missing_timestamp_falls_back_to_now() {
        let body = json!({"summary": {"score_percent": {"FAIR": 10}}});
        let parsed = parse_evaluation(&body, now()).expect("parse");
        assert_eq!(parsed.evaluated_at, now());
    }

    #[test]
    fn test_unparseable_timestamp_falls_back_to_now() {
        let body = json!({
            "summary": {"score_percent": {"FAIR": 10}},
            "end_timestamp": "yesterday"
        });
        let parsed = parse_evaluation(&body, now()).expect("parse");
        assert_eq!(parsed.evaluated_at, now());
    }

    #[test]
    fn test_unix_timestamp() {
        let body = json!({
            "summary": {"score_percent": {"FAIR": 10}},
            "end_timestamp": 1_700_000_000
        });
        let parsed = parse_evaluation(&body, now()).expect("parse");
        assert_eq!(parsed.evaluated_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_naive_timestamp_is_utc() {
        let parsed = parse_timestamp("2023-05-11T10:13:48.712345").expect("naive");
        assert_eq!(parsed.timestamp(), 1_683_800_028);

        let parsed = parse_timestamp("2023-05-11 10:13:48").expect("space separated");
        assert_eq!(parsed.timestamp(), 1_683_800_028);
    }

    #[test]
    fn test_offset_timestamp_is_normalized() {
        let parsed = parse_timestamp("2023-05-11T12:13:48+02:00").expect("offset");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2023, 5, 11, 10, 13, 48).unwrap());
    }

    #[test]
    fn test_missing_score_is_permanent() {
        let body = json!({"summary": {"score_percent": {}}});
        let err = parse_evaluation(&body, now()).expect_err("no score");
        assert!(matches!(err, ScoringError::MissingScore));
        assert!(!err.is_transient());

        let body = json!({"summary": {"score_percent": {"FAIR": null}}});
        assert!(matches!(
            parse_evaluation(&body, now()),
            Err(ScoringError::MissingScore)
        ));
    }

    #[test]
    fn test_non_object_body() {
        let err = parse_evaluation(&json!([1, 2, 3]), now()).expect_err("array");
        assert!(matches!(err, ScoringError::ParseError(_)));
    }
}
