//! Time-bucketed aggregation over archive rows.
//!
//! Both backends fetch candidate rows and aggregate here, so the bucket
//! and coercion semantics cannot drift between them.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use crate::types::{AggFunc, AggregatedHistory};

/// One archive row as needed by aggregation.
pub(crate) struct SampleRow {
    pub topic: String,
    pub time: DateTime<Utc>,
    pub payload: Bytes,
    pub payload_json: Option<Value>,
}

impl SampleRow {
    /// Numeric view of the row: `payload_json[field]` first, then the
    /// payload bytes as a UTF-8 number.
    fn numeric(&self, field: Option<&str>) -> Option<f64> {
        if let (Some(doc), Some(field)) = (self.payload_json.as_ref(), field) {
            if let Some(n) = doc.get(field).and_then(Value::as_f64) {
                return Some(n);
            }
        }
        if field.is_none() {
            if let Some(n) = self.payload_json.as_ref().and_then(Value::as_f64) {
                return Some(n);
            }
        }
        std::str::from_utf8(&self.payload)
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
    }
}

pub(crate) fn aggregate(
    mut rows: Vec<SampleRow>,
    topics: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval_minutes: u32,
    agg_funcs: &[AggFunc],
    json_fields: &[String],
) -> AggregatedHistory {
    let interval = Duration::minutes(i64::from(interval_minutes.max(1)));

    // Column per (topic, field, func); a missing field list means one
    // unnamed field coerced from the payload itself.
    let fields: Vec<Option<&str>> = if json_fields.is_empty() {
        vec![None]
    } else {
        json_fields.iter().map(|f| Some(f.as_str())).collect()
    };

    let mut columns = vec!["time".to_string()];
    for topic in topics {
        for field in &fields {
            for func in agg_funcs {
                let name = match field {
                    Some(f) => format!("{topic}:{f}:{}", func.as_str()),
                    None => format!("{topic}:{}", func.as_str()),
                };
                columns.push(name);
            }
        }
    }

    rows.sort_by(|a, b| a.time.cmp(&b.time));

    // bucket index -> topic -> rows in time order
    let mut buckets: std::collections::BTreeMap<i64, Vec<&SampleRow>> =
        std::collections::BTreeMap::new();
    for row in &rows {
        if row.time < start || row.time > end {
            continue;
        }
        let idx = (row.time - start).num_milliseconds() / interval.num_milliseconds();
        buckets.entry(idx).or_default().push(row);
    }

    let mut out_rows = Vec::with_capacity(buckets.len());
    for (idx, bucket_rows) in buckets {
        let bucket_start = start + interval * (idx as i32);
        let mut out = Vec::with_capacity(columns.len());
        out.push(json!(bucket_start.to_rfc3339()));

        for topic in topics {
            for field in &fields {
                let values: Vec<f64> = bucket_rows
                    .iter()
                    .filter(|r| &r.topic == topic)
                    .filter_map(|r| r.numeric(*field))
                    .collect();

                for func in agg_funcs {
                    out.push(apply(*func, &values));
                }
            }
        }
        out_rows.push(out);
    }

    AggregatedHistory {
        columns,
        rows: out_rows,
    }
}

fn apply(func: AggFunc, values: &[f64]) -> Value {
    if values.is_empty() {
        return match func {
            AggFunc::Count => json!(0),
            _ => Value::Null,
        };
    }

    match func {
        AggFunc::Min => json!(values.iter().copied().fold(f64::INFINITY, f64::min)),
        AggFunc::Max => json!(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        AggFunc::Avg => json!(values.iter().sum::<f64>() / values.len() as f64),
        AggFunc::Sum => json!(values.iter().sum::<f64>()),
        AggFunc::Count => json!(values.len()),
        AggFunc::First => json!(values[0]),
        AggFunc::Last => json!(values[values.len() - 1]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(topic: &str, offset_secs: i64, payload: &str, base: DateTime<Utc>) -> SampleRow {
        SampleRow {
            topic: topic.to_string(),
            time: base + Duration::seconds(offset_secs),
            payload: Bytes::from(payload.to_string()),
            payload_json: serde_json::from_str(payload).ok(),
        }
    }

    #[test]
    fn test_bucketing_and_funcs() {
        let start = Utc::now();
        let end = start + Duration::minutes(10);
        let rows = vec![
            row("t", 10, "1", start),
            row("t", 20, "3", start),
            row("t", 70, "10", start), // second bucket (1m interval)
        ];

        let result = aggregate(
            rows,
            &["t".to_string()],
            start,
            end,
            1,
            &[AggFunc::Min, AggFunc::Max, AggFunc::Avg, AggFunc::Count],
            &[],
        );

        assert_eq!(
            result.columns,
            vec!["time", "t:min", "t:max", "t:avg", "t:count"]
        );
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0][1], json!(1.0));
        assert_eq!(result.rows[0][2], json!(3.0));
        assert_eq!(result.rows[0][3], json!(2.0));
        assert_eq!(result.rows[0][4], json!(2));
        assert_eq!(result.rows[1][1], json!(10.0));
    }

    #[test]
    fn test_json_field_coercion() {
        let start = Utc::now();
        let end = start + Duration::minutes(5);
        let rows = vec![
            row("t", 1, r#"{"temp": 20.5, "hum": 40}"#, start),
            row("t", 2, r#"{"temp": 21.5, "hum": 42}"#, start),
        ];

        let result = aggregate(
            rows,
            &["t".to_string()],
            start,
            end,
            5,
            &[AggFunc::Avg],
            &["temp".to_string(), "hum".to_string()],
        );

        assert_eq!(result.columns, vec!["time", "t:temp:avg", "t:hum:avg"]);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][1], json!(21.0));
        assert_eq!(result.rows[0][2], json!(41.0));
    }

    #[test]
    fn test_first_last_ordering() {
        let start = Utc::now();
        let end = start + Duration::minutes(5);
        // Deliberately out of order
        let rows = vec![
            row("t", 30, "3", start),
            row("t", 10, "1", start),
            row("t", 20, "2", start),
        ];

        let result = aggregate(
            rows,
            &["t".to_string()],
            start,
            end,
            5,
            &[AggFunc::First, AggFunc::Last],
            &[],
        );

        assert_eq!(result.rows[0][1], json!(1.0));
        assert_eq!(result.rows[0][2], json!(3.0));
    }

    #[test]
    fn test_non_numeric_skipped() {
        let start = Utc::now();
        let end = start + Duration::minutes(5);
        let rows = vec![row("t", 1, "on", start), row("t", 2, "7", start)];

        let result = aggregate(
            rows,
            &["t".to_string()],
            start,
            end,
            5,
            &[AggFunc::Sum, AggFunc::Count],
            &[],
        );

        assert_eq!(result.rows[0][1], json!(7.0));
        assert_eq!(result.rows[0][2], json!(1));
    }
}
