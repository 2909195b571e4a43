use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::{PingSample, ProbeError};

/// The provider's query envelope: `results[0].series[*].{columns, values}`.
/// Unknown columns are tolerated and ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub results: Vec<QueryResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub series: Vec<Series>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}

/// Column positions we care about within one series.
struct ColumnIndex {
    time: usize,
    url: Option<usize>,
    result_code: Option<usize>,
    packet_loss: Option<usize>,
}

impl ColumnIndex {
    fn resolve(columns: &[String]) -> Result<Self, ProbeError> {
        let find = |name: &str| columns.iter().position(|c| c == name);
        let time = find("time").ok_or_else(|| {
            ProbeError::Config("query result is missing the time column".to_string())
        })?;
        Ok(Self {
            time,
            url: find("url"),
            result_code: find("result_code"),
            packet_loss: find("percent_packet_loss"),
        })
    }
}

impl QueryResponse {
    /// Flatten the envelope into `(ip, timestamp, success)` samples.
    /// A sample is successful iff `result_code == 0 && packet_loss < 100`.
    pub fn into_samples(self) -> Result<Vec<PingSample>, ProbeError> {
        let mut samples = Vec::new();

        let Some(first) = self.results.into_iter().next() else {
            return Ok(samples);
        };
        if let Some(error) = first.error {
            return Err(ProbeError::Config(format!("query rejected: {error}")));
        }

        for series in first.series {
            let index = ColumnIndex::resolve(&series.columns)?;
            for row in series.values {
                let Some(timestamp) = row.get(index.time).and_then(parse_timestamp) else {
                    continue;
                };
                let ip_address = index
                    .url
                    .and_then(|i| row.get(i))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if ip_address.is_empty() {
                    continue;
                }
                let result_code = index
                    .result_code
                    .and_then(|i| row.get(i))
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                let packet_loss = index
                    .packet_loss
                    .and_then(|i| row.get(i))
                    .and_then(Value::as_f64)
                    .unwrap_or(100.0);

                samples.push(PingSample {
                    ip_address,
                    timestamp,
                    success: result_code == 0 && packet_loss < 100.0,
                });
            }
        }

        samples.sort_by_key(|s| s.timestamp);
        Ok(samples)
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
