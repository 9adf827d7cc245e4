//! Power sample sources. The production source queries InfluxDB 2 with a
//! Flux expression and parses the CSV response.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use std::time::Duration;

/// HTTP timeout for a single query. Kept well below the maximum lease hold.
const QUERY_TIMEOUT_SEC: u64 = 20;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One time-stamped power reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("query request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed query result: {0}")]
    Malformed(String),
}

/// Read side of the time-series backend.
///
/// Returns samples oldest first. An empty vector means "no data in range";
/// a read failure is always an `Err`, never an empty result.
#[async_trait]
pub trait SampleSource: Send + Sync {
    async fn query(&self, query: &str) -> Result<Vec<Sample>, SourceError>;
}

// ---------------------------------------------------------------------------
// InfluxDB 2
// ---------------------------------------------------------------------------

pub struct InfluxDb2Source {
    client: Client,
    url: String,
    organization: String,
    token: String,
}

impl InfluxDb2Source {
    pub fn new(url: &str, organization: &str, token: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(QUERY_TIMEOUT_SEC))
            .build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            organization: organization.to_string(),
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl SampleSource for InfluxDb2Source {
    async fn query(&self, query: &str) -> Result<Vec<Sample>, SourceError> {
        let resp = self
            .client
            .post(format!("{}/api/v2/query", self.url))
            .query(&[("org", self.organization.as_str())])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "application/vnd.flux")
            .header(ACCEPT, "application/csv")
            .body(query.to_string())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.text().await?;
        parse_flux_csv(&body)
    }
}

/// Column positions of one CSV table header.
#[derive(Clone, Copy)]
struct Columns {
    time: usize,
    value: usize,
    table: Option<usize>,
}

/// Parse a Flux CSV response into samples.
///
/// Only the first table is used; a query is expected to yield one series.
/// Annotation rows (`#datatype`, ...) and blank separator rows are skipped.
pub(crate) fn parse_flux_csv(body: &str) -> Result<Vec<Sample>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut columns: Option<Columns> = None;
    let mut error_column: Option<usize> = None;
    let mut first_table: Option<String> = None;
    let mut samples = Vec::new();

    for record in reader.records() {
        let record = record.map_err(|e| SourceError::Malformed(e.to_string()))?;

        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        if record.get(0).is_some_and(|f| f.starts_with('#')) {
            continue;
        }

        let position = |name: &str| record.iter().position(|f| f == name);

        // Header rows: either a data table or the error table Influx emits
        // for failed queries.
        if let (Some(time), Some(value)) = (position("_time"), position("_value")) {
            if first_table.is_some() {
                break;
            }
            columns = Some(Columns {
                time,
                value,
                table: position("table"),
            });
            continue;
        }
        if columns.is_none() {
            if let Some(idx) = position("error") {
                error_column = Some(idx);
                continue;
            }
        }
        if let Some(idx) = error_column {
            let msg = record.get(idx).unwrap_or("unknown error");
            return Err(SourceError::Malformed(format!("query error: {msg}")));
        }

        let Some(cols) = columns else {
            return Err(SourceError::Malformed(
                "data row before table header".to_string(),
            ));
        };

        if let Some(table_idx) = cols.table {
            let table = record.get(table_idx).unwrap_or_default();
            match &first_table {
                None => first_table = Some(table.to_string()),
                Some(first) if first != table => break,
                Some(_) => {}
            }
        } else if first_table.is_none() {
            first_table = Some(String::new());
        }

        let time = record
            .get(cols.time)
            .ok_or_else(|| SourceError::Malformed("missing _time".to_string()))?;
        let value = record
            .get(cols.value)
            .ok_or_else(|| SourceError::Malformed("missing _value".to_string()))?;

        let timestamp = DateTime::parse_from_rfc3339(time)
            .map_err(|e| SourceError::Malformed(format!("bad _time '{time}': {e}")))?
            .with_timezone(&Utc);
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| SourceError::Malformed(format!("bad _value '{value}'")))?;

        samples.push(Sample::new(timestamp, value));
    }

    Ok(samples)
}

// ===========================================================================
// Tests
// ===========================================================================
