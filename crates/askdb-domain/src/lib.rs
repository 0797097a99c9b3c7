#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("step sequence regressed: {attempted} recorded after {previous}")]
    SequenceRegressed { previous: u32, attempted: u32 },
    #[error("step sequence numbers are 1-based, got 0")]
    ZeroSequence,
    #[error("sql_used is already set for this request")]
    SqlAlreadySet,
    #[error("row has {actual} values but the result has {expected} columns")]
    ColumnCountMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId(pub Ulid);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        let value = Ulid::from_str(input).map_err(|err| anyhow!("invalid request_id ULID: {err}"))?;
        Ok(Self(value))
    }
}

/// Tools the orchestrator can invoke while answering a question.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    None,
    ListTables,
    DescribeTable,
    PlanQuery,
    RunQuery,
    ValidateResult,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
}

/// Column metadata as reported by the dataset catalog.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub notnull: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

/// A single typed cell. Serialized as the native JSON scalar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// One result row: values positioned by the column list shared with its result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<CellValue>,
}

impl Row {
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn values(&self) -> &[CellValue] {
        &self.values
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .position(|name| name == column)
            .and_then(|index| self.values.get(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.iter() {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = Row;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of column names to scalar values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Row, A::Error> {
                let mut columns = Vec::new();
                let mut values = Vec::new();
                while let Some((column, value)) = access.next_entry::<String, CellValue>()? {
                    columns.push(column);
                    values.push(value);
                }
                Ok(Row {
                    columns: columns.into(),
                    values,
                })
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}

/// Rows returned by one statement, in projection column order.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    columns: Arc<[String]>,
    rows: Vec<Row>,
}

impl QueryResult {
    #[must_use]
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns: columns.into(),
            rows: Vec::new(),
        }
    }

    /// Append a row whose values follow the result's column order.
    ///
    /// # Errors
    /// Returns an error when the value count differs from the column count.
    pub fn push_row(&mut self, values: Vec<CellValue>) -> Result<(), DomainError> {
        if values.len() != self.columns.len() {
            return Err(DomainError::ColumnCountMismatch {
                expected: self.columns.len(),
                actual: values.len(),
            });
        }
        self.rows.push(Row {
            columns: Arc::clone(&self.columns),
            values,
        });
        Ok(())
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First `limit` rows, sharing this result's column list.
    #[must_use]
    pub fn preview(&self, limit: usize) -> Self {
        Self {
            columns: Arc::clone(&self.columns),
            rows: self.rows.iter().take(limit).cloned().collect(),
        }
    }
}

impl Serialize for QueryResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.rows.len()))?;
        for row in &self.rows {
            seq.serialize_element(row)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for QueryResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ResultVisitor;

        impl<'de> Visitor<'de> for ResultVisitor {
            type Value = QueryResult;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a sequence of row objects")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<QueryResult, A::Error> {
                let mut rows: Vec<Row> = Vec::new();
                while let Some(row) = access.next_element::<Row>()? {
                    rows.push(row);
                }
                let columns = rows
                    .first()
                    .map_or_else(|| Arc::from(Vec::new()), |row| Arc::clone(&row.columns));
                Ok(QueryResult { columns, rows })
            }
        }

        deserializer.deserialize_seq(ResultVisitor)
    }
}

/// What a step intends to record. Turned into an immutable [`Step`] by
/// [`Request::record`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepEntry {
    pub intent: String,
    pub tool: ToolName,
    pub tool_input: Value,
    pub tool_output: Option<Value>,
    pub decision: String,
    pub error: Option<String>,
}

impl StepEntry {
    #[must_use]
    pub fn new(intent: impl Into<String>, tool: ToolName) -> Self {
        Self {
            intent: intent.into(),
            tool,
            tool_input: json!({}),
            tool_output: None,
            decision: String::new(),
            error: None,
        }
    }

    #[must_use]
    pub fn input(mut self, tool_input: Value) -> Self {
        self.tool_input = tool_input;
        self
    }

    #[must_use]
    pub fn output(mut self, tool_output: Value) -> Self {
        self.tool_output = Some(tool_output);
        self
    }

    #[must_use]
    pub fn decision(mut self, decision: impl Into<String>) -> Self {
        self.decision = decision.into();
        self
    }

    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.tool_output = None;
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub step: u32,
    pub intent: String,
    pub tool: ToolName,
    pub tool_input: Value,
    pub tool_output: Value,
    pub decision: String,
    pub error: Option<String>,
    #[serde(with = "rfc3339")]
    pub timestamp: DateTimeUtc,
}

/// One orchestration run and its append-only step log.
#[derive(Debug, Clone)]
pub struct Request {
    request_id: RequestId,
    started_at: DateTimeUtc,
    ended_at: Option<DateTimeUtc>,
    steps: Vec<Step>,
    sql_used: String,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    #[must_use]
    pub fn new() -> Self {
        Self {
            request_id: RequestId::new(),
            started_at: now_utc(),
            ended_at: None,
            steps: Vec::new(),
            sql_used: String::new(),
        }
    }

    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    #[must_use]
    pub fn started_at(&self) -> DateTimeUtc {
        self.started_at
    }

    #[must_use]
    pub fn ended_at(&self) -> Option<DateTimeUtc> {
        self.ended_at
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    #[must_use]
    pub fn sql_used(&self) -> &str {
        &self.sql_used
    }

    /// Append a step. Absent output is stored as an empty array.
    ///
    /// # Errors
    /// Returns an error when `sequence` is zero or lower than the last recorded step.
    pub fn record(&mut self, sequence: u32, entry: StepEntry) -> Result<&Step, DomainError> {
        if sequence == 0 {
            return Err(DomainError::ZeroSequence);
        }
        if let Some(last) = self.steps.last() {
            if sequence < last.step {
                return Err(DomainError::SequenceRegressed {
                    previous: last.step,
                    attempted: sequence,
                });
            }
        }

        let step = Step {
            step: sequence,
            intent: entry.intent,
            tool: entry.tool,
            tool_input: entry.tool_input,
            tool_output: entry.tool_output.unwrap_or_else(|| Value::Array(Vec::new())),
            decision: entry.decision,
            error: entry.error,
            timestamp: now_utc(),
        };
        self.steps.push(step);
        let index = self.steps.len() - 1;
        Ok(&self.steps[index])
    }

    /// # Errors
    /// Returns an error when the SQL was already set by an earlier planning step.
    pub fn set_sql_used(&mut self, sql: &str) -> Result<(), DomainError> {
        if !self.sql_used.is_empty() {
            return Err(DomainError::SqlAlreadySet);
        }
        self.sql_used = sql.to_string();
        Ok(())
    }

    /// Stamp the end time. Later calls keep the first value.
    pub fn finish(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(now_utc());
        }
    }
}

/// Durable, write-once form of a finished request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    pub request_id: RequestId,
    pub steps: Vec<Step>,
    pub total_steps: usize,
    pub duration_seconds: f64,
    #[serde(with = "rfc3339")]
    pub start_time: DateTimeUtc,
    #[serde(with = "rfc3339")]
    pub end_time: DateTimeUtc,
}

impl Trace {
    /// Snapshot a request. An unfinished request is measured up to now.
    #[must_use]
    pub fn from_request(request: &Request) -> Self {
        let end_time = request.ended_at().unwrap_or_else(now_utc);
        let start_time = request.started_at();
        Self {
            request_id: request.request_id(),
            steps: request.steps().to_vec(),
            total_steps: request.steps().len(),
            duration_seconds: (end_time - start_time).as_seconds_f64(),
            start_time,
            end_time,
        }
    }
}

/// Response returned to the caller for one question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResponse {
    pub request_id: RequestId,
    pub question: String,
    pub answer: QueryResult,
    pub num_rows: usize,
    pub status: RunStatus,
    pub sql_used: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
    #[must_use]
    pub fn success(request_id: RequestId, question: &str, answer: QueryResult, sql_used: &str) -> Self {
        Self {
            request_id,
            question: question.to_string(),
            num_rows: answer.len(),
            answer,
            status: RunStatus::Success,
            sql_used: sql_used.to_string(),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(request_id: RequestId, question: &str, sql_used: &str, error: String) -> Self {
        Self {
            request_id,
            question: question.to_string(),
            answer: QueryResult::new(Vec::new()),
            num_rows: 0,
            status: RunStatus::Error,
            sql_used: sql_used.to_string(),
            error: Some(error),
        }
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let text = value.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        OffsetDateTime::parse(&text, &Rfc3339).map_err(serde::de::Error::custom)
    }
}
