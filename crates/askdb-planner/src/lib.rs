#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{anyhow, Result};
use askdb_config::ReasoningConfig;
use askdb_dataset::SchemaInspector;
use askdb_domain::QueryResult;
use serde_json::{json, Value};

pub const SQL_SYSTEM_INSTRUCTION: &str = "You are an expert SQL query generator for an SQLite database. \
Only return a single SELECT SQL query, no explanations or markdown. \
Use only the tables and columns from the given schema. \
Limit results to at most 100 rows.";

pub const SUMMARY_SYSTEM_INSTRUCTION: &str =
    "You are a helpful data analyst. Explain SQL query results in 2-3 sentences for a business user.";

const ORDER_STATUS_SQL: &str = "SELECT order_status, COUNT(*) as num_orders FROM orders GROUP BY order_status ORDER BY num_orders DESC;";
const CUSTOMER_COUNT_SQL: &str = "SELECT COUNT(*) as total_customers FROM customers;";
const PAYMENT_TYPE_SQL: &str = "SELECT payment_type, COUNT(*) as num_payments FROM payments GROUP BY payment_type ORDER BY num_payments DESC;";

const SUMMARY_ROW_LIMIT: usize = 10;

/// External text-generation service: one system instruction, one user message,
/// one completion back.
pub trait ReasoningCapability {
    fn name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn complete(&self, system_instruction: &str, user_message: &str) -> Result<String>;
}

/// Stand-in used when no reasoning endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct Unconfigured;

impl ReasoningCapability for Unconfigured {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    fn complete(&self, _system_instruction: &str, _user_message: &str) -> Result<String> {
        Err(anyhow!("reasoning capability not configured"))
    }
}

/// Non-streaming chat call against an Ollama-compatible `/api/chat` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaChat {
    endpoint: String,
    model: String,
    timeout_ms: u64,
    auth_bearer_token: Option<String>,
}

impl OllamaChat {
    #[must_use]
    pub fn new(endpoint: &str, model: &str, timeout_ms: u64) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            timeout_ms,
            auth_bearer_token: None,
        }
    }

    /// Build a client from configuration. `Ok(None)` when no endpoint is set.
    ///
    /// # Errors
    /// Returns an error when `auth_bearer_env` names a variable that is not set.
    pub fn from_config(config: &ReasoningConfig) -> Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.as_deref() else {
            return Ok(None);
        };
        let mut client = Self::new(endpoint, &config.model, config.timeout_ms);
        if let Some(env_name) = config.auth_bearer_env.as_deref() {
            client.auth_bearer_token = Some(std::env::var(env_name).map_err(|_| {
                anyhow!("missing env var '{env_name}' required by reasoning.auth_bearer_env")
            })?);
        }
        Ok(Some(client))
    }
}

impl ReasoningCapability for OllamaChat {
    fn name(&self) -> &'static str {
        "ollama_chat"
    }

    fn complete(&self, system_instruction: &str, user_message: &str) -> Result<String> {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build();
        let mut req = agent
            .request("POST", &self.endpoint)
            .set("content-type", "application/json");
        if let Some(token) = &self.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        let outbound = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_instruction},
                {"role": "user", "content": user_message},
            ],
            "stream": false,
        });

        let body: Value = match req.send_json(&outbound) {
            Ok(response) => response.into_json()?,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("reasoning endpoint returned http status {code}"));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("reasoning endpoint transport failure: {err}"));
            }
        };

        body.pointer("/message/content")
            .and_then(Value::as_str)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| anyhow!("reasoning response has no message.content"))
    }
}

/// SQL chosen for a question, tagged with the path that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlPlan {
    Planned(String),
    Fallback { sql: String, reason: String },
}

impl SqlPlan {
    #[must_use]
    pub fn sql(&self) -> &str {
        match self {
            Self::Planned(sql) | Self::Fallback { sql, .. } => sql,
        }
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

pub struct QueryPlanner<'a> {
    inspector: &'a dyn SchemaInspector,
    capability: &'a dyn ReasoningCapability,
}

impl<'a> QueryPlanner<'a> {
    #[must_use]
    pub fn new(inspector: &'a dyn SchemaInspector, capability: &'a dyn ReasoningCapability) -> Self {
        Self {
            inspector,
            capability,
        }
    }

    /// Turn a question into one read statement. Never fails: any problem with the
    /// reasoning capability selects the heuristic fallback instead.
    #[must_use]
    pub fn plan(&self, question: &str, available_tables: &[String]) -> SqlPlan {
        match self.plan_with_capability(question, available_tables) {
            Ok(sql) => {
                tracing::debug!(capability = self.capability.name(), %sql, "planned SQL");
                SqlPlan::Planned(sql)
            }
            Err(err) => {
                tracing::warn!(
                    capability = self.capability.name(),
                    error = %err,
                    "SQL generation failed; falling back to heuristics"
                );
                SqlPlan::Fallback {
                    sql: fallback_sql(question).to_string(),
                    reason: err.to_string(),
                }
            }
        }
    }

    fn plan_with_capability(&self, question: &str, available_tables: &[String]) -> Result<String> {
        let schema_context = build_schema_context(self.inspector, available_tables);
        let user_message = format!(
            "Schema:\n{schema_context}\n\nQuestion: {question}\n\nReturn ONLY the SQL query:"
        );
        let raw = self
            .capability
            .complete(SQL_SYSTEM_INSTRUCTION, &user_message)?;
        normalize_sql_response(&raw)
            .ok_or_else(|| anyhow!("reasoning response contained no SQL statement"))
    }
}

/// One `Table 'name': col (TYPE), ...` line per describable table.
#[must_use]
pub fn build_schema_context(inspector: &dyn SchemaInspector, tables: &[String]) -> String {
    let mut lines = Vec::with_capacity(tables.len());
    for table in tables {
        let Ok(fields) = inspector.describe_table(table) else {
            continue;
        };
        let columns = fields
            .iter()
            .map(|field| format!("{} ({})", field.name, field.data_type))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("Table '{table}': {columns}"));
    }
    lines.join("\n")
}

/// Keyword heuristics used when the reasoning capability cannot answer.
#[must_use]
pub fn fallback_sql(question: &str) -> &'static str {
    let question = question.to_lowercase();
    if question.contains("order") && question.contains("status") {
        ORDER_STATUS_SQL
    } else if question.contains("customer") {
        CUSTOMER_COUNT_SQL
    } else if question.contains("payment") {
        PAYMENT_TYPE_SQL
    } else {
        ORDER_STATUS_SQL
    }
}

/// Strip markdown fencing and terminators from a model response and end it with
/// exactly one `;`. `None` when nothing is left.
#[must_use]
pub fn normalize_sql_response(raw: &str) -> Option<String> {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let body = rest.split_once("```").map_or(rest, |(body, _)| body);
        text = strip_language_tag(body);
    }
    let text = text
        .trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if text.is_empty() {
        None
    } else {
        Some(format!("{text};"))
    }
}

fn strip_language_tag(body: &str) -> &str {
    let Some((first_line, rest)) = body.split_once('\n') else {
        return body;
    };
    let tag = first_line.trim();
    let is_tag = tag.is_empty()
        || (tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            && !tag.eq_ignore_ascii_case("select")
            && !tag.eq_ignore_ascii_case("with"));
    if is_tag {
        rest
    } else {
        body
    }
}

/// Ask the capability for a short prose explanation of a result. Failures are
/// logged and yield `None`.
#[must_use]
pub fn summarize_answer(
    capability: &dyn ReasoningCapability,
    question: &str,
    result: &QueryResult,
    sql_used: &str,
) -> Option<String> {
    let rows = match serde_json::to_string_pretty(&result.preview(SUMMARY_ROW_LIMIT)) {
        Ok(rows) => rows,
        Err(err) => {
            tracing::warn!(error = %err, "could not serialize rows for summary");
            return None;
        }
    };
    let user_message = format!(
        "User question: {question}\n\nSQL used:\n{sql_used}\n\n\
         First {SUMMARY_ROW_LIMIT} rows of result (JSON):\n{rows}\n\n\
         Explain the key insights in 2-3 short sentences:"
    );
    match capability.complete(SUMMARY_SYSTEM_INSTRUCTION, &user_message) {
        Ok(summary) => Some(summary.trim().to_string()),
        Err(err) => {
            tracing::warn!(capability = capability.name(), error = %err, "answer summary failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        build_schema_context, fallback_sql, normalize_sql_response, summarize_answer, OllamaChat,
        QueryPlanner, ReasoningCapability, SqlPlan, Unconfigured, SQL_SYSTEM_INSTRUCTION,
    };
    use anyhow::{anyhow, Result};
    use askdb_config::ReasoningConfig;
    use askdb_dataset::{DatasetError, SchemaInspector};
    use askdb_domain::{CellValue, QueryResult, SchemaField};
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::cell::RefCell;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::JoinHandle;

    struct FixtureInspector;

    impl SchemaInspector for FixtureInspector {
        fn list_tables(&self) -> Result<Vec<String>, DatasetError> {
            Ok(vec!["orders".to_string(), "broken".to_string()])
        }

        fn describe_table(&self, table: &str) -> Result<Vec<SchemaField>, DatasetError> {
            match table {
                "orders" => Ok(vec![
                    field("order_id", "TEXT"),
                    field("order_status", "TEXT"),
                ]),
                other => Err(DatasetError::UnknownTable(other.to_string())),
            }
        }
    }

    fn field(name: &str, data_type: &str) -> SchemaField {
        SchemaField {
            name: name.to_string(),
            data_type: data_type.to_string(),
            notnull: false,
            default: None,
            primary_key: false,
        }
    }

    struct Scripted {
        response: Result<String, String>,
        seen: RefCell<Vec<(String, String)>>,
    }

    impl Scripted {
        fn answering(text: &str) -> Self {
            Self {
                response: Ok(text.to_string()),
                seen: RefCell::new(Vec::new()),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                response: Err(message.to_string()),
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl ReasoningCapability for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn complete(&self, system_instruction: &str, user_message: &str) -> Result<String> {
            self.seen
                .borrow_mut()
                .push((system_instruction.to_string(), user_message.to_string()));
            self.response.clone().map_err(|message| anyhow!(message))
        }
    }

    fn tables() -> Vec<String> {
        vec!["orders".to_string(), "broken".to_string()]
    }

    #[test]
    fn unavailable_capability_uses_order_status_fallback() {
        let planner = QueryPlanner::new(&FixtureInspector, &Unconfigured);
        let plan = planner.plan("What are the order statuses?", &tables());
        assert!(plan.is_fallback());
        assert_eq!(
            plan.sql(),
            "SELECT order_status, COUNT(*) as num_orders FROM orders GROUP BY order_status ORDER BY num_orders DESC;"
        );
    }

    #[test]
    fn unavailable_capability_uses_customer_fallback() {
        let planner = QueryPlanner::new(&FixtureInspector, &Unconfigured);
        let plan = planner.plan("How many customers are there?", &tables());
        assert_eq!(plan.sql(), "SELECT COUNT(*) as total_customers FROM customers;");
    }

    #[test]
    fn fallback_keyword_precedence() {
        assert_eq!(
            fallback_sql("Which PAYMENT methods are popular?"),
            "SELECT payment_type, COUNT(*) as num_payments FROM payments GROUP BY payment_type ORDER BY num_payments DESC;"
        );
        assert_eq!(
            fallback_sql("customer payment split"),
            "SELECT COUNT(*) as total_customers FROM customers;"
        );
        assert_eq!(fallback_sql("anything else"), fallback_sql("order status"));
    }

    #[test]
    fn planned_sql_is_normalized_and_schema_is_sent() {
        let capability = Scripted::answering("```sql\nSELECT order_id FROM orders LIMIT 100;;\n```");
        let planner = QueryPlanner::new(&FixtureInspector, &capability);
        let plan = planner.plan("list orders", &tables());
        assert_eq!(
            plan,
            SqlPlan::Planned("SELECT order_id FROM orders LIMIT 100;".to_string())
        );

        let seen = capability.seen.borrow();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].0.contains("single SELECT"));
        assert!(seen[0]
            .1
            .contains("Table 'orders': order_id (TEXT), order_status (TEXT)"));
        assert!(!seen[0].1.contains("broken"));
        assert!(seen[0].1.contains("Question: list orders"));
    }

    #[test]
    fn failing_or_empty_responses_fall_back() {
        let failing = Scripted::failing("connection refused");
        let plan = QueryPlanner::new(&FixtureInspector, &failing).plan("payments?", &tables());
        match plan {
            SqlPlan::Fallback { sql, reason } => {
                assert!(sql.starts_with("SELECT payment_type"));
                assert_eq!(reason, "connection refused");
            }
            SqlPlan::Planned(_) => panic!("expected fallback"),
        }

        let empty = Scripted::answering("```\n```");
        let plan = QueryPlanner::new(&FixtureInspector, &empty).plan("payments?", &tables());
        assert!(plan.is_fallback());
    }

    #[test]
    fn schema_context_skips_undescribable_tables() {
        let context = build_schema_context(&FixtureInspector, &tables());
        assert_eq!(context, "Table 'orders': order_id (TEXT), order_status (TEXT)");
    }

    #[test]
    fn normalize_handles_fences_and_terminators() {
        assert_eq!(
            normalize_sql_response("  SELECT 1  ").as_deref(),
            Some("SELECT 1;")
        );
        assert_eq!(
            normalize_sql_response("```\nSELECT 1;\n```").as_deref(),
            Some("SELECT 1;")
        );
        assert_eq!(
            normalize_sql_response("```SQL\nSELECT 1\n```\nThis counts rows.").as_deref(),
            Some("SELECT 1;")
        );
        assert_eq!(
            normalize_sql_response("```SELECT *\nFROM t```").as_deref(),
            Some("SELECT *\nFROM t;")
        );
        assert_eq!(normalize_sql_response(" ;; ").as_deref(), None);
    }

    #[test]
    fn config_without_endpoint_builds_no_client() {
        let built = OllamaChat::from_config(&ReasoningConfig::default());
        assert!(matches!(built, Ok(None)));
    }

    #[test]
    fn config_with_missing_token_env_is_rejected() {
        let config = ReasoningConfig {
            endpoint: Some("http://127.0.0.1:11434/api/chat".to_string()),
            auth_bearer_env: Some("ASKDB_TEST_TOKEN_THAT_IS_NEVER_SET".to_string()),
            ..ReasoningConfig::default()
        };
        assert!(OllamaChat::from_config(&config).is_err());
    }

    /// Answer exactly one HTTP request with a canned response; the join handle
    /// yields the raw request head and body.
    fn one_shot_server(status_line: &'static str, body: &'static str) -> (String, JoinHandle<(String, String)>) {
        let listener =
            TcpListener::bind("127.0.0.1:0").unwrap_or_else(|err| panic!("bind stub: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("stub addr: {err}"));
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener
                .accept()
                .unwrap_or_else(|err| panic!("accept: {err}"));
            let received = read_http_request(&mut stream);
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream
                .write_all(response.as_bytes())
                .unwrap_or_else(|err| panic!("write response: {err}"));
            received
        });
        (format!("http://{addr}/api/chat"), handle)
    }

    fn read_http_request(stream: &mut TcpStream) -> (String, String) {
        let mut reader = BufReader::new(stream);
        let mut head = String::new();
        let mut content_length = 0_usize;
        loop {
            let mut line = String::new();
            reader
                .read_line(&mut line)
                .unwrap_or_else(|err| panic!("read request line: {err}"));
            if line.trim_end().is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
            head.push_str(&line);
        }
        let mut body = vec![0_u8; content_length];
        reader
            .read_exact(&mut body)
            .unwrap_or_else(|err| panic!("read request body: {err}"));
        (head, String::from_utf8_lossy(&body).into_owned())
    }

    fn joined(handle: JoinHandle<(String, String)>) -> (String, String) {
        handle
            .join()
            .unwrap_or_else(|_| panic!("stub server thread panicked"))
    }

    #[test]
    fn chat_endpoint_content_becomes_planned_sql() {
        let (endpoint, server) = one_shot_server(
            "200 OK",
            r#"{"model":"gemma3:4b","message":{"role":"assistant","content":"```sql\nSELECT order_id FROM orders\n```"},"done":true}"#,
        );
        let mut client = OllamaChat::new(&endpoint, "gemma3:4b", 5_000);
        client.auth_bearer_token = Some("secret-token".to_string());
        let planner = QueryPlanner::new(&FixtureInspector, &client);

        let plan = planner.plan("list orders", &tables());
        assert_eq!(plan, SqlPlan::Planned("SELECT order_id FROM orders;".to_string()));

        let (head, body) = joined(server);
        assert!(head.starts_with("POST /api/chat "), "{head}");
        assert!(
            head.to_lowercase().contains("authorization: bearer secret-token"),
            "{head}"
        );
        let body: Value = serde_json::from_str(&body).unwrap_or_else(|err| panic!("body: {err}"));
        assert_eq!(body["model"], json!("gemma3:4b"));
        assert_eq!(body["stream"], json!(false));
        assert_eq!(body["messages"][0]["role"], json!("system"));
        assert_eq!(body["messages"][0]["content"], json!(SQL_SYSTEM_INSTRUCTION));
        assert_eq!(body["messages"][1]["role"], json!("user"));
        let user = body["messages"][1]["content"].as_str().unwrap_or_default();
        assert!(user.contains("Table 'orders': order_id (TEXT), order_status (TEXT)"));
        assert!(user.contains("Question: list orders"));
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn chat_endpoint_without_token_sends_no_authorization() {
        let (endpoint, server) = one_shot_server(
            "200 OK",
            r#"{"message":{"role":"assistant","content":"SELECT 1"}}"#,
        );
        let client = OllamaChat::new(&endpoint, "gemma3:4b", 5_000);
        let completion = client.complete("system", "user");
        assert_eq!(completion.ok().as_deref(), Some("SELECT 1"));

        let (head, _) = joined(server);
        assert!(!head.to_lowercase().contains("authorization:"), "{head}");
    }

    #[test]
    fn chat_endpoint_server_error_falls_back() {
        let (endpoint, server) = one_shot_server("500 Internal Server Error", r#"{"error":"boom"}"#);
        let client = OllamaChat::new(&endpoint, "gemma3:4b", 5_000);
        let planner = QueryPlanner::new(&FixtureInspector, &client);

        let plan = planner.plan("What are the order statuses?", &tables());
        match &plan {
            SqlPlan::Fallback { sql, reason } => {
                assert_eq!(sql, fallback_sql("What are the order statuses?"));
                assert!(reason.contains("http status 500"), "{reason}");
            }
            SqlPlan::Planned(sql) => panic!("expected fallback, planned {sql}"),
        }
        let _ = joined(server);
    }

    #[test]
    fn chat_endpoint_without_message_content_falls_back() {
        let (endpoint, server) =
            one_shot_server("200 OK", r#"{"message":{"role":"assistant"},"done":true}"#);
        let client = OllamaChat::new(&endpoint, "gemma3:4b", 5_000);
        let planner = QueryPlanner::new(&FixtureInspector, &client);

        let plan = planner.plan("How many customers are there?", &tables());
        match &plan {
            SqlPlan::Fallback { sql, reason } => {
                assert_eq!(sql, "SELECT COUNT(*) as total_customers FROM customers;");
                assert!(reason.contains("no message.content"), "{reason}");
            }
            SqlPlan::Planned(sql) => panic!("expected fallback, planned {sql}"),
        }
        let _ = joined(server);
    }

    #[test]
    fn summary_failure_yields_none() {
        let mut result = QueryResult::new(vec!["n".to_string()]);
        assert!(result.push_row(vec![CellValue::Integer(3)]).is_ok());
        assert!(summarize_answer(&Unconfigured, "q", &result, "SELECT 3 as n;").is_none());

        let capability = Scripted::answering("  There are three.  ");
        let summary = summarize_answer(&capability, "how many?", &result, "SELECT 3 as n;");
        assert_eq!(summary.as_deref(), Some("There are three."));
        assert!(capability.seen.borrow()[0].1.contains("\"n\": 3"));
    }

    proptest! {
        #[test]
        fn normalized_sql_ends_with_one_terminator(
            body in "[A-Za-z][A-Za-z0-9 ,*()=_]{0,40}",
            terminators in ";{0,3}",
            fenced in any::<bool>(),
        ) {
            let raw = if fenced {
                format!("```sql\n{body}{terminators}\n```")
            } else {
                format!("{body}{terminators}")
            };
            let normalized = normalize_sql_response(&raw);
            prop_assert!(normalized.is_some());
            let normalized = normalized.unwrap_or_default();
            prop_assert!(normalized.ends_with(';'));
            prop_assert!(!normalized.ends_with(";;"));
            prop_assert!(!normalized.contains("```"));
            prop_assert_eq!(normalized.trim_end_matches(';'), body.trim_end());
        }

        #[test]
        fn fallback_is_deterministic(question in ".{0,80}") {
            let planner = QueryPlanner::new(&FixtureInspector, &Unconfigured);
            let first = planner.plan(&question, &tables());
            let second = planner.plan(&question, &tables());
            prop_assert!(first.is_fallback());
            prop_assert_eq!(first.sql(), fallback_sql(&question));
            prop_assert_eq!(first, second);
        }
    }
}
