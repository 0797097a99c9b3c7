#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use askdb_config::{AgentConfig, KeyEntityConfig};
use askdb_dataset::{QueryExecutor, SchemaInspector};
use askdb_domain::{AgentResponse, QueryResult, Request, StepEntry, ToolName};
use askdb_planner::{QueryPlanner, ReasoningCapability, SqlPlan};
use askdb_trace_core::TraceStore;
use serde_json::{json, Value};

/// Judges whether a result plausibly answers the question. Advisory only.
pub trait ResultValidator {
    fn validate(&self, result: Option<&QueryResult>, question: &str) -> bool;
}

/// Accepts any present result.
#[derive(Debug, Clone, Default)]
pub struct PresenceValidator;

impl ResultValidator for PresenceValidator {
    fn validate(&self, result: Option<&QueryResult>, _question: &str) -> bool {
        result.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub key_entities: KeyEntityConfig,
    pub preview_rows: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for RunConfig {
    fn from(value: &AgentConfig) -> Self {
        Self {
            key_entities: value.key_entities.clone(),
            preview_rows: value.preview_rows,
        }
    }
}

pub struct Orchestrator<'a> {
    inspector: &'a dyn SchemaInspector,
    executor: &'a dyn QueryExecutor,
    capability: &'a dyn ReasoningCapability,
    validator: &'a dyn ResultValidator,
    trace_store: &'a dyn TraceStore,
    config: RunConfig,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(
        inspector: &'a dyn SchemaInspector,
        executor: &'a dyn QueryExecutor,
        capability: &'a dyn ReasoningCapability,
        validator: &'a dyn ResultValidator,
        trace_store: &'a dyn TraceStore,
        config: RunConfig,
    ) -> Self {
        Self {
            inspector,
            executor,
            capability,
            validator,
            trace_store,
            config,
        }
    }

    /// Answer one question and persist its trace.
    ///
    /// Tool failures come back as a response with `status: error`; the trace
    /// recorded so far is persisted either way.
    ///
    /// # Errors
    /// Returns an error only when the trace cannot be persisted or a step cannot
    /// be recorded.
    pub fn run(&self, question: &str) -> Result<AgentResponse> {
        let mut request = Request::new();
        let request_id = request.request_id();
        tracing::info!(%request_id, "run started");

        let outcome = self.drive(&mut request, question);
        request.finish();
        self.trace_store
            .persist(&request)
            .with_context(|| format!("failed to persist trace for request {request_id}"))?;

        let response = outcome?;
        tracing::info!(
            %request_id,
            status = ?response.status,
            steps = request.steps().len(),
            rows = response.num_rows,
            "run finished"
        );
        Ok(response)
    }

    #[allow(clippy::too_many_lines)]
    fn drive(&self, request: &mut Request, question: &str) -> Result<AgentResponse> {
        let request_id = request.request_id();
        let mut step = 1_u32;

        request.record(
            step,
            StepEntry::new("Identify goal from user question", ToolName::None)
                .input(json!({"question": question}))
                .output(json!(
                    "Goal identified: Analyze database to answer user query"
                ))
                .decision("Proceed to schema exploration"),
        )?;
        step += 1;

        let tables = match self.inspector.list_tables() {
            Ok(tables) => {
                request.record(
                    step,
                    StepEntry::new("Explore available tables in database", ToolName::ListTables)
                        .output(json!(tables))
                        .decision(format!(
                            "Found {} tables. Proceeding to describe relevant tables.",
                            tables.len()
                        )),
                )?;
                tables
            }
            Err(err) => {
                tracing::warn!(%request_id, error = %err, "table discovery failed");
                request.record(
                    step,
                    StepEntry::new("Explore available tables", ToolName::ListTables)
                        .decision("Error occurred, cannot proceed")
                        .failed(err.to_string()),
                )?;
                return Ok(AgentResponse::failure(
                    request_id,
                    question,
                    request.sql_used(),
                    format!("Failed to list tables: {err}"),
                ));
            }
        };
        step += 1;

        for table in self.config.key_entities.select(&tables) {
            let entry = match self.inspector.describe_table(table) {
                Ok(fields) => {
                    let columns: Vec<&str> = fields.iter().map(|field| field.name.as_str()).collect();
                    let leading = columns.iter().take(3).copied().collect::<Vec<_>>().join(", ");
                    StepEntry::new(
                        format!("Understand schema of {table} table"),
                        ToolName::DescribeTable,
                    )
                    .input(json!({"table": table}))
                    .output(json!(columns))
                    .decision(format!(
                        "Table {table} has columns: {leading}... Proceeding to generate query."
                    ))
                }
                Err(err) => {
                    tracing::warn!(%request_id, table, error = %err, "describe failed; continuing");
                    StepEntry::new(format!("Describe {table}"), ToolName::DescribeTable)
                        .input(json!({"table": table}))
                        .decision("Error occurred")
                        .failed(err.to_string())
                }
            };
            request.record(step, entry)?;
            step += 1;
        }

        let plan = QueryPlanner::new(self.inspector, self.capability).plan(question, &tables);
        request.set_sql_used(plan.sql())?;
        let decision = match &plan {
            SqlPlan::Planned(_) => format!(
                "SQL query planned by {}. Proceeding to execution.",
                self.capability.name()
            ),
            SqlPlan::Fallback { reason, .. } => format!(
                "SQL query planned by fallback heuristics ({reason}). Proceeding to execution."
            ),
        };
        request.record(
            step,
            StepEntry::new("Plan SQL query based on question", ToolName::PlanQuery)
                .input(json!({"question": question}))
                .output(json!(plan.sql()))
                .decision(decision),
        )?;
        step += 1;

        let sql = plan.sql();
        let result = match self.executor.run_query(sql) {
            Ok(result) => {
                request.record(
                    step,
                    StepEntry::new("Execute SQL query", ToolName::RunQuery)
                        .input(json!({"sql": sql}))
                        .output(serde_json::to_value(result.preview(self.config.preview_rows))?)
                        .decision(format!(
                            "Query executed successfully. Received {} rows.",
                            result.len()
                        )),
                )?;
                result
            }
            Err(err) => {
                tracing::warn!(%request_id, error = %err, "query execution failed");
                request.record(
                    step,
                    StepEntry::new("Execute SQL query", ToolName::RunQuery)
                        .input(json!({"sql": sql}))
                        .decision("Error occurred during query execution")
                        .failed(err.to_string()),
                )?;
                return Ok(AgentResponse::failure(
                    request_id,
                    question,
                    request.sql_used(),
                    format!("Query execution failed: {err}"),
                ));
            }
        };
        step += 1;

        let is_valid = self.validator.validate(Some(&result), question);
        request.record(
            step,
            StepEntry::new("Validate query result against user intent", ToolName::ValidateResult)
                .input(json!({"result": result.len(), "intent": question}))
                .output(json!(format!("Valid: {is_valid}")))
                .decision(if is_valid {
                    "Result validated. Preparing final answer."
                } else {
                    "Result validation failed; returning the result as advisory."
                }),
        )?;
        step += 1;

        let response = AgentResponse::success(request_id, question, result, request.sql_used());
        let final_answer = final_answer_json(&response)?;
        request.record(
            step,
            StepEntry::new("Prepare final answer", ToolName::None)
                .output(final_answer)
                .decision("Agent loop complete."),
        )?;

        Ok(response)
    }
}

fn final_answer_json(response: &AgentResponse) -> Result<Value> {
    Ok(json!({
        "question": response.question,
        "answer": serde_json::to_value(&response.answer)?,
        "num_rows": response.num_rows,
        "status": response.status,
        "sql_used": response.sql_used,
    }))
}
