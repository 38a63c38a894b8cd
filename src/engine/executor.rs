//! DAG execution: materializes the workflow, walks it in topological
//! order, and records every transition.
//!
//! Node failures and validation problems are business outcomes here:
//! they fail the execution and return `Ok`. Only persistence errors
//! propagate to the worker loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::db::workflow_repository::WorkflowRepository;
use crate::engine::expression::{ExpressionEnvironment, ExpressionEvaluator, ResolveMode};
use crate::engine::graph::WorkflowGraph;
use crate::engine::nodes::condition::truthy;
use crate::engine::registry::{NodeContext, NodeRegistry};
use crate::models::event::{EventEnvelope, ExecutionEvent};
use crate::models::execution::{Execution, NewExecution};
use crate::models::workflow::WorkflowDefinition;
use crate::services::cancellation::CancellationManager;
use crate::services::credentials::CredentialStore;
use crate::services::events::EventPublisher;
use crate::services::execution_service::ExecutionService;
use crate::services::task_queue::WorkflowExecutionPayload;

const CANCELLED_MESSAGE: &str = "Execution cancelled";

pub struct WorkflowExecutor {
    workflows: Arc<dyn WorkflowRepository>,
    executions: Arc<ExecutionService>,
    registry: Arc<NodeRegistry>,
    publisher: Arc<dyn EventPublisher>,
    cancellations: Arc<CancellationManager>,
    credentials: Arc<dyn CredentialStore>,
    evaluator: ExpressionEvaluator,
    node_timeout: Duration,
}

impl WorkflowExecutor {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        executions: Arc<ExecutionService>,
        registry: Arc<NodeRegistry>,
        publisher: Arc<dyn EventPublisher>,
        cancellations: Arc<CancellationManager>,
        credentials: Arc<dyn CredentialStore>,
        config: &WorkerConfig,
    ) -> Self {
        let mode = if config.strict_expressions {
            ResolveMode::Strict
        } else {
            ResolveMode::Lenient
        };
        Self {
            workflows,
            executions,
            registry,
            publisher,
            cancellations,
            credentials,
            evaluator: ExpressionEvaluator::new(mode),
            node_timeout: config.node_timeout,
        }
    }

    pub async fn execute(&self, payload: WorkflowExecutionPayload) -> Result<(), sqlx::Error> {
        let execution = match payload.execution_id {
            Some(id) => match self.executions.get(id).await? {
                Some(execution) => execution,
                None => self.create_from_payload(&payload).await?,
            },
            None => self.create_from_payload(&payload).await?,
        };
        let execution_id = execution.id;

        let cancel = self.cancellations.register(execution_id);
        let result = self.run(execution, cancel).await;
        self.cancellations.clear(execution_id);
        result
    }

    async fn create_from_payload(
        &self,
        payload: &WorkflowExecutionPayload,
    ) -> Result<Execution, sqlx::Error> {
        self.executions
            .create(NewExecution {
                workflow_id: payload.workflow_id,
                workspace_id: payload.workspace_id,
                triggered_by: payload.triggered_by,
                trigger_type: payload.trigger_type.clone(),
                trigger_data: payload.trigger_data.clone(),
                input_data: payload.input_data.clone(),
            })
            .await
    }

    async fn run(
        &self,
        execution: Execution,
        cancel: CancellationToken,
    ) -> Result<(), sqlx::Error> {
        let started = Instant::now();
        self.executions.start(execution.id).await?;

        let workflow = match self.workflows.find_workflow_by_id(execution.workflow_id).await? {
            Some(workflow) => workflow,
            None => {
                return self
                    .fail_execution(&execution, "workflow not found", None)
                    .await;
            }
        };
        let definition = match WorkflowDefinition::from_value(&workflow.definition) {
            Ok(definition) => definition,
            Err(err) => {
                let message = format!("invalid workflow definition: {err}");
                return self
                    .fail_execution(&execution, &message, None)
                    .await;
            }
        };
        let graph = match WorkflowGraph::build(&definition) {
            Ok(graph) => graph,
            Err(err) => {
                return self
                    .fail_execution(&execution, &err.to_string(), None)
                    .await;
            }
        };

        info!(
            execution_id = %execution.id,
            workflow_id = %execution.workflow_id,
            trigger_type = %execution.trigger_type,
            nodes = graph.node_count(),
            "execution started"
        );
        self.publish(&execution, ExecutionEvent::Started).await;

        let input_data = execution.input_data.clone().unwrap_or(Value::Null);
        let vars: Map<String, Value> = execution
            .input_data
            .as_ref()
            .and_then(|v| v.get("vars"))
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        let mut node_outputs: Map<String, Value> = Map::new();
        let mut executed: HashSet<String> = HashSet::new();
        let mut selected_handles: HashMap<String, String> = HashMap::new();
        let total = graph.node_count();

        for node_id in graph.topological_order() {
            if cancel.is_cancelled() {
                return self.cancel_execution(&execution).await;
            }
            if !node_runs(&graph, node_id, &executed, &selected_handles) {
                debug!(execution_id = %execution.id, %node_id, "branch not taken, skipping node");
                continue;
            }
            let node = graph.node(node_id).expect("ordered node exists");
            let node_name = node.name.clone().unwrap_or_else(|| node.node_type.clone());

            self.publish(
                &execution,
                ExecutionEvent::NodeStarted {
                    node_id: node_id.clone(),
                    node_name: node_name.clone(),
                },
            )
            .await;
            let record = self
                .executions
                .create_node_execution(execution.id, node_id, &node.node_type, node.name.as_deref())
                .await?;

            let composed = compose_input(&input_data, &vars, &graph, node_id, &executed, &node_outputs);
            self.executions
                .start_node_execution(record.id, Some(composed.clone()))
                .await?;

            let mut env = ExpressionEnvironment::new(execution.id, execution.workflow_id);
            env.input = input_data.clone();
            env.json = current_payload(&graph, node_id, &executed, &node_outputs, &input_data);
            env.node = node_outputs.clone();
            env.vars = vars.clone();

            let node_started = Instant::now();
            let parameters = match self.evaluator.resolve_value(&node.parameters, &env) {
                Ok(parameters) => parameters,
                Err(err) => {
                    return self
                        .fail_node(&execution, record.id, node_id, &err.to_string())
                        .await;
                }
            };

            let Some(handler) = self.registry.get(&node.node_type) else {
                let message = format!("Unknown node type: {}", node.node_type);
                return self
                    .fail_node(&execution, record.id, node_id, &message)
                    .await;
            };

            let ctx = NodeContext {
                execution_id: execution.id,
                workflow_id: execution.workflow_id,
                node_id: node_id.clone(),
                input: composed,
                parameters,
                vars: vars.clone(),
                credentials: self.credentials.clone(),
                cancel: cancel.child_token(),
            };

            match timeout(self.node_timeout, handler.execute(ctx)).await {
                Ok(Ok(output)) => {
                    let duration_ms = node_started.elapsed().as_millis() as i64;
                    if node.node_type == "condition" {
                        let taken = output
                            .get("result")
                            .map(truthy)
                            .unwrap_or(false);
                        selected_handles
                            .insert(node_id.clone(), if taken { "true" } else { "false" }.into());
                    }
                    self.executions
                        .complete_node_execution(record.id, Some(output.clone()), duration_ms)
                        .await?;
                    self.publish(
                        &execution,
                        ExecutionEvent::NodeCompleted {
                            node_id: node_id.clone(),
                            duration_ms,
                        },
                    )
                    .await;
                    node_outputs.insert(node_id.clone(), output);
                    executed.insert(node_id.clone());
                    self.publish(
                        &execution,
                        ExecutionEvent::Progress {
                            completed: executed.len(),
                            total,
                        },
                    )
                    .await;
                }
                Ok(Err(err)) => {
                    return self
                        .fail_node(&execution, record.id, node_id, &err.message)
                        .await;
                }
                Err(_) => {
                    let message =
                        format!("node timed out after {}s", self.node_timeout.as_secs());
                    return self
                        .fail_node(&execution, record.id, node_id, &message)
                        .await;
                }
            }
        }

        if cancel.is_cancelled() {
            return self.cancel_execution(&execution).await;
        }

        // Output is the union of every node's output, keyed by node id.
        let node_count = executed.len();
        self.executions
            .complete(execution.id, Value::Object(node_outputs))
            .await?;
        let duration_ms = started.elapsed().as_millis() as i64;
        info!(
            execution_id = %execution.id,
            duration_ms,
            node_count,
            "execution completed"
        );
        self.publish(
            &execution,
            ExecutionEvent::Completed {
                duration_ms,
                node_count,
            },
        )
        .await;
        Ok(())
    }

    async fn fail_execution(
        &self,
        execution: &Execution,
        error: &str,
        node_id: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        info!(execution_id = %execution.id, %error, "execution failed");
        self.executions
            .fail(execution.id, error, node_id)
            .await?;
        self.publish(
            execution,
            ExecutionEvent::Failed {
                error: error.to_string(),
                node_id: node_id.map(|s| s.to_string()),
            },
        )
        .await;
        Ok(())
    }

    async fn fail_node(
        &self,
        execution: &Execution,
        record_id: Uuid,
        node_id: &str,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        self.executions.fail_node_execution(record_id, error).await?;
        self.publish(
            execution,
            ExecutionEvent::NodeFailed {
                node_id: node_id.to_string(),
                error: error.to_string(),
            },
        )
        .await;
        self.executions
            .fail(execution.id, error, Some(node_id))
            .await?;
        info!(execution_id = %execution.id, %node_id, %error, "execution failed at node");
        self.publish(
            execution,
            ExecutionEvent::Failed {
                error: error.to_string(),
                node_id: Some(node_id.to_string()),
            },
        )
        .await;
        Ok(())
    }

    async fn cancel_execution(&self, execution: &Execution) -> Result<(), sqlx::Error> {
        info!(execution_id = %execution.id, "execution cancelled");
        self.executions
            .cancel(execution.id, CANCELLED_MESSAGE)
            .await?;
        self.publish(
            execution,
            ExecutionEvent::Failed {
                error: CANCELLED_MESSAGE.to_string(),
                node_id: None,
            },
        )
        .await;
        Ok(())
    }

    async fn publish(&self, execution: &Execution, event: ExecutionEvent) {
        self.publisher
            .publish(EventEnvelope::new(
                execution.workspace_id,
                execution.workflow_id,
                execution.id,
                event,
            ))
            .await;
    }
}

/// A node runs when it is a root, or when at least one incoming
/// connection fires: its source executed and, for branching sources,
/// the connection rides the selected handle.
fn node_runs(
    graph: &WorkflowGraph,
    node_id: &str,
    executed: &HashSet<String>,
    selected_handles: &HashMap<String, String>,
) -> bool {
    let incoming = graph.incoming(node_id);
    if incoming.is_empty() {
        return true;
    }
    incoming.iter().any(|connection| {
        if !executed.contains(&connection.source_node_id) {
            return false;
        }
        match (
            selected_handles.get(&connection.source_node_id),
            &connection.source_handle,
        ) {
            (Some(selected), Some(handle)) => handle == selected,
            _ => true,
        }
    })
}

fn compose_input(
    input_data: &Value,
    vars: &Map<String, Value>,
    graph: &WorkflowGraph,
    node_id: &str,
    executed: &HashSet<String>,
    node_outputs: &Map<String, Value>,
) -> Value {
    let mut composed = Map::new();
    composed.insert("$input".to_string(), input_data.clone());
    composed.insert("$vars".to_string(), Value::Object(vars.clone()));
    for predecessor in graph.predecessors(node_id) {
        if executed.contains(predecessor) {
            if let Some(output) = node_outputs.get(predecessor) {
                composed.insert(predecessor.clone(), output.clone());
            }
        }
    }
    Value::Object(composed)
}

/// `$json` for a node: the output of its most recent executed
/// predecessor, or the workflow input at the roots.
fn current_payload(
    graph: &WorkflowGraph,
    node_id: &str,
    executed: &HashSet<String>,
    node_outputs: &Map<String, Value>,
    input_data: &Value,
) -> Value {
    graph
        .predecessors(node_id)
        .iter()
        .rev()
        .find(|p| executed.contains(*p))
        .and_then(|p| node_outputs.get(p))
        .cloned()
        .unwrap_or_else(|| input_data.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_db::{MemoryExecutionRepository, MemoryWorkflowRepository};
    use crate::engine::registry::{NodeError, NodeHandler, NodeRegistry};
    use crate::models::execution::{status, trigger_type};
    use crate::models::workflow::Workflow;
    use crate::services::credentials::StaticCredentialStore;
    use crate::services::events::MemoryEventPublisher;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::OffsetDateTime;

    struct OkHandler;

    #[async_trait]
    impl NodeHandler for OkHandler {
        async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
            Ok(json!({"node": ctx.node_id}))
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl NodeHandler for EchoHandler {
        async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
            Ok(ctx.parameters)
        }
    }

    struct BoomHandler;

    #[async_trait]
    impl NodeHandler for BoomHandler {
        async fn execute(&self, _ctx: NodeContext) -> Result<Value, NodeError> {
            Err(NodeError::new("boom"))
        }
    }

    struct SlowHandler {
        delay: Duration,
    }

    #[async_trait]
    impl NodeHandler for SlowHandler {
        async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
            tokio::time::sleep(self.delay).await;
            Ok(json!({"node": ctx.node_id}))
        }
    }

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NodeHandler for CountingHandler {
        async fn execute(&self, _ctx: NodeContext) -> Result<Value, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({}))
        }
    }

    struct Fixture {
        executor: WorkflowExecutor,
        executions: Arc<MemoryExecutionRepository>,
        service: Arc<ExecutionService>,
        publisher: Arc<MemoryEventPublisher>,
        cancellations: Arc<CancellationManager>,
        workflow_id: Uuid,
        workspace_id: Uuid,
    }

    fn fixture(definition: Value, registry: NodeRegistry, config: WorkerConfig) -> Fixture {
        let workflows = Arc::new(MemoryWorkflowRepository::default());
        let workflow_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        workflows.insert_workflow(Workflow {
            id: workflow_id,
            workspace_id,
            name: "test".into(),
            is_active: true,
            definition,
            created_at: now,
            updated_at: now,
        });

        let executions = Arc::new(MemoryExecutionRepository::default());
        let service = Arc::new(ExecutionService::new(executions.clone()));
        let publisher = Arc::new(MemoryEventPublisher::new());
        let cancellations = Arc::new(CancellationManager::new());
        let executor = WorkflowExecutor::new(
            workflows,
            service.clone(),
            Arc::new(registry),
            publisher.clone(),
            cancellations.clone(),
            Arc::new(StaticCredentialStore::new()),
            &config,
        );
        Fixture {
            executor,
            executions,
            service,
            publisher,
            cancellations,
            workflow_id,
            workspace_id,
        }
    }

    fn payload(fixture: &Fixture) -> WorkflowExecutionPayload {
        WorkflowExecutionPayload {
            workflow_id: fixture.workflow_id,
            workspace_id: fixture.workspace_id,
            execution_id: None,
            triggered_by: None,
            trigger_type: trigger_type::MANUAL.to_string(),
            trigger_data: None,
            input_data: Some(json!({"x": 1})),
        }
    }

    fn ok_registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register("ok", Arc::new(OkHandler));
        registry.register("echo", Arc::new(EchoHandler));
        registry.register("boom", Arc::new(BoomHandler));
        registry.register(
            "condition",
            Arc::new(crate::engine::nodes::condition::ConditionNode),
        );
        registry
    }

    fn linear(types: &[(&str, &str)], edges: &[(&str, &str)]) -> Value {
        json!({
            "nodes": types
                .iter()
                .map(|(id, ty)| json!({"id": id, "type": ty}))
                .collect::<Vec<_>>(),
            "connections": edges
                .iter()
                .map(|(s, t)| json!({"source_node_id": s, "target_node_id": t}))
                .collect::<Vec<_>>(),
        })
    }

    #[tokio::test]
    async fn linear_workflow_completes_with_all_outputs() {
        let fx = fixture(
            linear(
                &[("a", "ok"), ("b", "ok"), ("c", "ok")],
                &[("a", "b"), ("b", "c")],
            ),
            ok_registry(),
            WorkerConfig::default(),
        );

        fx.executor.execute(payload(&fx)).await.unwrap();

        let executions = fx.executions.executions();
        assert_eq!(executions.len(), 1);
        let execution = &executions[0];
        assert_eq!(execution.status, status::COMPLETED);

        let output = execution.output_data.clone().unwrap();
        assert_eq!(output["a"]["node"], "a");
        assert_eq!(output["b"]["node"], "b");
        assert_eq!(output["c"]["node"], "c");

        let node_runs = fx.executions.node_executions_for(execution.id);
        assert_eq!(node_runs.len(), 3);
        assert!(node_runs.iter().all(|n| n.status == status::COMPLETED));
        assert!(node_runs.iter().all(|n| n.duration_ms.is_some()));

        let types = fx.publisher.event_types();
        assert_eq!(types.first(), Some(&"execution.started"));
        assert_eq!(types.last(), Some(&"execution.completed"));
        assert_eq!(
            types.iter().filter(|t| **t == "node.completed").count(),
            3
        );
    }

    #[tokio::test]
    async fn cycle_fails_before_any_handler_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = NodeRegistry::new();
        registry.register(
            "counted",
            Arc::new(CountingHandler {
                calls: calls.clone(),
            }),
        );

        let fx = fixture(
            linear(&[("a", "counted"), ("b", "counted")], &[("a", "b"), ("b", "a")]),
            registry,
            WorkerConfig::default(),
        );

        fx.executor.execute(payload(&fx)).await.unwrap();

        let execution = &fx.executions.executions()[0];
        assert_eq!(execution.status, status::FAILED);
        assert!(execution
            .error_message
            .as_deref()
            .unwrap()
            .contains("cycle detected"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(fx.executions.node_executions_for(execution.id).is_empty());
        assert!(fx.publisher.event_types().contains(&"execution.failed"));
    }

    #[tokio::test]
    async fn node_failure_stops_the_chain_and_tags_the_node() {
        let fx = fixture(
            linear(
                &[("a", "ok"), ("b", "boom"), ("c", "ok")],
                &[("a", "b"), ("b", "c")],
            ),
            ok_registry(),
            WorkerConfig::default(),
        );

        fx.executor.execute(payload(&fx)).await.unwrap();

        let execution = &fx.executions.executions()[0];
        assert_eq!(execution.status, status::FAILED);
        assert_eq!(execution.error_message.as_deref(), Some("boom"));
        assert_eq!(execution.error_node_id.as_deref(), Some("b"));

        let node_runs = fx.executions.node_executions_for(execution.id);
        let ids: Vec<&str> = node_runs.iter().map(|n| n.node_id.as_str()).collect();
        assert!(ids.contains(&"a"));
        assert!(ids.contains(&"b"));
        assert!(!ids.contains(&"c"), "c must never be created");
        let b = node_runs.iter().find(|n| n.node_id == "b").unwrap();
        assert_eq!(b.status, status::FAILED);
        assert_eq!(b.error.as_deref(), Some("boom"));

        let types = fx.publisher.event_types();
        assert!(types.contains(&"node.failed"));
        assert_eq!(types.last(), Some(&"execution.failed"));
    }

    #[tokio::test]
    async fn unknown_node_type_is_a_node_tagged_failure() {
        let fx = fixture(
            linear(&[("a", "ok"), ("b", "martian")], &[("a", "b")]),
            ok_registry(),
            WorkerConfig::default(),
        );

        fx.executor.execute(payload(&fx)).await.unwrap();

        let execution = &fx.executions.executions()[0];
        assert_eq!(execution.status, status::FAILED);
        assert!(execution
            .error_message
            .as_deref()
            .unwrap()
            .contains("Unknown node type"));
        assert_eq!(execution.error_node_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn node_timeout_fails_the_node() {
        let mut registry = ok_registry();
        registry.register(
            "slow",
            Arc::new(SlowHandler {
                delay: Duration::from_millis(200),
            }),
        );
        let config = WorkerConfig {
            node_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let fx = fixture(linear(&[("a", "slow")], &[]), registry, config);

        fx.executor.execute(payload(&fx)).await.unwrap();

        let execution = &fx.executions.executions()[0];
        assert_eq!(execution.status, status::FAILED);
        assert!(execution
            .error_message
            .as_deref()
            .unwrap()
            .contains("timed out"));
        assert_eq!(execution.error_node_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn cancellation_lets_current_node_finish_and_skips_the_rest() {
        let mut registry = ok_registry();
        registry.register(
            "slow",
            Arc::new(SlowHandler {
                delay: Duration::from_millis(150),
            }),
        );
        let fx = fixture(
            linear(
                &[("a", "ok"), ("b", "slow"), ("c", "ok")],
                &[("a", "b"), ("b", "c")],
            ),
            registry,
            WorkerConfig::default(),
        );

        // Pre-create the row so the cancel can target a known id.
        let execution = fx
            .service
            .create(NewExecution {
                workflow_id: fx.workflow_id,
                workspace_id: fx.workspace_id,
                triggered_by: None,
                trigger_type: trigger_type::MANUAL.to_string(),
                trigger_data: None,
                input_data: None,
            })
            .await
            .unwrap();
        let mut task_payload = payload(&fx);
        task_payload.execution_id = Some(execution.id);

        let cancellations = fx.cancellations.clone();
        let execution_id = execution.id;
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(cancellations.cancel(execution_id));
        });

        fx.executor.execute(task_payload).await.unwrap();
        canceller.await.unwrap();

        let stored = fx.service.get(execution_id).await.unwrap().unwrap();
        assert_eq!(stored.status, status::CANCELLED);
        assert_eq!(stored.error_message.as_deref(), Some(CANCELLED_MESSAGE));

        let node_runs = fx.executions.node_executions_for(execution_id);
        let ids: Vec<&str> = node_runs.iter().map(|n| n.node_id.as_str()).collect();
        assert!(ids.contains(&"b"), "running node finishes");
        assert!(!ids.contains(&"c"), "later nodes never start");
        let b = node_runs.iter().find(|n| n.node_id == "b").unwrap();
        assert_eq!(b.status, status::COMPLETED);

        let types = fx.publisher.event_types();
        assert!(types.contains(&"execution.failed"));
        let failed_event = fx
            .publisher
            .events()
            .into_iter()
            .find(|e| e.event.event_type() == "execution.failed")
            .unwrap();
        assert_eq!(
            failed_event.to_json()["data"]["error"],
            CANCELLED_MESSAGE
        );
    }

    #[tokio::test]
    async fn condition_routes_only_the_matching_handle() {
        let definition = json!({
            "nodes": [
                {"id": "start", "type": "ok"},
                {"id": "gate", "type": "condition", "parameters": {"expression": "{{ 1 > 2 }}"}},
                {"id": "yes", "type": "ok"},
                {"id": "no", "type": "ok"},
            ],
            "connections": [
                {"source_node_id": "start", "target_node_id": "gate"},
                {"source_node_id": "gate", "source_handle": "true", "target_node_id": "yes"},
                {"source_node_id": "gate", "source_handle": "false", "target_node_id": "no"},
            ],
        });
        let fx = fixture(definition, ok_registry(), WorkerConfig::default());

        fx.executor.execute(payload(&fx)).await.unwrap();

        let execution = &fx.executions.executions()[0];
        assert_eq!(execution.status, status::COMPLETED);
        let output = execution.output_data.clone().unwrap();
        assert_eq!(output["gate"]["result"], false);
        assert!(output.get("no").is_some());
        assert!(output.get("yes").is_none(), "true branch must be skipped");

        let node_runs = fx.executions.node_executions_for(execution.id);
        assert!(!node_runs.iter().any(|n| n.node_id == "yes"));
    }

    #[tokio::test]
    async fn templates_resolve_against_prior_node_outputs() {
        let definition = json!({
            "nodes": [
                {"id": "a", "type": "ok"},
                {"id": "b", "type": "echo", "parameters": {
                    "from": "{{ $node.a.node }}",
                    "count": "{{ $input.x + 1 }}",
                }},
            ],
            "connections": [
                {"source_node_id": "a", "target_node_id": "b"},
            ],
        });
        let fx = fixture(definition, ok_registry(), WorkerConfig::default());

        fx.executor.execute(payload(&fx)).await.unwrap();

        let execution = &fx.executions.executions()[0];
        assert_eq!(execution.status, status::COMPLETED);
        let output = execution.output_data.clone().unwrap();
        assert_eq!(output["b"]["from"], "a");
        assert_eq!(output["b"]["count"], 2);
    }

    #[tokio::test]
    async fn missing_workflow_fails_the_execution() {
        let fx = fixture(linear(&[("a", "ok")], &[]), ok_registry(), WorkerConfig::default());
        let mut task_payload = payload(&fx);
        task_payload.workflow_id = Uuid::new_v4();

        fx.executor.execute(task_payload).await.unwrap();

        let execution = &fx.executions.executions()[0];
        assert_eq!(execution.status, status::FAILED);
        assert_eq!(
            execution.error_message.as_deref(),
            Some("workflow not found")
        );
    }
}
