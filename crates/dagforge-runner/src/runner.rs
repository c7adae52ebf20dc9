//! Concurrent graph execution
//!
//! Every statement is rendered up front from a frozen manifest, then a
//! bounded pool of tokio tasks sends them to the adapter in dependency
//! order. A failed node skips its descendants and, with `fail_fast`, stops
//! the run. Cancelling through a [`Canceller`] stops dispatching, cancels
//! open connections and returns what finished so far.

use crate::error::RunnerError;
use crate::queue::GraphQueue;
use crate::results::{NodeResult, NodeStatus, RunResults, TimingInfo};
use dagforge_catalog::{Adapter, ExecutionResult};
use dagforge_core::{Config, Diagnostic, Report};
use dagforge_engine::{CompileOptions, Compiler};
use dagforge_manifest::{DependencyGraph, Manifest, Node, NodeId, ResourceType};
use minijinja::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Scheduling knobs
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub threads: usize,
    pub fail_fast: bool,
    /// Used when the adapter has no timeout of its own
    pub task_timeout: Option<Duration>,
    pub require_explicit_package_overrides: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            threads: 4,
            fail_fast: false,
            task_timeout: None,
            require_explicit_package_overrides: false,
        }
    }
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            threads: config.threads.max(1),
            fail_fast: config.fail_fast,
            task_timeout: config.task_timeout_secs.map(Duration::from_secs),
            require_explicit_package_overrides: config
                .flags
                .require_explicit_package_overrides_for_builtin_materializations,
        }
    }
}

/// Requests cancellation of a running [`Runner`]
#[derive(Debug, Clone)]
pub struct Canceller(Arc<watch::Sender<bool>>);

impl Canceller {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Results plus the diagnostics raised while rendering and executing
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub results: RunResults,
    pub report: Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementKind {
    Materialize,
    Test { warn: bool },
    Hook,
}

#[derive(Debug, Clone)]
struct Statement {
    sql: String,
    kind: StatementKind,
}

impl Statement {
    fn fetch(&self) -> bool {
        matches!(self.kind, StatementKind::Test { .. })
    }
}

/// What happens to a node once its parents are done
#[derive(Debug, Clone)]
enum Plan {
    Execute(Statement),
    Ephemeral,
    /// Refs a disabled node
    Skip(String),
    /// Already failed resolution or compilation
    Fail(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Interrupted,
    FailFast,
}

/// Executes the nodes of one manifest against one adapter
pub struct Runner {
    manifest: Arc<Manifest>,
    graph: DependencyGraph,
    adapter: Arc<dyn Adapter>,
    compile: CompileOptions,
    options: RunOptions,
    /// Errors found before the run, keyed by the failing node
    blocked: BTreeMap<NodeId, String>,
    cancel: Arc<watch::Sender<bool>>,
}

impl Runner {
    pub fn new(
        manifest: Arc<Manifest>,
        graph: DependencyGraph,
        adapter: Arc<dyn Adapter>,
        compile: CompileOptions,
        options: RunOptions,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            manifest,
            graph,
            adapter,
            compile,
            options,
            blocked: BTreeMap::new(),
            cancel: Arc::new(cancel),
        }
    }

    /// Fail nodes named first by an error diagnostic, e.g. a denied ref
    pub fn with_blocking_errors(mut self, report: &Report) -> Self {
        for diagnostic in report.errors() {
            if let Some(node) = diagnostic.nodes.first() {
                self.blocked.entry(node.clone()).or_insert_with(|| diagnostic.message.clone());
            }
        }
        self
    }

    pub fn canceller(&self) -> Canceller {
        Canceller(Arc::clone(&self.cancel))
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// Run the executable nodes of `order`, a topological order
    pub async fn run(&self, order: &[NodeId]) -> RunOutcome {
        let clock = Instant::now();
        let (start_hooks, end_hooks) = self.hooks();
        let queued: Vec<NodeId> = order
            .iter()
            .filter(|id| {
                self.manifest
                    .get_node(id)
                    .map_or(false, |n| n.resource_type.is_executable() && n.resource_type != ResourceType::Operation)
            })
            .cloned()
            .collect();

        let mut report = Report::new();
        let mut plans = self.plan(queued.iter().chain(&start_hooks).chain(&end_hooks), &mut report);
        let results: Arc<Mutex<Vec<NodeResult>>> = Arc::default();
        tracing::info!(
            nodes = queued.len(),
            threads = self.options.threads,
            adapter = self.adapter.adapter_type(),
            "Starting run"
        );

        let mut hook_failure = None;
        for hook in &start_hooks {
            let status = self.run_hook(hook, &mut plans, &results, &mut report).await;
            if status.is_failure() {
                hook_failure = Some(hook.clone());
                break;
            }
        }

        let mut state = RunState {
            queue: GraphQueue::new(&self.graph, &queued),
            results: Arc::clone(&results),
            report,
            stop: None,
            fail_fast: self.options.fail_fast,
        };
        match hook_failure {
            Some(hook) => {
                for id in state.queue.drain_remaining() {
                    state.record(NodeResult::skipped(id, format!("Skipped because {} failed", hook)));
                }
            }
            None => self.schedule(&mut state, plans.clone()).await,
        }

        let interrupted = state.stop == Some(StopReason::Interrupted);
        let mut report = state.report;
        if !interrupted {
            for hook in &end_hooks {
                self.run_hook(hook, &mut plans, &results, &mut report).await;
            }
        }

        let results = results.lock().map(|r| r.clone()).unwrap_or_else(|e| e.into_inner().clone());
        let results = RunResults::new(results, clock.elapsed().as_secs_f64(), interrupted);
        tracing::info!(
            success = results.count(NodeStatus::Success) + results.count(NodeStatus::Pass),
            errors = results.count(NodeStatus::Error) + results.count(NodeStatus::Fail),
            skipped = results.count(NodeStatus::Skipped),
            interrupted,
            elapsed = results.elapsed_time,
            "Finished run"
        );
        RunOutcome { results, report }
    }

    /// `on-run-start` and `on-run-end` operation ids, in declaration order
    fn hooks(&self) -> (Vec<NodeId>, Vec<NodeId>) {
        let collect = |tag: &str| {
            let mut hooks: Vec<&Node> = self
                .manifest
                .nodes
                .values()
                .filter(|n| n.resource_type == ResourceType::Operation && n.config.tags.iter().any(|t| t == tag))
                .collect();
            hooks.sort_by_key(|n| (n.package_name.clone(), hook_index(&n.name)));
            hooks.into_iter().map(|n| n.unique_id.clone()).collect::<Vec<_>>()
        };
        (collect("on-run-start"), collect("on-run-end"))
    }

    /// Render the statement of every node up front
    fn plan<'a>(&self, ids: impl Iterator<Item = &'a NodeId>, report: &mut Report) -> BTreeMap<NodeId, Plan> {
        let mut compiler = Compiler::new(Arc::clone(&self.manifest), self.compile.clone());
        let mut plans = BTreeMap::new();

        for id in ids {
            let Some(node) = self.manifest.get_node(id) else { continue };
            let plan = if let Some(disabled) = self.manifest.disabled_refs.get(id).and_then(|d| d.first()) {
                Plan::Skip(format!("{} depends on disabled node {}", id, disabled))
            } else if let Some(message) = self.blocked.get(id) {
                Plan::Fail(message.clone())
            } else if node.is_ephemeral_model() {
                Plan::Ephemeral
            } else {
                match self.statement_for(&mut compiler, node, report) {
                    Ok(statement) => Plan::Execute(statement),
                    Err(err) => {
                        tracing::debug!(node = %id, error = %err, "Could not render node");
                        report.add_diagnostic(err.to_diagnostic());
                        Plan::Fail(err.to_string())
                    }
                }
            };
            plans.insert(id.clone(), plan);
        }

        for warning in compiler.warnings() {
            report.add_diagnostic(warning.clone());
        }
        plans
    }

    /// Compile a node and wrap it in its materialization
    fn statement_for(&self, compiler: &mut Compiler, node: &Node, report: &mut Report) -> Result<Statement, RunnerError> {
        let compiled = compiler.compile_node(&node.unique_id)?;
        if node.resource_type == ResourceType::Operation {
            return Ok(Statement {
                sql: compiled.compiled_code,
                kind: StatementKind::Hook,
            });
        }

        let found = self.compile.resolve.macro_resolver(&self.manifest).find_materialization(
            &node.config.materialized,
            &self.compile.resolve.adapter_chain,
            self.options.require_explicit_package_overrides,
        )?;
        for warning in found.warnings {
            if !report.diagnostics.iter().any(|d| d.message == warning.message) {
                report.add_diagnostic(warning);
            }
        }

        let mut extra = BTreeMap::new();
        extra.insert("sql".to_string(), Value::from(compiled.compiled_code));
        let sql = compiler.render_macro(&node.unique_id, &found.macro_id, &[], extra)?;

        let kind = match node.resource_type {
            ResourceType::Test => StatementKind::Test {
                warn: node
                    .config
                    .severity
                    .as_deref()
                    .map_or(false, |s| s.eq_ignore_ascii_case("warn")),
            },
            _ => StatementKind::Materialize,
        };
        Ok(Statement {
            sql: sql.trim().to_string(),
            kind,
        })
    }

    async fn run_hook(
        &self,
        id: &str,
        plans: &mut BTreeMap<NodeId, Plan>,
        results: &Arc<Mutex<Vec<NodeResult>>>,
        report: &mut Report,
    ) -> NodeStatus {
        match plans.remove(id) {
            Some(Plan::Execute(statement)) => {
                let (status, diagnostic) = execute_node(
                    Arc::clone(&self.adapter),
                    id.to_string(),
                    statement,
                    self.timeout(),
                    "main".to_string(),
                    Arc::clone(results),
                )
                .await;
                if let Some(diagnostic) = diagnostic {
                    report.add_diagnostic(diagnostic);
                }
                status
            }
            Some(Plan::Fail(message)) | Some(Plan::Skip(message)) => {
                push_result(results, NodeResult::new(id, NodeStatus::Error).with_message(message));
                NodeStatus::Error
            }
            Some(Plan::Ephemeral) | None => NodeStatus::Success,
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.adapter.timeout().or(self.options.task_timeout)
    }

    /// Drive the queue until every node finished or the run stopped
    async fn schedule(&self, state: &mut RunState, mut plans: BTreeMap<NodeId, Plan>) {
        let threads = self.options.threads.max(1);
        let semaphore = Arc::new(Semaphore::new(threads));
        let mut join_set: JoinSet<(NodeId, usize, NodeStatus, Option<Diagnostic>)> = JoinSet::new();
        let mut running: BTreeMap<NodeId, usize> = BTreeMap::new();
        let mut free_slots: BTreeSet<usize> = (1..=threads).collect();
        let mut cancel_rx = self.cancel.subscribe();
        let mut listening = true;

        loop {
            if *cancel_rx.borrow_and_update() && state.stop.is_none() {
                tracing::warn!("Run cancelled");
                state.stop = Some(StopReason::Interrupted);
            }

            while state.stop.is_none() && state.queue.has_ready() {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else { break };
                let Some(id) = state.queue.next() else { break };

                match plans.remove(&id) {
                    Some(Plan::Execute(statement)) => {
                        let slot = free_slots.pop_first().unwrap_or(threads);
                        running.insert(id.clone(), slot);
                        let adapter = Arc::clone(&self.adapter);
                        let timeout = self.timeout();
                        let results = Arc::clone(&state.results);
                        join_set.spawn(async move {
                            let _permit = permit;
                            let (status, diagnostic) =
                                execute_node(adapter, id.clone(), statement, timeout, format!("Thread-{}", slot), results)
                                    .await;
                            (id, slot, status, diagnostic)
                        });
                    }
                    Some(Plan::Ephemeral) => {
                        state.record(NodeResult::new(&id, NodeStatus::Success).with_message("ephemeral"));
                        state.settle(&id, NodeStatus::Success);
                    }
                    Some(Plan::Skip(message)) => {
                        tracing::info!(node = %id, "{}", message);
                        state.record(NodeResult::skipped(&id, message));
                        state.settle(&id, NodeStatus::Skipped);
                    }
                    Some(Plan::Fail(message)) => {
                        state.record(NodeResult::new(&id, NodeStatus::Error).with_message(message));
                        state.settle(&id, NodeStatus::Error);
                    }
                    None => {
                        state.record(NodeResult::skipped(&id, "Skipped because it could not be planned"));
                        state.settle(&id, NodeStatus::Skipped);
                    }
                }
            }

            if join_set.is_empty() {
                break;
            }
            if state.stop.is_some() {
                let cancelled = self.adapter.cancel_open_connections().await;
                tracing::warn!(connections = cancelled.len(), in_flight = running.len(), "Cancelling in-flight nodes");
                join_set.abort_all();
                while let Some(joined) = join_set.join_next().await {
                    if let Ok((id, slot, status, diagnostic)) = joined {
                        running.remove(&id);
                        free_slots.insert(slot);
                        state.finish(&id, status, diagnostic);
                    }
                }
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(Ok((id, slot, status, diagnostic))) => {
                        running.remove(&id);
                        free_slots.insert(slot);
                        state.finish(&id, status, diagnostic);
                    }
                    Some(Err(err)) => tracing::error!(error = %err, "Worker task failed"),
                    None => {}
                },
                changed = cancel_rx.changed(), if listening => {
                    if changed.is_err() {
                        listening = false;
                    }
                }
            }
        }

        let message = match state.stop {
            Some(StopReason::Interrupted) => "cancelled",
            Some(StopReason::FailFast) => "cancelled by fail-fast",
            None => "worker task failed",
        };
        for id in std::mem::take(&mut running).into_keys() {
            state.record(NodeResult::error(&id, &RunnerError::Cancelled(message.to_string())));
            state.queue.mark_done(&id);
        }
        let remaining = state.queue.drain_remaining();
        if state.stop != Some(StopReason::Interrupted) {
            for id in remaining {
                let message = match state.stop {
                    Some(StopReason::FailFast) => "Skipped due to fail-fast".to_string(),
                    _ => "Skipped because an upstream node did not finish".to_string(),
                };
                state.record(NodeResult::skipped(id, message));
            }
        }
    }
}

/// Mutable bookkeeping of one run
struct RunState {
    queue: GraphQueue,
    results: Arc<Mutex<Vec<NodeResult>>>,
    report: Report,
    stop: Option<StopReason>,
    fail_fast: bool,
}

impl RunState {
    fn record(&self, result: NodeResult) {
        push_result(&self.results, result);
    }

    fn finish(&mut self, id: &str, status: NodeStatus, diagnostic: Option<Diagnostic>) {
        if let Some(diagnostic) = diagnostic {
            self.report.add_diagnostic(diagnostic);
        }
        self.settle(id, status);
    }

    /// Release or skip the children of a finished node
    fn settle(&mut self, id: &str, status: NodeStatus) {
        let reason = if status.is_failure() {
            Some("failed")
        } else if status == NodeStatus::Skipped {
            Some("was skipped")
        } else {
            None
        };
        if let Some(reason) = reason {
            for child in self.queue.skip_descendants(id) {
                tracing::debug!(node = %child, upstream = id, "Skipping");
                self.record(NodeResult::skipped(child, format!("Skipped because {} {}", id, reason)));
            }
        }
        self.queue.mark_done(id);

        if status.is_failure() && self.fail_fast && self.stop.is_none() {
            tracing::warn!(node = id, "Stopping after first failure");
            self.stop = Some(StopReason::FailFast);
        }
    }
}

fn push_result(results: &Mutex<Vec<NodeResult>>, result: NodeResult) {
    results.lock().unwrap_or_else(|e| e.into_inner()).push(result);
}

fn hook_index(name: &str) -> usize {
    name.rsplit('-').next().and_then(|i| i.parse().ok()).unwrap_or(0)
}

/// Send one statement and record its result
async fn execute_node(
    adapter: Arc<dyn Adapter>,
    id: NodeId,
    statement: Statement,
    timeout: Option<Duration>,
    thread: String,
    results: Arc<Mutex<Vec<NodeResult>>>,
) -> (NodeStatus, Option<Diagnostic>) {
    let started_at = chrono::Utc::now();
    let clock = Instant::now();
    tracing::debug!(node = %id, thread = %thread, "Executing");

    let call = adapter.execute(&statement.sql, statement.fetch());
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(RunnerError::from),
            Err(_) => Err(RunnerError::Timeout {
                node: id.clone(),
                seconds: limit.as_secs_f64(),
            }),
        },
        None => call.await.map_err(RunnerError::from),
    };

    let (mut result, diagnostic) = match outcome {
        Ok(execution) => (statement_result(&id, statement.kind, execution), None),
        Err(err) => {
            tracing::warn!(node = %id, error = %err, "Node failed");
            let diagnostic = err.to_diagnostic().with_nodes([id.clone()]);
            (NodeResult::error(&id, &err), Some(diagnostic))
        }
    };
    result.timing.push(TimingInfo {
        name: "execute".to_string(),
        started_at,
        completed_at: chrono::Utc::now(),
    });
    result.thread_id = Some(thread);
    result.execution_time = clock.elapsed().as_secs_f64();
    result.compiled_code = Some(statement.sql);

    let status = result.status;
    tracing::info!(node = %id, status = %status, elapsed = result.execution_time, "Finished node");
    push_result(&results, result);
    (status, diagnostic)
}

fn statement_result(id: &str, kind: StatementKind, execution: ExecutionResult) -> NodeResult {
    let StatementKind::Test { warn } = kind else {
        let mut result = NodeResult::new(id, NodeStatus::Success).with_message(execution.response.message.clone());
        result.adapter_response = Some(execution.response);
        return result;
    };

    let failures = execution
        .rows
        .first()
        .and_then(|row| row.get("failures"))
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(execution.rows.len() as u64);
    let status = match (failures, warn) {
        (0, _) => NodeStatus::Pass,
        (_, true) => NodeStatus::Warn,
        (_, false) => NodeStatus::Fail,
    };
    let mut result = NodeResult::new(id, status);
    if failures > 0 {
        result.message = Some(format!(
            "Got {} result{}, configured to {} if != 0",
            failures,
            if failures == 1 { "" } else { "s" },
            if warn { "warn" } else { "fail" }
        ));
    }
    result.failures = Some(failures);
    result.adapter_response = Some(execution.response);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagforge_catalog::{AdapterError, MockAdapter};
    use dagforge_core::TargetConfig;
    use dagforge_engine::ResolveContext;
    use dagforge_manifest::{Macro, NodeConfig};

    const MATERIALIZATIONS: &[(&str, &str)] = &[
        ("view", "create view {{ this }} as {{ sql }}"),
        ("table", "create table {{ this }} as {{ sql }}"),
        ("test", "select count(*) as failures from ({{ sql }}) t"),
    ];

    fn model(name: &str, sql: &str, deps: &[&str]) -> Node {
        let mut node = Node::new(ResourceType::Model, "p", name, format!("models/{}.sql", name)).with_raw_code(sql);
        node.schema = "analytics".to_string();
        node.alias = name.to_string();
        for dep in deps {
            node.depends_on.add_node(format!("model.p.{}", dep));
        }
        node
    }

    fn manifest(nodes: Vec<Node>) -> Manifest {
        let mut manifest = Manifest::default();
        for (materialization, body) in MATERIALIZATIONS {
            let name = format!("materialization_{}_default", materialization);
            let sql = format!("{{% macro {}() %}}{}{{% endmacro %}}", name, body);
            manifest
                .add_macro(Macro::new("dagforge", name.as_str(), "macros/materializations.sql", sql))
                .unwrap();
        }
        for node in nodes {
            manifest.add_node(node).unwrap();
        }
        manifest
    }

    fn runner(manifest: Manifest, adapter: MockAdapter, options: RunOptions) -> (Runner, Vec<NodeId>) {
        let mut manifest = manifest;
        let graph = manifest.build_maps();
        let order = graph.topological_sort().unwrap();
        let compile = CompileOptions::new(
            TargetConfig::default(),
            ResolveContext::new("p").with_adapter_chain(vec!["postgres".to_string(), "default".to_string()]),
        );
        let runner = Runner::new(Arc::new(manifest), graph, Arc::new(adapter), compile, options);
        (runner, order)
    }

    fn chain() -> Manifest {
        manifest(vec![
            model("a", "select 1 as id", &[]),
            model("b", "select * from {{ ref('a') }}", &["a"]),
            model("c", "select * from {{ ref('b') }}", &["b"]),
            model("d", "select 2 as id", &[]),
        ])
    }

    #[tokio::test]
    async fn runs_every_node_after_its_parents() {
        let adapter = MockAdapter::new();
        let (runner, order) = runner(chain(), adapter.clone(), RunOptions::default());
        let outcome = runner.run(&order).await;

        assert_eq!(outcome.results.count(NodeStatus::Success), 4);
        let executed = adapter.executed().await;
        let position = |name: &str| executed.iter().position(|s| s.contains(&format!("\"{}\"", name))).unwrap();
        assert!(position("a") < position("b"));
        assert!(position("b") < position("c"));
        assert!(executed[position("b")].starts_with("create view"));
    }

    #[tokio::test]
    async fn selected_nodes_wait_on_ancestors_behind_unselected_nodes() {
        let adapter = MockAdapter::new().with_error("\"a\"", AdapterError::Execution("relation missing".into()));
        let (runner, _) = runner(chain(), adapter.clone(), RunOptions::default());
        let order = vec!["model.p.a".to_string(), "model.p.c".to_string()];
        let outcome = runner.run(&order).await;

        let c = outcome.results.get("model.p.c").unwrap();
        assert_eq!(c.status, NodeStatus::Skipped);
        assert!(c.message.as_deref().unwrap().contains("model.p.a"));
        assert!(outcome.results.get("model.p.b").is_none());
        assert_eq!(adapter.executed().await.len(), 1);
    }

    #[tokio::test]
    async fn failure_skips_descendants() {
        let adapter = MockAdapter::new().with_error("\"a\"", AdapterError::Execution("relation missing".into()));
        let (runner, order) = runner(chain(), adapter, RunOptions::default());
        let outcome = runner.run(&order).await;

        let results = &outcome.results;
        assert_eq!(results.get("model.p.a").unwrap().status, NodeStatus::Error);
        let b = results.get("model.p.b").unwrap();
        assert_eq!(b.status, NodeStatus::Skipped);
        assert!(b.message.as_deref().unwrap().contains("model.p.a"));
        assert_eq!(results.get("model.p.c").unwrap().status, NodeStatus::Skipped);
        assert_eq!(results.get("model.p.d").unwrap().status, NodeStatus::Success);
        assert!(outcome.report.has_errors());
        assert_eq!(results.exit_code(), dagforge_core::ExitCode::Failure);
    }

    #[tokio::test]
    async fn ephemeral_models_are_not_executed() {
        let mut eph = model("e", "select 1 as id", &[]);
        eph.config = NodeConfig::default().with_materialized("ephemeral");
        let adapter = MockAdapter::new();
        let (runner, order) = runner(
            manifest(vec![eph, model("a", "select * from {{ ref('e') }}", &["e"])]),
            adapter.clone(),
            RunOptions::default(),
        );
        let outcome = runner.run(&order).await;

        let e = outcome.results.get("model.p.e").unwrap();
        assert_eq!(e.status, NodeStatus::Success);
        assert_eq!(e.message.as_deref(), Some("ephemeral"));
        let executed = adapter.executed().await;
        assert_eq!(executed.len(), 1);
        assert!(executed[0].contains("with __dbt__CTE__e as (select 1 as id)"));
    }

    #[tokio::test]
    async fn fail_fast_skips_the_rest() {
        let adapter = MockAdapter::new().with_error("\"a\"", AdapterError::Execution("boom".into()));
        let options = RunOptions {
            threads: 1,
            fail_fast: true,
            ..RunOptions::default()
        };
        let (runner, order) = runner(chain(), adapter, options);
        let outcome = runner.run(&order).await;

        assert!(!outcome.results.interrupted);
        assert_eq!(outcome.results.count(NodeStatus::Error), 1);
        assert_eq!(outcome.results.count(NodeStatus::Success), 0);
        assert_eq!(outcome.results.count(NodeStatus::Skipped), 3);
    }

    #[tokio::test]
    async fn timeouts_fail_the_node() {
        let adapter = MockAdapter::new()
            .with_timeout(Duration::from_millis(20))
            .with_delay("\"d\"", 5_000);
        let (runner, order) = runner(chain(), adapter, RunOptions::default());
        let outcome = runner.run(&order).await;

        let d = outcome.results.get("model.p.d").unwrap();
        assert_eq!(d.status, NodeStatus::Error);
        assert_eq!(d.message.as_deref(), Some("timeout"));
        assert!(outcome
            .report
            .errors()
            .any(|e| e.kind == dagforge_core::ErrorKind::Runtime && e.message == "timeout"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_run() {
        let adapter = MockAdapter::new().with_delay("\"a\"", 10_000);
        let (runner, order) = runner(chain(), adapter.clone(), RunOptions::default());
        let canceller = runner.canceller();
        let watcher = adapter.clone();
        tokio::spawn(async move {
            while watcher.executed().await.iter().all(|s| !s.contains("\"a\"")) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            canceller.cancel();
        });

        let outcome = runner.run(&order).await;
        assert!(outcome.results.interrupted);
        assert_eq!(outcome.results.exit_code(), dagforge_core::ExitCode::Failure);
        assert_eq!(outcome.results.get("model.p.a").unwrap().message.as_deref(), Some("cancelled"));
        assert!(outcome.results.get("model.p.c").is_none());
        assert!(!adapter.cancelled().await.is_empty());
    }

    #[test]
    fn test_results_follow_failures_and_severity() {
        let mut row = serde_json::Map::new();
        row.insert("failures".to_string(), serde_json::json!(3));
        let execution = ExecutionResult {
            rows: vec![row],
            ..ExecutionResult::default()
        };

        let fail = statement_result("test.p.t", StatementKind::Test { warn: false }, execution.clone());
        assert_eq!(fail.status, NodeStatus::Fail);
        assert_eq!(fail.failures, Some(3));
        assert_eq!(fail.message.as_deref(), Some("Got 3 results, configured to fail if != 0"));

        let warn = statement_result("test.p.t", StatementKind::Test { warn: true }, execution);
        assert_eq!(warn.status, NodeStatus::Warn);

        let pass = statement_result("test.p.t", StatementKind::Test { warn: false }, ExecutionResult::default());
        assert_eq!(pass.status, NodeStatus::Pass);
    }

    #[test]
    fn hooks_sort_by_index() {
        assert_eq!(hook_index("shop-on-run-start-10"), 10);
        assert_eq!(hook_index("shop-on-run-end-2"), 2);
    }
}
