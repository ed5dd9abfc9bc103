// SPDX-License-Identifier: Apache-2.0

//! Topological pipeline execution (spec §4.10).
//!
//! Grounded on `otap-df-controller`'s pipeline lifecycle (`thread_task.rs`,
//! `observed_state.rs`), generalized from OTel's multi-pipeline-group supervision down to the
//! spec's single frozen-graph execution model: one [`PipelineRunner`] instantiates every node
//! from the frozen [`PipelineDefinition`], wires a data-pipe per edge, drives every node
//! concurrently, and consults the [`PipelineErrorHandler`] the first time (and every
//! subsequent time) a node exits with a fatal, unrecovered fault.

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::control::{ControlSurface, NodeControlMsg};
use crate::effect_handler::EffectHandler;
use crate::error::Error;
use crate::error_policy::{
    DeadLetterEverything, DeadLetterSink, FailPipelineOnAnyFault, NodeErrorHandler,
    PipelineErrorDecision, PipelineErrorHandler,
};
use crate::item::Item;
use crate::lineage::{LineageSink, LineageTracker};
use crate::node::NodeBehavior;
use crate::observability::{
    NodeMetrics, ObservabilitySink, PipelineEvent, PipelineEventKind, PipelineMetrics,
    TracingObservabilitySink,
};
use crate::retry::RestartBudget;
use crate::runner::{NodeInputs, NodeRunner, NodeRunnerConfig};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use npipe_channel::{DataPipe, PipeSender};
use npipe_config::node::{NodeId, PortName};
use npipe_config::retry::RetryOptions;
use npipe_config::{PipelineDefinition, PipelineSettings};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Shared services and policy hooks a [`PipelineRunner`] needs beyond the frozen graph itself
/// (spec §6 "Configuration", §4.11 "handler chains").
pub struct PipelineRuntime {
    /// Pipeline-wide defaults, loaded from code or from a settings file.
    pub settings: PipelineSettings,
    /// Shared circuit-breaker registry, one breaker tracked per node name.
    pub circuit_breakers: Arc<CircuitBreakerRegistry>,
    /// Lineage tracker, if item-level lineage is enabled.
    pub lineage: Option<Arc<LineageTracker>>,
    /// Destination for finalized lineage records, required whenever `lineage` is `Some`.
    pub lineage_sink: Option<Arc<dyn LineageSink>>,
    /// Per-item failure routing policy, shared by every node unless overridden.
    pub node_error_handler: Arc<dyn NodeErrorHandler>,
    /// Per-node fatal-failure routing policy, consulted by the pipeline runner.
    pub pipeline_error_handler: Arc<dyn PipelineErrorHandler>,
    /// Destination for dead-lettered items.
    pub dead_letter_sink: Option<Arc<dyn DeadLetterSink>>,
    /// Observability sink events and metrics are reported to.
    pub observability: Arc<dyn ObservabilitySink>,
    /// Per-operation timeout applied to every user callback.
    pub timeout: Option<Duration>,
    /// Out-of-orderness bound for aggregate/join watermark generation.
    pub watermark_max_lag: Duration,
}

impl PipelineRuntime {
    /// Builds a runtime from [`PipelineSettings`], with conservative defaults for every policy
    /// hook (dead-letter everything, fail the pipeline on any fatal fault, `tracing`-backed
    /// observability) — the same conservative defaults the spec's node/pipeline error handlers
    /// describe (spec §4.11 "the engine has already exhausted retries by the time this is
    /// consulted").
    #[must_use]
    pub fn new(settings: PipelineSettings) -> Self {
        let lineage = settings.lineage_options.item_level_enabled.then(|| {
            Arc::new(LineageTracker::new(
                settings.lineage_options.sample_every,
                settings.lineage_options.max_hops_per_item,
                settings.lineage_options.overflow_policy,
            ))
        });
        Self {
            circuit_breakers: Arc::new(CircuitBreakerRegistry::new(
                settings.circuit_breaker_options.clone(),
                settings.circuit_breaker_memory_options.clone(),
            )),
            lineage,
            lineage_sink: None,
            node_error_handler: Arc::new(DeadLetterEverything),
            pipeline_error_handler: Arc::new(FailPipelineOnAnyFault),
            dead_letter_sink: None,
            observability: Arc::new(TracingObservabilitySink),
            timeout: None,
            watermark_max_lag: Duration::from_secs(1),
            settings,
        }
    }
}

/// A static snapshot of the topology a run executed, correlated by run id (spec §4.10 step 5
/// "PipelineLineageReport").
#[derive(Debug, Clone)]
pub struct PipelineLineageReport {
    /// The run this snapshot describes.
    pub run_id: Uuid,
    /// Every node's user-declared name, by id.
    pub node_names: HashMap<NodeId, String>,
    /// Every edge, as `(source, target)` node id pairs.
    pub edges: Vec<(NodeId, NodeId)>,
}

/// The result of running a pipeline to completion.
pub struct PipelineRunOutcome {
    /// Per-node and aggregate run metrics.
    pub metrics: PipelineMetrics,
    /// The static topology snapshot for this run.
    pub lineage_report: PipelineLineageReport,
    /// Whether the run ended in a failed state (at least one node's fatal fault escalated to
    /// `FailPipeline`, or a node's restart budget was exhausted with no handler recovery).
    pub failed: bool,
}

/// Drives one frozen [`PipelineDefinition`] to completion (spec §4.10).
pub struct PipelineRunner {
    definition: PipelineDefinition,
    behaviors: HashMap<NodeId, NodeBehavior>,
    runtime: PipelineRuntime,
}

/// Bookkeeping carried across a node's lifetime that a restart needs to reconstruct its inputs
/// and reattach its output.
struct NodeWiring {
    inputs: NodeInputs,
    output: Option<PipeSender<Item>>,
}

impl PipelineRunner {
    /// Builds a runner for an already-built graph (spec §4.9 `Builder::build` output) plus the
    /// shared services it will run against.
    #[must_use]
    pub fn new(
        definition: PipelineDefinition,
        behaviors: HashMap<NodeId, NodeBehavior>,
        runtime: PipelineRuntime,
    ) -> Self {
        Self {
            definition,
            behaviors,
            runtime,
        }
    }

    /// Runs the pipeline to completion (spec §4.10 steps 1-5).
    pub async fn run(self) -> PipelineRunOutcome {
        let run_id = Uuid::new_v4();
        let cancellation = CancellationToken::new();
        self.runtime.observability.on_event(PipelineEvent {
            run_id,
            wall_time: std::time::SystemTime::now(),
            node_id: None,
            kind: PipelineEventKind::PipelineStarted,
            tags: HashMap::new(),
        });

        let node_names: HashMap<NodeId, String> = self
            .definition
            .nodes()
            .iter()
            .map(|n| (n.id(), n.name().to_string()))
            .collect();
        let edges: Vec<(NodeId, NodeId)> = self
            .definition
            .edges()
            .iter()
            .map(|e| (e.source, e.target))
            .collect();

        // Step 2: one data-pipe per edge.
        let mut senders: HashMap<(NodeId, PortName), PipeSender<Item>> = HashMap::new();
        let mut receivers: HashMap<(NodeId, PortName), DataPipe<Item>> = HashMap::new();
        for edge in self.definition.edges() {
            let name = format!(
                "{}:{}->{}:{}",
                edge.source, edge.source_port, edge.target, edge.target_port
            );
            let (tx, pipe) = DataPipe::streaming(
                name,
                self.runtime.settings.default_pdata_channel_capacity,
            );
            senders.insert((edge.source, edge.source_port.clone()), tx);
            receivers.insert((edge.target, edge.target_port.clone()), pipe);
        }

        // Step 1/3: instantiate and start every node, in topological order so downstream
        // consumers always find their edge's `DataPipe` already created (creation above does
        // not depend on order, but starting in topological order matches the spec's wording).
        let mut control_senders: HashMap<NodeId, tokio::sync::mpsc::Sender<NodeControlMsg>> =
            HashMap::new();
        let mut restart_budgets: HashMap<NodeId, RestartBudget> = HashMap::new();
        let mut tasks: FuturesUnordered<JoinHandle<(NodeId, Result<NodeMetrics, Error>)>> =
            FuturesUnordered::new();

        for &node_id in self.definition.topological_order() {
            let wiring = self.take_wiring(node_id, &mut senders, &mut receivers);
            restart_budgets.insert(
                node_id,
                RestartBudget::new(self.effective_retry_options(node_id)),
            );
            tasks.push(self.spawn_node(
                node_id,
                wiring,
                run_id,
                &cancellation,
                &mut control_senders,
            ));
        }

        let mut per_node_metrics: HashMap<NodeId, NodeMetrics> = HashMap::new();
        let mut failed = false;

        while let Some(joined) = tasks.next().await {
            let (node_id, result) = match joined {
                Ok(pair) => pair,
                Err(join_error) => {
                    tracing::error!(error = %join_error, "node task panicked");
                    failed = true;
                    continue;
                }
            };
            match result {
                Ok(metrics) => {
                    per_node_metrics.insert(node_id, metrics);
                }
                Err(error) => {
                    let node_failed = self
                        .handle_node_failure(
                            node_id,
                            error,
                            run_id,
                            &cancellation,
                            &mut control_senders,
                            &mut restart_budgets,
                            &mut senders,
                            &mut receivers,
                            &mut tasks,
                        )
                        .await;
                    failed = failed || node_failed;
                }
            }
        }

        let total_items_processed = per_node_metrics.values().map(|m| m.items_processed).sum();
        self.runtime.observability.on_event(PipelineEvent {
            run_id,
            wall_time: std::time::SystemTime::now(),
            node_id: None,
            kind: if failed {
                PipelineEventKind::PipelineFailed {
                    cause: "one or more nodes failed fatally".to_string(),
                }
            } else {
                PipelineEventKind::PipelineCompleted
            },
            tags: HashMap::new(),
        });

        PipelineRunOutcome {
            metrics: PipelineMetrics {
                total_items_processed,
                per_node: per_node_metrics,
            },
            lineage_report: PipelineLineageReport {
                run_id,
                node_names,
                edges,
            },
            failed,
        }
    }

    fn effective_retry_options(&self, node_id: NodeId) -> &RetryOptions {
        self.definition
            .node(node_id)
            .and_then(|def| def.retry_options())
            .unwrap_or(&self.runtime.settings.retry_options)
    }

    /// Pulls this node's input pipe(s) and output sender out of the edge-wiring maps,
    /// substituting an empty materialized pipe for any declared input port with no connected
    /// edge so every node still runs to completion instead of hanging (spec §4.9 does not
    /// require every port be connected).
    fn take_wiring(
        &self,
        node_id: NodeId,
        senders: &mut HashMap<(NodeId, PortName), PipeSender<Item>>,
        receivers: &mut HashMap<(NodeId, PortName), DataPipe<Item>>,
    ) -> NodeWiring {
        let node = self
            .definition
            .node(node_id)
            .expect("node_id came from this definition's own topological order");
        let output = senders.remove(&(node_id, PortName::default()));

        let inputs = if node.input_ports().is_empty() {
            NodeInputs::None
        } else if node.input_ports().len() == 1 {
            let (port, _) = &node.input_ports()[0];
            let pipe = receivers
                .remove(&(node_id, port.clone()))
                .unwrap_or_else(|| empty_pipe(node_id, port));
            NodeInputs::Single(pipe)
        } else {
            let left_port = PortName::from("left");
            let right_port = PortName::from("right");
            let left = receivers
                .remove(&(node_id, left_port.clone()))
                .unwrap_or_else(|| empty_pipe(node_id, &left_port));
            let right = receivers
                .remove(&(node_id, right_port.clone()))
                .unwrap_or_else(|| empty_pipe(node_id, &right_port));
            NodeInputs::LeftRight(left, right)
        };

        NodeWiring { inputs, output }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_node(
        &self,
        node_id: NodeId,
        wiring: NodeWiring,
        run_id: Uuid,
        cancellation: &CancellationToken,
        control_senders: &mut HashMap<NodeId, tokio::sync::mpsc::Sender<NodeControlMsg>>,
    ) -> JoinHandle<(NodeId, Result<NodeMetrics, Error>)> {
        let node = self
            .definition
            .node(node_id)
            .expect("node_id came from this definition's own topological order");
        let behavior = self
            .behaviors
            .get(&node_id)
            .cloned()
            .expect("every node in the definition has a registered behavior (Builder::build invariant)");
        let node_name: Arc<str> = Arc::from(node.name());

        let config = NodeRunnerConfig {
            node_name: node_name.clone(),
            retry_options: self.effective_retry_options(node_id).clone(),
            execution_strategy: node.execution_strategy(),
            timeout: self.runtime.timeout,
            circuit_breakers: self.runtime.circuit_breakers.clone(),
            lineage: self.runtime.lineage.clone(),
            lineage_sink: self.runtime.lineage_sink.clone(),
            node_error_handler: self.runtime.node_error_handler.clone(),
            dead_letter_sink: self.runtime.dead_letter_sink.clone(),
            watermark_max_lag: self.runtime.watermark_max_lag,
        };

        let (control_tx, control_rx) = tokio::sync::mpsc::channel(
            self.runtime.settings.default_control_channel_capacity,
        );
        control_senders.insert(node_id, control_tx);
        let control = ControlSurface::new(node_id, cancellation.clone(), control_rx);

        let ctx = EffectHandler::new(
            run_id,
            node_id,
            node.kind(),
            node_name,
            cancellation.clone(),
            self.runtime.observability.clone(),
        );

        let runner = NodeRunner::new(node_id, behavior, config);
        tokio::spawn(async move {
            let result = runner.run(wiring.inputs, wiring.output, ctx, control).await;
            (node_id, result)
        })
    }

    /// Consults the pipeline error handler on a node's fatal failure and acts on its decision
    /// (spec §4.10 step 4). Returns whether the run should be considered failed overall.
    #[allow(clippy::too_many_arguments)]
    async fn handle_node_failure(
        &self,
        node_id: NodeId,
        error: Error,
        run_id: Uuid,
        cancellation: &CancellationToken,
        control_senders: &mut HashMap<NodeId, tokio::sync::mpsc::Sender<NodeControlMsg>>,
        restart_budgets: &mut HashMap<NodeId, RestartBudget>,
        senders: &mut HashMap<(NodeId, PortName), PipeSender<Item>>,
        receivers: &mut HashMap<(NodeId, PortName), DataPipe<Item>>,
        tasks: &mut FuturesUnordered<JoinHandle<(NodeId, Result<NodeMetrics, Error>)>>,
    ) -> bool {
        let node_name = self
            .definition
            .node(node_id)
            .map(|n| n.name().to_string())
            .unwrap_or_else(|| node_id.to_string());
        tracing::warn!(node = %node_name, error = %error, "node exited with a fatal fault");

        let decision = self.runtime.pipeline_error_handler.decide(node_id, &error).await;
        match decision {
            PipelineErrorDecision::Continue => {
                tracing::info!(node = %node_name, "pipeline continuing past fatal node failure");
                false
            }
            PipelineErrorDecision::RestartNode => {
                let budget = restart_budgets
                    .get_mut(&node_id)
                    .expect("every node got a restart budget in PipelineRunner::run");
                if budget.try_consume() {
                    tracing::info!(node = %node_name, attempt = budget.used(), "restarting node");
                    // Restart re-runs the same configured behavior from empty input: the
                    // original edge's upstream pipe was already consumed by the failed
                    // attempt, and the spec excludes exactly-once delivery, so items already
                    // in flight before the failure are not replayed (DESIGN.md).
                    let wiring = self.take_wiring(node_id, senders, receivers);
                    tasks.push(self.spawn_node(
                        node_id,
                        wiring,
                        run_id,
                        cancellation,
                        control_senders,
                    ));
                    false
                } else {
                    tracing::warn!(node = %node_name, "restart budget exhausted");
                    let budget_error = Error::RestartBudgetExhaustedFault {
                        node: node_name.clone(),
                        attempts: budget.used(),
                    };
                    Box::pin(self.handle_node_failure(
                        node_id,
                        budget_error,
                        run_id,
                        cancellation,
                        control_senders,
                        restart_budgets,
                        senders,
                        receivers,
                        tasks,
                    ))
                    .await
                }
            }
            PipelineErrorDecision::DrainAndStop => {
                tracing::info!(node = %node_name, "draining remaining nodes and stopping");
                for (&other_id, tx) in control_senders {
                    if other_id != node_id {
                        let _ = tx.send(NodeControlMsg::Drain).await;
                    }
                }
                false
            }
            PipelineErrorDecision::FailPipeline => {
                tracing::error!(node = %node_name, "failing the whole pipeline");
                cancellation.cancel();
                true
            }
        }
    }
}

fn empty_pipe(node_id: NodeId, port: &PortName) -> DataPipe<Item> {
    DataPipe::materialized(format!("empty:{node_id}:{port}"), Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::node::{Decision, Sink, Source, Transform};
    use async_trait::async_trait;
    use npipe_config::node::Cardinality;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingSource {
        total: i32,
    }

    #[async_trait]
    impl Source<i32> for CountingSource {
        async fn run(
            &self,
            tx: crate::node::ItemSender<i32>,
            _ctx: &EffectHandler,
        ) -> Result<(), crate::error::UserError> {
            for i in 0..self.total {
                tx.send(i).await.ok();
            }
            Ok(())
        }
    }

    struct Double;
    #[async_trait]
    impl Transform<i32, i32> for Double {
        fn cardinality(&self) -> Cardinality {
            Cardinality::OneToOne
        }
        async fn call(
            &self,
            input: i32,
            _ctx: &EffectHandler,
        ) -> Result<Decision<i32>, crate::error::UserError> {
            Ok(Decision::emit(input * 2))
        }
    }

    struct CollectingSink {
        seen: Arc<AtomicU64>,
    }
    #[async_trait]
    impl Sink<i32> for CollectingSink {
        async fn call(
            &self,
            _input: i32,
            _ctx: &EffectHandler,
        ) -> Result<(), crate::error::UserError> {
            self.seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_a_three_node_pipeline_to_completion() {
        let mut builder = Builder::default();
        let source = builder
            .add_source("source", CountingSource { total: 10 })
            .unwrap();
        let transform = builder
            .add_transform("double", Cardinality::OneToOne, Double)
            .unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let sink = builder
            .add_sink(
                "sink",
                CollectingSink {
                    seen: seen.clone(),
                },
            )
            .unwrap();
        builder.connect(source.output(), transform.input()).unwrap();
        builder.connect(transform.output(), sink.input()).unwrap();
        let (definition, behaviors) = builder.build().unwrap();

        let runner = PipelineRunner::new(
            definition,
            behaviors,
            PipelineRuntime::new(PipelineSettings::default()),
        );
        let outcome = runner.run().await;

        assert!(!outcome.failed);
        assert_eq!(seen.load(Ordering::Relaxed), 10);
        assert_eq!(outcome.metrics.per_node.len(), 3);
        assert_eq!(outcome.metrics.total_items_processed, 20);
    }

    #[tokio::test]
    async fn an_unconnected_sink_completes_with_zero_items() {
        let mut builder = Builder::default();
        let seen = Arc::new(AtomicU64::new(0));
        let _sink = builder
            .add_sink(
                "sink",
                CollectingSink {
                    seen: seen.clone(),
                },
            )
            .unwrap();
        let (definition, behaviors) = builder.build().unwrap();

        let runner = PipelineRunner::new(
            definition,
            behaviors,
            PipelineRuntime::new(PipelineSettings::default()),
        );
        let outcome = runner.run().await;

        assert!(!outcome.failed);
        assert_eq!(seen.load(Ordering::Relaxed), 0);
    }
}
