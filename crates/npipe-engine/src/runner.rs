// SPDX-License-Identifier: Apache-2.0

//! The per-node driver (spec §4.6).
//!
//! Grounded on `otap-df-engine::processor::ProcessorWrapper` and the
//! receiver/exporter wrappers alongside it: one runner shape parameterized over
//! [`crate::node::NodeBehavior`] instead of three separate wrapper types, since every one of
//! NPipeline's five node kinds drives through the same per-item loop (input acquisition ->
//! resilient call -> lineage hop -> forward-or-route-failure -> termination metrics).

use crate::circuit_breaker::{CircuitBreakerRegistry, Outcome};
use crate::control::{ControlSurface, NodeControlMsg};
use crate::effect_handler::{EffectHandler, TimeoutOrCancel};
use crate::error::{Error, IsTransient, UserError};
use crate::error_policy::{DeadLetterRecord, DeadLetterSink, NodeErrorDecision, NodeErrorHandler};
use crate::item::{Item, Timestamp};
use crate::lineage::{Hop, HopCardinality, HopOutcome, LineageSink, LineageTracker};
use crate::node::{ErasedDecision, ErasedSink, ErasedSource, ErasedTransform, NodeBehavior};
use crate::observability::{NodeMetrics, ObservabilitySink, PipelineEvent, PipelineEventKind};
use crate::retry::{retry_with_backoff, RetryOutcome};
use crate::watermark::{BoundedOutOfOrderness, LateDataFilter, Watermarked, WatermarkGenerator};
use npipe_channel::{DataPipe, PipeError, PipeIter, PipeSender};
use npipe_config::node::{ExecutionStrategy, NodeId};
use npipe_config::retry::RetryOptions;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// The upstream data-pipes a node is wired to, by arity (spec §4.6 step 1 "input acquisition").
/// A node's output is always at most one pipe, since the build-time single-consumer check
/// guarantees an output port has exactly one downstream edge.
pub enum NodeInputs {
    /// A source: no upstream input.
    None,
    /// A transform, aggregate or sink: one upstream input.
    Single(DataPipe<Item>),
    /// A join: two named upstream inputs.
    LeftRight(DataPipe<Item>, DataPipe<Item>),
}

/// Per-node runtime configuration resolved from pipeline settings plus any per-node override
/// (spec §6 "retryOptions", §4.4, §4.3, §4.11).
pub struct NodeRunnerConfig {
    /// The node's user-declared name, used as both the log tag and the circuit-breaker
    /// resource key.
    pub node_name: std::sync::Arc<str>,
    /// Effective per-item retry/restart budget for this node.
    pub retry_options: RetryOptions,
    /// How this node schedules its item processing (spec §6). Only `Resilient` gets the
    /// circuit-breaker + retry wrapping in [`NodeRunner::resilient_call`]; `Sequential`,
    /// `Parallel` and `Batching` all currently drive the same sequential per-item loop (a
    /// disclosed scope cut for the latter two — see DESIGN.md).
    pub execution_strategy: ExecutionStrategy,
    /// Per-operation timeout wrapped around every user callback invocation.
    pub timeout: Option<Duration>,
    /// Shared circuit-breaker registry (one breaker per node name).
    pub circuit_breakers: std::sync::Arc<CircuitBreakerRegistry>,
    /// Lineage tracking, if enabled for this pipeline run.
    pub lineage: Option<std::sync::Arc<LineageTracker>>,
    /// Destination for finalized lineage records (required whenever `lineage` is `Some`).
    pub lineage_sink: Option<std::sync::Arc<dyn LineageSink>>,
    /// Per-item failure routing policy.
    pub node_error_handler: std::sync::Arc<dyn NodeErrorHandler>,
    /// Destination for items routed to `NodeErrorDecision::DeadLetter`.
    pub dead_letter_sink: Option<std::sync::Arc<dyn DeadLetterSink>>,
    /// Out-of-orderness bound used to build this node's watermark generator (spec §4.2).
    /// Drives window closing for aggregate/join nodes and late-item dead-lettering for
    /// transform/sink nodes; unused by sources, which have no inbound timestamps to judge.
    pub watermark_max_lag: Duration,
}

/// Drives one node's behavior to completion (spec §4.6).
pub struct NodeRunner {
    node_id: NodeId,
    behavior: NodeBehavior,
    config: NodeRunnerConfig,
}

impl NodeRunner {
    /// Builds a runner for one node's already-constructed behavior.
    #[must_use]
    pub fn new(node_id: NodeId, behavior: NodeBehavior, config: NodeRunnerConfig) -> Self {
        Self {
            node_id,
            behavior,
            config,
        }
    }

    /// Runs the node to completion: acquires its inputs, drives the per-item (or
    /// whole-function, for sources) loop, and returns final metrics (spec §4.6 steps 1-4).
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`Error`] — an upstream input fault, a `FailPipeline` routing
    /// decision, or a dead-letter-sink failure that itself escalates. The caller (the pipeline
    /// runner) is responsible for consulting the pipeline error handler on this.
    pub async fn run(
        mut self,
        inputs: NodeInputs,
        output: Option<PipeSender<Item>>,
        ctx: EffectHandler,
        mut control: ControlSurface,
    ) -> Result<NodeMetrics, Error> {
        let start = Instant::now();
        ctx.observability().on_event(PipelineEvent {
            run_id: ctx.run_id(),
            wall_time: std::time::SystemTime::now(),
            node_id: Some(self.node_id),
            kind: PipelineEventKind::NodeExecutionStarted,
            tags: HashMap::new(),
        });

        let mut metrics = NodeMetrics::default();
        let result = self
            .run_inner(inputs, output, &ctx, &mut control, &mut metrics)
            .await;
        metrics.success = result.is_ok();
        metrics.duration_ms = start.elapsed().as_millis() as u64;
        if metrics.duration_ms > 0 {
            metrics.throughput_items_per_sec =
                Some(metrics.items_processed as f64 * 1000.0 / metrics.duration_ms as f64);
        }

        ctx.observability()
            .on_node_metrics(self.node_id, metrics.clone());
        ctx.observability().on_event(PipelineEvent {
            run_id: ctx.run_id(),
            wall_time: std::time::SystemTime::now(),
            node_id: Some(self.node_id),
            kind: PipelineEventKind::NodeExecutionCompleted {
                success: metrics.success,
            },
            tags: HashMap::new(),
        });

        result.map(|()| metrics)
    }

    async fn run_inner(
        &mut self,
        inputs: NodeInputs,
        output: Option<PipeSender<Item>>,
        ctx: &EffectHandler,
        control: &mut ControlSurface,
        metrics: &mut NodeMetrics,
    ) -> Result<(), Error> {
        match (&self.behavior, inputs) {
            (NodeBehavior::Source(_), NodeInputs::None) => {
                let tx = output.ok_or_else(|| Error::UserFault {
                    node: self.config.node_name.to_string(),
                    message: "source node built with no output pipe".to_string(),
                })?;
                self.run_source(tx, ctx, control, metrics).await
            }
            (NodeBehavior::Transform(_), NodeInputs::Single(pipe)) => {
                let iter = Self::iterate(pipe, ctx, &self.config.node_name)?;
                self.run_transform(iter, output, ctx, control, metrics).await
            }
            (NodeBehavior::Sink(_), NodeInputs::Single(pipe)) => {
                let iter = Self::iterate(pipe, ctx, &self.config.node_name)?;
                self.run_sink(iter, ctx, control, metrics).await
            }
            (NodeBehavior::Aggregate(_), NodeInputs::Single(pipe)) => {
                let iter = Self::iterate(pipe, ctx, &self.config.node_name)?;
                self.run_aggregate(iter, output, ctx, control, metrics)
                    .await
            }
            (NodeBehavior::Join(_), NodeInputs::LeftRight(left, right)) => {
                let left = Self::iterate(left, ctx, &self.config.node_name)?;
                let right = Self::iterate(right, ctx, &self.config.node_name)?;
                self.run_join(left, right, output, ctx, control, metrics)
                    .await
            }
            _ => Err(Error::UserFault {
                node: self.config.node_name.to_string(),
                message: "node behavior and wired input arity disagree".to_string(),
            }),
        }
    }

    fn iterate(
        mut pipe: DataPipe<Item>,
        ctx: &EffectHandler,
        node_name: &str,
    ) -> Result<PipeIter<Item>, Error> {
        pipe.iterate(ctx.cancellation().clone())
            .map_err(|source| Error::InputFault {
                node: node_name.to_string(),
                source,
            })
    }

    // -- Source -----------------------------------------------------------------------------

    async fn run_source(
        &self,
        tx: PipeSender<Item>,
        ctx: &EffectHandler,
        control: &mut ControlSurface,
        metrics: &mut NodeMetrics,
    ) -> Result<(), Error> {
        let NodeBehavior::Source(adapter) = &self.behavior else {
            unreachable!("run_source only called for Source behavior")
        };
        let (internal_tx, mut internal_pipe) =
            DataPipe::streaming(format!("internal:{}", self.config.node_name), 64);

        let source_fut = adapter.run(internal_tx, ctx);
        let forward_fut = async {
            let mut iter = internal_pipe
                .iterate(ctx.cancellation().clone())
                .map_err(|source| Error::InputFault {
                    node: self.config.node_name.to_string(),
                    source,
                })?;
            loop {
                tokio::select! {
                    biased;
                    msg = control.next_control() => {
                        if matches!(msg, Some(NodeControlMsg::Drain) | None) {
                            break;
                        }
                    }
                    next = iter.next() => {
                        let item = match next {
                            Ok(Some(item)) => item,
                            Ok(None) => break,
                            Err(PipeError::Canceled) => break,
                            Err(source) => {
                                return Err(Error::InputFault {
                                    node: self.config.node_name.to_string(),
                                    source,
                                });
                            }
                        };
                        let mut item = item;
                        if let Some(tracker) = &self.config.lineage {
                            item.set_lineage(tracker.create_envelope(self.node_id));
                        }
                        metrics.items_processed += 1;
                        if tx.send(item).await.is_err() {
                            break;
                        }
                        metrics.items_emitted += 1;
                    }
                }
            }
            Ok(())
        };

        let (source_result, forward_result) = tokio::join!(source_fut, forward_fut);
        forward_result?;
        source_result.map_err(|err| Error::UserFault {
            node: self.config.node_name.to_string(),
            message: err.to_string(),
        })?;
        Ok(())
    }

    // -- Transform --------------------------------------------------------------------------

    async fn run_transform(
        &self,
        mut input: PipeIter<Item>,
        output: Option<PipeSender<Item>>,
        ctx: &EffectHandler,
        control: &mut ControlSurface,
        metrics: &mut NodeMetrics,
    ) -> Result<(), Error> {
        let NodeBehavior::Transform(adapter) = &self.behavior else {
            unreachable!("run_transform only called for Transform behavior")
        };
        let mut watermark_gen = BoundedOutOfOrderness::new(self.config.watermark_max_lag);
        let mut late_filter = LateDataFilter::new();
        loop {
            tokio::select! {
                biased;
                msg = control.next_control() => {
                    if matches!(msg, Some(NodeControlMsg::Drain) | None) {
                        break;
                    }
                }
                next = input.next() => {
                    let mut item = match self.next_or_fault(next)? {
                        Some(item) => item,
                        None => break,
                    };
                    metrics.items_processed += 1;
                    if self
                        .drop_if_late(&mut watermark_gen, &mut late_filter, &mut item)
                        .await?
                    {
                        continue;
                    }
                    match self
                        .resilient_call(ctx, || adapter.call(&item, ctx))
                        .await
                    {
                        Ok((decision, attempts)) => {
                            metrics.retry_count += u64::from(attempts);
                            match decision {
                                ErasedDecision::Ok(mut outputs) => {
                                    metrics.items_emitted += outputs.len() as u64;
                                    self.close_lineage(
                                        &mut item,
                                        HopOutcome::Emitted,
                                        cardinality_of(outputs.len()),
                                        &mut outputs,
                                    );
                                    if let Some(tx) = &output {
                                        for out in outputs {
                                            if tx.send(out).await.is_err() {
                                                return Ok(());
                                            }
                                        }
                                    }
                                }
                                ErasedDecision::Reject(_) => {
                                    self.close_lineage(
                                        &mut item,
                                        HopOutcome::FilteredOut,
                                        HopCardinality::Zero,
                                        &mut [],
                                    );
                                }
                            }
                        }
                        Err(err) => {
                            if !self.handle_item_error(err, item, ctx).await? {
                                break;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // -- Sink ---------------------------------------------------------------------------------

    async fn run_sink(
        &self,
        mut input: PipeIter<Item>,
        ctx: &EffectHandler,
        control: &mut ControlSurface,
        metrics: &mut NodeMetrics,
    ) -> Result<(), Error> {
        let NodeBehavior::Sink(adapter) = &self.behavior else {
            unreachable!("run_sink only called for Sink behavior")
        };
        let mut watermark_gen = BoundedOutOfOrderness::new(self.config.watermark_max_lag);
        let mut late_filter = LateDataFilter::new();
        loop {
            tokio::select! {
                biased;
                msg = control.next_control() => {
                    if matches!(msg, Some(NodeControlMsg::Drain) | None) {
                        break;
                    }
                }
                next = input.next() => {
                    let mut item = match self.next_or_fault(next)? {
                        Some(item) => item,
                        None => break,
                    };
                    metrics.items_processed += 1;
                    if self
                        .drop_if_late(&mut watermark_gen, &mut late_filter, &mut item)
                        .await?
                    {
                        continue;
                    }
                    match self.resilient_call(ctx, || adapter.call(&item, ctx)).await {
                        Ok(((), attempts)) => {
                            metrics.retry_count += u64::from(attempts);
                            self.close_lineage(&mut item, HopOutcome::Emitted, HopCardinality::Zero, &mut []);
                        }
                        Err(err) => {
                            if !self.handle_item_error(err, item, ctx).await? {
                                break;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // -- Aggregate ------------------------------------------------------------------------------

    async fn run_aggregate(
        &self,
        mut input: PipeIter<Item>,
        output: Option<PipeSender<Item>>,
        ctx: &EffectHandler,
        control: &mut ControlSurface,
        metrics: &mut NodeMetrics,
    ) -> Result<(), Error> {
        let NodeBehavior::Aggregate(adapter) = &self.behavior else {
            unreachable!("run_aggregate only called for Aggregate behavior")
        };
        let mut watermark_gen = BoundedOutOfOrderness::new(self.config.watermark_max_lag);
        let mut tick = tokio::time::interval(Duration::from_millis(200));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                msg = control.next_control() => {
                    if matches!(msg, Some(NodeControlMsg::Drain) | None) {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if let Some(w) = watermark_gen.on_tick(Instant::now()) {
                        self.flush_aggregate(adapter.as_ref(), w, &output, metrics, ctx).await;
                    }
                }
                next = input.next() => {
                    let mut item = match self.next_or_fault(next)? {
                        Some(item) => item,
                        None => break,
                    };
                    metrics.items_processed += 1;
                    if let Some(ts) = item.timestamp() {
                        if let Some(w) = watermark_gen.on_event(ts) {
                            self.flush_aggregate(adapter.as_ref(), w, &output, metrics, ctx).await;
                        }
                    }
                    match self.resilient_call(ctx, || adapter.on_data(&item, ctx)).await {
                        Ok((outcome, attempts)) => {
                            metrics.retry_count += u64::from(attempts);
                            let hop_outcome = match outcome {
                                crate::aggregate::AggregateOutcome::Accepted => HopOutcome::Aggregated,
                                crate::aggregate::AggregateOutcome::Late => HopOutcome::Error,
                                crate::aggregate::AggregateOutcome::EmptyKey => HopOutcome::FilteredOut,
                            };
                            self.close_lineage(&mut item, hop_outcome, HopCardinality::Unknown, &mut []);
                            if matches!(outcome, crate::aggregate::AggregateOutcome::Late) {
                                self.dead_letter(
                                    &Error::UserFault {
                                        node: self.config.node_name.to_string(),
                                        message: "item arrived after its window closed".to_string(),
                                    },
                                    &mut item,
                                )
                                .await?;
                            }
                        }
                        Err(err) => {
                            if !self.handle_item_error(err, item, ctx).await? {
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.flush_aggregate(adapter.as_ref(), Timestamp::MAX, &output, metrics, ctx)
            .await;
        Ok(())
    }

    async fn flush_aggregate(
        &self,
        adapter: &dyn crate::aggregate::ErasedAggregate,
        watermark: Timestamp,
        output: &Option<PipeSender<Item>>,
        metrics: &mut NodeMetrics,
        ctx: &EffectHandler,
    ) {
        let (outputs, evicted) = adapter.on_watermark(watermark);
        metrics.items_emitted += outputs.len() as u64;
        for out in outputs {
            let window_start = out.timestamp().unwrap_or(0);
            ctx.observability().on_event(PipelineEvent {
                run_id: ctx.run_id(),
                wall_time: std::time::SystemTime::now(),
                node_id: Some(self.node_id),
                kind: PipelineEventKind::WindowClosed { window_start },
                tags: HashMap::new(),
            });
            if let Some(tx) = output {
                if tx.send(out).await.is_err() {
                    break;
                }
            }
        }
        if evicted > 0 {
            ctx.observability().on_event(PipelineEvent {
                run_id: ctx.run_id(),
                wall_time: std::time::SystemTime::now(),
                node_id: Some(self.node_id),
                kind: PipelineEventKind::QueueDrop {
                    reason: format!("{evicted} window(s) evicted past maxConcurrentWindows"),
                },
                tags: HashMap::new(),
            });
        }
    }

    // -- Join ---------------------------------------------------------------------------------

    async fn run_join(
        &self,
        mut left: PipeIter<Item>,
        mut right: PipeIter<Item>,
        output: Option<PipeSender<Item>>,
        ctx: &EffectHandler,
        control: &mut ControlSurface,
        metrics: &mut NodeMetrics,
    ) -> Result<(), Error> {
        let NodeBehavior::Join(adapter) = &self.behavior else {
            unreachable!("run_join only called for Join behavior")
        };
        let mut watermark_gen = BoundedOutOfOrderness::new(self.config.watermark_max_lag);
        let mut tick = tokio::time::interval(Duration::from_millis(200));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut left_done = false;
        let mut right_done = false;

        loop {
            if left_done && right_done {
                break;
            }
            tokio::select! {
                biased;
                msg = control.next_control() => {
                    if matches!(msg, Some(NodeControlMsg::Drain) | None) {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if let Some(w) = watermark_gen.on_tick(Instant::now()) {
                        self.flush_join(adapter.as_ref(), w, &output, metrics, ctx).await;
                    }
                }
                next = left.next(), if !left_done => {
                    match self.next_or_fault(next)? {
                        Some(item) => {
                            self.handle_join_side(
                                adapter.as_ref(),
                                crate::join::Side::Left,
                                item,
                                &output,
                                &mut watermark_gen,
                                ctx,
                                metrics,
                            )
                            .await?;
                        }
                        None => left_done = true,
                    }
                }
                next = right.next(), if !right_done => {
                    match self.next_or_fault(next)? {
                        Some(item) => {
                            self.handle_join_side(
                                adapter.as_ref(),
                                crate::join::Side::Right,
                                item,
                                &output,
                                &mut watermark_gen,
                                ctx,
                                metrics,
                            )
                            .await?;
                        }
                        None => right_done = true,
                    }
                }
            }
        }
        self.flush_join(adapter.as_ref(), Timestamp::MAX, &output, metrics, ctx)
            .await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_join_side(
        &self,
        adapter: &dyn crate::join::ErasedJoin,
        side: crate::join::Side,
        mut item: Item,
        output: &Option<PipeSender<Item>>,
        watermark_gen: &mut BoundedOutOfOrderness,
        ctx: &EffectHandler,
        metrics: &mut NodeMetrics,
    ) -> Result<(), Error> {
        metrics.items_processed += 1;
        if let Some(ts) = item.timestamp() {
            if let Some(w) = watermark_gen.on_event(ts) {
                self.flush_join(adapter, w, output, metrics, ctx).await;
            }
        }
        match self.resilient_call(ctx, || adapter.on_item(side, &item, ctx)).await {
            Ok((mut outputs, attempts)) => {
                metrics.retry_count += u64::from(attempts);
                metrics.items_emitted += outputs.len() as u64;
                self.close_lineage(
                    &mut item,
                    HopOutcome::Joined,
                    cardinality_of(outputs.len()),
                    &mut outputs,
                );
                if let Some(tx) = output {
                    for out in outputs {
                        if tx.send(out).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.handle_item_error(err, item, ctx).await?;
                Ok(())
            }
        }
    }

    async fn flush_join(
        &self,
        adapter: &dyn crate::join::ErasedJoin,
        watermark: Timestamp,
        output: &Option<PipeSender<Item>>,
        metrics: &mut NodeMetrics,
        ctx: &EffectHandler,
    ) {
        let outputs = adapter.on_watermark(watermark, ctx).await;
        metrics.items_emitted += outputs.len() as u64;
        if let Some(tx) = output {
            for out in outputs {
                if tx.send(out).await.is_err() {
                    break;
                }
            }
        }
    }

    // -- Shared helpers -------------------------------------------------------------------------

    fn next_or_fault(&self, next: Result<Option<Item>, PipeError>) -> Result<Option<Item>, Error> {
        next.or_else(|err| match err {
            PipeError::Canceled => Ok(None),
            source => Err(Error::InputFault {
                node: self.config.node_name.to_string(),
                source,
            }),
        })
    }

    /// Runs one user callback, honoring the node's [`ExecutionStrategy`] (spec §4.4, §4.5,
    /// §4.6 step 2b). Only `Resilient` nodes get the circuit breaker and per-item retry budget
    /// (see [`NodeRunner::call_with_resilience`]); every other strategy runs `op` once under
    /// the per-operation timeout and maps a failure straight to an [`Error`], with no retry.
    async fn resilient_call<T, F, Fut>(
        &self,
        ctx: &EffectHandler,
        op: F,
    ) -> Result<(T, u32), Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, UserError>>,
    {
        if matches!(self.config.execution_strategy, ExecutionStrategy::Resilient) {
            self.call_with_resilience(ctx, op).await
        } else {
            self.call_once(ctx, op).await
        }
    }

    /// Invokes `op` exactly once under the per-operation timeout, with no circuit breaker and
    /// no retry — the behavior of every [`ExecutionStrategy`] other than `Resilient`.
    async fn call_once<T, F, Fut>(&self, ctx: &EffectHandler, mut op: F) -> Result<(T, u32), Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, UserError>>,
    {
        let result = match ctx.with_timeout(self.config.timeout, op()).await {
            Ok(result) => result,
            Err(TimeoutOrCancel::TimedOut) => Err(UserError::transient("operation timed out")),
            Err(TimeoutOrCancel::Canceled) => Err(UserError::permanent("canceled")),
        };
        match result {
            Ok(value) => Ok((value, 0)),
            Err(_) if ctx.cancellation().is_cancelled() => Err(Error::CancellationFault {
                node: self.config.node_name.to_string(),
            }),
            Err(err) => Err(Error::UserFault {
                node: self.config.node_name.to_string(),
                message: err.to_string(),
            }),
        }
    }

    /// Runs one user callback under the circuit breaker and per-item retry budget (spec §4.4,
    /// §4.5, §4.6 step 2b, §5 `ExecutionStrategy::Resilient`). Fails fast with
    /// [`Error::CircuitOpenFault`] without invoking `op` at all while the breaker is open;
    /// otherwise retries transient [`UserError`]s with backoff, honoring the per-operation
    /// timeout and cancellation on every attempt.
    async fn call_with_resilience<T, F, Fut>(
        &self,
        ctx: &EffectHandler,
        mut op: F,
    ) -> Result<(T, u32), Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, UserError>>,
    {
        let resource = self.config.node_name.as_ref();
        let breaker = self.config.circuit_breakers.get_or_create(resource);
        if !breaker.permits() {
            return Err(Error::CircuitOpenFault {
                resource: resource.to_string(),
            });
        }

        let timeout = self.config.timeout;
        let outcome = retry_with_backoff(&self.config.retry_options, ctx.cancellation(), || {
            let fut = op();
            async {
                match ctx.with_timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(TimeoutOrCancel::TimedOut) => {
                        Err(UserError::transient("operation timed out"))
                    }
                    Err(TimeoutOrCancel::Canceled) => Err(UserError::permanent("canceled")),
                }
            }
        })
        .await;

        match outcome {
            RetryOutcome::Succeeded {
                value,
                attempts_used,
            } => {
                breaker.record(Outcome::Success);
                if attempts_used > 0 {
                    ctx.observability().on_event(PipelineEvent {
                        run_id: ctx.run_id(),
                        wall_time: std::time::SystemTime::now(),
                        node_id: Some(self.node_id),
                        kind: PipelineEventKind::NodeRetry {
                            attempt: attempts_used,
                        },
                        tags: HashMap::new(),
                    });
                }
                Ok((value, attempts_used))
            }
            RetryOutcome::NonTransient(err) => {
                breaker.record(Outcome::Failure);
                if ctx.cancellation().is_cancelled() {
                    Err(Error::CancellationFault {
                        node: resource.to_string(),
                    })
                } else {
                    Err(Error::UserFault {
                        node: resource.to_string(),
                        message: err.to_string(),
                    })
                }
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                breaker.record(Outcome::Failure);
                Err(Error::RetryExhaustedFault {
                    node: resource.to_string(),
                    attempts,
                    last_error: last_error.to_string(),
                })
            }
        }
    }

    /// Routes a failed item per the node error handler's decision (spec §4.6 step 2d, §4.11).
    ///
    /// Returns `Ok(true)` if the node should keep processing further items, `Ok(false)` on
    /// `StopNode`, or `Err` (propagating up as a fatal node failure) on `FailPipeline` or a
    /// dead-letter-sink failure.
    async fn handle_item_error(
        &self,
        error: Error,
        mut item: Item,
        ctx: &EffectHandler,
    ) -> Result<bool, Error> {
        self.close_lineage(&mut item, HopOutcome::Error, HopCardinality::Zero, &mut []);
        let decision = self.config.node_error_handler.decide(self.node_id, &error).await;
        match decision {
            NodeErrorDecision::Retry | NodeErrorDecision::Skip => Ok(true),
            NodeErrorDecision::DeadLetter => {
                self.dead_letter(&error, &mut item).await?;
                Ok(true)
            }
            NodeErrorDecision::StopNode => Ok(false),
            NodeErrorDecision::FailPipeline => {
                let _ = ctx;
                Err(error)
            }
        }
    }

    /// Advances `watermark_gen`/`late_filter` on `item`'s timestamp and, if the item itself
    /// arrived after the resulting watermark already passed it, closes its lineage, dead-letters
    /// it and returns `true` so the caller skips further processing (spec §4.2, non-windowed
    /// nodes).
    async fn drop_if_late(
        &self,
        watermark_gen: &mut BoundedOutOfOrderness,
        late_filter: &mut LateDataFilter,
        item: &mut Item,
    ) -> Result<bool, Error> {
        let Some(ts) = item.timestamp() else {
            return Ok(false);
        };
        if let Some(w) = watermark_gen.on_event(ts) {
            late_filter.accept(Watermarked::Watermark(w));
        }
        if !late_filter.is_late(ts) {
            return Ok(false);
        }
        self.close_lineage(item, HopOutcome::Error, HopCardinality::Zero, &mut []);
        self.dead_letter(
            &Error::UserFault {
                node: self.config.node_name.to_string(),
                message: "item arrived after its watermark passed".to_string(),
            },
            item,
        )
        .await?;
        Ok(true)
    }

    async fn dead_letter(&self, error: &Error, item: &mut Item) -> Result<(), Error> {
        let Some(sink) = &self.config.dead_letter_sink else {
            tracing::warn!(
                node = %self.config.node_name,
                error = %error,
                "no dead-letter sink configured; dropping failed item"
            );
            return Ok(());
        };
        let mut record = DeadLetterRecord::from_error(self.node_id, error);
        if let Some(lineage) = item.lineage() {
            record.traversal_path = lineage.traversal_path().to_vec();
        }
        sink.deliver(record)
            .await
            .map_err(|message| Error::DeadLetterSinkFailed {
                node: self.config.node_name.to_string(),
                message,
            })
    }

    /// Records this node's lineage hop for `item` and, if the item produced no further
    /// outputs, finalizes and delivers its lineage record; otherwise propagates a clone of the
    /// (possibly truncated) envelope onto every output (spec §4.3).
    fn close_lineage(
        &self,
        item: &mut Item,
        outcome: HopOutcome,
        cardinality: HopCardinality,
        outputs: &mut [Item],
    ) {
        let Some(tracker) = &self.config.lineage else {
            return;
        };
        let Some(mut envelope) = item.take_lineage() else {
            return;
        };
        tracker.record_hop(
            &mut envelope,
            self.node_id,
            Hop::simple(self.node_id, outcome, cardinality),
        );
        if outputs.is_empty() {
            let record = tracker.finalize(envelope);
            if let Some(sink) = self.config.lineage_sink.clone() {
                tokio::spawn(async move { sink.emit(record).await });
            }
        } else {
            for out in outputs.iter_mut() {
                out.set_lineage(envelope.clone());
            }
        }
    }
}

fn cardinality_of(len: usize) -> HopCardinality {
    match len {
        0 => HopCardinality::Zero,
        1 => HopCardinality::One,
        _ => HopCardinality::Many,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::node::{Decision, Sink, Source, Transform};
    use crate::observability::RecordingObservabilitySink;
    use async_trait::async_trait;
    use npipe_config::node::Cardinality;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct CountingSource {
        total: i32,
    }

    #[async_trait]
    impl Source<i32> for CountingSource {
        async fn run(
            &self,
            tx: crate::node::ItemSender<i32>,
            _ctx: &EffectHandler,
        ) -> Result<(), UserError> {
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
        async fn call(&self, input: i32, _ctx: &EffectHandler) -> Result<Decision<i32>, UserError> {
            Ok(Decision::emit(input * 2))
        }
    }

    struct CollectingSink {
        seen: Arc<AtomicU64>,
    }
    #[async_trait]
    impl Sink<i32> for CollectingSink {
        async fn call(&self, _input: i32, _ctx: &EffectHandler) -> Result<(), UserError> {
            self.seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn default_config(node_name: &str) -> NodeRunnerConfig {
        NodeRunnerConfig {
            node_name: Arc::from(node_name),
            retry_options: RetryOptions::default(),
            execution_strategy: ExecutionStrategy::Sequential,
            timeout: None,
            circuit_breakers: Arc::new(CircuitBreakerRegistry::new(
                npipe_config::circuit_breaker::CircuitBreakerOptions::default(),
                npipe_config::circuit_breaker::CircuitBreakerMemoryOptions::default(),
            )),
            lineage: None,
            lineage_sink: None,
            node_error_handler: Arc::new(crate::error_policy::DeadLetterEverything),
            dead_letter_sink: None,
            watermark_max_lag: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn map_then_sink_processes_every_item() {
        let mut builder = Builder::default();
        let source = builder
            .add_source("source", CountingSource { total: 5 })
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
        let (definition, mut behaviors) = builder.build().unwrap();

        let run_id = uuid::Uuid::new_v4();
        let cancellation = tokio_util::sync::CancellationToken::new();
        let observability: Arc<dyn ObservabilitySink> = Arc::new(RecordingObservabilitySink::new());

        let (source_tx, source_pipe) = DataPipe::streaming("source->double", 8);
        let (transform_tx, transform_pipe) = DataPipe::streaming("double->sink", 8);

        let source_behavior = behaviors.remove(&source.node_id()).unwrap();
        let transform_behavior = behaviors.remove(&transform.node_id()).unwrap();
        let sink_behavior = behaviors.remove(&sink.node_id()).unwrap();

        let (_ctrl_tx1, ctrl_rx1) = tokio::sync::mpsc::channel(1);
        let (_ctrl_tx2, ctrl_rx2) = tokio::sync::mpsc::channel(1);
        let (_ctrl_tx3, ctrl_rx3) = tokio::sync::mpsc::channel(1);

        let source_runner = NodeRunner::new(
            source.node_id(),
            source_behavior,
            default_config("source"),
        );
        let transform_runner = NodeRunner::new(
            transform.node_id(),
            transform_behavior,
            default_config("double"),
        );
        let sink_runner = NodeRunner::new(sink.node_id(), sink_behavior, default_config("sink"));

        let source_ctx = EffectHandler::new(
            run_id,
            source.node_id(),
            npipe_config::node::NodeKind::Source,
            Arc::from("source"),
            cancellation.clone(),
            observability.clone(),
        );
        let transform_ctx = EffectHandler::new(
            run_id,
            transform.node_id(),
            npipe_config::node::NodeKind::Transform,
            Arc::from("double"),
            cancellation.clone(),
            observability.clone(),
        );
        let sink_ctx = EffectHandler::new(
            run_id,
            sink.node_id(),
            npipe_config::node::NodeKind::Sink,
            Arc::from("sink"),
            cancellation.clone(),
            observability.clone(),
        );

        let source_fut = source_runner.run(
            NodeInputs::None,
            Some(source_tx),
            source_ctx,
            ControlSurface::new(source.node_id(), cancellation.clone(), ctrl_rx1),
        );
        let transform_fut = transform_runner.run(
            NodeInputs::Single(source_pipe),
            Some(transform_tx),
            transform_ctx,
            ControlSurface::new(transform.node_id(), cancellation.clone(), ctrl_rx2),
        );
        let sink_fut = sink_runner.run(
            NodeInputs::Single(transform_pipe),
            None,
            sink_ctx,
            ControlSurface::new(sink.node_id(), cancellation.clone(), ctrl_rx3),
        );

        let (source_metrics, transform_metrics, sink_metrics) =
            tokio::join!(source_fut, transform_fut, sink_fut);
        let source_metrics = source_metrics.unwrap();
        let transform_metrics = transform_metrics.unwrap();
        let sink_metrics = sink_metrics.unwrap();

        assert_eq!(source_metrics.items_emitted, 5);
        assert_eq!(transform_metrics.items_processed, 5);
        assert_eq!(transform_metrics.items_emitted, 5);
        assert_eq!(sink_metrics.items_processed, 5);
        assert_eq!(seen.load(Ordering::Relaxed), 5);
        let _ = definition;
    }

    struct AlwaysFails;
    #[async_trait]
    impl Sink<i32> for AlwaysFails {
        async fn call(&self, _input: i32, _ctx: &EffectHandler) -> Result<(), UserError> {
            Err(UserError::transient("always fails"))
        }
    }

    #[tokio::test]
    async fn retry_exhaustion_dead_letters_the_item() {
        let mut builder = Builder::default();
        let sink = builder.add_sink("sink", AlwaysFails).unwrap();
        let (_, mut behaviors) = builder.build().unwrap();
        let behavior = behaviors.remove(&sink.node_id()).unwrap();

        let dead_letters = Arc::new(crate::error_policy::VecDeadLetterSink::new());
        let mut config = default_config("sink");
        config.execution_strategy = ExecutionStrategy::Resilient;
        config.retry_options = RetryOptions {
            max_item_retries: 1,
            base_delay: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..RetryOptions::default()
        };
        config.dead_letter_sink = Some(dead_letters.clone());

        let runner = NodeRunner::new(sink.node_id(), behavior, config);
        let (tx, pipe) = DataPipe::streaming("src->sink", 4);
        tx.send(Item::new(1i32)).await.unwrap();
        drop(tx);

        let cancellation = tokio_util::sync::CancellationToken::new();
        let (_ctrl_tx, ctrl_rx) = tokio::sync::mpsc::channel(1);
        let observability: Arc<dyn ObservabilitySink> = Arc::new(RecordingObservabilitySink::new());
        let ctx = EffectHandler::new(
            uuid::Uuid::new_v4(),
            sink.node_id(),
            npipe_config::node::NodeKind::Sink,
            Arc::from("sink"),
            cancellation.clone(),
            observability,
        );
        let metrics = runner
            .run(
                NodeInputs::Single(pipe),
                None,
                ctx,
                ControlSurface::new(sink.node_id(), cancellation, ctrl_rx),
            )
            .await
            .unwrap();

        assert!(metrics.success);
        assert_eq!(dead_letters.records().len(), 1);
    }
}
