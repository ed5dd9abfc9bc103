// SPDX-License-Identifier: Apache-2.0

//! The typed graph model: node/edge metadata, fluent builder and build-time validation
//! (spec §4.9 "Graph & builder").

use crate::error::Error;
use crate::lineage::ValidationMode;
use crate::node::{Cardinality, ExecutionStrategy, MergeStrategy, NodeId, NodeKind, PortName};
use crate::retry::RetryOptions;
use std::any::TypeId;
use std::collections::{HashMap, HashSet, VecDeque};

/// A type-erased marker for an edge/port's declared Rust type, used for the defensive
/// runtime type-agreement check (spec invariant "Port typing"). The fluent builder's typed
/// handles make mismatches a compile error; this is the backstop for graphs assembled from a
/// declarative description (SPEC_FULL.md §3.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Builds a type key for `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        TypeKey {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The type's `std::any::type_name` string, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Build-time metadata for one node, indexed by its [`NodeId`].
#[derive(Debug, Clone)]
pub struct NodeDef {
    id: NodeId,
    name: String,
    kind: NodeKind,
    input_ports: Vec<(PortName, TypeKey)>,
    output_type: Option<TypeKey>,
    declared_cardinality: Option<Cardinality>,
    merge_strategy: Option<MergeStrategy>,
    execution_strategy: ExecutionStrategy,
    retry_options: Option<RetryOptions>,
}

impl NodeDef {
    /// This node's id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The user-declared, graph-unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node kind.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Declared input ports and their types.
    #[must_use]
    pub fn input_ports(&self) -> &[(PortName, TypeKey)] {
        &self.input_ports
    }

    /// The declared output type, if this node produces output.
    #[must_use]
    pub fn output_type(&self) -> Option<TypeKey> {
        self.output_type
    }

    /// Declared cardinality, for transform nodes.
    #[must_use]
    pub fn declared_cardinality(&self) -> Option<Cardinality> {
        self.declared_cardinality
    }

    /// Merge strategy for multi-input nodes.
    #[must_use]
    pub fn merge_strategy(&self) -> Option<&MergeStrategy> {
        self.merge_strategy.as_ref()
    }

    /// The node's execution strategy.
    #[must_use]
    pub fn execution_strategy(&self) -> ExecutionStrategy {
        self.execution_strategy
    }

    /// Per-node retry override, if any (falls back to the pipeline default otherwise).
    #[must_use]
    pub fn retry_options(&self) -> Option<&RetryOptions> {
        self.retry_options.as_ref()
    }
}

/// A directed connection between two node ports, with the declared element type carried for
/// validation (spec §3 "Edge").
#[derive(Debug, Clone)]
pub struct EdgeSpec {
    /// The upstream node.
    pub source: NodeId,
    /// The upstream node's output port.
    pub source_port: PortName,
    /// The downstream node.
    pub target: NodeId,
    /// The downstream node's input port.
    pub target_port: PortName,
    /// The element type flowing over this edge.
    pub element_type: TypeKey,
}

/// Parameters for declaring a new node, gathered by the typed builder wrappers in
/// `npipe-engine` before being handed to [`GraphBuilder::add_node`].
pub struct NodeSpec {
    /// Graph-unique node name.
    pub name: String,
    /// Node kind.
    pub kind: NodeKind,
    /// Declared input ports (empty for sources).
    pub input_ports: Vec<(PortName, TypeKey)>,
    /// Declared output type (`None` for sinks).
    pub output_type: Option<TypeKey>,
    /// Declared cardinality (transforms only).
    pub declared_cardinality: Option<Cardinality>,
    /// Merge strategy (multi-input nodes only).
    pub merge_strategy: Option<MergeStrategy>,
    /// Execution strategy; defaults to [`ExecutionStrategy::Sequential`].
    pub execution_strategy: ExecutionStrategy,
    /// Per-node retry override.
    pub retry_options: Option<RetryOptions>,
}

/// Fluent, incrementally-built graph of nodes and edges. Frozen by [`GraphBuilder::build`]
/// into a [`PipelineDefinition`] (spec §3 "Lifecycles": "Graph & node definitions are built
/// incrementally and frozen at build").
pub struct GraphBuilder {
    nodes: Vec<NodeDef>,
    edges: Vec<EdgeSpec>,
    names: HashSet<String>,
    validation_mode: ValidationMode,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new(ValidationMode::Strict)
    }
}

const MAX_NODES: usize = u16::MAX as usize;

impl GraphBuilder {
    /// Creates an empty builder with the given [`ValidationMode`].
    #[must_use]
    pub fn new(validation_mode: ValidationMode) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            names: HashSet::new(),
            validation_mode,
        }
    }

    /// Declares a new node, returning its assigned [`NodeId`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateNodeName`] if `spec.name` collides with an existing node, or
    /// [`Error::TooManyNodes`] once the graph holds `u16::MAX` nodes.
    pub fn add_node(&mut self, spec: NodeSpec) -> Result<NodeId, Error> {
        if self.nodes.len() >= MAX_NODES {
            return Err(Error::TooManyNodes { limit: MAX_NODES });
        }
        if !self.names.insert(spec.name.clone()) {
            return Err(Error::DuplicateNodeName { name: spec.name });
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeDef {
            id,
            name: spec.name,
            kind: spec.kind,
            input_ports: spec.input_ports,
            output_type: spec.output_type,
            declared_cardinality: spec.declared_cardinality,
            merge_strategy: spec.merge_strategy,
            execution_strategy: spec.execution_strategy,
            retry_options: spec.retry_options,
        });
        Ok(id)
    }

    /// Connects `source`'s `source_port` output to `target`'s `target_port` input.
    ///
    /// The fluent typed handles in `npipe-engine` only ever call this with ports whose Rust
    /// types already match at compile time; the `element_type` passed here is still checked
    /// against both nodes' declared ports so mis-wired declarative graphs fail fast too.
    pub fn connect(
        &mut self,
        source: NodeId,
        source_port: PortName,
        target: NodeId,
        target_port: PortName,
        element_type: TypeKey,
    ) -> Result<(), Error> {
        self.node(source)?;
        self.node(target)?;
        self.edges.push(EdgeSpec {
            source,
            source_port,
            target,
            target_port,
            element_type,
        });
        Ok(())
    }

    fn node(&self, id: NodeId) -> Result<&NodeDef, Error> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(Error::DanglingEdge { node: id })
    }

    /// Runs every build-time check without consuming the builder (spec §4.9 steps 1-5).
    ///
    /// Returns every violation found; in [`ValidationMode::Warn`] mode the caller may choose to
    /// log these and proceed instead of aborting.
    pub fn validate(&self) -> Vec<Error> {
        let mut errors = Vec::new();

        // 2. Type agreement on every edge.
        for edge in &self.edges {
            let source = match self.node(edge.source) {
                Ok(n) => n,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            let target = match self.node(edge.target) {
                Ok(n) => n,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            match source.output_type {
                Some(out) if out == edge.element_type => {}
                Some(out) => errors.push(Error::TypeMismatch {
                    source: edge.source,
                    target: edge.target,
                    output_type: out.name().to_string(),
                    input_type: edge.element_type.name().to_string(),
                }),
                None => errors.push(Error::TypeMismatch {
                    source: edge.source,
                    target: edge.target,
                    output_type: "<none>".to_string(),
                    input_type: edge.element_type.name().to_string(),
                }),
            }
            let target_port_type = target
                .input_ports
                .iter()
                .find(|(p, _)| *p == edge.target_port)
                .map(|(_, t)| *t);
            match target_port_type {
                Some(t) if t == edge.element_type => {}
                Some(t) => errors.push(Error::TypeMismatch {
                    source: edge.source,
                    target: edge.target,
                    output_type: edge.element_type.name().to_string(),
                    input_type: t.name().to_string(),
                }),
                None => errors.push(Error::UnknownPort {
                    node: edge.target,
                    port: edge.target_port.0.to_string(),
                }),
            }
        }

        // 4. Single-consumer invariant on every output port.
        let mut consumers: HashMap<(NodeId, PortName), usize> = HashMap::new();
        for edge in &self.edges {
            *consumers
                .entry((edge.source, edge.source_port.clone()))
                .or_insert(0) += 1;
        }
        for ((node, port), count) in consumers {
            if count > 1 {
                errors.push(Error::MultipleConsumers {
                    node,
                    port: port.0.to_string(),
                });
            }
        }

        // 3. Acyclicity.
        if let Err(cycle_node) = self.topological_order() {
            errors.push(Error::Cycle { node: cycle_node });
        }

        errors
    }

    /// Kahn's algorithm; returns the first node still un-orderable (participating in a cycle)
    /// as `Err`.
    fn topological_order(&self) -> Result<Vec<NodeId>, NodeId> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
        for edge in &self.edges {
            adjacency[edge.source.0 as usize].push(edge.target.0 as usize);
            in_degree[edge.target.0 as usize] += 1;
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(idx) = queue.pop_front() {
            order.push(NodeId(idx as u32));
            for &next in &adjacency[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() == n {
            Ok(order)
        } else {
            let stuck = (0..n)
                .find(|&i| in_degree[i] > 0)
                .expect("order.len() < n implies some in_degree remains positive");
            Err(NodeId(stuck as u32))
        }
    }

    /// Runs validation and, on success (or in [`ValidationMode::Warn`] mode), freezes the
    /// graph into a [`PipelineDefinition`].
    ///
    /// # Errors
    ///
    /// Returns every validation error in [`ValidationMode::Strict`] mode (the default). In
    /// [`ValidationMode::Warn`] mode, non-fatal checks (type mismatches and multi-consumer
    /// ports are still fatal; only node-count/name checks are soft) are ignored.
    pub fn build(self) -> Result<PipelineDefinition, Vec<Error>> {
        let errors = self.validate();
        if !errors.is_empty() && matches!(self.validation_mode, ValidationMode::Strict) {
            return Err(errors);
        }
        let order = self
            .topological_order()
            .map_err(|node| vec![Error::Cycle { node }])?;
        Ok(PipelineDefinition {
            nodes: self.nodes,
            edges: self.edges,
            order,
        })
    }
}

/// An immutable, validated graph ready for instantiation by the pipeline runner (spec §4.9
/// "On success, build() freezes the graph").
pub struct PipelineDefinition {
    nodes: Vec<NodeDef>,
    edges: Vec<EdgeSpec>,
    order: Vec<NodeId>,
}

impl PipelineDefinition {
    /// All node definitions.
    #[must_use]
    pub fn nodes(&self) -> &[NodeDef] {
        &self.nodes
    }

    /// All edges.
    #[must_use]
    pub fn edges(&self) -> &[EdgeSpec] {
        &self.edges
    }

    /// A valid topological order over the node set.
    #[must_use]
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Looks up a node definition by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&NodeDef> {
        self.nodes.get(id.0 as usize)
    }

    /// Edges whose source is `node`.
    pub fn outgoing(&self, node: NodeId) -> impl Iterator<Item = &EdgeSpec> {
        self.edges.iter().filter(move |e| e.source == node)
    }

    /// Edges whose target is `node`.
    pub fn incoming(&self, node: NodeId) -> impl Iterator<Item = &EdgeSpec> {
        self.edges.iter().filter(move |e| e.target == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;

    fn source_spec(name: &str) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            kind: NodeKind::Source,
            input_ports: Vec::new(),
            output_type: Some(TypeKey::of::<i32>()),
            declared_cardinality: None,
            merge_strategy: None,
            execution_strategy: ExecutionStrategy::Sequential,
            retry_options: None,
        }
    }

    fn sink_spec(name: &str) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            kind: NodeKind::Sink,
            input_ports: vec![(PortName::default(), TypeKey::of::<i32>())],
            output_type: None,
            declared_cardinality: None,
            merge_strategy: None,
            execution_strategy: ExecutionStrategy::Sequential,
            retry_options: None,
        }
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut b = GraphBuilder::default();
        b.add_node(source_spec("a")).unwrap();
        let err = b.add_node(source_spec("a")).unwrap_err();
        assert_eq!(
            err,
            Error::DuplicateNodeName {
                name: "a".to_string()
            }
        );
    }

    #[test]
    fn simple_source_sink_builds() {
        let mut b = GraphBuilder::default();
        let src = b.add_node(source_spec("src")).unwrap();
        let sink = b.add_node(sink_spec("sink")).unwrap();
        b.connect(
            src,
            PortName::default(),
            sink,
            PortName::default(),
            TypeKey::of::<i32>(),
        )
        .unwrap();
        let def = b.build().unwrap();
        assert_eq!(def.nodes().len(), 2);
        assert_eq!(def.topological_order(), &[src, sink]);
    }

    #[test]
    fn cycle_detected() {
        let mut b = GraphBuilder::default();
        let a = b
            .add_node(NodeSpec {
                input_ports: vec![(PortName::default(), TypeKey::of::<i32>())],
                ..source_spec("a")
            })
            .unwrap();
        let c = b
            .add_node(NodeSpec {
                input_ports: vec![(PortName::default(), TypeKey::of::<i32>())],
                ..source_spec("c")
            })
            .unwrap();
        b.connect(
            a,
            PortName::default(),
            c,
            PortName::default(),
            TypeKey::of::<i32>(),
        )
        .unwrap();
        b.connect(
            c,
            PortName::default(),
            a,
            PortName::default(),
            TypeKey::of::<i32>(),
        )
        .unwrap();
        let errors = b.build().unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, Error::Cycle { .. })));
    }

    #[test]
    fn type_mismatch_detected() {
        let mut b = GraphBuilder::default();
        let src = b.add_node(source_spec("src")).unwrap();
        let sink = b
            .add_node(NodeSpec {
                input_ports: vec![(PortName::default(), TypeKey::of::<String>())],
                ..sink_spec("sink")
            })
            .unwrap();
        b.connect(
            src,
            PortName::default(),
            sink,
            PortName::default(),
            TypeKey::of::<i32>(),
        )
        .unwrap();
        let errors = b.build().unwrap_err();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, Error::TypeMismatch { .. }))
        );
    }

    #[test]
    fn multiple_consumers_detected() {
        let mut b = GraphBuilder::default();
        let src = b.add_node(source_spec("src")).unwrap();
        let sink1 = b.add_node(sink_spec("sink1")).unwrap();
        let sink2 = b.add_node(sink_spec("sink2")).unwrap();
        b.connect(
            src,
            PortName::default(),
            sink1,
            PortName::default(),
            TypeKey::of::<i32>(),
        )
        .unwrap();
        b.connect(
            src,
            PortName::default(),
            sink2,
            PortName::default(),
            TypeKey::of::<i32>(),
        )
        .unwrap();
        let errors = b.build().unwrap_err();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, Error::MultipleConsumers { .. }))
        );
    }
}
