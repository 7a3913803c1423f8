//! The concurrent scheduler graph.
//!
//! A node with M methods contributes M endpoints; edges connect a producer
//! endpoint to one input slot of a consumer endpoint. The graph itself is
//! passive data — the executor owns all runtime state (queues, in-flight
//! bookkeeping) so that `reset` can simply discard the structure and start
//! over.

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::error::EasyWorkError;
use crate::node::Emission;
use crate::typing::TypeDescriptor;
use crate::value::Value;

/// Identifier of one scheduler endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub(crate) NodeIndex);

/// The type-erased body invoked on each fire.
pub(crate) type EndpointBody =
    std::sync::Arc<dyn Fn(Vec<Value>) -> anyhow::Result<Emission> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndpointKind {
    /// Zero declared inputs; fires while activated, until it signals `Done`.
    Source,
    /// Fires when one value is available per declared input.
    Function,
}

pub(crate) struct Endpoint {
    pub label: String,
    pub kind: EndpointKind,
    pub inputs: Vec<&'static TypeDescriptor>,
    pub output: &'static TypeDescriptor,
    pub body: EndpointBody,
    /// Sources only emit once activated; function endpoints ignore this.
    pub active: bool,
}

/// Edge weight: which input slot of the consumer the edge delivers into.
pub(crate) struct EdgeSlot {
    pub input_index: usize,
}

/// The set of endpoints and typed edges built from a traced pipeline.
#[derive(Default)]
pub struct ExecutionGraph {
    pub(crate) graph: Graph<Endpoint, EdgeSlot>,
}

impl ExecutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_source_endpoint(
        &mut self,
        label: String,
        output: &'static TypeDescriptor,
        body: EndpointBody,
    ) -> EndpointId {
        EndpointId(self.graph.add_node(Endpoint {
            label,
            kind: EndpointKind::Source,
            inputs: Vec::new(),
            output,
            body,
            active: false,
        }))
    }

    pub(crate) fn add_function_endpoint(
        &mut self,
        label: String,
        inputs: Vec<&'static TypeDescriptor>,
        output: &'static TypeDescriptor,
        body: EndpointBody,
    ) -> EndpointId {
        EndpointId(self.graph.add_node(Endpoint {
            label,
            kind: EndpointKind::Function,
            inputs,
            output,
            body,
            active: false,
        }))
    }

    /// Wires `producer`'s output into input slot `input_index` of `consumer`.
    pub(crate) fn add_edge(
        &mut self,
        producer: EndpointId,
        consumer: EndpointId,
        input_index: usize,
    ) {
        self.graph
            .add_edge(producer.0, consumer.0, EdgeSlot { input_index });
    }

    /// Marks a source endpoint as emitting.
    pub(crate) fn activate(&mut self, endpoint: EndpointId) {
        self.graph[endpoint.0].active = true;
    }

    pub fn endpoint_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Rejects cyclic topologies. Back-edges would need bounded in-cycle
    /// buffers to be schedulable; this implementation refuses them outright.
    pub(crate) fn ensure_acyclic(&self) -> Result<(), EasyWorkError> {
        match petgraph::algo::toposort(&self.graph, None) {
            Ok(_) => Ok(()),
            Err(cycle) => Err(EasyWorkError::Cycle(
                self.graph[cycle.node_id()].label.clone(),
            )),
        }
    }

    /// Discards all endpoints and edges, returning the graph to a blank
    /// state usable for another build.
    pub fn reset(&mut self) {
        self.graph = Graph::new();
    }
}

impl std::fmt::Display for ExecutionGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let endpoint = &self.graph[index];
            let name = endpoint.label.replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_references() {
            let output = self.graph[edge.source()]
                .output
                .name()
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            writeln!(
                f,
                "    {:?} -- \"{}[{}]\" --> {:?}",
                edge.source().index(),
                output,
                edge.weight().input_index,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
