//! The node model.
//!
//! User behavior lives behind the [`Worker`] trait; [`Node`] wraps a worker
//! with everything the pipeline needs around it: the shared [`TypeInfo`],
//! per-method upstream bindings recorded during tracing, lifecycle flags and
//! the endpoint map filled in by `build`.
//!
//! Nodes are shared (`Arc`) between the pipeline, the scheduler graph and
//! the embedding host; the last owner to drop the node releases it. Endpoint
//! bodies capture their own `Arc`, so endpoint lifetime matches node
//! lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::{EasyWorkError, InvokeError};
use crate::graph::{EndpointBody, EndpointId, ExecutionGraph};
use crate::method::{MethodId, TypeInfo};
use crate::value::Value;

/// What one method invocation produced.
pub enum Emission {
    /// A value to push along the method's outgoing edges.
    Value(Value),
    /// Nothing; the method's output type is `void`.
    Void,
    /// Source termination: the endpoint signals completion.
    Done,
}

/// User-implemented node behavior.
///
/// A worker's state is mutated only from its own method bodies; the executor
/// guarantees a given (node, method) pair runs at most once concurrently,
/// but different methods of one node may overlap, so shared state must be
/// guarded internally.
pub trait Worker: Send + Sync {
    /// The shared type record: display name plus exposed methods in
    /// declaration order.
    fn info(&self) -> Arc<TypeInfo>;

    /// User lifecycle; runs once per open/close cycle.
    fn open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the pipeline activates. Sources typically rewind their
    /// cursor here so a re-run emits from the start.
    fn activate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invokes one method. Source methods receive an empty input vector and
    /// return [`Emission::Done`] once exhausted.
    fn call(&self, method: MethodId, inputs: Vec<Value>) -> anyhow::Result<Emission>;
}

/// One upstream binding of a consumer input slot.
#[derive(Clone)]
pub(crate) struct Upstream {
    pub producer: Arc<Node>,
    pub method: MethodId,
}

#[derive(Default)]
struct NodeState {
    /// Per consumer method, the producers bound to its input slots in
    /// positional order.
    bindings: HashMap<MethodId, Vec<Upstream>>,
    open: bool,
    built: bool,
    endpoints: HashMap<MethodId, EndpointId>,
}

/// A stateful unit of computation exposing one or more typed methods.
pub struct Node {
    id: u64,
    info: Arc<TypeInfo>,
    worker: Box<dyn Worker>,
    synthetic: bool,
    /// Back-reference to the owning `Arc`, for endpoint bodies and symbols.
    this: Weak<Node>,
    state: Mutex<NodeState>,
}

fn next_node_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

impl Node {
    /// Wraps `worker` into a shared node.
    pub fn new(worker: impl Worker + 'static) -> Arc<Node> {
        Self::with_flags(Box::new(worker), false)
    }

    /// Internal constructor for synthesized nodes (tuple projections), which
    /// are exempt from the user open check and auto-opened at creation.
    pub(crate) fn synthetic(worker: impl Worker + 'static) -> Arc<Node> {
        Self::with_flags(Box::new(worker), true)
    }

    fn with_flags(worker: Box<dyn Worker>, synthetic: bool) -> Arc<Node> {
        let info = worker.info();
        Arc::new_cyclic(|this| Node {
            id: next_node_id(),
            info,
            worker,
            synthetic,
            this: this.clone(),
            state: Mutex::new(NodeState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap()
    }

    /// The shared handle this node lives behind. Nodes are only ever
    /// constructed into an `Arc`, so the upgrade cannot fail.
    pub(crate) fn handle(&self) -> Arc<Node> {
        self.this.upgrade().unwrap()
    }

    /// Display label unique within the process, e.g. `NumberSource#3`.
    pub fn label(&self) -> String {
        format!("{}#{}", self.info.name(), self.id)
    }

    pub(crate) fn instance_id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn type_info(&self) -> Arc<TypeInfo> {
        self.info.clone()
    }

    fn unknown_method(&self, method: MethodId) -> InvokeError {
        InvokeError::UnknownMethod {
            node: self.label(),
            method: method.to_string(),
        }
    }

    /// Appends an upstream binding to `method`'s input list. The position of
    /// the appended entry is the input index it will feed.
    pub fn bind_input(
        &self,
        method: MethodId,
        producer: &Arc<Node>,
        producer_method: MethodId,
    ) -> Result<(), EasyWorkError> {
        if self.info.method(method).is_none() {
            return Err(self.unknown_method(method).into());
        }
        if producer.info.method(producer_method).is_none() {
            return Err(producer.unknown_method(producer_method).into());
        }
        self.state().bindings.entry(method).or_default().push(Upstream {
            producer: producer.clone(),
            method: producer_method,
        });
        Ok(())
    }

    /// Drops all recorded upstream bindings; the controller calls this when
    /// a new trace begins.
    pub fn clear_bindings(&self) {
        self.state().bindings.clear();
    }

    pub(crate) fn upstreams(&self, method: MethodId) -> Vec<Upstream> {
        self.state().bindings.get(&method).cloned().unwrap_or_default()
    }

    pub fn open(&self) -> Result<(), EasyWorkError> {
        let mut state = self.state();
        if !state.open {
            self.worker.open().map_err(|source| EasyWorkError::Runtime {
                node: self.label(),
                source,
            })?;
            state.open = true;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), EasyWorkError> {
        let mut state = self.state();
        if state.open {
            self.worker.close().map_err(|source| EasyWorkError::Runtime {
                node: self.label(),
                source,
            })?;
            state.open = false;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// Eager invocation, used outside any pipeline scope: validates the
    /// arguments against the method table, runs the method synchronously and
    /// returns its value (`None` when the output is `void`).
    pub fn invoke(
        &self,
        method: MethodId,
        args: Vec<Value>,
    ) -> Result<Option<Value>, EasyWorkError> {
        let spec = self
            .info
            .method(method)
            .ok_or_else(|| self.unknown_method(method))?;

        if args.len() != spec.inputs().len() {
            return Err(InvokeError::ArgCountMismatch {
                method: spec.name().to_string(),
                expected: spec.inputs().len(),
                found: args.len(),
            }
            .into());
        }
        for (index, (arg, expected)) in args.iter().zip(spec.inputs()).enumerate() {
            if arg.descriptor() != *expected {
                return Err(InvokeError::ArgTypeMismatch {
                    method: spec.name().to_string(),
                    index,
                    expected: expected.name(),
                    found: arg.descriptor().name(),
                }
                .into());
            }
        }

        let emission = self
            .worker
            .call(method, args)
            .map_err(|source| EasyWorkError::Runtime {
                node: self.label(),
                source,
            })?;
        match emission {
            Emission::Value(value) => Ok(Some(value)),
            Emission::Void | Emission::Done => Ok(None),
        }
    }

    /// Materialises this node's endpoints into `graph`, one per declared
    /// method. Subsequent calls are no-ops until the built flag is cleared
    /// by a pipeline reset.
    pub fn build(&self, graph: &mut ExecutionGraph) {
        let mut state = self.state();
        if state.built {
            return;
        }

        for spec in self.info.methods() {
            let body: EndpointBody = {
                let node = self.handle();
                let id = spec.id();
                Arc::new(move |inputs| node.worker.call(id, inputs))
            };
            let label = format!("{}.{}", self.label(), spec.name());
            let endpoint = if spec.is_source() {
                graph.add_source_endpoint(label, spec.output(), body)
            } else {
                graph.add_function_endpoint(label, spec.inputs().to_vec(), spec.output(), body)
            };
            state.endpoints.insert(spec.id(), endpoint);
        }
        state.built = true;
    }

    pub(crate) fn endpoint(&self, method: MethodId) -> Option<EndpointId> {
        self.state().endpoints.get(&method).copied()
    }

    /// Replays this node's recorded bindings as scheduler edges. All
    /// involved nodes must have been built.
    pub fn connect(&self, graph: &mut ExecutionGraph) -> Result<(), EasyWorkError> {
        // Snapshot under the lock; resolving producer endpoints takes the
        // producers' locks, and a self-edge would otherwise deadlock here.
        let (bindings, endpoints) = {
            let state = self.state();
            let bindings: Vec<(MethodId, Vec<Upstream>)> = state
                .bindings
                .iter()
                .map(|(method, upstreams)| (*method, upstreams.clone()))
                .collect();
            (bindings, state.endpoints.clone())
        };

        for (method, upstreams) in bindings {
            let Some(consumer) = endpoints.get(&method).copied() else {
                return Err(EasyWorkError::Lifecycle(format!(
                    "`{}` must be built before connect",
                    self.label()
                )));
            };
            for (input_index, upstream) in upstreams.iter().enumerate() {
                let Some(producer) = upstream.producer.endpoint(upstream.method) else {
                    return Err(EasyWorkError::Lifecycle(format!(
                        "`{}` must be built before connect",
                        upstream.producer.label()
                    )));
                };
                graph.add_edge(producer, consumer, input_index);
            }
        }
        Ok(())
    }

    /// Starts this node's source endpoints; function endpoints no-op.
    pub fn activate(&self, graph: &mut ExecutionGraph) -> Result<(), EasyWorkError> {
        self.worker
            .activate()
            .map_err(|source| EasyWorkError::Runtime {
                node: self.label(),
                source,
            })?;
        let state = self.state();
        for spec in self.info.methods() {
            if spec.is_source()
                && let Some(endpoint) = state.endpoints.get(&spec.id())
            {
                graph.activate(*endpoint);
            }
        }
        Ok(())
    }

    pub(crate) fn reset_build(&self) {
        let mut state = self.state();
        state.built = false;
        state.endpoints.clear();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Node")
            .field("label", &self.label())
            .field("open", &state.open)
            .field("built", &state.built)
            .field("synthetic", &self.synthetic)
            .finish()
    }
}
