//! The pipeline controller.
//!
//! A [`Pipeline`] walks one execution graph through its lifecycle:
//!
//! ```text
//! Idle    --trace-->    Traced
//! Traced  --validate--> Validated | Error
//! Validated --build--> Built
//! Built   --connect--> Connected
//! Connected --activate--> Active
//! Active  --run-->     Running --quiesce--> Stopped
//! Any     --reset-->   Idle
//! ```
//!
//! `trace` installs a thread-local "active pipeline" binding (nestable, with
//! save/restore semantics) and runs the user's topology closure. Inside that
//! scope, [`Node::apply`] records an edge binding and returns a [`Symbol`];
//! outside any scope the same node executes eagerly through
//! [`Node::invoke`]. `run` after `Stopped` or `Error` resets the graph and
//! re-traces the stored topology, so dynamic topologies between runs work
//! without extra ceremony.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::{EasyWorkError, EdgeFault, InvokeError, ValidationError};
use crate::executor::{CancelToken, Diagnostics, Executor};
use crate::graph::ExecutionGraph;
use crate::method::MethodId;
use crate::node::Node;
use crate::tuple::TupleGet;

/// A host-side handle for a traced producer: (producer node, producer
/// method, optional tuple component index).
#[derive(Clone, Debug)]
pub struct Symbol {
    producer: Arc<Node>,
    method: MethodId,
    component: Option<usize>,
}

impl Symbol {
    pub fn producer(&self) -> &Arc<Node> {
        &self.producer
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Selects component `index` of a tuple-typed output. Consuming the
    /// returned symbol routes through a synthesized projection node.
    pub fn component(&self, index: usize) -> Result<Symbol, EasyWorkError> {
        if self.component.is_some() {
            return Err(EasyWorkError::Lifecycle(
                "nested tuple unpacking is not supported".to_string(),
            ));
        }
        let info = self.producer.type_info();
        let output = info
            .method(self.method)
            .ok_or_else(|| InvokeError::UnknownMethod {
                node: self.producer.label(),
                method: self.method.to_string(),
            })?
            .output();
        if index >= output.arity() {
            return Err(InvokeError::Component {
                descriptor: output.name(),
                index,
            }
            .into());
        }
        Ok(Symbol {
            producer: self.producer.clone(),
            method: self.method,
            component: Some(index),
        })
    }

    /// Unpacks a tuple-typed output into one symbol per component.
    pub fn unpack(&self) -> Result<Vec<Symbol>, EasyWorkError> {
        let info = self.producer.type_info();
        let arity = info
            .method(self.method)
            .map(|spec| spec.output().arity())
            .unwrap_or(0);
        if arity == 0 {
            let name = info
                .method(self.method)
                .map(|spec| spec.output().name())
                .unwrap_or("?");
            return Err(InvokeError::Component {
                descriptor: name,
                index: 0,
            }
            .into());
        }
        (0..arity).map(|index| self.component(index)).collect()
    }
}

thread_local! {
    static ACTIVE: RefCell<Vec<Arc<PipelineShared>>> = const { RefCell::new(Vec::new()) };
}

fn current_scope() -> Option<Arc<PipelineShared>> {
    ACTIVE.with(|stack| stack.borrow().last().cloned())
}

/// Guard for one level of the active-pipeline stack; restores the previous
/// binding on drop, so scopes nest.
pub struct PipelineScope {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for PipelineScope {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

pub(crate) struct PipelineShared {
    recorder: Mutex<Recorder>,
}

#[derive(Default)]
struct Recorder {
    /// User nodes in first-seen order.
    nodes: Vec<Arc<Node>>,
    /// Synthesized projection nodes in creation order.
    synthetic: Vec<Arc<Node>>,
    seen: HashSet<u64>,
    /// (producer id, producer method, component) -> projection node; at most
    /// one per key within a trace.
    tuple_gets: HashMap<(u64, MethodId, usize), Arc<Node>>,
}

impl Recorder {
    fn register(&mut self, node: &Arc<Node>) {
        if self.seen.insert(node.instance_id()) && !node.is_synthetic() {
            self.nodes.push(node.clone());
        }
    }

    /// Resolves a symbol to the (producer, method) pair edges should record,
    /// synthesizing the tuple projection when a component is selected.
    fn resolve(&mut self, symbol: &Symbol) -> Result<(Arc<Node>, MethodId), EasyWorkError> {
        let Some(index) = symbol.component else {
            return Ok((symbol.producer.clone(), symbol.method));
        };

        let key = (symbol.producer.instance_id(), symbol.method, index);
        if let Some(existing) = self.tuple_gets.get(&key) {
            return Ok((existing.clone(), MethodId::forward()));
        }

        let info = symbol.producer.type_info();
        let output = info
            .method(symbol.method)
            .ok_or_else(|| InvokeError::UnknownMethod {
                node: symbol.producer.label(),
                method: symbol.method.to_string(),
            })?
            .output();
        let projection = TupleGet::node(output, index)?;
        projection.bind_input(MethodId::forward(), &symbol.producer, symbol.method)?;
        self.register(&symbol.producer);
        self.synthetic.push(projection.clone());
        self.tuple_gets.insert(key, projection.clone());
        Ok((projection, MethodId::forward()))
    }
}

impl Node {
    /// Traced application: records one edge binding per argument symbol on
    /// the innermost active pipeline and returns the symbolic result.
    ///
    /// This is the second half of the eager/traced duality — the host calls
    /// [`Node::invoke`] outside a pipeline scope and `apply` inside one.
    pub fn apply(&self, method: MethodId, args: &[Symbol]) -> Result<Symbol, EasyWorkError> {
        let Some(shared) = current_scope() else {
            return Err(EasyWorkError::Lifecycle(
                "no active pipeline scope; use `invoke` for eager execution".to_string(),
            ));
        };

        let info = self.type_info();
        let spec = info.method(method).ok_or_else(|| InvokeError::UnknownMethod {
            node: self.label(),
            method: method.to_string(),
        })?;
        if args.len() != spec.inputs().len() {
            return Err(InvokeError::ArgCountMismatch {
                method: spec.name().to_string(),
                expected: spec.inputs().len(),
                found: args.len(),
            }
            .into());
        }

        let this = self.handle();
        let mut recorder = shared.recorder.lock().unwrap();
        for arg in args {
            let (producer, producer_method) = recorder.resolve(arg)?;
            self.bind_input(method, &producer, producer_method)?;
            recorder.register(&producer);
        }
        recorder.register(&this);

        Ok(Symbol {
            producer: this,
            method,
            component: None,
        })
    }

    /// Anonymous traced application targeting the `forward` method.
    pub fn apply_forward(&self, args: &[Symbol]) -> Result<Symbol, EasyWorkError> {
        self.apply(MethodId::forward(), args)
    }
}

/// Lifecycle states of a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Traced,
    Validated,
    Built,
    Connected,
    Active,
    Running,
    Stopped,
    Error,
}

/// The controller orchestrating one execution graph's lifecycle.
pub struct Pipeline {
    shared: Arc<PipelineShared>,
    graph: ExecutionGraph,
    executor: Executor,
    cancel: CancelToken,
    topology: Option<Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>>,
    state: PipelineState,
    validated: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline {
            shared: Arc::new(PipelineShared {
                recorder: Mutex::new(Recorder::default()),
            }),
            graph: ExecutionGraph::new(),
            executor: Executor::new(),
            cancel: CancelToken::new(),
            topology: None,
            state: PipelineState::Idle,
            validated: false,
        }
    }

    /// Replaces the executor configuration (buffer capacity etc.).
    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    /// The cancellation token observed by `run` (the SIGINT analogue).
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Number of user nodes recorded by the last trace.
    pub fn recorded_nodes(&self) -> usize {
        self.shared.recorder.lock().unwrap().nodes.len()
    }

    /// Installs this pipeline as the innermost active scope. Applications of
    /// nodes inside the scope record bindings here; scopes nest and restore
    /// the previous binding when the guard drops.
    pub fn scope(&self) -> PipelineScope {
        ACTIVE.with(|stack| stack.borrow_mut().push(self.shared.clone()));
        PipelineScope {
            _not_send: std::marker::PhantomData,
        }
    }

    fn user_nodes(&self) -> Vec<Arc<Node>> {
        self.shared.recorder.lock().unwrap().nodes.clone()
    }

    fn all_nodes(&self) -> Vec<Arc<Node>> {
        let recorder = self.shared.recorder.lock().unwrap();
        recorder
            .nodes
            .iter()
            .chain(recorder.synthetic.iter())
            .cloned()
            .collect()
    }

    /// Stores `topology` and traces it: clears previous bindings and
    /// synthetic nodes, installs the scope, runs the closure.
    pub fn trace<F>(&mut self, topology: F) -> Result<(), EasyWorkError>
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        match self.state {
            PipelineState::Idle | PipelineState::Traced => {}
            PipelineState::Stopped | PipelineState::Error => self.release_graph(),
            other => {
                return Err(EasyWorkError::Lifecycle(format!(
                    "cannot trace from {other:?}"
                )));
            }
        }
        self.topology = Some(Box::new(topology));
        self.retrace()
    }

    fn retrace(&mut self) -> Result<(), EasyWorkError> {
        {
            let mut recorder = self.shared.recorder.lock().unwrap();
            for node in recorder.nodes.iter().chain(recorder.synthetic.iter()) {
                node.clear_bindings();
            }
            *recorder = Recorder::default();
        }

        let Some(topology) = self.topology.as_ref() else {
            return Err(EasyWorkError::Lifecycle("no topology recorded".to_string()));
        };
        {
            let _scope = self.scope();
            topology().map_err(EasyWorkError::Trace)?;
        }

        debug!(nodes = self.recorded_nodes(), "topology traced");
        self.state = PipelineState::Traced;
        self.validated = false;
        Ok(())
    }

    /// Checks every recorded binding against the method tables. All faults
    /// are collected before the aggregate error is raised, and two runs over
    /// the same topology report the same list.
    pub fn validate(&mut self) -> Result<(), EasyWorkError> {
        if !matches!(
            self.state,
            PipelineState::Traced | PipelineState::Validated | PipelineState::Error
        ) {
            return Err(EasyWorkError::Lifecycle(format!(
                "cannot validate from {:?}",
                self.state
            )));
        }

        let mut faults = Vec::new();
        for node in self.all_nodes() {
            let info = node.type_info();
            for spec in info.methods() {
                let upstreams = node.upstreams(spec.id());
                if upstreams.is_empty() {
                    continue;
                }
                if upstreams.len() != spec.inputs().len() {
                    faults.push(EdgeFault::ArityMismatch {
                        consumer: node.label(),
                        consumer_method: spec.name(),
                        expected: spec.inputs().len(),
                        found: upstreams.len(),
                    });
                    continue;
                }
                for (input_index, (upstream, expected)) in
                    upstreams.iter().zip(spec.inputs()).enumerate()
                {
                    let producer_info = upstream.producer.type_info();
                    let Some(producer_spec) = producer_info.method(upstream.method) else {
                        continue;
                    };
                    if producer_spec.output().is_void() {
                        faults.push(EdgeFault::VoidProducer {
                            consumer: node.label(),
                            consumer_method: spec.name(),
                            input_index,
                            producer: upstream.producer.label(),
                            producer_method: producer_spec.name(),
                        });
                    } else if producer_spec.output() != *expected {
                        faults.push(EdgeFault::TypeMismatch {
                            consumer: node.label(),
                            consumer_method: spec.name(),
                            input_index,
                            producer: upstream.producer.label(),
                            producer_method: producer_spec.name(),
                            expected: expected.name(),
                            found: producer_spec.output().name(),
                        });
                    }
                }
            }
        }

        if faults.is_empty() {
            self.validated = true;
            self.state = PipelineState::Validated;
            Ok(())
        } else {
            self.state = PipelineState::Error;
            Err(ValidationError { faults }.into())
        }
    }

    /// Materialises endpoints for every recorded node, synthetic projections
    /// included. Idempotent until the next reset.
    pub fn build(&mut self) -> Result<(), EasyWorkError> {
        if !matches!(self.state, PipelineState::Validated | PipelineState::Built) {
            return Err(EasyWorkError::Lifecycle(format!(
                "cannot build from {:?}",
                self.state
            )));
        }
        for node in self.all_nodes() {
            node.build(&mut self.graph);
        }
        self.state = PipelineState::Built;
        Ok(())
    }

    /// Replays recorded bindings as scheduler edges and rejects cycles.
    pub fn connect(&mut self) -> Result<(), EasyWorkError> {
        if self.state != PipelineState::Built {
            return Err(EasyWorkError::Lifecycle(format!(
                "cannot connect from {:?}",
                self.state
            )));
        }
        for node in self.all_nodes() {
            if let Err(error) = node.connect(&mut self.graph) {
                self.state = PipelineState::Error;
                return Err(error);
            }
        }
        if let Err(error) = self.graph.ensure_acyclic() {
            self.state = PipelineState::Error;
            return Err(error);
        }
        self.state = PipelineState::Connected;
        Ok(())
    }

    /// Verifies every user node is open, then starts the sources.
    pub fn activate(&mut self) -> Result<(), EasyWorkError> {
        if self.state != PipelineState::Connected {
            return Err(EasyWorkError::Lifecycle(format!(
                "cannot activate from {:?}",
                self.state
            )));
        }

        let closed: Vec<String> = self
            .user_nodes()
            .iter()
            .filter(|node| !node.is_open())
            .map(|node| node.label())
            .collect();
        if !closed.is_empty() {
            self.state = PipelineState::Error;
            return Err(EasyWorkError::NotOpened(closed));
        }

        for node in self.all_nodes() {
            if let Err(error) = node.activate(&mut self.graph) {
                self.state = PipelineState::Error;
                return Err(error);
            }
        }
        self.state = PipelineState::Active;
        Ok(())
    }

    /// Opens every user node recorded so far.
    pub fn open(&self) -> Result<(), EasyWorkError> {
        for node in self.user_nodes() {
            node.open()?;
        }
        Ok(())
    }

    /// Closes every user node recorded so far.
    pub fn close(&self) -> Result<(), EasyWorkError> {
        for node in self.user_nodes() {
            node.close()?;
        }
        Ok(())
    }

    /// Drives the pipeline to quiescence and returns the run diagnostics.
    ///
    /// From `Stopped` or `Error` the graph is rebuilt from scratch: reset,
    /// re-trace of the stored topology, validate, build, connect, activate.
    /// Stepwise phases already performed by the host are not repeated.
    pub fn run(&mut self) -> Result<Diagnostics, EasyWorkError> {
        match self.state {
            PipelineState::Idle => {
                return Err(EasyWorkError::Lifecycle(
                    "nothing traced; call `trace` first".to_string(),
                ));
            }
            PipelineState::Running => {
                return Err(EasyWorkError::Lifecycle("pipeline is already running".to_string()));
            }
            // Stepwise hosts may have activated already.
            PipelineState::Active => {}
            PipelineState::Stopped | PipelineState::Error => {
                self.release_graph();
                self.retrace()?;
            }
            PipelineState::Traced
            | PipelineState::Validated
            | PipelineState::Built
            | PipelineState::Connected => {}
        }

        if self.state == PipelineState::Traced {
            self.validate()?;
        }
        if self.state == PipelineState::Validated {
            self.build()?;
        }
        if self.state == PipelineState::Built {
            self.connect()?;
        }
        if self.state == PipelineState::Connected {
            self.activate()?;
        }

        info!(
            endpoints = self.graph.endpoint_count(),
            edges = self.graph.edge_count(),
            "running pipeline"
        );
        self.state = PipelineState::Running;
        let result = self.executor.run(&self.graph, &self.cancel);
        self.validated = false;
        self.state = PipelineState::Stopped;
        result
    }

    /// Releases the graph and per-node built flags, keeping node objects.
    pub fn reset(&mut self) {
        self.release_graph();
        self.state = PipelineState::Idle;
    }

    fn release_graph(&mut self) {
        self.graph.reset();
        for node in self.all_nodes() {
            node.reset_build();
        }
        self.validated = false;
    }
}
