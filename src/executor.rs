//! The parallel executor.
//!
//! The thread calling [`Executor::run`] becomes the scheduler: it owns every
//! endpoint's input queues and bookkeeping, spawns each fire as a task on
//! the rayon pool, and drains results from an mpsc channel. Workers never
//! touch shared scheduler state, so the loop needs no locks of its own.
//!
//! The algorithm:
//! 1. Activated source endpoints are seeded as the initial fires.
//! 2. The main thread waits for any fire to complete.
//! 3. A completed fire's output is routed to its outgoing edges; fan-out
//!    duplicates the payload so each edge delivers an owned value.
//! 4. Every endpoint that became ready — inputs available, one fire at a
//!    time, room in every downstream queue — is spawned immediately.
//! 5. The loop ends at quiescence: sources done, nothing ready, nothing in
//!    flight. The first captured error cancels the rest, waits for in-flight
//!    fires and is re-raised.
//!
//! Backpressure suspends the push before it happens: an endpoint only fires
//! when every downstream slot has room, so queues never exceed capacity and
//! stalled producers hold no thread.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Sender, channel};
use std::time::{Duration, Instant};

use petgraph::visit::EdgeRef;
use tracing::{Level, debug, span, trace};

use crate::error::EasyWorkError;
use crate::graph::{EndpointBody, EndpointKind, ExecutionGraph};
use crate::node::Emission;
use crate::value::Value;

/// Cooperative cancellation flag shared between `run` and the embedding
/// host (the SIGINT analogue). The executor observes it between fires,
/// stops accepting new ones, lets in-flight fires finish and returns
/// cleanly.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What a run did: per-endpoint fire counts, wall-clock duration, and
/// whether an external interrupt cut it short.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub fires: HashMap<String, u64>,
    pub duration: Duration,
    pub interrupted: bool,
}

impl Diagnostics {
    pub fn total_fires(&self) -> u64 {
        self.fires.values().sum()
    }
}

/// Drives an [`ExecutionGraph`] to quiescence on the rayon pool.
#[derive(Debug, Clone)]
pub struct Executor {
    capacity: usize,
}

impl Default for Executor {
    fn default() -> Self {
        Executor { capacity: 16 }
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-input buffer capacity (minimum 1).
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Runs until quiescence, first error, or external cancellation.
    pub fn run(
        &self,
        graph: &ExecutionGraph,
        cancel: &CancelToken,
    ) -> Result<Diagnostics, EasyWorkError> {
        let infos: Vec<EndpointRun> = graph
            .graph
            .node_indices()
            .map(|index| {
                let endpoint = &graph.graph[index];
                EndpointRun {
                    label: endpoint.label.clone(),
                    kind: endpoint.kind,
                    active: endpoint.active,
                    body: endpoint.body.clone(),
                    n_inputs: endpoint.inputs.len(),
                    outgoing: graph
                        .graph
                        .edges(index)
                        .map(|edge| (edge.target().index(), edge.weight().input_index))
                        .collect(),
                }
            })
            .collect();

        let mut states: Vec<EndpointState> = infos
            .iter()
            .map(|info| EndpointState {
                busy: false,
                done: false,
                queues: (0..info.n_inputs).map(|_| VecDeque::new()).collect(),
            })
            .collect();

        let mut fire_counts = vec![0u64; infos.len()];
        let mut first_error: Option<(String, anyhow::Error)> = None;
        let mut in_flight = 0usize;
        let started = Instant::now();

        let root_span = span!(Level::DEBUG, "run_graph", endpoints = infos.len());
        let _enter = root_span.enter();

        rayon::scope(|scope| {
            // The channel lives inside the scope so the receiver stays on
            // the scheduler thread; only sender clones cross into tasks.
            let (result_sender, result_receiver) = channel::<FireResult>();

            scan_and_spawn(
                scope,
                &infos,
                &mut states,
                self.capacity,
                &result_sender,
                &mut in_flight,
            );

            while in_flight > 0 {
                // Senders outlive the loop (we hold one), so recv cannot fail.
                let (index, result) = result_receiver.recv().unwrap();
                in_flight -= 1;
                states[index].busy = false;
                fire_counts[index] += 1;

                match result {
                    Err(source) => {
                        if first_error.is_none() {
                            debug!(endpoint = %infos[index].label, "fire failed, cancelling");
                            first_error = Some((infos[index].label.clone(), source));
                        }
                    }
                    Ok(Emission::Done) => states[index].done = true,
                    Ok(Emission::Void) => {}
                    Ok(Emission::Value(value)) => {
                        if first_error.is_none() && !cancel.is_cancelled() {
                            route(index, value, &infos, &mut states);
                        }
                    }
                }

                if first_error.is_none() && !cancel.is_cancelled() {
                    scan_and_spawn(
                        scope,
                        &infos,
                        &mut states,
                        self.capacity,
                        &result_sender,
                        &mut in_flight,
                    );
                }
            }
        });

        if let Some((node, source)) = first_error {
            return Err(EasyWorkError::Runtime { node, source });
        }

        let diagnostics = Diagnostics {
            fires: infos
                .iter()
                .zip(&fire_counts)
                .map(|(info, &count)| (info.label.clone(), count))
                .collect(),
            duration: started.elapsed(),
            interrupted: cancel.is_cancelled(),
        };
        debug!(
            fires = diagnostics.total_fires(),
            interrupted = diagnostics.interrupted,
            "graph quiescent"
        );
        Ok(diagnostics)
    }
}

type FireResult = (usize, anyhow::Result<Emission>);

struct EndpointRun {
    label: String,
    kind: EndpointKind,
    active: bool,
    body: EndpointBody,
    n_inputs: usize,
    /// (consumer endpoint index, consumer input slot) per outgoing edge.
    outgoing: Vec<(usize, usize)>,
}

struct EndpointState {
    busy: bool,
    done: bool,
    queues: Vec<VecDeque<Value>>,
}

fn endpoint_ready(
    infos: &[EndpointRun],
    states: &[EndpointState],
    capacity: usize,
    index: usize,
) -> bool {
    let info = &infos[index];
    let state = &states[index];
    if state.busy {
        return false;
    }
    let has_room = info
        .outgoing
        .iter()
        .all(|&(target, slot)| states[target].queues[slot].len() < capacity);
    match info.kind {
        EndpointKind::Source => info.active && !state.done && has_room,
        EndpointKind::Function => state.queues.iter().all(|q| !q.is_empty()) && has_room,
    }
}

/// Spawns every ready endpoint. Inputs are popped here, on the scheduler
/// thread, which keeps per-edge FIFO intact and frees queue room for the
/// producers upstream.
fn scan_and_spawn<'s>(
    scope: &rayon::Scope<'s>,
    infos: &[EndpointRun],
    states: &mut [EndpointState],
    capacity: usize,
    sender: &Sender<FireResult>,
    in_flight: &mut usize,
) {
    for index in 0..infos.len() {
        if !endpoint_ready(infos, states, capacity, index) {
            continue;
        }

        let inputs: Vec<Value> = states[index]
            .queues
            .iter_mut()
            .map(|queue| queue.pop_front().unwrap())
            .collect();
        states[index].busy = true;
        *in_flight += 1;

        let body = infos[index].body.clone();
        let sender = sender.clone();
        scope.spawn(move |_| {
            trace!(endpoint = index, "fire");
            // Panics inside node bodies must not take the pool down; they
            // are captured and surfaced like any other node error.
            let result = match catch_unwind(AssertUnwindSafe(|| body(inputs))) {
                Ok(result) => result,
                Err(panic) => Err(panic_to_error(panic)),
            };
            let _ = sender.send((index, result));
        });
    }
}

fn route(index: usize, value: Value, infos: &[EndpointRun], states: &mut [EndpointState]) {
    let outgoing = &infos[index].outgoing;
    let Some((&(last_target, last_slot), rest)) = outgoing.split_last() else {
        // No consumers; the value is dropped here.
        return;
    };
    for &(target, slot) in rest {
        states[target].queues[slot].push_back(value.duplicate());
    }
    states[last_target].queues[last_slot].push_back(value);
}

fn panic_to_error(panic: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    if let Some(message) = panic.downcast_ref::<&str>() {
        anyhow::anyhow!("node panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        anyhow::anyhow!("node panicked: {message}")
    } else {
        anyhow::anyhow!("node panicked with unknown payload")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::graph::ExecutionGraph;
    use crate::typing::{descriptor_of, void_descriptor};

    fn counting_source(limit: i64) -> EndpointBody {
        let cursor = Mutex::new(0_i64);
        Arc::new(move |_| {
            let mut cursor = cursor.lock().unwrap();
            if *cursor >= limit {
                Ok(Emission::Done)
            } else {
                let value = *cursor;
                *cursor += 1;
                Ok(Emission::Value(Value::new(value)))
            }
        })
    }

    fn collecting_sink(store: &Arc<Mutex<Vec<i64>>>) -> EndpointBody {
        let store = store.clone();
        Arc::new(move |inputs| {
            for input in inputs {
                store.lock().unwrap().push(input.take::<i64>()?);
            }
            Ok(Emission::Void)
        })
    }

    fn run_graph(graph: &ExecutionGraph) -> Result<Diagnostics, EasyWorkError> {
        Executor::new().run(graph, &CancelToken::new())
    }

    #[test]
    fn empty_graph_is_immediately_quiescent() {
        let graph = ExecutionGraph::new();
        let diagnostics = run_graph(&graph).unwrap();
        assert_eq!(diagnostics.total_fires(), 0);
        assert!(!diagnostics.interrupted);
    }

    #[test]
    fn inactive_sources_do_not_fire() {
        let mut graph = ExecutionGraph::new();
        graph.add_source_endpoint("idle.forward".into(), descriptor_of::<i64>(), counting_source(5));
        let diagnostics = run_graph(&graph).unwrap();
        assert_eq!(diagnostics.total_fires(), 0);
    }

    #[test]
    fn per_edge_fifo_is_preserved() {
        let mut graph = ExecutionGraph::new();
        let store = Arc::new(Mutex::new(Vec::new()));

        let src = graph.add_source_endpoint("src.forward".into(), descriptor_of::<i64>(), counting_source(100));
        let sink = graph.add_function_endpoint(
            "sink.forward".into(),
            vec![descriptor_of::<i64>()],
            void_descriptor(),
            collecting_sink(&store),
        );
        graph.add_edge(src, sink, 0);
        graph.activate(src);

        run_graph(&graph).unwrap();
        let seen = store.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<i64>>());
    }

    #[test]
    fn capacity_one_still_delivers_everything() {
        let mut graph = ExecutionGraph::new();
        let store = Arc::new(Mutex::new(Vec::new()));

        let src = graph.add_source_endpoint("src.forward".into(), descriptor_of::<i64>(), counting_source(50));
        let sink = graph.add_function_endpoint(
            "sink.forward".into(),
            vec![descriptor_of::<i64>()],
            void_descriptor(),
            collecting_sink(&store),
        );
        graph.add_edge(src, sink, 0);
        graph.activate(src);

        Executor::new()
            .with_capacity(1)
            .run(&graph, &CancelToken::new())
            .unwrap();
        assert_eq!(*store.lock().unwrap(), (0..50).collect::<Vec<i64>>());
    }

    #[test]
    fn fan_out_duplicates_to_every_consumer() {
        let mut graph = ExecutionGraph::new();
        let left = Arc::new(Mutex::new(Vec::new()));
        let right = Arc::new(Mutex::new(Vec::new()));

        let src = graph.add_source_endpoint("src.forward".into(), descriptor_of::<i64>(), counting_source(3));
        let sink_l = graph.add_function_endpoint(
            "left.forward".into(),
            vec![descriptor_of::<i64>()],
            void_descriptor(),
            collecting_sink(&left),
        );
        let sink_r = graph.add_function_endpoint(
            "right.forward".into(),
            vec![descriptor_of::<i64>()],
            void_descriptor(),
            collecting_sink(&right),
        );
        graph.add_edge(src, sink_l, 0);
        graph.add_edge(src, sink_r, 0);
        graph.activate(src);

        run_graph(&graph).unwrap();
        assert_eq!(*left.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(*right.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn join_pairs_inputs_in_order() {
        let mut graph = ExecutionGraph::new();
        let store = Arc::new(Mutex::new(Vec::new()));

        let a = graph.add_source_endpoint("a.forward".into(), descriptor_of::<i64>(), counting_source(3));
        let tens = Mutex::new(0_i64);
        let b = graph.add_source_endpoint(
            "b.forward".into(),
            descriptor_of::<i64>(),
            Arc::new(move |_| {
                let mut cursor = tens.lock().unwrap();
                if *cursor >= 30 {
                    Ok(Emission::Done)
                } else {
                    *cursor += 10;
                    Ok(Emission::Value(Value::new(*cursor)))
                }
            }),
        );
        let join = {
            let store = store.clone();
            graph.add_function_endpoint(
                "join.forward".into(),
                vec![descriptor_of::<i64>(), descriptor_of::<i64>()],
                void_descriptor(),
                Arc::new(move |inputs| {
                    let mut inputs = inputs.into_iter();
                    let x = inputs.next().unwrap().take::<i64>()?;
                    let y = inputs.next().unwrap().take::<i64>()?;
                    store.lock().unwrap().push(x + y);
                    Ok(Emission::Void)
                }),
            )
        };
        graph.add_edge(a, join, 0);
        graph.add_edge(b, join, 1);
        graph.activate(a);
        graph.activate(b);

        run_graph(&graph).unwrap();
        assert_eq!(*store.lock().unwrap(), vec![10, 21, 32]);
    }

    #[test]
    fn first_error_is_reraised() {
        let mut graph = ExecutionGraph::new();

        let src = graph.add_source_endpoint("src.forward".into(), descriptor_of::<i64>(), counting_source(100));
        let sink = graph.add_function_endpoint(
            "fragile.forward".into(),
            vec![descriptor_of::<i64>()],
            void_descriptor(),
            Arc::new(|inputs| {
                let mut inputs = inputs.into_iter();
                let n = inputs.next().unwrap().take::<i64>()?;
                if n >= 3 {
                    anyhow::bail!("value {n} is out of range");
                }
                Ok(Emission::Void)
            }),
        );
        graph.add_edge(src, sink, 0);
        graph.activate(src);

        let err = run_graph(&graph).unwrap_err();
        match err {
            EasyWorkError::Runtime { node, source } => {
                assert_eq!(node, "fragile.forward");
                assert!(source.to_string().contains("out of range"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn panics_are_captured_as_errors() {
        let mut graph = ExecutionGraph::new();

        let src = graph.add_source_endpoint("src.forward".into(), descriptor_of::<i64>(), counting_source(1));
        let sink = graph.add_function_endpoint(
            "panicky.forward".into(),
            vec![descriptor_of::<i64>()],
            void_descriptor(),
            Arc::new(|_| std::panic::panic_any("boom".to_string())),
        );
        graph.add_edge(src, sink, 0);
        graph.activate(src);

        let err = run_graph(&graph).unwrap_err();
        match err {
            EasyWorkError::Runtime { node, source } => {
                assert_eq!(node, "panicky.forward");
                assert!(source.to_string().contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cancellation_returns_cleanly() {
        let mut graph = ExecutionGraph::new();
        let cancel = CancelToken::new();
        let seen = Arc::new(Mutex::new(0_u64));

        // An endless source; only the token stops this graph.
        let src = graph.add_source_endpoint(
            "endless.forward".into(),
            descriptor_of::<i64>(),
            Arc::new(|_| Ok(Emission::Value(Value::new(1_i64)))),
        );
        let sink = {
            let cancel = cancel.clone();
            let seen = seen.clone();
            graph.add_function_endpoint(
                "sink.forward".into(),
                vec![descriptor_of::<i64>()],
                void_descriptor(),
                Arc::new(move |_| {
                    let mut seen = seen.lock().unwrap();
                    *seen += 1;
                    if *seen >= 10 {
                        cancel.cancel();
                    }
                    Ok(Emission::Void)
                }),
            )
        };
        graph.add_edge(src, sink, 0);
        graph.activate(src);

        let diagnostics = Executor::new().run(&graph, &cancel).unwrap();
        assert!(diagnostics.interrupted);
        assert!(*seen.lock().unwrap() >= 10);
    }
}
