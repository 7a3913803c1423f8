#![deny(clippy::panic)]

//! EasyWork is a library for assembling and running typed, heterogeneous
//! dataflow graphs.
//!
//! A user declares nodes (sources, transforms, sinks), wires them by
//! applying named methods whose inputs and outputs carry static type
//! descriptors, and executes the resulting graph with a parallel scheduler:
//!
//! ```rust,no_run
//! use easywork::nodes::{CaptureText, IntToText, MultiplyBy, NumberSource};
//! use easywork::Pipeline;
//!
//! # fn main() -> Result<(), easywork::EasyWorkError> {
//! let src = NumberSource::node(0, 5, 1);
//! let triple = MultiplyBy::node(3);
//! let to_text = IntToText::node();
//! let (sink, _seen) = CaptureText::node();
//!
//! let mut pipeline = Pipeline::new();
//! {
//!     let (src, triple, to_text, sink) =
//!         (src.clone(), triple.clone(), to_text.clone(), sink.clone());
//!     pipeline.trace(move || {
//!         let x = src.apply_forward(&[])?;
//!         let x = triple.apply_forward(&[x])?;
//!         let x = to_text.apply_forward(&[x])?;
//!         sink.apply_forward(&[x])?;
//!         Ok(())
//!     })?;
//! }
//! pipeline.validate()?;
//! pipeline.open()?;
//! pipeline.run()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! * [`typing`](crate::typing) / [`Value`] — interned type descriptors and
//!   the move-only, small-buffer-optimized value bus.
//! * [`TypeInfo`] / [`MethodId`] — per-node-type method tables with stable
//!   hashed method ids.
//! * [`Node`] / [`Worker`] — multi-method nodes; eager [`Node::invoke`]
//!   outside a pipeline, traced [`Node::apply`] inside one.
//! * [`ExecutionGraph`] — one scheduler endpoint per (node, method), typed
//!   edges between them.
//! * [`Executor`] — the parallel scheduler: bounded per-input queues,
//!   backpressure, first-error cancellation, source quiescence.
//! * [`Pipeline`] — the trace → validate → build → connect → activate → run
//!   state machine, re-traceable between runs.

pub mod error;
mod executor;
mod graph;
mod method;
mod node;
pub mod nodes;
mod pipeline;
pub mod registry;
mod tuple;
pub mod typing;
mod utils;
mod value;

pub use crate::error::EasyWorkError;
pub use crate::executor::{CancelToken, Diagnostics, Executor};
pub use crate::graph::{EndpointId, ExecutionGraph};
pub use crate::method::{MethodId, MethodSpec, TypeInfo, TypeInfoBuilder};
pub use crate::node::{Emission, Node, Worker};
pub use crate::pipeline::{Pipeline, PipelineScope, PipelineState, Symbol};
pub use crate::registry::{Arguments, NodeFactory, create_node, register_node};
pub use crate::typing::{Payload, TypeDescriptor, descriptor_of, void_descriptor};
pub use crate::value::Value;

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
