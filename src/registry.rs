//! The node factory registry.
//!
//! A process-wide table maps node type names to factory functions. Factories
//! receive an [`Arguments`] bundle of positional and named values, consume
//! what they recognise with [`Arguments::take`] / [`Arguments::take_or`],
//! and call [`Arguments::finish`] so leftovers surface as
//! `UnknownParameter`. The built-in catalogue registers itself on first use.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{ConstructError, EasyWorkError};
use crate::node::Node;
use crate::typing::{Payload, descriptor_of};
use crate::value::Value;

/// Constructs one node instance from an argument bundle.
pub type NodeFactory = fn(Arguments) -> Result<Arc<Node>, EasyWorkError>;

/// Positional and named construction arguments for a node factory.
#[derive(Default)]
pub struct Arguments {
    node: String,
    positional: VecDeque<Value>,
    named: HashMap<String, Value>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    pub fn arg<T: Payload>(mut self, value: T) -> Self {
        self.positional.push_back(Value::new(value));
        self
    }

    /// Adds a named argument.
    pub fn named<T: Payload>(mut self, name: impl Into<String>, value: T) -> Self {
        self.named.insert(name.into(), Value::new(value));
        self
    }

    fn next(&mut self, name: &str) -> Option<Value> {
        self.named
            .remove(name)
            .or_else(|| self.positional.pop_front())
    }

    fn convert<T: Payload>(name: &str, value: Value) -> Result<T, ConstructError> {
        let found = value.descriptor().name();
        value.take::<T>().map_err(|_| ConstructError::ParameterType {
            name: name.to_string(),
            expected: descriptor_of::<T>().name(),
            found,
        })
    }

    /// Consumes a required parameter, by name or by position.
    pub fn take<T: Payload>(&mut self, name: &str) -> Result<T, ConstructError> {
        match self.next(name) {
            Some(value) => Self::convert(name, value),
            None => Err(ConstructError::MissingParameter {
                node: self.node.clone(),
                name: name.to_string(),
            }),
        }
    }

    /// Consumes an optional parameter, falling back to `default`.
    pub fn take_or<T: Payload>(&mut self, name: &str, default: T) -> Result<T, ConstructError> {
        match self.next(name) {
            Some(value) => Self::convert(name, value),
            None => Ok(default),
        }
    }

    /// Rejects any argument the factory did not recognise.
    pub fn finish(mut self) -> Result<(), ConstructError> {
        if self.positional.pop_front().is_some() {
            return Err(ConstructError::UnknownParameter {
                node: self.node,
                name: "<extra positional argument>".to_string(),
            });
        }
        if !self.named.is_empty() {
            let mut names: Vec<_> = self.named.keys().cloned().collect();
            names.sort();
            return Err(ConstructError::UnknownParameter {
                node: self.node,
                name: names.swap_remove(0),
            });
        }
        Ok(())
    }
}

fn table() -> &'static RwLock<HashMap<&'static str, NodeFactory>> {
    static TABLE: OnceLock<RwLock<HashMap<&'static str, NodeFactory>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(crate::nodes::builtin_factories()))
}

/// Registers (or replaces) a factory under `name`.
pub fn register_node(name: &'static str, factory: NodeFactory) {
    table().write().unwrap().insert(name, factory);
}

/// Instantiates a registered node type.
pub fn create_node(name: &str, mut args: Arguments) -> Result<Arc<Node>, EasyWorkError> {
    let factory = table()
        .read()
        .unwrap()
        .get(name)
        .copied()
        .ok_or_else(|| ConstructError::UnknownNodeType(name.to_string()))?;
    args.node = name.to_string();
    factory(args)
}
