//! Tuple projection nodes.
//!
//! Methods are strictly single-output, so unpacking a tuple-typed output
//! goes through a synthesized `TupleGet` node per requested component: its
//! `forward` method consumes the tuple and emits the i-th component. The
//! pipeline guarantees one projection node per (producer, method, component)
//! within a trace.

use std::sync::Arc;

use crate::error::{EasyWorkError, InvokeError};
use crate::method::{MethodId, TypeInfo};
use crate::node::{Emission, Node, Worker};
use crate::typing::TypeDescriptor;
use crate::value::Value;

pub(crate) struct TupleGet {
    info: Arc<TypeInfo>,
    tuple: &'static TypeDescriptor,
    index: usize,
}

impl TupleGet {
    /// Builds the projection node for component `index` of `tuple`.
    pub(crate) fn node(
        tuple: &'static TypeDescriptor,
        index: usize,
    ) -> Result<Arc<Node>, EasyWorkError> {
        let component = tuple.component(index).ok_or(InvokeError::Component {
            descriptor: tuple.name(),
            index,
        })?;
        let info = TypeInfo::builder("TupleGet")
            .method("forward", vec![tuple], component)
            .finish();
        let node = Node::synthetic(TupleGet { info, tuple, index });
        node.open()?;
        Ok(node)
    }
}

impl Worker for TupleGet {
    fn info(&self) -> Arc<TypeInfo> {
        self.info.clone()
    }

    fn call(&self, _method: MethodId, inputs: Vec<Value>) -> anyhow::Result<Emission> {
        let mut inputs = inputs.into_iter();
        let tuple = inputs
            .next()
            .ok_or_else(|| anyhow::anyhow!("projection received no input"))?;
        let mut parts = self
            .tuple
            .split_value(tuple)
            .ok_or_else(|| anyhow::anyhow!("`{}` is not a product type", self.tuple.name()))?;
        if self.index >= parts.len() {
            anyhow::bail!("`{}` has no component {}", self.tuple.name(), self.index);
        }
        Ok(Emission::Value(parts.swap_remove(self.index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typing::descriptor_of;

    #[test]
    fn projects_one_component() {
        let pair = descriptor_of::<(i64, String)>();

        let first = TupleGet::node(pair, 0).unwrap();
        let out = first
            .invoke(
                MethodId::forward(),
                vec![Value::new((9_i64, String::from("nine")))],
            )
            .unwrap()
            .unwrap();
        assert_eq!(out.take::<i64>().unwrap(), 9);

        let second = TupleGet::node(pair, 1).unwrap();
        let out = second
            .invoke(
                MethodId::forward(),
                vec![Value::new((9_i64, String::from("nine")))],
            )
            .unwrap()
            .unwrap();
        assert_eq!(out.take::<String>().unwrap(), "nine");
    }

    #[test]
    fn rejects_out_of_range_components() {
        let pair = descriptor_of::<(i64, String)>();
        assert!(matches!(
            TupleGet::node(pair, 2),
            Err(EasyWorkError::Invoke(InvokeError::Component { index: 2, .. }))
        ));
        assert!(TupleGet::node(descriptor_of::<i64>(), 0).is_err());
    }

    #[test]
    fn projection_nodes_are_synthetic_and_open() {
        let pair = descriptor_of::<(i64, String)>();
        let node = TupleGet::node(pair, 0).unwrap();
        assert!(node.is_synthetic());
        assert!(node.is_open());
    }
}
