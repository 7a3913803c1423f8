//! The built-in node catalogue.
//!
//! Small, dependency-free nodes used by the tests and by embedders as
//! building blocks. Worker state sits behind a `Mutex` because different
//! methods of one node may fire concurrently; a single method never
//! overlaps with itself.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, OnceLock};

use crate::method::{MethodId, TypeInfo};
use crate::node::{Emission, Node, Worker};
use crate::registry::{Arguments, NodeFactory};
use crate::typing::{Payload, TypeDescriptor, descriptor_of, void_descriptor};
use crate::value::Value;

fn one_input(inputs: Vec<Value>) -> anyhow::Result<Value> {
    inputs
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("dispatcher delivered no input"))
}

/// Emits `start, start + step, ..` while below `max`.
pub struct NumberSource {
    start: i64,
    max: i64,
    step: i64,
    cursor: Mutex<i64>,
}

impl NumberSource {
    pub fn node(start: i64, max: i64, step: i64) -> Arc<Node> {
        Node::new(NumberSource {
            start,
            max,
            step,
            cursor: Mutex::new(start),
        })
    }
}

impl Worker for NumberSource {
    fn info(&self) -> Arc<TypeInfo> {
        static INFO: OnceLock<Arc<TypeInfo>> = OnceLock::new();
        INFO.get_or_init(|| {
            TypeInfo::builder("NumberSource")
                .source("forward", descriptor_of::<i64>())
                .finish()
        })
        .clone()
    }

    fn activate(&self) -> anyhow::Result<()> {
        // Rewind so a re-run emits the full sequence again.
        *self.cursor.lock().unwrap() = self.start;
        Ok(())
    }

    fn call(&self, _method: MethodId, _inputs: Vec<Value>) -> anyhow::Result<Emission> {
        let mut cursor = self.cursor.lock().unwrap();
        if *cursor >= self.max {
            return Ok(Emission::Done);
        }
        let value = *cursor;
        *cursor += self.step;
        Ok(Emission::Value(Value::new(value)))
    }
}

pub struct MultiplyBy {
    factor: i64,
}

impl MultiplyBy {
    pub fn node(factor: i64) -> Arc<Node> {
        Node::new(MultiplyBy { factor })
    }
}

impl Worker for MultiplyBy {
    fn info(&self) -> Arc<TypeInfo> {
        static INFO: OnceLock<Arc<TypeInfo>> = OnceLock::new();
        INFO.get_or_init(|| {
            TypeInfo::builder("MultiplyBy")
                .method("forward", vec![descriptor_of::<i64>()], descriptor_of::<i64>())
                .finish()
        })
        .clone()
    }

    fn call(&self, _method: MethodId, inputs: Vec<Value>) -> anyhow::Result<Emission> {
        let n = one_input(inputs)?.take::<i64>()?;
        Ok(Emission::Value(Value::new(n * self.factor)))
    }
}

pub struct IntToText;

impl IntToText {
    pub fn node() -> Arc<Node> {
        Node::new(IntToText)
    }
}

impl Worker for IntToText {
    fn info(&self) -> Arc<TypeInfo> {
        static INFO: OnceLock<Arc<TypeInfo>> = OnceLock::new();
        INFO.get_or_init(|| {
            TypeInfo::builder("IntToText")
                .method("forward", vec![descriptor_of::<i64>()], descriptor_of::<String>())
                .finish()
        })
        .clone()
    }

    fn call(&self, _method: MethodId, inputs: Vec<Value>) -> anyhow::Result<Emission> {
        let n = one_input(inputs)?.take::<i64>()?;
        Ok(Emission::Value(Value::new(n.to_string())))
    }
}

pub struct PrefixText {
    prefix: String,
}

impl PrefixText {
    pub fn node(prefix: impl Into<String>) -> Arc<Node> {
        Node::new(PrefixText {
            prefix: prefix.into(),
        })
    }
}

impl Worker for PrefixText {
    fn info(&self) -> Arc<TypeInfo> {
        static INFO: OnceLock<Arc<TypeInfo>> = OnceLock::new();
        INFO.get_or_init(|| {
            TypeInfo::builder("PrefixText")
                .method(
                    "forward",
                    vec![descriptor_of::<String>()],
                    descriptor_of::<String>(),
                )
                .finish()
        })
        .clone()
    }

    fn call(&self, _method: MethodId, inputs: Vec<Value>) -> anyhow::Result<Emission> {
        let text = one_input(inputs)?.take::<String>()?;
        Ok(Emission::Value(Value::new(format!("{}{}", self.prefix, text))))
    }
}

/// Emits `(n, n.to_string())` pairs while `n` is below `max`.
pub struct PairEmitter {
    start: i64,
    max: i64,
    cursor: Mutex<i64>,
}

impl PairEmitter {
    pub fn node(start: i64, max: i64) -> Arc<Node> {
        Node::new(PairEmitter {
            start,
            max,
            cursor: Mutex::new(start),
        })
    }
}

impl Worker for PairEmitter {
    fn info(&self) -> Arc<TypeInfo> {
        static INFO: OnceLock<Arc<TypeInfo>> = OnceLock::new();
        INFO.get_or_init(|| {
            TypeInfo::builder("PairEmitter")
                .source("forward", descriptor_of::<(i64, String)>())
                .finish()
        })
        .clone()
    }

    fn activate(&self) -> anyhow::Result<()> {
        *self.cursor.lock().unwrap() = self.start;
        Ok(())
    }

    fn call(&self, _method: MethodId, _inputs: Vec<Value>) -> anyhow::Result<Emission> {
        let mut cursor = self.cursor.lock().unwrap();
        if *cursor >= self.max {
            return Ok(Emission::Done);
        }
        let n = *cursor;
        *cursor += 1;
        Ok(Emission::Value(Value::new((n, n.to_string()))))
    }
}

/// Joins a number and a text into `"{n}:{s}"`.
pub struct PairJoiner;

impl PairJoiner {
    pub fn node() -> Arc<Node> {
        Node::new(PairJoiner)
    }
}

impl Worker for PairJoiner {
    fn info(&self) -> Arc<TypeInfo> {
        static INFO: OnceLock<Arc<TypeInfo>> = OnceLock::new();
        INFO.get_or_init(|| {
            TypeInfo::builder("PairJoiner")
                .method(
                    "forward",
                    vec![descriptor_of::<i64>(), descriptor_of::<String>()],
                    descriptor_of::<String>(),
                )
                .finish()
        })
        .clone()
    }

    fn call(&self, _method: MethodId, inputs: Vec<Value>) -> anyhow::Result<Emission> {
        let mut inputs = inputs.into_iter();
        let n = inputs
            .next()
            .ok_or_else(|| anyhow::anyhow!("dispatcher delivered no input"))?
            .take::<i64>()?;
        let s = inputs
            .next()
            .ok_or_else(|| anyhow::anyhow!("dispatcher delivered one input"))?
            .take::<String>()?;
        Ok(Emission::Value(Value::new(format!("{n}:{s}"))))
    }
}

/// Consumes and discards values of one declared type.
pub struct NullSink {
    info: Arc<TypeInfo>,
}

impl NullSink {
    pub fn node(input: &'static TypeDescriptor) -> Arc<Node> {
        Node::new(NullSink {
            info: TypeInfo::builder("NullSink")
                .method("forward", vec![input], void_descriptor())
                .finish(),
        })
    }
}

impl Worker for NullSink {
    fn info(&self) -> Arc<TypeInfo> {
        self.info.clone()
    }

    fn call(&self, _method: MethodId, _inputs: Vec<Value>) -> anyhow::Result<Emission> {
        Ok(Emission::Void)
    }
}

/// Records every text it consumes, for observation in tests and demos.
pub struct CaptureText {
    seen: Arc<Mutex<Vec<String>>>,
}

impl CaptureText {
    /// Returns the node and the shared observation log.
    pub fn node() -> (Arc<Node>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let node = Node::new(CaptureText { seen: seen.clone() });
        (node, seen)
    }
}

impl Worker for CaptureText {
    fn info(&self) -> Arc<TypeInfo> {
        static INFO: OnceLock<Arc<TypeInfo>> = OnceLock::new();
        INFO.get_or_init(|| {
            TypeInfo::builder("CaptureText")
                .method("forward", vec![descriptor_of::<String>()], void_descriptor())
                .finish()
        })
        .clone()
    }

    fn call(&self, _method: MethodId, inputs: Vec<Value>) -> anyhow::Result<Emission> {
        let text = one_input(inputs)?.take::<String>()?;
        self.seen.lock().unwrap().push(text);
        Ok(Emission::Void)
    }
}

struct FnWorker<A, R, F> {
    f: F,
    info: Arc<TypeInfo>,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R, F> Worker for FnWorker<A, R, F>
where
    A: Payload,
    R: Payload,
    F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
{
    fn info(&self) -> Arc<TypeInfo> {
        self.info.clone()
    }

    fn call(&self, _method: MethodId, inputs: Vec<Value>) -> anyhow::Result<Emission> {
        let input = one_input(inputs)?.take::<A>()?;
        let output = (self.f)(input)?;
        if descriptor_of::<R>().is_void() {
            Ok(Emission::Void)
        } else {
            Ok(Emission::Value(Value::new(output)))
        }
    }
}

/// Wraps a closure as a single-method function node, `forward: A -> R`.
/// With `R = ()` the node becomes a sink.
pub fn func<A, R, F>(f: F) -> Arc<Node>
where
    A: Payload,
    R: Payload,
    F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
{
    let info = TypeInfo::builder("Func")
        .method("forward", vec![descriptor_of::<A>()], descriptor_of::<R>())
        .finish();
    Node::new(FnWorker {
        f,
        info,
        _marker: PhantomData,
    })
}

pub(crate) fn builtin_factories() -> HashMap<&'static str, NodeFactory> {
    let mut table: HashMap<&'static str, NodeFactory> = HashMap::new();
    table.insert("NumberSource", |mut args| {
        let start = args.take_or::<i64>("start", 0)?;
        let max = args.take::<i64>("max")?;
        let step = args.take_or::<i64>("step", 1)?;
        args.finish()?;
        Ok(NumberSource::node(start, max, step))
    });
    table.insert("MultiplyBy", |mut args| {
        let factor = args.take::<i64>("factor")?;
        args.finish()?;
        Ok(MultiplyBy::node(factor))
    });
    table.insert("IntToText", |args| {
        args.finish()?;
        Ok(IntToText::node())
    });
    table.insert("PrefixText", |mut args| {
        let prefix = args.take::<String>("prefix")?;
        args.finish()?;
        Ok(PrefixText::node(prefix))
    });
    table.insert("PairEmitter", |mut args| {
        let start = args.take_or::<i64>("start", 0)?;
        let max = args.take::<i64>("max")?;
        args.finish()?;
        Ok(PairEmitter::node(start, max))
    });
    table.insert("PairJoiner", |args| {
        args.finish()?;
        Ok(PairJoiner::node())
    });
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_source_terminates_and_rewinds() {
        let src = NumberSource::node(0, 3, 1);
        let forward = MethodId::forward();

        let mut produced = Vec::new();
        while let Some(value) = src.invoke(forward, vec![]).unwrap() {
            produced.push(value.take::<i64>().unwrap());
        }
        assert_eq!(produced, vec![0, 1, 2]);

        // Exhausted until something re-activates it.
        assert!(src.invoke(forward, vec![]).unwrap().is_none());
    }

    #[test]
    fn pair_emitter_produces_matching_components() {
        let pairs = PairEmitter::node(5, 7);
        let (n, s) = pairs
            .invoke(MethodId::forward(), vec![])
            .unwrap()
            .unwrap()
            .take::<(i64, String)>()
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(s, "5");
    }

    #[test]
    fn func_wraps_a_closure() {
        let negate = func(|n: i64| Ok(-n));
        let out = negate
            .invoke(MethodId::forward(), vec![Value::new(4_i64)])
            .unwrap()
            .unwrap();
        assert_eq!(out.take::<i64>().unwrap(), -4);
    }

    #[test]
    fn func_with_unit_output_is_a_sink() {
        let sink = func(|_: i64| Ok(()));
        let out = sink
            .invoke(MethodId::forward(), vec![Value::new(4_i64)])
            .unwrap();
        assert!(out.is_none());

        let spec_output = sink.type_info();
        assert!(spec_output.method_named("forward").unwrap().output().is_void());
    }
}
