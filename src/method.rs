//! Method tables.
//!
//! Every node type carries a shared [`TypeInfo`]: its display name plus the
//! exposed methods in declaration order. Method ids are derived by hashing
//! the method name with BLAKE3 and keeping the first 8 bytes, so ids are
//! stable across builds and hosts and a dynamic front-end can resolve
//! `node.some_method(..)` to an id without any runtime codegen.

use std::sync::{Arc, OnceLock};

use crate::typing::TypeDescriptor;

/// Stable 64-bit identifier of a method name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(u64);

impl MethodId {
    /// Hashes `name` into its stable id.
    pub fn of(name: &str) -> MethodId {
        let digest = blake3::hash(name.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        MethodId(u64::from_le_bytes(bytes))
    }

    /// Id of the built-in `forward` method, the default target of anonymous
    /// application.
    pub fn forward() -> MethodId {
        static FORWARD: OnceLock<MethodId> = OnceLock::new();
        *FORWARD.get_or_init(|| MethodId::of("forward"))
    }
}

impl std::fmt::Debug for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MethodId({:#018x})", self.0)
    }
}

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// One declared method: name, id, positional input types, output type.
#[derive(Debug)]
pub struct MethodSpec {
    name: &'static str,
    id: MethodId,
    inputs: Vec<&'static TypeDescriptor>,
    output: &'static TypeDescriptor,
}

impl MethodSpec {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn inputs(&self) -> &[&'static TypeDescriptor] {
        &self.inputs
    }

    pub fn output(&self) -> &'static TypeDescriptor {
        self.output
    }

    /// A method with no declared inputs is a source; it is driven by
    /// activation rather than by arriving values.
    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Shared, immutable description of a node type.
#[derive(Debug)]
pub struct TypeInfo {
    name: &'static str,
    methods: Vec<MethodSpec>,
}

impl TypeInfo {
    pub fn builder(name: &'static str) -> TypeInfoBuilder {
        TypeInfoBuilder {
            name,
            methods: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Exposed methods in declaration order.
    pub fn methods(&self) -> &[MethodSpec] {
        &self.methods
    }

    pub fn method(&self, id: MethodId) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.id == id)
    }

    pub fn method_named(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.name == name)
    }
}

pub struct TypeInfoBuilder {
    name: &'static str,
    methods: Vec<MethodSpec>,
}

impl TypeInfoBuilder {
    /// Declares a method with positional inputs.
    pub fn method(
        mut self,
        name: &'static str,
        inputs: Vec<&'static TypeDescriptor>,
        output: &'static TypeDescriptor,
    ) -> Self {
        self.methods.push(MethodSpec {
            name,
            id: MethodId::of(name),
            inputs,
            output,
        });
        self
    }

    /// Declares a zero-input source method.
    pub fn source(self, name: &'static str, output: &'static TypeDescriptor) -> Self {
        self.method(name, Vec::new(), output)
    }

    pub fn finish(self) -> Arc<TypeInfo> {
        Arc::new(TypeInfo {
            name: self.name,
            methods: self.methods,
        })
    }
}
