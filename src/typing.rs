//! The type registry.
//!
//! Every payload type that crosses the value bus is described by an interned
//! [`TypeDescriptor`]. Within a process, interning makes pointer equality
//! equivalent to semantic equality; `PartialEq` and `Hash` are nevertheless
//! content-based (name, layout, components) so descriptors remain comparable
//! across translation boundaries.
//!
//! Descriptors double as the vtable of the type-erased [`Value`]: they carry
//! monomorphized drop, clone and (for tuples) split thunks. The clone thunk
//! exists because fan-out edges duplicate payloads; values on edges are
//! moved, never shared, so a producer with N outgoing edges must emit N
//! independently owned values.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::value::Value;

/// A payload that can travel through the value bus.
///
/// Implemented for the primitive types, `String`, `()` (the `void`
/// descriptor) and tuples of arity 2 to 4. User types opt in with an empty
/// `impl Payload for MyType {}`; tuples additionally report their components
/// so that tuple unpacking can synthesize projection nodes.
pub trait Payload: Clone + Send + 'static {
    /// Component descriptors, non-empty only for fixed-arity products.
    fn components() -> Vec<&'static TypeDescriptor> {
        Vec::new()
    }

    /// Explodes a product payload into its component values, in order.
    fn split(self) -> Vec<Value> {
        Vec::new()
    }
}

impl Payload for i64 {}
impl Payload for i32 {}
impl Payload for u64 {}
impl Payload for u32 {}
impl Payload for f64 {}
impl Payload for f32 {}
impl Payload for bool {}
impl Payload for char {}
impl Payload for String {}
impl Payload for () {}

macro_rules! impl_tuple_payload {
    ($($T:ident . $idx:tt),*) => {
        impl<$($T: Payload),*> Payload for ($($T,)*) {
            fn components() -> Vec<&'static TypeDescriptor> {
                vec![$(descriptor_of::<$T>()),*]
            }

            fn split(self) -> Vec<Value> {
                vec![$(Value::new(self.$idx)),*]
            }
        }
    };
}

impl_tuple_payload!(A.0, B.1);
impl_tuple_payload!(A.0, B.1, C.2);
impl_tuple_payload!(A.0, B.1, C.2, D.3);

/// Interned description of one payload type.
pub struct TypeDescriptor {
    name: &'static str,
    size: usize,
    align: usize,
    trivially_destructible: bool,
    components: Vec<&'static TypeDescriptor>,
    type_id: TypeId,
    pub(crate) drop_thunk: unsafe fn(*mut u8),
    pub(crate) clone_thunk: unsafe fn(*const u8) -> Value,
    split_thunk: Option<fn(Value) -> Vec<Value>>,
}

impl TypeDescriptor {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn is_trivially_destructible(&self) -> bool {
        self.trivially_destructible
    }

    /// Number of components for fixed-arity products, 0 otherwise.
    pub fn arity(&self) -> usize {
        self.components.len()
    }

    pub fn component(&self, index: usize) -> Option<&'static TypeDescriptor> {
        self.components.get(index).copied()
    }

    /// Whether this is the distinguished `void` descriptor. A `void` output
    /// carries no payload and prohibits outgoing edges.
    pub fn is_void(&self) -> bool {
        self.type_id == TypeId::of::<()>()
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Explodes a tuple-typed value into its components. Returns `None` for
    /// non-product descriptors or when `value` is not of this type.
    pub(crate) fn split_value(&'static self, value: Value) -> Option<Vec<Value>> {
        if value.descriptor().type_id != self.type_id {
            return None;
        }
        self.split_thunk.map(|thunk| thunk(value))
    }
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("arity", &self.arity())
            .finish()
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.size == other.size
            && self.align == other.align
            && self.components == other.components
    }
}

impl Eq for TypeDescriptor {}

impl std::hash::Hash for TypeDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.size.hash(state);
        self.align.hash(state);
        self.components.len().hash(state);
    }
}

fn registry() -> &'static Mutex<HashMap<TypeId, &'static TypeDescriptor>> {
    static REGISTRY: OnceLock<Mutex<HashMap<TypeId, &'static TypeDescriptor>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// Returns the interned descriptor for `T`, creating it on first use.
///
/// Descriptors are leaked; there is exactly one live allocation per payload
/// type per process, so returned references are `'static` and pointer
/// equality equals semantic equality.
pub fn descriptor_of<T: Payload>() -> &'static TypeDescriptor {
    let key = TypeId::of::<T>();
    {
        let map = registry().lock().unwrap();
        if let Some(descriptor) = map.get(&key) {
            return descriptor;
        }
    }

    // Interning the components of a nested product re-enters the registry,
    // so the lock must not be held while they resolve.
    let components = T::components();
    let has_components = !components.is_empty();
    let descriptor: &'static TypeDescriptor = Box::leak(Box::new(TypeDescriptor {
        name: std::any::type_name::<T>(),
        size: std::mem::size_of::<T>(),
        align: std::mem::align_of::<T>(),
        trivially_destructible: !std::mem::needs_drop::<T>(),
        components,
        type_id: key,
        drop_thunk: drop_thunk::<T>,
        clone_thunk: clone_thunk::<T>,
        split_thunk: has_components.then_some(split_thunk::<T> as fn(Value) -> Vec<Value>),
    }));

    let mut map = registry().lock().unwrap();
    *map.entry(key).or_insert(descriptor)
}

/// Returns the distinguished `void` descriptor.
pub fn void_descriptor() -> &'static TypeDescriptor {
    descriptor_of::<()>()
}

unsafe fn drop_thunk<T>(payload: *mut u8) {
    // SAFETY: the caller passes a pointer to a live, correctly aligned `T`
    // that is dropped exactly once.
    unsafe { std::ptr::drop_in_place(payload.cast::<T>()) }
}

unsafe fn clone_thunk<T: Payload>(payload: *const u8) -> Value {
    // SAFETY: the caller passes a pointer to a live, correctly aligned `T`.
    let copy = unsafe { &*payload.cast::<T>() }.clone();
    Value::new(copy)
}

fn split_thunk<T: Payload>(value: Value) -> Vec<Value> {
    value.take::<T>().map(Payload::split).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_are_interned() {
        let a = descriptor_of::<i64>();
        let b = descriptor_of::<i64>();
        assert!(std::ptr::eq(a, b));
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_types_differ() {
        assert_ne!(descriptor_of::<i64>(), descriptor_of::<u64>());
        assert_ne!(descriptor_of::<String>(), descriptor_of::<i64>());
    }

    #[test]
    fn layout_is_reflected() {
        let desc = descriptor_of::<i64>();
        assert_eq!(desc.size(), 8);
        assert_eq!(desc.align(), 8);
        assert!(desc.is_trivially_destructible());
        assert_eq!(desc.arity(), 0);

        assert!(!descriptor_of::<String>().is_trivially_destructible());
    }

    #[test]
    fn void_has_no_arity() {
        let void = void_descriptor();
        assert!(void.is_void());
        assert_eq!(void.arity(), 0);
        assert_eq!(void.size(), 0);
        assert!(!descriptor_of::<i64>().is_void());
    }

    #[test]
    fn tuple_components_resolve() {
        let pair = descriptor_of::<(i64, String)>();
        assert_eq!(pair.arity(), 2);
        assert!(std::ptr::eq(pair.component(0).unwrap(), descriptor_of::<i64>()));
        assert!(std::ptr::eq(
            pair.component(1).unwrap(),
            descriptor_of::<String>()
        ));
        assert!(pair.component(2).is_none());
    }

    #[test]
    fn tuple_split_preserves_order() {
        let pair = descriptor_of::<(i64, String)>();
        let value = Value::new((7_i64, String::from("seven")));
        let parts = pair.split_value(value).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(*parts[0].downcast_ref::<i64>().unwrap(), 7);
        assert_eq!(parts[1].downcast_ref::<String>().unwrap(), "seven");
    }

    #[test]
    fn split_rejects_foreign_values() {
        let pair = descriptor_of::<(i64, String)>();
        assert!(pair.split_value(Value::new(1_i64)).is_none());
        assert!(descriptor_of::<i64>().split_value(Value::new(1_i64)).is_none());
    }
}
