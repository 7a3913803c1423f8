//! The type-erased value bus.
//!
//! A [`Value`] owns exactly one payload instance. Small payloads live in an
//! inline buffer; everything else goes through one heap allocation. Moves are
//! bitwise and never re-allocate, a moved-from value is empty, and the
//! payload destructor runs exactly once regardless of where it was stored.
//!
//! This is the only module (together with the thunks in [`crate::typing`])
//! that uses `unsafe`; every operation is guarded by the descriptor's
//! `TypeId` before any pointer is cast.

use std::alloc::Layout;
use std::any::TypeId;
use std::mem::MaybeUninit;
use std::ptr::NonNull;

use crate::error::InvokeError;
use crate::typing::{Payload, TypeDescriptor, descriptor_of, void_descriptor};

/// Inline storage capacity in bytes. Holds a pair of machine words or a
/// `String` header without touching the allocator.
pub(crate) const INLINE_CAP: usize = 24;

/// Maximum payload alignment the inline buffer satisfies.
pub(crate) const INLINE_ALIGN: usize = 8;

#[repr(C, align(8))]
struct InlineBuf([MaybeUninit<u8>; INLINE_CAP]);

enum Storage {
    /// Moved-from, or the `void` payload.
    Empty,
    Inline(InlineBuf),
    Heap(NonNull<u8>),
}

/// A move-only, type-erased container for one payload.
pub struct Value {
    desc: &'static TypeDescriptor,
    storage: Storage,
}

// SAFETY: every payload entering a `Value` is constrained to `Send` by the
// `Payload` bound on `new`, and the drop/clone thunks are monomorphized for
// that same payload type.
unsafe impl Send for Value {}

impl Value {
    /// Wraps `payload`, choosing inline storage when the layout fits.
    pub fn new<T: Payload>(payload: T) -> Value {
        let desc = descriptor_of::<T>();
        if desc.is_void() {
            return Value {
                desc,
                storage: Storage::Empty,
            };
        }

        let storage = if size_of::<T>() <= INLINE_CAP && align_of::<T>() <= INLINE_ALIGN {
            let mut buf = InlineBuf([MaybeUninit::uninit(); INLINE_CAP]);
            // SAFETY: the buffer is at least `size_of::<T>()` bytes and its
            // alignment covers `align_of::<T>()`.
            unsafe { std::ptr::write(buf.0.as_mut_ptr().cast::<T>(), payload) };
            Storage::Inline(buf)
        } else {
            let layout = Layout::new::<T>();
            let ptr = if layout.size() == 0 {
                // Zero-sized but over-aligned payloads need no allocation,
                // only a well-aligned dangling pointer.
                NonNull::<T>::dangling().cast::<u8>()
            } else {
                // SAFETY: `layout` has non-zero size.
                let raw = unsafe { std::alloc::alloc(layout) };
                let Some(ptr) = NonNull::new(raw) else {
                    std::alloc::handle_alloc_error(layout);
                };
                ptr
            };
            // SAFETY: `ptr` is valid for writes of `T` and correctly aligned.
            unsafe { std::ptr::write(ptr.as_ptr().cast::<T>(), payload) };
            Storage::Heap(ptr)
        };

        Value { desc, storage }
    }

    /// The payload-less `void` value.
    pub fn void() -> Value {
        Value {
            desc: void_descriptor(),
            storage: Storage::Empty,
        }
    }

    pub fn descriptor(&self) -> &'static TypeDescriptor {
        self.desc
    }

    pub fn is_void(&self) -> bool {
        self.desc.is_void()
    }

    /// True for moved-from values. A `void` value is not considered empty.
    pub fn is_empty(&self) -> bool {
        matches!(self.storage, Storage::Empty) && !self.desc.is_void()
    }

    fn payload_ptr(&self) -> Option<*mut u8> {
        match &self.storage {
            Storage::Empty => None,
            Storage::Inline(buf) => Some(buf.0.as_ptr() as *mut u8),
            Storage::Heap(ptr) => Some(ptr.as_ptr()),
        }
    }

    /// Borrows the payload as `T`.
    pub fn downcast_ref<T: Payload>(&self) -> Result<&T, InvokeError> {
        if self.desc.type_id() != TypeId::of::<T>() {
            return Err(InvokeError::ValueType {
                expected: descriptor_of::<T>().name(),
                found: self.desc.name(),
            });
        }
        let ptr = self.payload_ptr().ok_or(InvokeError::EmptyValue)?;
        // SAFETY: the `TypeId` check above proves the stored payload is a
        // live `T`, and the pointer satisfies `T`'s alignment.
        Ok(unsafe { &*ptr.cast::<T>() })
    }

    /// Moves the payload out. On a type mismatch the value is consumed and
    /// its payload destroyed.
    pub fn take<T: Payload>(mut self) -> Result<T, InvokeError> {
        if self.desc.type_id() != TypeId::of::<T>() {
            return Err(InvokeError::ValueType {
                expected: descriptor_of::<T>().name(),
                found: self.desc.name(),
            });
        }
        if self.desc.is_void() {
            // SAFETY: `T` is `()` here (the `TypeId`s matched); reading a
            // zero-sized payload from a dangling pointer is a no-op.
            return Ok(unsafe { std::ptr::read(NonNull::<T>::dangling().as_ptr()) });
        }

        match std::mem::replace(&mut self.storage, Storage::Empty) {
            Storage::Empty => Err(InvokeError::EmptyValue),
            // SAFETY (both arms): the payload is a live `T`; replacing the
            // storage with `Empty` transfers ownership to the read, so the
            // destructor will not run a second time on drop.
            Storage::Inline(buf) => Ok(unsafe { std::ptr::read(buf.0.as_ptr().cast::<T>()) }),
            Storage::Heap(ptr) => {
                let payload = unsafe { std::ptr::read(ptr.as_ptr().cast::<T>()) };
                let layout = Layout::new::<T>();
                if layout.size() != 0 {
                    // SAFETY: allocated in `new` with this exact layout.
                    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
                }
                Ok(payload)
            }
        }
    }

    /// Produces an independently owned copy through the descriptor's clone
    /// thunk. Fan-out edges use this; per edge the payload has one owner.
    pub fn duplicate(&self) -> Value {
        match self.payload_ptr() {
            None => Value {
                desc: self.desc,
                storage: Storage::Empty,
            },
            // SAFETY: the pointer references the live payload this
            // descriptor was interned for.
            Some(ptr) => unsafe { (self.desc.clone_thunk)(ptr) },
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.storage, Storage::Empty) {
            Storage::Empty => {}
            Storage::Inline(mut buf) => {
                if !self.desc.is_trivially_destructible() {
                    // SAFETY: the buffer holds the live payload; the storage
                    // was replaced with `Empty`, so this runs exactly once.
                    unsafe { (self.desc.drop_thunk)(buf.0.as_mut_ptr().cast()) };
                }
            }
            Storage::Heap(ptr) => {
                if !self.desc.is_trivially_destructible() {
                    // SAFETY: as above.
                    unsafe { (self.desc.drop_thunk)(ptr.as_ptr()) };
                }
                let layout =
                    Layout::from_size_align(self.desc.size(), self.desc.align()).unwrap();
                if layout.size() != 0 {
                    // SAFETY: allocated in `new` with this exact layout.
                    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
                }
            }
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.storage {
            Storage::Empty if self.desc.is_void() => write!(f, "Value(void)"),
            Storage::Empty => write!(f, "Value(<moved> {})", self.desc.name()),
            Storage::Inline(_) => write!(f, "Value({}, inline)", self.desc.name()),
            Storage::Heap(_) => write!(f, "Value({}, heap)", self.desc.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;

    /// Payload whose clones and drops adjust a shared live-count.
    #[derive(Debug)]
    struct Canary {
        tag: i64,
        live: Arc<AtomicI64>,
    }

    impl Canary {
        fn new(tag: i64, live: &Arc<AtomicI64>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Canary {
                tag,
                live: live.clone(),
            }
        }
    }

    impl Clone for Canary {
        fn clone(&self) -> Self {
            self.live.fetch_add(1, Ordering::SeqCst);
            Canary {
                tag: self.tag,
                live: self.live.clone(),
            }
        }
    }

    impl Drop for Canary {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl Payload for Canary {}

    #[test]
    fn small_payloads_stay_inline() {
        let pair = Value::new((1_i64, 2_i64));
        assert!(matches!(pair.storage, Storage::Inline(_)));

        let text = Value::new(String::from("inline header"));
        assert!(matches!(text.storage, Storage::Inline(_)));
    }

    #[test]
    fn large_payloads_go_to_the_heap() {
        let value = Value::new((3_i64, String::from("three")));
        assert!(matches!(value.storage, Storage::Heap(_)));
        let (n, s) = value.take::<(i64, String)>().unwrap();
        assert_eq!((n, s.as_str()), (3, "three"));
    }

    #[test]
    fn roundtrip_preserves_payload() {
        let value = Value::new(41_i64);
        assert_eq!(*value.downcast_ref::<i64>().unwrap(), 41);
        assert_eq!(value.take::<i64>().unwrap(), 41);
    }

    #[test]
    fn downcast_checks_the_descriptor() {
        let value = Value::new(1_i64);
        let err = value.downcast_ref::<String>().unwrap_err();
        assert!(matches!(err, InvokeError::ValueType { .. }));
    }

    #[test]
    fn void_carries_no_payload() {
        let value = Value::void();
        assert!(value.is_void());
        assert!(!value.is_empty());
        assert!(matches!(
            value.downcast_ref::<()>(),
            Err(InvokeError::EmptyValue)
        ));
        Value::void().take::<()>().unwrap();
    }

    #[test]
    fn destructor_runs_exactly_once() {
        let live = Arc::new(AtomicI64::new(0));
        {
            let _value = Value::new(Canary::new(0, &live));
            assert_eq!(live.load(Ordering::SeqCst), 1);
        }
        assert_eq!(live.load(Ordering::SeqCst), 0);

        // Taking the payload out transfers ownership; dropping the taken
        // payload is the single destruction.
        let value = Value::new(Canary::new(1, &live));
        let canary = value.take::<Canary>().unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);
        drop(canary);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn mismatched_take_destroys_the_payload() {
        let live = Arc::new(AtomicI64::new(0));
        let value = Value::new(Canary::new(2, &live));
        assert!(value.take::<i64>().is_err());
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn duplicate_is_independent() {
        let live = Arc::new(AtomicI64::new(0));
        let original = Value::new(Canary::new(7, &live));
        let copy = original.duplicate();
        assert_eq!(live.load(Ordering::SeqCst), 2);

        drop(original);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(copy.downcast_ref::<Canary>().unwrap().tag, 7);
        drop(copy);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
