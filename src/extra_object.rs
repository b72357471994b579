//! Sidecar records attached to objects that need more than a header: currently weak
//! reference bookkeeping.
//!
//! A sidecar is owned by the [`ExtraObjectDataFactory`] and points back at its base object.
//! It lives until the base object is finalized, at which point the finalizer thread uninstalls
//! and destroys it. While uninstalled but still linked, a sidecar has no base and the extra
//! object sweep treats it as marked.
use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicPtr, Ordering},
        Arc,
    },
};

use atomic::Atomic;
use parking_lot::{Mutex, MutexGuard};

use crate::gcref::{GcRef, HeapObject};

pub struct WeakReferenceSlot {
    referent: Atomic<Option<GcRef>>,
}

/// Weak handle to a managed object. [`WeakRef::get`] starts returning `None` in the cycle that
/// finds the referent unreachable.
#[derive(Clone)]
pub struct WeakRef {
    slot: Arc<WeakReferenceSlot>,
}

impl WeakRef {
    pub fn get(&self) -> Option<GcRef> {
        self.slot.referent.load(Ordering::Acquire)
    }
}

pub struct ExtraObjectData {
    base: AtomicPtr<HeapObject>,
    weak: Arc<WeakReferenceSlot>,
}

impl ExtraObjectData {
    fn new(base: GcRef) -> Box<Self> {
        Box::new(Self {
            base: AtomicPtr::new(base.as_ptr()),
            weak: Arc::new(WeakReferenceSlot {
                referent: Atomic::new(Some(base)),
            }),
        })
    }

    /// The object this sidecar belongs to, or `None` once it was uninstalled.
    pub fn base_object(&self) -> Option<GcRef> {
        GcRef::from_raw(self.base.load(Ordering::Acquire))
    }

    pub fn weak_reference(&self) -> WeakRef {
        WeakRef {
            slot: self.weak.clone(),
        }
    }

    pub(crate) fn uninstall(&self) {
        self.base.store(std::ptr::null_mut(), Ordering::Release);
    }

    /// Returns `true` if a referent was cleared.
    pub(crate) fn clear_weak_reference(&self) -> bool {
        self.weak.referent.swap(None, Ordering::AcqRel).is_some()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct ExtraRef(NonNull<ExtraObjectData>);

unsafe impl Send for ExtraRef {}
unsafe impl Sync for ExtraRef {}

#[derive(Default)]
pub struct ExtraObjectDataFactory {
    nodes: Mutex<Vec<ExtraRef>>,
}

impl ExtraObjectDataFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a weak handle to `object`, installing its sidecar first if needed.
    ///
    /// The caller must keep `object` reachable for the duration of the call.
    pub(crate) fn weak_reference_for(&self, object: GcRef) -> WeakRef {
        let existing = object.header().extra_object();
        if !existing.is_null() {
            return unsafe { (*existing).weak_reference() };
        }
        let fresh = Box::into_raw(ExtraObjectData::new(object));
        match object.header().install_extra_object(fresh) {
            Ok(_) => {
                let weak = unsafe { (*fresh).weak_reference() };
                self.nodes
                    .lock()
                    .push(ExtraRef(unsafe { NonNull::new_unchecked(fresh) }));
                weak
            }
            Err(winner) => unsafe {
                drop(Box::from_raw(fresh));
                (*winner).weak_reference()
            },
        }
    }

    /// Uninstalls and frees the sidecar. The base object must still be allocated when this
    /// is called; it may be released right after.
    pub(crate) fn destroy_extra_object_data(&self, extra: *mut ExtraObjectData) {
        let Some(extra) = NonNull::new(extra) else {
            return;
        };
        let mut nodes = self.nodes.lock();
        unsafe { extra.as_ref().uninstall() };
        if let Some(position) = nodes.iter().position(|node| node.0 == extra) {
            nodes.swap_remove(position);
            drop(nodes);
            unsafe { drop(Box::from_raw(extra.as_ptr())) };
        }
    }

    pub fn lock_for_iter(&self) -> ExtraObjectsIterable<'_> {
        ExtraObjectsIterable {
            nodes: self.nodes.lock(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear_for_tests(&self) {
        for node in self.nodes.lock().drain(..) {
            unsafe { drop(Box::from_raw(node.0.as_ptr())) };
        }
    }
}

impl Drop for ExtraObjectDataFactory {
    fn drop(&mut self) {
        self.clear_for_tests();
    }
}

/// Holds the sidecar store lock for the duration of an iteration.
pub struct ExtraObjectsIterable<'a> {
    nodes: MutexGuard<'a, Vec<ExtraRef>>,
}

impl ExtraObjectsIterable<'_> {
    pub fn iter(&self) -> impl Iterator<Item = &ExtraObjectData> + '_ {
        self.nodes.iter().map(|node| unsafe { node.0.as_ref() })
    }
}
