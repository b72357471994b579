use std::{fmt, mem::size_of, ptr::NonNull};

use atomic::{Atomic, Ordering};

use crate::{header::HeapObjectHeader, type_info::TypeInfo};

pub(crate) type Slot = Atomic<Option<GcRef>>;

/// Object record: header followed by the reference slots of the object.
pub struct HeapObject {
    pub(crate) header: HeapObjectHeader,
    slots: Box<[Slot]>,
}

impl HeapObject {
    pub(crate) fn new(type_info: &'static TypeInfo, slots: usize, is_array: bool) -> Box<Self> {
        Box::new(Self {
            header: HeapObjectHeader::new(type_info, is_array),
            slots: (0..slots).map(|_| Atomic::new(None)).collect(),
        })
    }
}

/// Untyped reference to a managed object.
///
/// A `GcRef` stays valid only while the object is reachable from a root. Holding a bare
/// `GcRef` across a safepoint without rooting the object is a use-after-free waiting to
/// happen.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GcRef {
    ptr: NonNull<HeapObject>,
}

unsafe impl Send for GcRef {}
unsafe impl Sync for GcRef {}

impl GcRef {
    pub(crate) fn from_box(object: Box<HeapObject>) -> Self {
        Self {
            ptr: NonNull::from(Box::leak(object)),
        }
    }

    pub(crate) fn from_raw(ptr: *mut HeapObject) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr })
    }

    #[inline(always)]
    pub(crate) fn as_ptr(self) -> *mut HeapObject {
        self.ptr.as_ptr()
    }

    /// Releases the object memory.
    ///
    /// # Safety
    ///
    /// The object must be unreachable and already unlinked from every store.
    pub(crate) unsafe fn free(self) {
        drop(Box::from_raw(self.ptr.as_ptr()));
    }

    #[inline(always)]
    fn object(&self) -> &HeapObject {
        unsafe { &*self.ptr.as_ptr() }
    }

    #[inline(always)]
    pub fn header(&self) -> &HeapObjectHeader {
        &self.object().header
    }

    #[inline(always)]
    pub fn type_info(&self) -> &'static TypeInfo {
        self.header().type_info()
    }

    pub fn is_array(&self) -> bool {
        self.header().is_array()
    }

    /// Number of reference slots.
    pub fn len(&self) -> usize {
        self.object().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<GcRef> {
        self.object().slots[index].load(Ordering::Acquire)
    }

    pub fn set(&self, index: usize, value: Option<GcRef>) {
        self.object().slots[index].store(value, Ordering::Release);
    }

    /// Non-null references held by this object.
    pub fn references(&self) -> impl Iterator<Item = GcRef> + '_ {
        self.object()
            .slots
            .iter()
            .filter_map(|slot| slot.load(Ordering::Acquire))
    }

    pub fn allocation_size(&self) -> usize {
        size_of::<HeapObject>() + self.len() * size_of::<Slot>() + self.type_info().instance_size
    }

    /// Objects with a finalizer or an installed sidecar go through the finalizer queue
    /// instead of being released directly by the sweeper.
    pub fn needs_finalization(&self) -> bool {
        self.type_info().has_finalizer() || !self.header().extra_object().is_null()
    }

    pub fn is_marked(&self) -> bool {
        self.header().data().marked()
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcRef({:p})", self.ptr)
    }
}

impl fmt::Pointer for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.ptr)
    }
}
