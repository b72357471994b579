use crate::{extra_object::ExtraObjectData, type_info::TypeInfo};
use modular_bitfield::prelude::*;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

// HeapObjectHeader contains meta data per object and is stored in front of the
// reference slots of each object.
//
// +-----------------+------+------------------------------------------+
// | name            | bits |                                          |
// +-----------------+------+------------------------------------------+
// | type info       |   64 | Static type descriptor.                  |
// +-----------------+------+------------------------------------------+
// | mark bit        |    1 | Only transitions through CAS.            |
// | array bit       |    1 | Set once at allocation.                  |
// | unused          |    6 |                                          |
// +-----------------+------+------------------------------------------+
// | extra object    |   64 | Lazily installed sidecar, may be null.   |
// +-----------------+------+------------------------------------------+
//
// Notes:
// - The mark bit is the only mutable part of the encoded byte. Both transitions
//   (unmarked -> marked while tracing, marked -> unmarked while sweeping) are
//   linearizable compare-and-swap operations, so exactly one of any number of
//   racing markers observes a successful `try_mark`.
pub struct HeapObjectHeader {
    type_info: &'static TypeInfo,
    data: ObjectData,
    extra: AtomicPtr<ExtraObjectData>,
}

impl HeapObjectHeader {
    pub(crate) fn new(type_info: &'static TypeInfo, is_array: bool) -> Self {
        Self {
            type_info,
            data: ObjectData::new(is_array),
            extra: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
    #[inline(always)]
    pub fn type_info(&self) -> &'static TypeInfo {
        self.type_info
    }
    #[inline(always)]
    pub fn data(&self) -> &ObjectData {
        &self.data
    }
    #[inline(always)]
    pub fn is_array(&self) -> bool {
        self.data.flags().is_array()
    }
    #[inline(always)]
    pub fn extra_object(&self) -> *mut ExtraObjectData {
        self.extra.load(Ordering::Acquire)
    }
    #[inline]
    pub(crate) fn install_extra_object(
        &self,
        extra: *mut ExtraObjectData,
    ) -> Result<*mut ExtraObjectData, *mut ExtraObjectData> {
        self.extra.compare_exchange(
            std::ptr::null_mut(),
            extra,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
    }
}

#[bitfield(bits = 8)]
#[derive(Clone, Copy, Debug)]
pub struct ObjectFlags {
    pub marked: bool,
    pub is_array: bool,
    #[skip]
    __: B6,
}

/// Per-object mark state.
pub struct ObjectData {
    flags: AtomicU8,
}

impl ObjectData {
    pub(crate) fn new(is_array: bool) -> Self {
        let flags = ObjectFlags::new().with_is_array(is_array);
        Self {
            flags: AtomicU8::new(flags.into_bytes()[0]),
        }
    }

    #[inline(always)]
    fn flags(&self) -> ObjectFlags {
        ObjectFlags::from_bytes([self.flags.load(Ordering::Acquire)])
    }

    #[inline(always)]
    pub fn marked(&self) -> bool {
        self.flags().marked()
    }

    /// Atomically sets the mark bit. Returns `true` only for the caller that performed the
    /// unmarked -> marked transition.
    #[inline]
    pub fn try_mark(&self) -> bool {
        self.transition(false, true)
    }

    /// Atomically clears the mark bit. Returns `true` if the object was marked.
    #[inline]
    pub fn try_reset_mark(&self) -> bool {
        self.transition(true, false)
    }

    #[inline(always)]
    fn transition(&self, from: bool, to: bool) -> bool {
        let mut current = self.flags.load(Ordering::Relaxed);
        loop {
            let flags = ObjectFlags::from_bytes([current]);
            if flags.marked() != from {
                return false;
            }
            let next = flags.with_marked(to).into_bytes()[0];
            match self.flags.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}
