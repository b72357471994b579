use crate::gcref::GcRef;

/// Invoked on the finalizer thread for an unreachable object, right before its memory is
/// released. The object must not be stored anywhere and its reference slots must not be
/// followed: objects they point to may already be gone.
pub type FinalizerCallback = fn(GcRef);

/// Static descriptor shared by every object of a managed type.
#[derive(Debug)]
pub struct TypeInfo {
    pub name: &'static str,
    /// Number of reference slots of a plain object. Arrays take their length at allocation.
    pub ref_fields: usize,
    /// Non-reference payload bytes accounted to every instance.
    pub instance_size: usize,
    pub finalizer: Option<FinalizerCallback>,
}

impl TypeInfo {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            ref_fields: 0,
            instance_size: 0,
            finalizer: None,
        }
    }

    pub const fn with_ref_fields(self, ref_fields: usize) -> Self {
        Self { ref_fields, ..self }
    }

    pub const fn with_instance_size(self, instance_size: usize) -> Self {
        Self {
            instance_size,
            ..self
        }
    }

    pub const fn with_finalizer(self, finalizer: FinalizerCallback) -> Self {
        Self {
            finalizer: Some(finalizer),
            ..self
        }
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }
}
