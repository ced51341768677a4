//! Tensor descriptors and the arena of named buffer slots.
//!
//! The arena only describes buffers; the device memory behind each slot is owned by the
//! compute backend, keyed by the slot's [`BufferId`].

use std::fmt;

/// Size in bytes of one element. Every tensor in the engine is single-precision.
pub const ELEMENT_SIZE: usize = std::mem::size_of::<f32>();

/// The part a buffer plays in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorRole {
    /// Host-written network input.
    Input,
    /// Constant weight matrix, row-major.
    Weight,
    /// Constant bias vector.
    Bias,
    /// Reusable intermediate storage, overwritten on every layer.
    Scratch,
    /// Network output, read back by the host.
    Output,
}

impl TensorRole {
    /// Scratch slots are sized for the widest layer and may be bound for fewer elements.
    pub fn is_reusable(self) -> bool {
        matches!(self, TensorRole::Scratch)
    }

    pub fn is_constant(self) -> bool {
        matches!(self, TensorRole::Weight | TensorRole::Bias)
    }
}

impl fmt::Display for TensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TensorRole::Input => "input",
            TensorRole::Weight => "weight",
            TensorRole::Bias => "bias",
            TensorRole::Scratch => "scratch",
            TensorRole::Output => "output",
        };
        f.write_str(name)
    }
}

/// Shape and access mode of a device-resident buffer. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    label: String,
    element_count: usize,
    role: TensorRole,
    byte_size: usize,
}

impl TensorDescriptor {
    pub fn new(label: impl Into<String>, element_count: usize, role: TensorRole) -> Self {
        Self {
            label: label.into(),
            element_count,
            role,
            byte_size: element_count * ELEMENT_SIZE,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn role(&self) -> TensorRole {
        self.role
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Returns true when a kernel may bind this buffer for `required` elements.
    ///
    /// Fixed-role buffers must match exactly; scratch slots must be at least as large.
    pub fn admits(&self, required: usize) -> bool {
        if self.role.is_reusable() {
            required <= self.element_count
        } else {
            required == self.element_count
        }
    }
}

/// Index of a slot in a [`TensorArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(usize);

impl BufferId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ordered set of named tensor slots.
#[derive(Debug, Clone, Default)]
pub struct TensorArena {
    slots: Vec<TensorDescriptor>,
}

impl TensorArena {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Declares a new slot and returns its id.
    pub fn declare(&mut self, descriptor: TensorDescriptor) -> BufferId {
        let id = BufferId(self.slots.len());
        self.slots.push(descriptor);
        id
    }

    pub fn descriptor(&self, id: BufferId) -> Option<&TensorDescriptor> {
        self.slots.get(id.0)
    }

    /// Looks a slot up by label.
    pub fn find(&self, label: &str) -> Option<BufferId> {
        self.slots
            .iter()
            .position(|slot| slot.label == label)
            .map(BufferId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BufferId, &TensorDescriptor)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (BufferId(index), slot))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total bytes declared across all slots.
    pub fn footprint_bytes(&self) -> usize {
        self.slots.iter().map(TensorDescriptor::byte_size).sum()
    }
}
