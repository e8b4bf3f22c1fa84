//! Read/write dependency derivation
//!
//! The engine serializes tasks by the handles they read and write. A handle
//! must never appear in both sets of one task, so a handle the task writes
//! is removed from its read set (writer wins: the engine's read lock would
//! not order the write).

use crate::host::TensorHandle;

/// Dependency sets of one engine task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySets {
    /// Handles the task only reads
    pub reads: Vec<TensorHandle>,
    /// Handles the task writes
    pub writes: Vec<TensorHandle>,
}

impl DependencySets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_read(&mut self, handle: TensorHandle) {
        self.reads.push(handle);
    }

    pub fn add_write(&mut self, handle: TensorHandle) {
        self.writes.push(handle);
    }

    /// Make both sets sorted, duplicate-free and disjoint
    pub fn deduplicate(&mut self) {
        deduplicate_handles(&mut self.reads, &mut self.writes);
    }

    pub fn is_disjoint(&self) -> bool {
        self.reads.iter().all(|r| !self.writes.contains(r))
    }
}

/// Sort and deduplicate both lists, then drop from `reads` every handle
/// present in `writes`
///
/// Both lists end up sorted. O((R + W) log(R + W)).
pub fn deduplicate_handles(reads: &mut Vec<TensorHandle>, writes: &mut Vec<TensorHandle>) {
    writes.sort_unstable();
    writes.dedup();
    reads.sort_unstable();
    reads.dedup();

    // linear merge: both sorted, retain visits reads in order
    let mut wit = writes.iter().peekable();
    reads.retain(|r| {
        while wit.next_if(|w| *w < r).is_some() {}
        wit.peek() != Some(&r)
    });
}
