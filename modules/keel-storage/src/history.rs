//! Append-only mutation history shared between storage copies.
//!
//! Records live in immutable `Arc<[MutationRecord]>` segments plus a short
//! owned tail. Cloning copies the segment pointers and the tail only, so a
//! working copy shares everything committed before it. Sealing turns the tail
//! into a segment and merges it into its predecessor until each segment is
//! more than twice the size of the next, so the segment count stays
//! logarithmic in the history length.

use std::sync::Arc;

use crate::types::MutationRecord;

/// Tail length at which appends seal on their own.
const SEAL_AT: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct History {
    segments: Vec<Arc<[MutationRecord]>>,
    tail: Vec<MutationRecord>,
    len: usize,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records in application order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &MutationRecord> + '_ {
        self.segments
            .iter()
            .flat_map(|segment| segment.iter())
            .chain(self.tail.iter())
    }

    pub fn last(&self) -> Option<&MutationRecord> {
        self.iter().next_back()
    }

    pub fn to_vec(&self) -> Vec<MutationRecord> {
        self.iter().cloned().collect()
    }

    /// Records held only by this copy, not yet shared with its clones.
    pub fn unsealed(&self) -> usize {
        self.tail.len()
    }

    pub(crate) fn push(&mut self, record: MutationRecord) {
        self.tail.push(record);
        self.len += 1;
        if self.tail.len() >= SEAL_AT {
            self.seal();
        }
    }

    /// Move the tail into a shared segment.
    pub(crate) fn seal(&mut self) {
        if self.tail.is_empty() {
            return;
        }
        let sealed: Arc<[MutationRecord]> = std::mem::take(&mut self.tail).into();
        self.segments.push(sealed);

        while let [.., older, newer] = self.segments.as_slice() {
            if older.len() > 2 * newer.len() {
                break;
            }
            let merged: Arc<[MutationRecord]> = older.iter().chain(newer.iter()).cloned().collect();
            self.segments.truncate(self.segments.len() - 2);
            self.segments.push(merged);
        }
    }

    pub(crate) fn take(&mut self) -> Vec<MutationRecord> {
        let drained = self.to_vec();
        *self = Self::default();
        drained
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a MutationRecord;
    type IntoIter = Box<dyn DoubleEndedIterator<Item = &'a MutationRecord> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
