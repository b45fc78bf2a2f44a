//! Lazy live-cell queries over store snapshots.

use crate::{
    domain::{
        cell::{Cell, LockFilter},
        error::IndexerResult,
    },
    infra::store::{CellStore, StoreSnapshot},
};

/// Collects live cells by lock filter.
#[derive(Clone)]
pub struct CellCollector {
    store: CellStore,
}

impl CellCollector {
    pub fn new(store: CellStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CellStore {
        &self.store
    }

    /// Open a fresh snapshot and iterate its live cells matching `filter`.
    ///
    /// Blocks applied after this call are invisible to the returned sequence.
    /// Drop it before awaiting: the snapshot pins a read transaction to the
    /// current thread.
    pub fn collect(&self, filter: &LockFilter) -> IndexerResult<CellIter<'_>> {
        let snapshot = self.store.snapshot()?;
        Ok(CellIter::new(snapshot, filter.clone()))
    }

    /// Materialize every matching live cell.
    pub fn collect_vec(&self, filter: &LockFilter) -> IndexerResult<Vec<Cell>> {
        self.collect(filter)?.collect()
    }

    /// Total capacity of matching live cells, in shannons.
    pub fn capacity_of(&self, filter: &LockFilter) -> IndexerResult<u64> {
        let mut total = 0u64;
        for cell in self.collect(filter)? {
            total = total.saturating_add(cell?.capacity);
        }
        Ok(total)
    }
}

/// Iterator owning its snapshot. Finite; call [`CellCollector::collect`]
/// again to restart on the latest committed state.
pub struct CellIter<'s> {
    snapshot: StoreSnapshot<'s>,
    filter: LockFilter,
    buffer: std::vec::IntoIter<Cell>,
    resume_after: Option<Cell>,
    done: bool,
}

/// Cells fetched from the index per refill.
const PAGE_SIZE: usize = 256;

impl<'s> CellIter<'s> {
    fn new(snapshot: StoreSnapshot<'s>, filter: LockFilter) -> Self {
        Self {
            snapshot,
            filter,
            buffer: Vec::new().into_iter(),
            resume_after: None,
            done: false,
        }
    }

    fn refill(&mut self) -> IndexerResult<()> {
        let page = self
            .snapshot
            .query_page(&self.filter, self.resume_after.as_ref(), PAGE_SIZE)?;
        if page.len() < PAGE_SIZE {
            self.done = true;
        }
        self.resume_after = page.last().cloned();
        self.buffer = page.into_iter();
        Ok(())
    }
}

impl Iterator for CellIter<'_> {
    type Item = IndexerResult<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cell) = self.buffer.next() {
                return Some(Ok(cell));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.refill() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}
