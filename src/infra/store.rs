use std::{ops::Bound, path::PathBuf};

use heed::{
    Database, Env, EnvOpenOptions, RoTxn, RwTxn,
    byteorder::BE,
    types::{Bytes, SerdeRmp, Str, U64},
};
use tracing::{debug, info, warn};

use crate::domain::{
    block::BlockDelta,
    block_changes::BlockUndo,
    cell::{
        Cell, CellPosition, CellStatus, HashType, IndexScope, LockFilter, OUT_POINT_KEY_LEN,
        OutPoint,
    },
    cursor::ChainCursor,
    error::{IndexerError, IndexerResult},
};

/// Key of the cursor in the metadata table.
const CURSOR_KEY: &str = "cursor";

/// Key of the bound index scope in the scope table.
const SCOPE_KEY: &str = "scope";

/// Default LMDB map size (4 GiB of address space).
const DEFAULT_MAP_SIZE: usize = 4 * 1024 * 1024 * 1024;

const LOCK_KEY_LEN: usize = 32 + CellPosition::KEY_LEN;
const CODE_KEY_LEN: usize = 32 + 1 + CellPosition::KEY_LEN;

#[derive(Clone, Copy)]
struct Tables {
    /// out point -> cell (live and not yet pruned dead cells)
    cells: Database<Bytes, SerdeRmp<Cell>>,
    /// lock hash || position -> out point, live cells only
    lock_index: Database<Bytes, Bytes>,
    /// code hash || hash type || position -> out point, live cells only
    code_index: Database<Bytes, Bytes>,
    /// block number -> undo record
    undo: Database<U64<BE>, SerdeRmp<BlockUndo>>,
    meta: Database<Str, SerdeRmp<ChainCursor>>,
    scope: Database<Str, SerdeRmp<IndexScope>>,
}

/// Persistent cell index on LMDB.
///
/// Every mutation (block application or rollback) is one write transaction
/// that also stores the chain cursor, so the pair is always consistent on disk.
#[derive(Clone)]
pub struct CellStore {
    env: Env,
    tables: Tables,
    confirmation_depth: u64,
}

impl CellStore {
    pub fn with_path(path: PathBuf, confirmation_depth: u64) -> IndexerResult<Self> {
        std::fs::create_dir_all(&path)?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(DEFAULT_MAP_SIZE)
                .max_dbs(8)
                .open(&path)?
        };

        let mut wtxn = env.write_txn()?;
        let tables = Tables {
            cells: env.create_database(&mut wtxn, Some("cells"))?,
            lock_index: env.create_database(&mut wtxn, Some("lock_index"))?,
            code_index: env.create_database(&mut wtxn, Some("code_index"))?,
            undo: env.create_database(&mut wtxn, Some("undo"))?,
            meta: env.create_database(&mut wtxn, Some("meta"))?,
            scope: env.create_database(&mut wtxn, Some("scope"))?,
        };
        wtxn.commit()?;

        debug!("Opened cell store at {}", path.display());
        Ok(Self {
            env,
            tables,
            confirmation_depth: confirmation_depth.max(1),
        })
    }

    /// Number of blocks kept in the undo window.
    pub fn confirmation_depth(&self) -> u64 {
        self.confirmation_depth
    }

    /// Last committed cursor.
    pub fn cursor(&self) -> IndexerResult<ChainCursor> {
        let rtxn = self.env.read_txn()?;
        self.load_cursor(&rtxn)
    }

    pub fn get_cell(&self, out_point: &OutPoint) -> IndexerResult<Option<Cell>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.tables.cells.get(&rtxn, &out_point.to_key()[..])?)
    }

    /// Whether the out point is indexed, live or dead.
    pub fn contains(&self, out_point: &OutPoint) -> IndexerResult<bool> {
        Ok(self.get_cell(out_point)?.is_some())
    }

    /// Hash of the indexed block at `number`, while it is inside the undo window.
    pub fn block_hash_at(&self, number: u64) -> IndexerResult<Option<[u8; 32]>> {
        let rtxn = self.env.read_txn()?;
        if let Some(undo) = self.tables.undo.get(&rtxn, &number)? {
            return Ok(Some(undo.block_hash));
        }
        match number.checked_add(1) {
            Some(child) => Ok(self
                .tables
                .undo
                .get(&rtxn, &child)?
                .map(|undo| undo.parent_hash)),
            None => Ok(None),
        }
    }

    /// Scope the store was bound to on its first sync, if any.
    pub fn scope(&self) -> IndexerResult<Option<IndexScope>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.tables.scope.get(&rtxn, SCOPE_KEY)?)
    }

    /// Bind the store to `scope`, or check it matches the bound one.
    ///
    /// Cells outside a lock scope are never recorded, so a store cannot
    /// switch scope without a [`CellStore::reset`].
    pub fn bind_scope(&self, scope: &IndexScope) -> IndexerResult<()> {
        let mut wtxn = self.env.write_txn()?;
        match self.tables.scope.get(&wtxn, SCOPE_KEY)? {
            Some(stored) if &stored == scope => Ok(()),
            Some(stored) => Err(IndexerError::ScopeMismatch {
                stored: stored.to_string(),
                requested: scope.to_string(),
            }),
            None => {
                self.tables.scope.put(&mut wtxn, SCOPE_KEY, scope)?;
                wtxn.commit()?;
                debug!("Cell store bound to {}", scope);
                Ok(())
            }
        }
    }

    /// Lowest block number that can still be reverted.
    pub fn oldest_undo_height(&self) -> IndexerResult<Option<u64>> {
        let rtxn = self.env.read_txn()?;
        self.oldest_undo(&rtxn)
    }

    /// Open a read snapshot. Readers never observe a partially applied block.
    pub fn snapshot(&self) -> IndexerResult<StoreSnapshot<'_>> {
        Ok(StoreSnapshot {
            rtxn: self.env.read_txn()?,
            tables: &self.tables,
        })
    }

    /// Apply one block: insert created cells as live, mark consumed cells dead,
    /// record undo data and advance the cursor, atomically.
    pub fn apply_block(&self, delta: &BlockDelta) -> IndexerResult<ChainCursor> {
        let mut wtxn = self.env.write_txn()?;
        let mut cursor = self.load_cursor(&wtxn)?;
        cursor.advance(&delta.header)?;

        for cell in &delta.created {
            let key = cell.out_point.to_key();
            if self.tables.cells.get(&wtxn, &key[..])?.is_some() {
                return Err(IndexerError::InconsistentState(format!(
                    "cell {} created at block {} is already indexed",
                    cell.out_point, delta.header.number
                )));
            }
            let mut cell = cell.clone();
            cell.status = CellStatus::Live;
            self.tables.cells.put(&mut wtxn, &key[..], &cell)?;
            self.insert_index(&mut wtxn, &cell)?;
        }

        for out_point in &delta.consumed {
            let key = out_point.to_key();
            let mut cell = match self.tables.cells.get(&wtxn, &key[..])? {
                Some(cell) if cell.status == CellStatus::Live => cell,
                Some(_) => {
                    return Err(IndexerError::InconsistentState(format!(
                        "cell {} consumed at block {} is already dead",
                        out_point, delta.header.number
                    )));
                }
                None => {
                    return Err(IndexerError::InconsistentState(format!(
                        "cell {} consumed at block {} is not indexed",
                        out_point, delta.header.number
                    )));
                }
            };
            self.remove_index(&mut wtxn, &cell)?;
            cell.status = CellStatus::Dead;
            self.tables.cells.put(&mut wtxn, &key[..], &cell)?;
        }

        let undo = BlockUndo::from_delta(delta);
        self.tables
            .undo
            .put(&mut wtxn, &delta.header.number, &undo)?;
        self.prune(&mut wtxn, delta.header.number)?;
        self.tables.meta.put(&mut wtxn, CURSOR_KEY, &cursor)?;
        wtxn.commit()?;

        if !delta.is_empty() {
            debug!(
                "Applied block {}: {} created, {} consumed",
                delta.header.number,
                delta.created.len(),
                delta.consumed.len()
            );
        }
        Ok(cursor)
    }

    /// Revert every block above `to_height`, atomically.
    pub fn rollback(&self, to_height: u64) -> IndexerResult<ChainCursor> {
        let mut wtxn = self.env.write_txn()?;
        let mut cursor = self.load_cursor(&wtxn)?;
        let head = match cursor.current() {
            Some(head) if head.number > to_height => head,
            _ => return Ok(cursor),
        };

        for number in ((to_height + 1)..=head.number).rev() {
            let Some(undo) = self.tables.undo.get(&wtxn, &number)? else {
                let oldest = self.oldest_undo(&wtxn)?;
                return Err(IndexerError::RollbackTooDeep {
                    target: to_height,
                    oldest,
                });
            };
            self.revert(&mut wtxn, &undo)?;
            self.tables.undo.delete(&mut wtxn, &number)?;
            if let Some(parent) = undo.parent() {
                cursor.rollback(parent);
            }
        }

        self.tables.meta.put(&mut wtxn, CURSOR_KEY, &cursor)?;
        wtxn.commit()?;

        info!("Rolled back from block {} to {}", head.number, to_height);
        Ok(cursor)
    }

    /// Wipe all tables for a full resync.
    pub fn reset(&self) -> IndexerResult<()> {
        let mut wtxn = self.env.write_txn()?;
        self.tables.cells.clear(&mut wtxn)?;
        self.tables.lock_index.clear(&mut wtxn)?;
        self.tables.code_index.clear(&mut wtxn)?;
        self.tables.undo.clear(&mut wtxn)?;
        self.tables.meta.clear(&mut wtxn)?;
        self.tables.scope.clear(&mut wtxn)?;
        wtxn.commit()?;
        warn!("Cell store reset, a full resync is required");
        Ok(())
    }

    fn revert(&self, wtxn: &mut RwTxn, undo: &BlockUndo) -> IndexerResult<()> {
        // Restore consumed cells first so a cell created and spent in the
        // same block is removed by the created pass below.
        for out_point in undo.consumed.iter().rev() {
            let key = out_point.to_key();
            let mut cell = self.tables.cells.get(wtxn, &key[..])?.ok_or_else(|| {
                IndexerError::InconsistentState(format!(
                    "cell {} consumed at block {} is missing",
                    out_point, undo.block_number
                ))
            })?;
            if cell.status != CellStatus::Dead {
                return Err(IndexerError::InconsistentState(format!(
                    "cell {} consumed at block {} is not dead",
                    out_point, undo.block_number
                )));
            }
            cell.status = CellStatus::Live;
            self.tables.cells.put(wtxn, &key[..], &cell)?;
            self.insert_index(wtxn, &cell)?;
        }

        for out_point in undo.created.iter().rev() {
            let key = out_point.to_key();
            if let Some(cell) = self.tables.cells.get(wtxn, &key[..])? {
                if cell.status == CellStatus::Live {
                    self.remove_index(wtxn, &cell)?;
                }
                self.tables.cells.delete(wtxn, &key[..])?;
            }
        }
        Ok(())
    }

    /// Drop the undo record and dead cells that left the confirmation window.
    fn prune(&self, wtxn: &mut RwTxn, applied: u64) -> IndexerResult<()> {
        let Some(expired) = applied.checked_sub(self.confirmation_depth) else {
            return Ok(());
        };
        let Some(undo) = self.tables.undo.get(wtxn, &expired)? else {
            return Ok(());
        };
        for out_point in &undo.consumed {
            let key = out_point.to_key();
            if let Some(cell) = self.tables.cells.get(wtxn, &key[..])?
                && cell.status == CellStatus::Dead
            {
                self.tables.cells.delete(wtxn, &key[..])?;
            }
        }
        self.tables.undo.delete(wtxn, &expired)?;
        Ok(())
    }

    fn insert_index(&self, wtxn: &mut RwTxn, cell: &Cell) -> IndexerResult<()> {
        let value = cell.out_point.to_key();
        self.tables
            .lock_index
            .put(wtxn, &lock_index_key(cell)[..], &value[..])?;
        self.tables
            .code_index
            .put(wtxn, &code_index_key(cell)[..], &value[..])?;
        Ok(())
    }

    fn remove_index(&self, wtxn: &mut RwTxn, cell: &Cell) -> IndexerResult<()> {
        self.tables
            .lock_index
            .delete(wtxn, &lock_index_key(cell)[..])?;
        self.tables
            .code_index
            .delete(wtxn, &code_index_key(cell)[..])?;
        Ok(())
    }

    fn load_cursor(&self, txn: &RoTxn) -> IndexerResult<ChainCursor> {
        Ok(self
            .tables
            .meta
            .get(txn, CURSOR_KEY)?
            .unwrap_or_default())
    }

    fn oldest_undo(&self, txn: &RoTxn) -> IndexerResult<Option<u64>> {
        Ok(self.tables.undo.first(txn)?.map(|(number, _)| number))
    }
}

fn lock_index_key(cell: &Cell) -> [u8; LOCK_KEY_LEN] {
    let mut key = [0u8; LOCK_KEY_LEN];
    key[..32].copy_from_slice(&cell.lock.script_hash());
    key[32..].copy_from_slice(&cell.position.to_key());
    key
}

fn code_prefix(code_hash: &[u8; 32], hash_type: HashType) -> [u8; 33] {
    let mut prefix = [0u8; 33];
    prefix[..32].copy_from_slice(code_hash);
    prefix[32] = hash_type.as_byte();
    prefix
}

fn code_index_key(cell: &Cell) -> [u8; CODE_KEY_LEN] {
    let mut key = [0u8; CODE_KEY_LEN];
    key[..33].copy_from_slice(&code_prefix(&cell.lock.code_hash, cell.lock.hash_type));
    key[33..].copy_from_slice(&cell.position.to_key());
    key
}

/// Read-only view of the store at one committed state.
pub struct StoreSnapshot<'s> {
    rtxn: RoTxn<'s>,
    tables: &'s Tables,
}

impl StoreSnapshot<'_> {
    pub fn cursor(&self) -> IndexerResult<ChainCursor> {
        Ok(self
            .tables
            .meta
            .get(&self.rtxn, CURSOR_KEY)?
            .unwrap_or_default())
    }

    pub fn get_cell(&self, out_point: &OutPoint) -> IndexerResult<Option<Cell>> {
        Ok(self.tables.cells.get(&self.rtxn, &out_point.to_key()[..])?)
    }

    pub fn contains(&self, out_point: &OutPoint) -> IndexerResult<bool> {
        Ok(self.get_cell(out_point)?.is_some())
    }

    /// Live cells matching `filter`, lazily, in (block, tx, output) order.
    ///
    /// Exact filters walk the lock-hash index. Prefix filters walk every live
    /// cell under the filter's code hash and compare args.
    pub fn query_by_lock(
        &self,
        filter: &LockFilter,
    ) -> IndexerResult<impl Iterator<Item = IndexerResult<Cell>> + '_> {
        let (index, prefix) = match filter.exact_script() {
            Some(script) => (self.tables.lock_index, script.script_hash().to_vec()),
            None => (
                self.tables.code_index,
                code_prefix(&filter.code_hash, filter.hash_type).to_vec(),
            ),
        };
        let entries = index.prefix_iter(&self.rtxn, &prefix[..])?;
        let filter = filter.clone();

        Ok(entries.filter_map(move |entry| {
            let cell = entry
                .map_err(IndexerError::from)
                .and_then(|(_, value)| self.load_indexed(value));
            match cell {
                Ok(cell) if filter.matches(&cell.lock) => Some(Ok(cell)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        }))
    }

    /// Up to `limit` live cells matching `filter` that sort after `after`.
    pub fn query_page(
        &self,
        filter: &LockFilter,
        after: Option<&Cell>,
        limit: usize,
    ) -> IndexerResult<Vec<Cell>> {
        let (index, prefix, start) = match filter.exact_script() {
            Some(script) => (
                self.tables.lock_index,
                script.script_hash().to_vec(),
                after.map(|cell| lock_index_key(cell).to_vec()),
            ),
            None => (
                self.tables.code_index,
                code_prefix(&filter.code_hash, filter.hash_type).to_vec(),
                after.map(|cell| code_index_key(cell).to_vec()),
            ),
        };

        let lower = match &start {
            Some(key) => Bound::Excluded(&key[..]),
            None => Bound::Included(&prefix[..]),
        };
        let range = (lower, Bound::Unbounded);

        let mut page = Vec::new();
        for entry in index.range(&self.rtxn, &range)? {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) || page.len() >= limit {
                break;
            }
            let cell = self.load_indexed(value)?;
            if filter.matches(&cell.lock) {
                page.push(cell);
            }
        }
        Ok(page)
    }

    /// Every live cell in the store, in out point order.
    pub fn live_cells(&self) -> IndexerResult<Vec<Cell>> {
        let mut cells = Vec::new();
        for entry in self.tables.cells.iter(&self.rtxn)? {
            let (_, cell) = entry?;
            if cell.status == CellStatus::Live {
                cells.push(cell);
            }
        }
        Ok(cells)
    }

    fn load_indexed(&self, value: &[u8]) -> IndexerResult<Cell> {
        if value.len() != OUT_POINT_KEY_LEN {
            return Err(IndexerError::InconsistentState(format!(
                "index entry holds {} bytes",
                value.len()
            )));
        }
        match self.tables.cells.get(&self.rtxn, value)? {
            Some(cell) if cell.status == CellStatus::Live => Ok(cell),
            _ => Err(IndexerError::InconsistentState(format!(
                "index points at missing or dead cell {}",
                OutPoint::from_key(value)?
            ))),
        }
    }
}
