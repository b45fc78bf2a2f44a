//! Deterministic greedy coin selection with in-memory reservations.
//!
//! Cells are taken in collector order until their capacity covers the target
//! plus fee. Chosen cells are claimed under a [`ReservationToken`] so that
//! concurrent selections never spend the same cell. Claims expire after the
//! configured TTL and are not persisted.

use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    config::SelectorConfig,
    domain::{
        cell::{Cell, CellStatus, LockFilter, OutPoint},
        error::{IndexerError, IndexerResult},
    },
    infra::collector::CellCollector,
};

/// Handle on a set of claimed cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationToken(pub u64);

impl fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of a successful selection.
#[derive(Debug, Clone)]
pub struct Selection {
    pub token: ReservationToken,
    /// Chosen cells in collector order, marked pending spend.
    pub cells: Vec<Cell>,
    pub target: u64,
    pub fee: u64,
    pub total_capacity: u64,
    /// `total_capacity - target - fee`.
    pub change_capacity: u64,
}

impl Selection {
    pub fn out_points(&self) -> impl Iterator<Item = &OutPoint> {
        self.cells.iter().map(|c| &c.out_point)
    }
}

struct Claim {
    cells: Vec<OutPoint>,
    expires_at: Instant,
}

#[derive(Default)]
struct ReservationBook {
    claims: HashMap<ReservationToken, Claim>,
    owners: HashMap<OutPoint, ReservationToken>,
}

impl ReservationBook {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<ReservationToken> = self
            .claims
            .iter()
            .filter(|(_, claim)| claim.expires_at <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            debug!("Reservation {} expired", token);
            self.remove(token);
        }
    }

    fn remove(&mut self, token: ReservationToken) -> usize {
        let Some(claim) = self.claims.remove(&token) else {
            return 0;
        };
        for out_point in &claim.cells {
            if self.owners.get(out_point) == Some(&token) {
                self.owners.remove(out_point);
            }
        }
        claim.cells.len()
    }

    fn insert(&mut self, token: ReservationToken, cells: Vec<OutPoint>, expires_at: Instant) {
        for out_point in &cells {
            self.owners.insert(*out_point, token);
        }
        self.claims.insert(token, Claim { cells, expires_at });
    }
}

/// Picks cells to fund a transfer.
pub struct CoinSelector {
    collector: CellCollector,
    book: Mutex<ReservationBook>,
    ttl: Duration,
    safe_mode: bool,
    next_token: AtomicU64,
}

impl CoinSelector {
    pub fn new(collector: CellCollector, ttl: Duration, safe_mode: bool) -> Self {
        Self {
            collector,
            book: Mutex::new(ReservationBook::default()),
            ttl,
            safe_mode,
            next_token: AtomicU64::new(1),
        }
    }

    pub fn from_config(collector: CellCollector, config: &SelectorConfig) -> Self {
        Self::new(
            collector,
            Duration::from_secs(config.reservation_ttl_secs),
            config.safe_mode,
        )
    }

    pub fn collector(&self) -> &CellCollector {
        &self.collector
    }

    /// Claim live cells matching `filter` whose capacity covers `target + fee`.
    ///
    /// Cells reserved by another live token are skipped. At least one cell is
    /// always chosen.
    pub fn select(&self, filter: &LockFilter, target: u64, fee: u64) -> IndexerResult<Selection> {
        let required = target.checked_add(fee).ok_or_else(|| {
            IndexerError::InvalidData(format!("target {} plus fee {} overflows", target, fee))
        })?;

        let now = Instant::now();
        let mut book = self.book.lock();
        book.purge_expired(now);

        let mut chosen = Vec::new();
        let mut total = 0u64;
        let mut reserved = 0u64;
        for cell in self.collector.collect(filter)? {
            let cell = cell?;
            if self.safe_mode && !cell.is_plain() {
                continue;
            }
            if book.owners.contains_key(&cell.out_point) {
                reserved = reserved.saturating_add(cell.capacity);
                continue;
            }
            total = total.saturating_add(cell.capacity);
            chosen.push(cell);
            if total >= required {
                break;
            }
        }

        if total < required || chosen.is_empty() {
            return Err(IndexerError::InsufficientFunds {
                required,
                available: total,
                reserved,
            });
        }

        let token = ReservationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        book.insert(
            token,
            chosen.iter().map(|c| c.out_point).collect(),
            now + self.ttl,
        );
        drop(book);

        for cell in &mut chosen {
            cell.status = CellStatus::PendingSpend;
        }
        info!(
            "Selected {} cells ({} shannons) under reservation {}",
            chosen.len(),
            total,
            token
        );
        Ok(Selection {
            token,
            cells: chosen,
            target,
            fee,
            total_capacity: total,
            change_capacity: total - required,
        })
    }

    /// Free the cells claimed by `token`. Unknown or expired tokens are ignored.
    pub fn release(&self, token: ReservationToken) {
        let released = self.book.lock().remove(token);
        if released > 0 {
            debug!("Released reservation {} ({} cells)", token, released);
        }
    }

    /// Extend a selection's claim by another TTL.
    ///
    /// An expired claim is re-established if none of its cells was taken by
    /// another selection in the meantime.
    pub fn renew(&self, selection: &Selection) -> IndexerResult<()> {
        let token = selection.token;
        let now = Instant::now();
        let mut book = self.book.lock();
        book.purge_expired(now);

        if let Some(claim) = book.claims.get_mut(&token) {
            claim.expires_at = now + self.ttl;
            return Ok(());
        }

        if let Some(out_point) = selection
            .out_points()
            .find(|op| book.owners.get(op).is_some_and(|owner| *owner != token))
        {
            return Err(IndexerError::ReservationConflict {
                token: token.0,
                out_point: *out_point,
            });
        }

        book.insert(token, selection.out_points().copied().collect(), now + self.ttl);
        debug!("Reservation {} re-established after expiry", token);
        Ok(())
    }

    /// Whether a live reservation holds `out_point`.
    pub fn is_reserved(&self, out_point: &OutPoint) -> bool {
        let now = Instant::now();
        let book = self.book.lock();
        book.owners
            .get(out_point)
            .and_then(|token| book.claims.get(token))
            .is_some_and(|claim| claim.expires_at > now)
    }
}
