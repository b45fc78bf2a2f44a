//! CKB cell indexer - a local cell index and coin selector for Nervos CKB.
//!
//! This library provides:
//! - A crash-safe LMDB cell store with per-block undo history
//! - A sync engine that follows the chain tip through reorgs
//! - Lazy snapshot queries of live cells by lock
//! - Deterministic coin selection with in-memory reservations
//! - Sighash transfer building and signing

pub mod config;
pub mod domain;
pub mod infra;
