use std::fmt;

use ckb_hash::blake2b_256;
use ckb_jsonrpc_types::{JsonBytes, ScriptHashType};
use ckb_types::{H256, packed, prelude::*};
use serde::{Deserialize, Serialize};

use super::error::{IndexerError, IndexerResult};

/// Data digest recorded for cells with empty output data.
pub const EMPTY_DATA_HASH: [u8; 32] = [0u8; 32];

/// Length of an encoded out point key (tx_hash || index BE).
pub const OUT_POINT_KEY_LEN: usize = 36;

/// Reference to a transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_hash: [u8; 32],
    pub index: u32,
}

impl OutPoint {
    pub fn new(tx_hash: [u8; 32], index: u32) -> Self {
        Self { tx_hash, index }
    }

    /// The cellbase input references this out point.
    pub fn is_null(&self) -> bool {
        self.tx_hash == [0u8; 32] && self.index == u32::MAX
    }

    /// Storage key: tx_hash (32) || index (4, big-endian).
    pub fn to_key(&self) -> [u8; OUT_POINT_KEY_LEN] {
        let mut key = [0u8; OUT_POINT_KEY_LEN];
        key[..32].copy_from_slice(&self.tx_hash);
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> IndexerResult<Self> {
        if key.len() != OUT_POINT_KEY_LEN {
            return Err(IndexerError::InvalidData(format!(
                "out point key has {} bytes",
                key.len()
            )));
        }
        let mut tx_hash = [0u8; 32];
        tx_hash.copy_from_slice(&key[..32]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&key[32..]);
        Ok(Self {
            tx_hash,
            index: u32::from_be_bytes(index),
        })
    }

    pub fn to_json(&self) -> ckb_jsonrpc_types::OutPoint {
        ckb_jsonrpc_types::OutPoint {
            tx_hash: H256(self.tx_hash),
            index: self.index.into(),
        }
    }
}

impl From<&ckb_jsonrpc_types::OutPoint> for OutPoint {
    fn from(out_point: &ckb_jsonrpc_types::OutPoint) -> Self {
        Self {
            tx_hash: out_point.tx_hash.0,
            index: out_point.index.value(),
        }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}:{}", hex::encode(self.tx_hash), self.index)
    }
}

/// How a script's code hash is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashType {
    Data,
    Type,
    Data1,
    Data2,
}

impl HashType {
    /// Molecule byte for this hash type.
    pub fn as_byte(&self) -> u8 {
        match self {
            HashType::Data => 0,
            HashType::Type => 1,
            HashType::Data1 => 2,
            HashType::Data2 => 4,
        }
    }
}

impl TryFrom<&ScriptHashType> for HashType {
    type Error = IndexerError;

    fn try_from(value: &ScriptHashType) -> IndexerResult<Self> {
        match value {
            ScriptHashType::Data => Ok(HashType::Data),
            ScriptHashType::Type => Ok(HashType::Type),
            ScriptHashType::Data1 => Ok(HashType::Data1),
            ScriptHashType::Data2 => Ok(HashType::Data2),
            #[allow(unreachable_patterns)]
            other => Err(IndexerError::InvalidData(format!(
                "unsupported hash type {:?}",
                other
            ))),
        }
    }
}

impl From<HashType> for ScriptHashType {
    fn from(value: HashType) -> Self {
        match value {
            HashType::Data => ScriptHashType::Data,
            HashType::Type => ScriptHashType::Type,
            HashType::Data1 => ScriptHashType::Data1,
            HashType::Data2 => ScriptHashType::Data2,
        }
    }
}

/// A lock or type script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Script {
    pub code_hash: [u8; 32],
    pub hash_type: HashType,
    pub args: Vec<u8>,
}

impl Script {
    pub fn new(code_hash: [u8; 32], hash_type: HashType, args: Vec<u8>) -> Self {
        Self {
            code_hash,
            hash_type,
            args,
        }
    }

    pub fn to_packed(&self) -> packed::Script {
        packed::Script::new_builder()
            .code_hash(self.code_hash.pack())
            .hash_type(packed::Byte::new(self.hash_type.as_byte()))
            .args(self.args.pack())
            .build()
    }

    /// blake2b-256 of the molecule-encoded script.
    pub fn script_hash(&self) -> [u8; 32] {
        let hash: H256 = self.to_packed().calc_script_hash().unpack();
        hash.0
    }

    pub fn to_json(&self) -> ckb_jsonrpc_types::Script {
        ckb_jsonrpc_types::Script {
            code_hash: H256(self.code_hash),
            hash_type: self.hash_type.into(),
            args: JsonBytes::from_vec(self.args.clone()),
        }
    }
}

impl TryFrom<&ckb_jsonrpc_types::Script> for Script {
    type Error = IndexerError;

    fn try_from(script: &ckb_jsonrpc_types::Script) -> IndexerResult<Self> {
        Ok(Self {
            code_hash: script.code_hash.0,
            hash_type: HashType::try_from(&script.hash_type)?,
            args: script.args.as_bytes().to_vec(),
        })
    }
}

/// Lifecycle of an indexed cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellStatus {
    Live,
    /// Live on chain, claimed by an in-flight selection.
    PendingSpend,
    Dead,
}

/// Where a cell was created. Orders cells deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellPosition {
    pub block_number: u64,
    pub tx_index: u32,
    pub output_index: u32,
}

impl CellPosition {
    pub const KEY_LEN: usize = 16;

    pub fn to_key(&self) -> [u8; Self::KEY_LEN] {
        let mut key = [0u8; Self::KEY_LEN];
        key[..8].copy_from_slice(&self.block_number.to_be_bytes());
        key[8..12].copy_from_slice(&self.tx_index.to_be_bytes());
        key[12..].copy_from_slice(&self.output_index.to_be_bytes());
        key
    }
}

/// An indexed cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub out_point: OutPoint,
    /// Capacity in shannons.
    pub capacity: u64,
    pub lock: Script,
    pub type_: Option<Script>,
    /// blake2b-256 of the output data, or [`EMPTY_DATA_HASH`].
    pub data_hash: [u8; 32],
    pub position: CellPosition,
    pub status: CellStatus,
}

impl Cell {
    pub fn new(
        out_point: OutPoint,
        capacity: u64,
        lock: Script,
        type_: Option<Script>,
        data: &[u8],
        position: CellPosition,
    ) -> Self {
        Self {
            out_point,
            capacity,
            lock,
            type_,
            data_hash: data_hash(data),
            position,
            status: CellStatus::Live,
        }
    }

    /// No type script and no data. Only these are spent by plain transfers.
    pub fn is_plain(&self) -> bool {
        self.type_.is_none() && self.data_hash == EMPTY_DATA_HASH
    }
}

/// Digest recorded for output data.
pub fn data_hash(data: &[u8]) -> [u8; 32] {
    if data.is_empty() {
        EMPTY_DATA_HASH
    } else {
        blake2b_256(data)
    }
}

/// How lock args are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArgsMatch {
    #[default]
    Exact,
    Prefix,
}

/// Selects cells by lock script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFilter {
    pub code_hash: [u8; 32],
    pub hash_type: HashType,
    pub args: Vec<u8>,
    pub args_match: ArgsMatch,
}

impl LockFilter {
    pub fn exact(script: &Script) -> Self {
        Self {
            code_hash: script.code_hash,
            hash_type: script.hash_type,
            args: script.args.clone(),
            args_match: ArgsMatch::Exact,
        }
    }

    pub fn prefix(code_hash: [u8; 32], hash_type: HashType, args_prefix: Vec<u8>) -> Self {
        Self {
            code_hash,
            hash_type,
            args: args_prefix,
            args_match: ArgsMatch::Prefix,
        }
    }

    pub fn matches(&self, lock: &Script) -> bool {
        if lock.code_hash != self.code_hash || lock.hash_type != self.hash_type {
            return false;
        }
        match self.args_match {
            ArgsMatch::Exact => lock.args == self.args,
            ArgsMatch::Prefix => lock.args.starts_with(&self.args),
        }
    }

    /// The exact lock script, when the filter names one.
    pub fn exact_script(&self) -> Option<Script> {
        match self.args_match {
            ArgsMatch::Exact => Some(Script::new(self.code_hash, self.hash_type, self.args.clone())),
            ArgsMatch::Prefix => None,
        }
    }
}

/// Which cells the sync engine records.
///
/// A store is bound to the scope it was first synced with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexScope {
    /// Every cell on chain. Every consumed out point must be live.
    #[default]
    All,
    /// Only cells whose lock matches one of the filters.
    Locks(Vec<LockFilter>),
}

impl IndexScope {
    pub fn includes(&self, lock: &Script) -> bool {
        match self {
            IndexScope::All => true,
            IndexScope::Locks(filters) => filters.iter().any(|f| f.matches(lock)),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, IndexScope::All)
    }

    /// Stable directory name for a store holding this scope.
    pub fn store_name(&self) -> String {
        match self {
            IndexScope::All => "all".to_string(),
            IndexScope::Locks(filters) => {
                let mut encoded = Vec::new();
                for filter in filters {
                    encoded.extend_from_slice(&filter.code_hash);
                    encoded.push(filter.hash_type.as_byte());
                    encoded.push(filter.args_match as u8);
                    encoded.extend_from_slice(&(filter.args.len() as u32).to_be_bytes());
                    encoded.extend_from_slice(&filter.args);
                }
                format!("locks-{}", hex::encode(&blake2b_256(&encoded)[..8]))
            }
        }
    }
}

impl fmt::Display for IndexScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexScope::All => write!(f, "all cells"),
            IndexScope::Locks(filters) => {
                write!(f, "locks [")?;
                for (i, filter) in filters.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "0x{}", hex::encode(&filter.args))?;
                    if filter.args_match == ArgsMatch::Prefix {
                        write!(f, "*")?;
                    }
                }
                write!(f, "]")
            }
        }
    }
}
