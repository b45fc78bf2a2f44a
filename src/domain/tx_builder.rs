//! Transaction builder for plain sighash transfers.
//!
//! Spends a [`Selection`], pays the target capacity to a destination lock and
//! returns change to the sender. Signing follows secp256k1_blake160_sighash_all.

use ckb_hash::new_blake2b;
use ckb_jsonrpc_types::{
    CellDep, CellInput, CellOutput, DepType, JsonBytes, Transaction, Uint32, Uint64,
};
use ckb_types::{bytes::Bytes, packed, prelude::*};
use color_eyre::eyre::{Result, eyre};
use tracing::{debug, warn};

use crate::{
    domain::{
        cell::{HashType, OutPoint, Script},
        selector::Selection,
        signer::Signer,
    },
    infra::rpc::NodeRpc,
};

/// Minimum capacity of a sighash cell with no data (61 CKB).
pub const MIN_CELL_CAPACITY: u64 = 61_00000000;

/// Size of a recoverable secp256k1 signature.
const SIGNATURE_SIZE: usize = 65;

/// Location of the system secp256k1 sighash lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Secp256k1Dep {
    /// Type-script hash of the lock binary (used with hash type `type`).
    pub code_hash: [u8; 32],
    /// Dep group bundling the lock binary and secp256k1 data.
    pub dep_group: OutPoint,
}

impl Secp256k1Dep {
    /// Sighash lock for `args`.
    pub fn lock(&self, args: &[u8]) -> Script {
        Script::new(self.code_hash, HashType::Type, args.to_vec())
    }

    fn cell_dep(&self) -> CellDep {
        CellDep {
            out_point: self.dep_group.to_json(),
            dep_type: DepType::DepGroup,
        }
    }
}

/// Read the system lock location from the genesis block.
///
/// The lock binary is genesis tx 0 output 1; its dep group is genesis tx 1
/// output 0.
pub fn load_secp256k1_dep<R: NodeRpc + ?Sized>(rpc: &R) -> Result<Secp256k1Dep> {
    let genesis = rpc
        .get_block_by_number(0)?
        .ok_or_else(|| eyre!("Genesis block not found"))?;

    let code_hash = genesis
        .transactions
        .first()
        .and_then(|tx| tx.outputs.get(1))
        .and_then(|output| output.type_.as_ref())
        .map(|type_script| type_script.script_hash())
        .ok_or_else(|| eyre!("Genesis tx 0 output 1 has no type script"))?;

    let dep_group_tx = genesis
        .transactions
        .get(1)
        .ok_or_else(|| eyre!("Genesis block has no dep group transaction"))?;

    let dep = Secp256k1Dep {
        code_hash,
        dep_group: OutPoint::new(dep_group_tx.hash, 0),
    };
    debug!(
        "Loaded secp256k1 dep: code hash 0x{}, dep group {}",
        hex::encode(dep.code_hash),
        dep.dep_group
    );
    Ok(dep)
}

/// A built but unsigned transaction.
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub tx: Transaction,
    pub tx_hash: [u8; 32],
}

/// Builds transfers from one sender lock.
#[derive(Debug, Clone)]
pub struct TransferBuilder {
    dep: Secp256k1Dep,
    sender_lock: Script,
}

impl TransferBuilder {
    pub fn new(dep: Secp256k1Dep, sender_lock: Script) -> Self {
        Self { dep, sender_lock }
    }

    /// Spend `selection`, sending its target capacity to `to`.
    ///
    /// Change below [`MIN_CELL_CAPACITY`] cannot form a cell and is added to
    /// the fee.
    pub fn build(&self, selection: &Selection, to: &Script) -> Result<BuiltTransaction> {
        if selection.cells.is_empty() {
            return Err(eyre!("No inputs specified"));
        }
        if selection.target < MIN_CELL_CAPACITY {
            return Err(eyre!(
                "Output capacity {} is below the minimum cell capacity {}",
                selection.target,
                MIN_CELL_CAPACITY
            ));
        }
        let required = selection.target + selection.fee;
        if selection.total_capacity < required {
            return Err(eyre!(
                "Insufficient input: {} < {} + {} fee",
                selection.total_capacity,
                selection.target,
                selection.fee
            ));
        }

        let inputs: Vec<CellInput> = selection
            .cells
            .iter()
            .map(|cell| CellInput {
                previous_output: cell.out_point.to_json(),
                since: Uint64::from(0u64),
            })
            .collect();

        let mut outputs = vec![CellOutput {
            capacity: Uint64::from(selection.target),
            lock: to.to_json(),
            type_: None,
        }];

        let change = selection.total_capacity - required;
        if change >= MIN_CELL_CAPACITY {
            outputs.push(CellOutput {
                capacity: Uint64::from(change),
                lock: self.sender_lock.to_json(),
                type_: None,
            });
        } else if change > 0 {
            warn!(
                "Change of {} shannons is below the minimum cell capacity, adding it to the fee",
                change
            );
        }
        let outputs_data = vec![JsonBytes::default(); outputs.len()];

        let tx = Transaction {
            version: Uint32::from(0u32),
            cell_deps: vec![self.dep.cell_dep()],
            header_deps: vec![],
            inputs,
            outputs,
            outputs_data,
            witnesses: vec![JsonBytes::default(); selection.cells.len()],
        };
        let tx_hash = calculate_tx_hash(&tx);

        Ok(BuiltTransaction { tx, tx_hash })
    }
}

/// Sign every input with one sighash-all signature (all inputs share the
/// sender lock, so they form a single script group).
pub fn sign(built: BuiltTransaction, signer: &dyn Signer) -> Result<Transaction> {
    let input_count = built.tx.inputs.len();
    if input_count == 0 {
        return Err(eyre!("Transaction has no inputs to sign"));
    }

    let message = sighash_all_message(&built.tx_hash, input_count);
    let signature = signer.sign_recoverable(&message)?;

    let mut witnesses = Vec::with_capacity(input_count);
    witnesses.push(JsonBytes::from_vec(build_witness_args(signature.to_vec())));
    witnesses.extend(std::iter::repeat_n(JsonBytes::default(), input_count - 1));

    let mut tx = built.tx;
    tx.witnesses = witnesses;
    Ok(tx)
}

/// Digest signed by the sighash-all lock for a group of `input_count` inputs
/// whose first witness carries the signature.
pub fn sighash_all_message(tx_hash: &[u8; 32], input_count: usize) -> [u8; 32] {
    let placeholder = build_witness_args(vec![0u8; SIGNATURE_SIZE]);

    let mut hasher = new_blake2b();
    hasher.update(tx_hash);
    hasher.update(&(placeholder.len() as u64).to_le_bytes());
    hasher.update(&placeholder);
    // Remaining witnesses of the group are empty
    for _ in 1..input_count {
        hasher.update(&0u64.to_le_bytes());
    }

    let mut message = [0u8; 32];
    hasher.finalize(&mut message);
    message
}

/// Hash of the raw transaction (witnesses excluded).
pub fn calculate_tx_hash(tx: &Transaction) -> [u8; 32] {
    let hash: ckb_types::H256 = packed::Transaction::from(tx.clone()).calc_tx_hash().unpack();
    hash.0
}

/// Build WitnessArgs with lock field containing `lock_data`.
fn build_witness_args(lock_data: Vec<u8>) -> Vec<u8> {
    let witness_args = packed::WitnessArgs::new_builder()
        .lock(Some(Bytes::from(lock_data)).pack())
        .build();
    witness_args.as_bytes().to_vec()
}

/// Parse 20-byte lock args from hex.
pub fn parse_lock_args(hex_str: &str) -> Result<[u8; 20]> {
    let hex_str = hex_str.trim().trim_start_matches("0x");
    if hex_str.len() != 40 {
        return Err(eyre!(
            "Invalid lock args length: {} (expected 40 hex chars)",
            hex_str.len()
        ));
    }
    let mut args = [0u8; 20];
    hex::decode_to_slice(hex_str, &mut args)?;
    Ok(args)
}
