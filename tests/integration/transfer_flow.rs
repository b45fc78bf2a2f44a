//! End-to-end transfer flow: sync, select, build, sign, send, then observe
//! the spent inputs and the change cell after the transaction is mined.

use std::time::Duration;

use ckb_types::{packed, prelude::*};

use ckb_cell_indexer::{
    domain::{
        cell::{CellStatus, IndexScope, LockFilter, OutPoint},
        error::IndexerError,
        selector::CoinSelector,
        signer::{Secp256k1Signer, Signer, recover_lock_args},
        tx_builder::{TransferBuilder, load_secp256k1_dep, sighash_all_message, sign},
    },
    infra::{collector::CellCollector, rpc::NodeRpc},
};

use super::fake_node::{genesis_type_id, output, transaction, tx_hash};
use super::{TestEnv, test_config};

const CKB: u64 = 1_00000000;
const FEE: u64 = 100_000;
const KEY: &str = "0x6c2b8a2e4f8d7b3c1a0e9f8d7c6b5a4938271605f4e3d2c1b0a9f8e7d6c5b4a3";

#[tokio::test]
async fn test_transfer_spends_selected_cells_and_returns_change() {
    let env = TestEnv::new(100);
    let signer = Secp256k1Signer::from_hex(KEY).unwrap();
    let dep = load_secp256k1_dep(env.node.as_ref()).unwrap();
    assert_eq!(dep.code_hash, genesis_type_id().script_hash());
    assert_eq!(dep.dep_group, OutPoint::new(tx_hash("genesis-dep-group"), 0));

    let sender = dep.lock(&signer.lock_args());
    let recipient = dep.lock(&[0x42; 20]);
    env.node.mine(vec![transaction(
        "fund",
        vec![OutPoint::new(tx_hash("genesis-cellbase"), 0)],
        vec![
            output(500 * CKB, &sender),
            output(300 * CKB, &sender),
            output(200 * CKB, &sender),
        ],
    )]);

    let filter = LockFilter::exact(&sender);
    let engine = env.engine(IndexScope::Locks(vec![filter.clone()]), test_config());
    engine.sync_to_tip().await.unwrap();

    let collector = CellCollector::new(env.store.clone());
    let selector = CoinSelector::new(collector.clone(), Duration::from_secs(60), true);

    let selection = selector.select(&filter, 600 * CKB, FEE).unwrap();
    let chosen: Vec<OutPoint> = selection.out_points().copied().collect();
    assert_eq!(
        chosen,
        vec![
            OutPoint::new(tx_hash("fund"), 0),
            OutPoint::new(tx_hash("fund"), 1)
        ]
    );
    assert_eq!(selection.change_capacity, 200 * CKB - FEE);

    let built = TransferBuilder::new(dep, sender.clone())
        .build(&selection, &recipient)
        .unwrap();
    let unsigned_hash = built.tx_hash;
    let tx = sign(built, &signer).unwrap();

    let witness = packed::WitnessArgs::from_slice(tx.witnesses[0].as_bytes()).unwrap();
    let signature = witness.lock().to_opt().unwrap().raw_data();
    let message = sighash_all_message(&unsigned_hash, tx.inputs.len());
    assert_eq!(
        recover_lock_args(&message, &signature).unwrap(),
        signer.lock_args()
    );

    let sent_hash = env.node.send_transaction(tx).unwrap();
    assert_eq!(sent_hash, unsigned_hash);
    assert_eq!(env.node.sent().len(), 1);

    // While the transfer is pending only the third cell can be selected
    let second = selector.select(&filter, 150 * CKB, 0).unwrap();
    assert_eq!(
        second.out_points().copied().collect::<Vec<_>>(),
        vec![OutPoint::new(tx_hash("fund"), 2)]
    );
    selector.release(second.token);
    assert!(matches!(
        selector.select(&filter, 201 * CKB, 0),
        Err(IndexerError::InsufficientFunds {
            available,
            reserved,
            ..
        }) if available == 200 * CKB && reserved == 800 * CKB
    ));

    env.node.mine_pending();
    engine.sync_to_tip().await.unwrap();

    let remaining: Vec<(OutPoint, u64)> = collector
        .collect_vec(&filter)
        .unwrap()
        .into_iter()
        .map(|cell| (cell.out_point, cell.capacity))
        .collect();
    assert_eq!(
        remaining,
        vec![
            (OutPoint::new(tx_hash("fund"), 2), 200 * CKB),
            (OutPoint::new(sent_hash, 1), 200 * CKB - FEE),
        ]
    );
    for out_point in &chosen {
        let spent = env.store.get_cell(out_point).unwrap().unwrap();
        assert_eq!(spent.status, CellStatus::Dead);
    }
    // Recipient cells are outside the indexed scope
    assert!(
        collector
            .collect_vec(&LockFilter::exact(&recipient))
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_insufficient_funds_reports_available_capacity() {
    let env = TestEnv::new(100);
    let signer = Secp256k1Signer::from_hex(KEY).unwrap();
    let dep = load_secp256k1_dep(env.node.as_ref()).unwrap();
    let sender = dep.lock(&signer.lock_args());
    env.node.mine(vec![transaction(
        "small-fund",
        vec![OutPoint::new(tx_hash("genesis-cellbase"), 0)],
        vec![output(100 * CKB, &sender)],
    )]);

    let filter = LockFilter::exact(&sender);
    let engine = env.engine(IndexScope::Locks(vec![filter.clone()]), test_config());
    engine.sync_to_tip().await.unwrap();

    let selector = CoinSelector::new(
        CellCollector::new(env.store.clone()),
        Duration::from_secs(60),
        true,
    );
    let err = selector.select(&filter, 100 * CKB, FEE).unwrap_err();
    assert!(matches!(
        err,
        IndexerError::InsufficientFunds {
            required,
            available,
            reserved: 0,
        } if required == 100 * CKB + FEE && available == 100 * CKB
    ));
    assert!(!err.is_fatal());
}
