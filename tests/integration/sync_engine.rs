//! Sync engine behavior against the in-memory node: replay equivalence,
//! reorg recovery, failure escalation and the run/stop lifecycle.

use std::{sync::Arc, time::Duration};

use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};

use ckb_cell_indexer::{
    domain::{
        block::BlockTransaction,
        cell::{IndexScope, LockFilter, OutPoint},
        error::IndexerError,
    },
    infra::{collector::CellCollector, sync::SyncState},
};

use super::fake_node::{REWARD, output, transaction, tx_hash};
use super::{TestEnv, lock, test_config};

const WAIT: Duration = Duration::from_secs(5);

fn genesis_reward() -> OutPoint {
    OutPoint::new(tx_hash("genesis-cellbase"), 0)
}

/// Transactions spending random live cells of the current chain.
fn random_transactions(
    env: &TestEnv,
    rng: &mut StdRng,
    label: &str,
) -> Vec<BlockTransaction> {
    let live: Vec<(OutPoint, u64)> = env
        .node
        .replay_live_set(&IndexScope::All)
        .into_iter()
        .collect();
    let mut spendable: Vec<&(OutPoint, u64)> = live.iter().collect();
    spendable.shuffle(rng);

    let mut txs = Vec::new();
    let tx_count = rng.gen_range(0..=3);
    for i in 0..tx_count {
        let take = rng.gen_range(1..=2).min(spendable.len());
        if take == 0 {
            break;
        }
        let inputs: Vec<(OutPoint, u64)> = spendable.drain(..take).cloned().collect();
        let total: u64 = inputs.iter().map(|(_, capacity)| capacity).sum();

        let output_count = rng.gen_range(1..=3u64);
        let share = total / output_count;
        let outputs = (0..output_count)
            .map(|_| output(share, &lock(rng.gen_range(1..=3))))
            .collect();
        txs.push(transaction(
            &format!("{}-{}", label, i),
            inputs.into_iter().map(|(out_point, _)| out_point).collect(),
            outputs,
        ));
    }
    txs
}

#[tokio::test]
async fn test_sync_matches_replay() {
    let env = TestEnv::new(100);
    let mut rng = StdRng::seed_from_u64(7);
    for number in 1..=40 {
        let txs = random_transactions(&env, &mut rng, &format!("b{}", number));
        env.node.mine(txs);
    }

    let engine = env.engine(IndexScope::All, test_config());
    let progress = engine.sync_to_tip().await.unwrap();

    assert_eq!(progress.blocks_applied, 41);
    assert_eq!(progress.height, Some(40));
    assert_eq!(env.store_live_set(), env.node.replay_live_set(&IndexScope::All));
    assert_eq!(env.store.cursor().unwrap().current().unwrap().hash, env.node.tip().hash);
}

#[tokio::test]
async fn test_random_reorgs_match_replay() {
    let env = TestEnv::new(20);
    let mut rng = StdRng::seed_from_u64(42);
    let engine = env.engine(IndexScope::All, test_config());

    for round in 0..6 {
        for number in 0..8 {
            let txs = random_transactions(&env, &mut rng, &format!("r{}-{}", round, number));
            env.node.mine(txs);
        }
        engine.sync_to_tip().await.unwrap();
        assert_eq!(env.store_live_set(), env.node.replay_live_set(&IndexScope::All));

        // Replace the top of the chain with a longer branch built on the fork point
        let tip = env.node.tip().number;
        let fork = tip - rng.gen_range(1..=6);
        env.node.reorg(fork, vec![]);
        for n in 0..(tip - fork + rng.gen_range(1..=3)) {
            let txs = random_transactions(&env, &mut rng, &format!("f{}-{}", round, n));
            env.node.mine(txs);
        }

        engine.sync_to_tip().await.unwrap();
        assert_eq!(env.store_live_set(), env.node.replay_live_set(&IndexScope::All));
        assert_eq!(
            env.store.cursor().unwrap().current().unwrap().hash,
            env.node.tip().hash
        );
    }
}

#[tokio::test]
async fn test_reorg_recovery_restores_spent_cells() {
    let env = TestEnv::new(10);
    let alice = lock(1);
    let bob = lock(2);
    env.node.mine(vec![transaction(
        "pay-alice",
        vec![genesis_reward()],
        vec![output(REWARD - 400, &alice), output(400, &bob)],
    )]);
    env.node.mine_empty(4);

    let engine = env.engine(IndexScope::All, test_config());
    engine.sync_to_tip().await.unwrap();
    let collector = CellCollector::new(env.store.clone());
    assert_eq!(
        collector.capacity_of(&LockFilter::exact(&alice)).unwrap(),
        REWARD - 400
    );

    // Competing branch from genesis pays everything to bob
    let replacement = vec![
        vec![transaction(
            "pay-bob",
            vec![genesis_reward()],
            vec![output(REWARD, &bob)],
        )],
        vec![],
        vec![],
        vec![],
        vec![],
        vec![],
    ];
    env.node.reorg(0, replacement);

    let progress = engine.sync_to_tip().await.unwrap();
    assert_eq!(progress.reorgs, 1);
    assert_eq!(progress.height, Some(6));
    assert_eq!(collector.capacity_of(&LockFilter::exact(&alice)).unwrap(), 0);
    assert_eq!(
        collector.capacity_of(&LockFilter::exact(&bob)).unwrap(),
        REWARD
    );
    assert_eq!(env.store_live_set(), env.node.replay_live_set(&IndexScope::All));
}

#[tokio::test]
async fn test_lock_scope_indexes_only_matching_cells() {
    let env = TestEnv::new(100);
    let alice = lock(1);
    let bob = lock(2);
    env.node.mine(vec![transaction(
        "split",
        vec![genesis_reward()],
        vec![output(600, &alice), output(400, &bob)],
    )]);
    env.node.mine(vec![
        transaction(
            "alice-pays",
            vec![OutPoint::new(tx_hash("split"), 0)],
            vec![output(100, &bob), output(500, &alice)],
        ),
        transaction(
            "bob-pays",
            vec![OutPoint::new(tx_hash("split"), 1)],
            vec![output(400, &alice)],
        ),
    ]);

    let scope = IndexScope::Locks(vec![LockFilter::exact(&alice)]);
    let engine = env.engine(scope.clone(), test_config());
    engine.sync_to_tip().await.unwrap();

    let live = env.store_live_set();
    assert_eq!(live, env.node.replay_live_set(&scope));
    assert_eq!(live.values().sum::<u64>(), 900);
    // Bob's cells were never indexed
    assert!(!env.store.contains(&OutPoint::new(tx_hash("split"), 1)).unwrap());
    assert!(
        env.store
            .get_cell(&OutPoint::new(tx_hash("split"), 0))
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_reorg_deeper_than_window_fails() {
    let env = TestEnv::new(3);
    env.node.mine_empty(10);
    let engine = Arc::new(env.engine(IndexScope::All, test_config()));
    engine.sync_to_tip().await.unwrap();

    env.node.reorg(2, vec![vec![]; 9]);
    let err = engine.run().await.unwrap_err();

    assert!(matches!(err, IndexerError::RollbackTooDeep { .. }));
    assert!(err.is_fatal());
    assert!(matches!(engine.state(), SyncState::Failed(_)));
    // Nothing was rolled back
    assert_eq!(env.store.cursor().unwrap().height(), Some(10));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let env = TestEnv::new(100);
    env.node.mine_empty(3);
    env.node.fail_next(2);

    let engine = env.engine(IndexScope::All, test_config());
    let progress = engine.sync_to_tip().await.unwrap();
    assert_eq!(progress.height, Some(3));
    // One tip fetch plus four blocks, with two extra attempts for the failures
    assert!(env.node.requests() >= 7);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_engine() {
    let env = TestEnv::new(100);
    env.node.mine_empty(3);
    env.node.fail_next(3);

    let engine = env.engine(IndexScope::All, test_config());
    let err = engine.run().await.unwrap_err();
    assert!(matches!(err, IndexerError::FetchFailed { .. }));
    assert!(matches!(engine.state(), SyncState::Failed(_)));
    assert_eq!(env.store.cursor().unwrap().height(), None);
}

#[tokio::test]
async fn test_slow_node_times_out() {
    let env = TestEnv::new(100);
    env.node.set_delay(Duration::from_millis(200));

    let mut config = test_config();
    config.fetch_timeout_ms = 50;
    config.fetch_retries = 2;
    let engine = env.engine(IndexScope::All, config);

    let err = engine.sync_to_tip().await.unwrap_err();
    assert!(matches!(
        err,
        IndexerError::FetchTimeout {
            timeout_ms: 50,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_follow_and_stop() {
    let env = TestEnv::new(100);
    env.node.mine_empty(5);

    let engine = Arc::new(env.engine(IndexScope::All, test_config()));
    let mut states = engine.subscribe();
    let handle = engine.clone().start();

    tokio::time::timeout(
        WAIT,
        states.wait_for(|s| matches!(s, SyncState::Idle { height: Some(5), .. })),
    )
    .await
    .expect("engine did not catch up")
    .unwrap();

    env.node.mine_empty(3);
    tokio::time::timeout(
        WAIT,
        states.wait_for(|s| matches!(s, SyncState::Idle { height: Some(8), .. })),
    )
    .await
    .expect("engine did not follow the tip")
    .unwrap();

    engine.stop();
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("engine did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(engine.state(), SyncState::Stopped);
    assert_eq!(env.store_live_set(), env.node.replay_live_set(&IndexScope::All));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_right_after_start() {
    let env = TestEnv::new(100);
    env.node.mine_empty(2);

    let engine = Arc::new(env.engine(IndexScope::All, test_config()));
    let handle = engine.clone().start();
    engine.stop();

    tokio::time::timeout(WAIT, handle)
        .await
        .expect("engine ignored the stop request")
        .unwrap()
        .unwrap();
    assert_eq!(engine.state(), SyncState::Stopped);

    // A stopped engine starts again
    let mut states = engine.subscribe();
    let handle = engine.clone().start();
    tokio::time::timeout(
        WAIT,
        states.wait_for(|s| matches!(s, SyncState::Idle { height: Some(2), .. })),
    )
    .await
    .expect("restarted engine did not catch up")
    .unwrap();
    engine.stop();
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("engine did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_scope_change_on_one_store_is_rejected() {
    let env = TestEnv::new(100);
    let alice = lock(1);
    let bob = lock(2);
    env.node.mine(vec![transaction(
        "split",
        vec![genesis_reward()],
        vec![output(600, &alice), output(400, &bob)],
    )]);
    env.node.mine(vec![transaction(
        "bob-pays",
        vec![OutPoint::new(tx_hash("split"), 1)],
        vec![output(150, &alice), output(250, &bob)],
    )]);

    let alice_scope = IndexScope::Locks(vec![LockFilter::exact(&alice)]);
    let bob_scope = IndexScope::Locks(vec![LockFilter::exact(&bob)]);
    env.engine(alice_scope.clone(), test_config())
        .sync_to_tip()
        .await
        .unwrap();
    let height = env.store.cursor().unwrap().height();

    let err = env
        .engine(bob_scope.clone(), test_config())
        .sync_to_tip()
        .await
        .unwrap_err();
    assert!(matches!(err, IndexerError::ScopeMismatch { .. }));
    assert!(err.is_fatal());

    let engine = env.engine(IndexScope::All, test_config());
    assert!(matches!(
        engine.run().await,
        Err(IndexerError::ScopeMismatch { .. })
    ));
    assert!(matches!(engine.state(), SyncState::Failed(_)));

    // Nothing was written by the rejected engines
    assert_eq!(env.store.cursor().unwrap().height(), height);
    assert_eq!(env.store.scope().unwrap(), Some(alice_scope.clone()));
    assert_eq!(env.store_live_set(), env.node.replay_live_set(&alice_scope));

    // After a reset the store follows the new scope from scratch
    env.store.reset().unwrap();
    env.engine(bob_scope.clone(), test_config())
        .sync_to_tip()
        .await
        .unwrap();
    let collector = CellCollector::new(env.store.clone());
    assert_eq!(collector.capacity_of(&LockFilter::exact(&bob)).unwrap(), 250);
    assert_eq!(env.store_live_set(), env.node.replay_live_set(&bob_scope));
}
