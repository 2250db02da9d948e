mod common;

use chrono::Duration;
use common::{addr, FakeVenue, Harness};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use strata_core::risk::BALANCED;
use strata_core::{AssetType, Clock, EngineConfig, LedgerConfig, VaultError, VaultEvent};

fn capped(cap: u128) -> Harness {
    Harness::with_config(EngineConfig {
        emergency_admin: addr(common::ADMIN),
        ledger: LedgerConfig {
            daily_withdrawal_cap: cap,
            ..LedgerConfig::default()
        },
        ..EngineConfig::default()
    })
}

#[tokio::test]
async fn daily_limit_blocks_large_and_repeated_withdrawals() {
    let harness = capped(1_000);
    let engine = &harness.engine;
    let alice = addr("alice");
    engine
        .deposit(&alice, AssetType::Usdc, 5_000, BALANCED)
        .await
        .unwrap();

    let err = engine.withdraw(&alice, AssetType::Usdc, 1_500).await.unwrap_err();
    assert!(matches!(
        err,
        VaultError::ExceedsWithdrawalLimit {
            requested: 1_500,
            remaining: 1_000,
            cap: 1_000,
            ..
        }
    ));

    assert_eq!(engine.withdraw(&alice, AssetType::Usdc, 600).await.unwrap(), 600);
    let err = engine.withdraw(&alice, AssetType::Usdc, 600).await.unwrap_err();
    assert!(matches!(
        err,
        VaultError::ExceedsWithdrawalLimit { remaining: 400, .. }
    ));

    harness.clock.advance(Duration::days(1));
    assert_eq!(engine.withdraw(&alice, AssetType::Usdc, 600).await.unwrap(), 600);
    assert_eq!(engine.balance_of(&alice, AssetType::Usdc).unwrap(), 3_800);
    assert_eq!(harness.custody.transfer_count(), 2);
}

#[tokio::test]
async fn custody_failure_restores_the_debit() {
    let harness = capped(1_000);
    let engine = &harness.engine;
    let alice = addr("alice");
    engine
        .deposit(&alice, AssetType::Usdc, 5_000, BALANCED)
        .await
        .unwrap();
    let mut events = engine.subscribe();

    harness.custody.fail.store(true, Ordering::SeqCst);
    let err = engine.withdraw(&alice, AssetType::Usdc, 800).await.unwrap_err();
    assert!(matches!(err, VaultError::Custody(_)));

    assert_eq!(engine.balance_of(&alice, AssetType::Usdc).unwrap(), 5_000);
    assert_eq!(engine.total_deposits(AssetType::Usdc).unwrap(), 5_000);
    let account = engine.account(&alice).unwrap().unwrap();
    assert_eq!(
        account.remaining_withdrawal(AssetType::Usdc, 86_400, harness.clock.now()),
        1_000
    );
    assert!(events.try_recv().is_err());

    harness.custody.fail.store(false, Ordering::SeqCst);
    assert_eq!(engine.withdraw(&alice, AssetType::Usdc, 800).await.unwrap(), 800);
    assert!(matches!(
        events.try_recv().unwrap(),
        VaultEvent::Withdrawn { amount: 800, .. }
    ));
    engine.check_invariants().unwrap();
}

#[tokio::test]
async fn withdrawal_recalls_deployed_funds() {
    let harness = Harness::new();
    let venue = Arc::new(FakeVenue::new("risky-lend", 900, 50));
    let calm = Arc::new(FakeVenue::new("calm-lend", 300, 10));
    let risky = harness
        .add_strategy(venue.clone(), AssetType::Usdc, 100_000)
        .await;
    let steady = harness
        .add_strategy(calm.clone(), AssetType::Usdc, 100_000)
        .await;
    let engine = &harness.engine;
    let bob = addr("bob");
    engine
        .deposit(&bob, AssetType::Usdc, 10_000, "aggressive")
        .await
        .unwrap();
    engine.allocate(risky, 5_000, "aggressive").await.unwrap();
    engine.allocate(steady, 4_000, "aggressive").await.unwrap();
    assert_eq!(engine.idle_liquidity(AssetType::Usdc).unwrap(), 1_000);

    assert_eq!(engine.withdraw(&bob, AssetType::Usdc, 3_000).await.unwrap(), 3_000);

    // highest risk score is recalled first
    assert_eq!(engine.strategy(risky).unwrap().allocated, 3_000);
    assert_eq!(engine.strategy(steady).unwrap().allocated, 4_000);
    assert_eq!(venue.deployed(), 3_000);
    assert_eq!(engine.idle_liquidity(AssetType::Usdc).unwrap(), 0);
    engine.check_invariants().unwrap();
}

#[tokio::test]
async fn rebalance_waits_out_an_in_flight_recall() {
    let harness = Harness::new();
    let venue = Arc::new(FakeVenue::new("risky-lend", 900, 50));
    let risky = harness
        .add_strategy(venue.clone(), AssetType::Usdc, 100_000)
        .await;
    let engine = harness.engine.clone();
    let bob = addr("bob");
    engine
        .deposit(&bob, AssetType::Usdc, 10_000, "aggressive")
        .await
        .unwrap();
    engine.allocate(risky, 9_000, "aggressive").await.unwrap();
    venue.hold_deallocate.store(true, Ordering::SeqCst);

    let withdrawing = tokio::spawn({
        let engine = engine.clone();
        let bob = bob.clone();
        async move { engine.withdraw(&bob, AssetType::Usdc, 4_000).await }
    });
    venue.deallocating.notified().await;

    // the recall has released 3_000 but the debit has not committed yet
    assert!(matches!(
        engine.rebalance().await,
        Err(VaultError::OperationInProgress { .. })
    ));
    assert_eq!(engine.strategy(risky).unwrap().allocated, 6_000);

    venue.hold_deallocate.store(false, Ordering::SeqCst);
    venue.resume.notify_one();
    assert_eq!(withdrawing.await.unwrap().unwrap(), 4_000);
    assert_eq!(engine.balance_of(&bob, AssetType::Usdc).unwrap(), 6_000);
    assert_eq!(engine.idle_liquidity(AssetType::Usdc).unwrap(), 0);
    assert_eq!(venue.deployed(), 6_000);
    engine.check_invariants().unwrap();

    assert!(engine.rebalance().await.is_ok());
}

#[tokio::test]
async fn unrecallable_shortfall_fails_without_debit() {
    let harness = Harness::new();
    let venue = Arc::new(FakeVenue::new("stuck-lend", 900, 50));
    let stuck = harness
        .add_strategy(venue.clone(), AssetType::Usdc, 100_000)
        .await;
    let engine = &harness.engine;
    let bob = addr("bob");
    engine
        .deposit(&bob, AssetType::Usdc, 10_000, "aggressive")
        .await
        .unwrap();
    engine.allocate(stuck, 5_000, "aggressive").await.unwrap();
    venue.fail_deallocate.store(true, Ordering::SeqCst);

    let err = engine.withdraw(&bob, AssetType::Usdc, 8_000).await.unwrap_err();
    assert!(matches!(err, VaultError::Venue { .. }));
    assert_eq!(engine.balance_of(&bob, AssetType::Usdc).unwrap(), 10_000);
    assert_eq!(engine.strategy(stuck).unwrap().allocated, 5_000);
    assert_eq!(harness.custody.transfer_count(), 0);
}

#[tokio::test]
async fn unknown_risk_profile_is_rejected_on_deposit() {
    let harness = Harness::new();
    let err = harness
        .engine
        .deposit(&addr("eve"), AssetType::Usdc, 10, "yolo")
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::UnknownRiskProfile(_)));
    assert!(harness.engine.account(&addr("eve")).unwrap().is_none());
}

#[tokio::test]
async fn concurrent_deposits_keep_totals_consistent() {
    let harness = Harness::new();
    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = harness.engine.clone();
        handles.push(tokio::spawn(async move {
            let who = addr(&format!("user-{}", i % 4));
            engine
                .deposit(&who, AssetType::Usdt, 100 + i, BALANCED)
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    let expected: u128 = (0..16).map(|i| 100 + i).sum();
    assert_eq!(harness.engine.total_deposits(AssetType::Usdt).unwrap(), expected);
    harness.engine.check_invariants().unwrap();
}
