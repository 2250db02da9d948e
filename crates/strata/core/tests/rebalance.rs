mod common;

use chrono::Duration;
use common::{addr, FakeVenue, Harness, ADMIN};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use strata_core::risk::{AGGRESSIVE, BALANCED, CONSERVATIVE};
use strata_core::{
    Address, Amount, AssetType, EngineConfig, Ledger, OracleConfig, RebalanceAction,
    RebalanceConfig, Rebalancer, RiskParameterStore, StrategyId, StrategyRecord,
    StrategyRegistry, VaultError,
};

struct Setup {
    harness: Harness,
    steady: StrategyId,
    spicy: StrategyId,
    spicy_venue: Arc<FakeVenue>,
}

async fn setup(harness: Harness) -> Setup {
    let spicy_venue = Arc::new(FakeVenue::new("spicy-lend", 800, 40));
    let steady = harness
        .add_strategy(
            Arc::new(FakeVenue::new("steady-lend", 500, 20)),
            AssetType::Usdc,
            100_000,
        )
        .await;
    let spicy = harness
        .add_strategy(spicy_venue.clone(), AssetType::Usdc, 100_000)
        .await;
    harness
        .engine
        .deposit(&addr("alice"), AssetType::Usdc, 10_000, BALANCED)
        .await
        .unwrap();
    Setup {
        harness,
        steady,
        spicy,
        spicy_venue,
    }
}

#[tokio::test]
async fn second_pass_with_unchanged_inputs_is_empty() {
    let Setup {
        harness,
        steady,
        spicy,
        ..
    } = setup(Harness::new()).await;
    let engine = &harness.engine;
    assert!(engine.rebalance_due().await.unwrap());

    let first = engine.rebalance().await.unwrap();
    assert_eq!(first.len(), 2);
    // balanced: 35% per-strategy cap on 10_000 binds both strategies
    assert_eq!(engine.strategy(steady).unwrap().allocated, 3_500);
    assert_eq!(engine.strategy(spicy).unwrap().allocated, 3_500);
    assert_eq!(engine.idle_liquidity(AssetType::Usdc).unwrap(), 3_000);

    let second = engine.rebalance().await.unwrap();
    assert!(second.is_empty());
    assert!(!engine.rebalance_due().await.unwrap());
    engine.check_invariants().unwrap();
}

#[tokio::test]
async fn failing_action_aborts_and_keeps_applied_ones() {
    let Setup {
        harness,
        steady,
        spicy,
        spicy_venue,
    } = setup(Harness::new()).await;
    spicy_venue.fail_allocate.store(true, Ordering::SeqCst);

    let err = harness.engine.rebalance().await.unwrap_err();
    match err {
        VaultError::RebalanceAborted {
            applied,
            action,
            source,
        } => {
            assert_eq!(applied, 1);
            assert!(action.contains(&spicy.to_string()));
            assert!(matches!(*source, VaultError::Venue { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(harness.engine.strategy(steady).unwrap().allocated, 3_500);
    assert_eq!(harness.engine.strategy(spicy).unwrap().allocated, 0);
    harness.engine.check_invariants().unwrap();

    spicy_venue.fail_allocate.store(false, Ordering::SeqCst);
    let retry = harness.engine.rebalance().await.unwrap();
    assert_eq!(retry.len(), 1);
    assert_eq!(spicy_venue.deployed(), 3_500);
}

#[tokio::test]
async fn volatility_spike_unwinds_allocations() {
    let config = EngineConfig {
        emergency_admin: addr(ADMIN),
        oracle: OracleConfig {
            max_deviation_bps: 5_000,
            ..OracleConfig::default()
        },
        ..EngineConfig::default()
    };
    let Setup {
        harness,
        steady,
        spicy,
        ..
    } = setup(Harness::with_config(config)).await;
    harness.engine.rebalance().await.unwrap();

    harness.clock.advance(Duration::minutes(1));
    harness.set_price(150);
    let actions = harness.engine.rebalance().await.unwrap();

    assert_eq!(
        actions,
        vec![
            RebalanceAction::Deallocate {
                strategy: steady,
                amount: 3_500
            },
            RebalanceAction::Deallocate {
                strategy: spicy,
                amount: 3_500
            },
        ]
    );
    assert_eq!(harness.engine.idle_liquidity(AssetType::Usdc).unwrap(), 10_000);
}

#[tokio::test]
async fn paused_vault_refuses_rebalance() {
    let Setup { harness, .. } = setup(Harness::new()).await;
    harness.engine.emergency_pause(&addr(ADMIN)).unwrap();
    assert!(matches!(
        harness.engine.rebalance().await,
        Err(VaultError::ContractPaused)
    ));
}

#[tokio::test]
async fn direct_allocation_checks_limits() {
    let Setup {
        harness,
        steady,
        spicy,
        ..
    } = setup(Harness::new()).await;
    let engine = &harness.engine;

    let err = engine.allocate(spicy, 100, CONSERVATIVE).await.unwrap_err();
    assert!(matches!(
        err,
        VaultError::RiskTooHigh {
            risk_score: 40,
            ceiling: 30,
            ..
        }
    ));

    let err = engine.allocate(steady, 20_000, BALANCED).await.unwrap_err();
    assert!(matches!(err, VaultError::InsufficientLiquidity { .. }));

    engine.allocate(steady, 1_000, BALANCED).await.unwrap();
    let err = engine.deallocate(steady, 1_001).await.unwrap_err();
    assert!(matches!(
        err,
        VaultError::ExceedsMaxAllocation {
            requested: 1_001,
            available: 1_000,
            ..
        }
    ));
    assert_eq!(engine.strategy(steady).unwrap().allocated, 1_000);
    assert_eq!(engine.deallocate(steady, 400).await.unwrap(), 400);
}

#[tokio::test]
async fn removed_strategy_is_drained() {
    let Setup {
        harness,
        steady,
        spicy,
        ..
    } = setup(Harness::new()).await;
    let engine = &harness.engine;
    engine.rebalance().await.unwrap();

    let whale = addr("governance-whale");
    let id = engine
        .create_proposal(
            &whale,
            "retire spicy",
            strata_core::ProposalPayload::RemoveStrategy { strategy: spicy },
            3_600,
        )
        .await
        .unwrap();
    let power = engine.voting_power(&whale).unwrap();
    engine
        .vote(&whale, id, strata_core::VoteDirection::For, power)
        .await
        .unwrap();
    harness.clock.advance(Duration::hours(1));
    engine.execute_proposal(&whale, id).await.unwrap();
    assert!(!engine.strategy(spicy).unwrap().active);

    let actions = engine.rebalance().await.unwrap();
    assert_eq!(
        actions[0],
        RebalanceAction::Deallocate {
            strategy: spicy,
            amount: 3_500
        }
    );
    assert_eq!(engine.strategy(spicy).unwrap().allocated, 0);
    assert_eq!(engine.strategy(steady).unwrap().allocated, 3_500);
}

#[tokio::test]
async fn governed_risk_score_survives_venue_reports() {
    let harness = Harness::new();
    let engine = &harness.engine;
    let lend = harness
        .add_strategy(
            Arc::new(FakeVenue::new("calm-lend", 500, 20)),
            AssetType::Usdc,
            100_000,
        )
        .await;

    let whale = addr("governance-whale");
    let id = engine
        .create_proposal(
            &whale,
            "reprice calm-lend risk",
            strata_core::ProposalPayload::UpdateStrategy {
                strategy: lend,
                max_allocation: None,
                risk_score: Some(90),
            },
            3_600,
        )
        .await
        .unwrap();
    let power = engine.voting_power(&whale).unwrap();
    engine
        .vote(&whale, id, strata_core::VoteDirection::For, power)
        .await
        .unwrap();
    harness.clock.advance(Duration::hours(1));
    engine.execute_proposal(&whale, id).await.unwrap();

    engine
        .deposit(&addr("carol"), AssetType::Usdc, 10_000, CONSERVATIVE)
        .await
        .unwrap();
    let actions = engine.rebalance().await.unwrap();
    assert!(actions.is_empty(), "unexpected actions {actions:?}");

    let record = engine.strategy(lend).unwrap();
    assert_eq!(record.risk_score, 90);
    assert_eq!(record.reported_risk_score, Some(20));
    assert_eq!(record.allocated, 0);
    assert!(matches!(
        engine.allocate(lend, 1_000, CONSERVATIVE).await,
        Err(VaultError::RiskTooHigh { risk_score: 90, .. })
    ));
}

fn arb_record(id: u64) -> impl Strategy<Value = StrategyRecord> {
    (
        1u128..50_000,
        0u8..=100,
        0u32..3_000,
        any::<bool>(),
        proptest::option::of(0u8..=100),
    )
        .prop_map(
            move |(max_allocation, risk_score, apy_bps, active, reported_risk_score)| {
                StrategyRecord {
                    id: StrategyId(id),
                    name: format!("s{id}"),
                    venue: format!("v{id}"),
                    asset: AssetType::Usdc,
                    active,
                    max_allocation,
                    risk_score,
                    apy_bps,
                    allocated: 0,
                    reported_risk_score,
                }
            },
        )
}

fn arb_deposits() -> impl Strategy<Value = Vec<(&'static str, Amount)>> {
    prop::collection::vec(
        (
            prop_oneof![Just(CONSERVATIVE), Just(BALANCED), Just(AGGRESSIVE)],
            1u128..100_000,
        ),
        1..8,
    )
}

proptest! {
    /// Targets never break strategy caps, cohort caps, risk ceilings or liquidity floors.
    #[test]
    fn plans_respect_hard_limits(
        records in (arb_record(1), arb_record(2), arb_record(3), arb_record(4)),
        deposits in arb_deposits(),
    ) {
        let mut ledger = Ledger::new(Address::new("admin"));
        for (i, (profile, amount)) in deposits.iter().enumerate() {
            ledger
                .deposit(
                    &Address::new(format!("user-{i}")),
                    AssetType::Usdc,
                    *amount,
                    profile,
                    Amount::MAX,
                    chrono::Utc::now(),
                )
                .unwrap();
        }
        let (a, b, c, d) = records;
        let strategies = StrategyRegistry::from_records([a, b, c, d]).unwrap();
        let risk = RiskParameterStore::with_defaults();
        let plan = Rebalancer::new(RebalanceConfig::default())
            .plan(&ledger, &strategies, &risk, &BTreeMap::from([(AssetType::Usdc, 0)]))
            .unwrap();

        for record in strategies.records() {
            let target = plan.targets[&record.id];
            prop_assert!(target <= record.max_allocation);
            if !record.active {
                prop_assert_eq!(target, 0);
            }
        }

        let mut deployable_total = 0;
        for cohort in &plan.cohorts {
            let profile = risk.get(&cohort.profile).unwrap();
            deployable_total += cohort.deployable;
            prop_assert!(cohort.shares.values().sum::<Amount>() <= cohort.deployable);
            for (id, share) in &cohort.shares {
                prop_assert!(*share <= cohort.per_strategy_cap);
                if *share > 0 {
                    prop_assert!(
                        strategies.get(*id).unwrap().effective_risk_score() <= profile.max_risk_score
                    );
                }
            }
        }
        prop_assert!(plan.targets.values().sum::<Amount>() <= deployable_total);
    }
}
