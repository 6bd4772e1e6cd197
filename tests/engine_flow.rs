use chrono::Duration;

use footy_value::config::{DecisionConfig, EngineConfig};
use footy_value::feed::{Fixture, MarketPrices, MemoryFeed, PriceFeed, Quote, load_slate};
use footy_value::gbm::GbmParams;
use footy_value::history::HistoryDb;
use footy_value::league_params::LeagueParamsTable;
use footy_value::ledger::{Ledger, SqliteLedger};
use footy_value::market::Market;
use footy_value::persist::{load_snapshot, save_snapshot};
use footy_value::pipeline::{Engine, FixtureOutcome};
use footy_value::synthetic::SyntheticLeague;

fn quick_config() -> EngineConfig {
    EngineConfig {
        gbm: GbmParams {
            n_estimators: 25,
            ..GbmParams::default()
        },
        decision: DecisionConfig {
            min_confidence: 0.0,
            min_odd: 1.01,
            max_odd: 20.0,
            ..DecisionConfig::default()
        },
        ..EngineConfig::default()
    }
}

/// The same odd on all four markets of every fixture.
fn flat_feed(fixtures: &[Fixture], odd: f64) -> MemoryFeed {
    let mut feed = MemoryFeed::default();
    for fx in fixtures {
        let mut prices = MarketPrices::default();
        for market in Market::ALL {
            prices.insert(
                market,
                Quote {
                    odd,
                    provider: "flat".to_string(),
                },
            );
        }
        feed.set_prices(fx.fixture_id, prices);
    }
    feed
}

#[test]
fn history_db_to_ledger() {
    let league = SyntheticLeague::new(19, 61, 12);
    let mut db = HistoryDb::open_in_memory().unwrap();
    db.upsert_matches(&league.simulate_seasons(3)).unwrap();

    let mut engine = Engine::new(quick_config(), LeagueParamsTable::builtin());
    let loaded = engine.load_history(&db).unwrap();
    assert_eq!(loaded, db.match_count().unwrap());
    assert_eq!(engine.league_ids(), vec![61]);

    let kickoff = league.next_kickoff(3);
    let now = kickoff - Duration::days(1);
    let models = engine.fit(now);
    assert!(models > 0 && models <= 4);
    assert!(engine.store().models().all(|m| m.league_id == 61 && m.sample_size > 0));
    let report = engine.train().unwrap();
    assert!(report.rows >= 100);
    assert!(engine.predictor().is_trained());

    let fixtures = league.upcoming_fixtures(kickoff, 500);
    let feed = flat_feed(&fixtures, 5.0);
    let mut accepted = 0;
    for fx in &fixtures {
        let prices = feed.prices(fx.fixture_id).unwrap();
        match engine.evaluate_fixture(fx, &prices, now) {
            FixtureOutcome::Evaluated(picks) => {
                for pick in &picks {
                    assert!(pick.edge >= pick.market.min_edge());
                    assert!((0.0..=0.25).contains(&pick.stake_fraction));
                    assert!(pick.predictor_prob.is_some());
                }
                accepted += picks.len();
            }
            FixtureOutcome::Skipped(_) => {}
            FixtureOutcome::Ineligible(reason) => panic!("unexpected {reason:?}"),
        }
    }
    assert!(accepted > 0);

    let mut ledger = SqliteLedger::open_in_memory().unwrap();
    let scan = engine.scan(&fixtures, &feed, &mut ledger, now).unwrap();
    assert_eq!(scan.inserted, accepted);
    let stored = ledger.load().unwrap();
    assert_eq!(stored.len(), accepted);
    assert!(stored.iter().all(|r| r.predictor_prob.is_some() && r.model_used.label().ends_with("+gbm")));
}

#[test]
fn snapshot_restores_ensemble_weight() {
    let league = SyntheticLeague::new(23, 88, 10);
    let mut engine = Engine::new(quick_config(), LeagueParamsTable::builtin());
    engine.set_league_matches(88, league.simulate_seasons(3));
    let now = league.next_kickoff(3) - Duration::days(1);
    engine.fit(now);

    let dir = std::env::temp_dir().join(format!("footy_value_engine_snap_{}", std::process::id()));
    let path = dir.join("snapshot.json");
    save_snapshot(&path, engine.store(), engine.ensemble(), now).unwrap();

    let mut restored = Engine::new(EngineConfig::default(), LeagueParamsTable::builtin());
    restored.restore(load_snapshot(&path).unwrap().unwrap());
    assert_eq!(restored.store().len(), engine.store().len());
    assert_eq!(
        restored.ensemble().predictor_weight(),
        engine.ensemble().predictor_weight()
    );
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn slate_file_feeds_the_engine() {
    let dir = std::env::temp_dir().join(format!("footy_value_slate_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("slate.json");
    std::fs::write(
        &path,
        r#"{"fixtures":[
            {"fixture_id":1,"league_id":39,"home_id":1,"away_id":2,"kickoff":"2030-01-05T15:00:00Z",
             "odds":{"over25":1.9,"under25":1.95},"provider":"book"},
            {"fixture_id":2,"league_id":39,"home_id":3,"away_id":4,"kickoff":"2030-01-05T17:30:00Z",
             "odds":{"btts_yes":3.5},"score":"1-0"}
        ]}"#,
    )
    .unwrap();
    let (fixtures, feed) = load_slate(&path).unwrap();
    assert_eq!(fixtures.len(), 2);
    assert_eq!(feed.prices(1).unwrap().iter().count(), 2);

    // No history at all: the heuristic path still answers, with default odds range.
    let mut engine = Engine::new(EngineConfig::default(), LeagueParamsTable::builtin());
    let now = fixtures[0].kickoff - Duration::days(1);
    let outcome = engine.evaluate_fixture(&fixtures[1], &feed.prices(2).unwrap(), now);
    assert!(matches!(outcome, FixtureOutcome::Ineligible(_)));
    let outcome = engine.evaluate_fixture(&fixtures[0], &feed.prices(1).unwrap(), now);
    assert!(matches!(outcome, FixtureOutcome::Evaluated(_)));
    let _ = std::fs::remove_dir_all(&dir);
}
