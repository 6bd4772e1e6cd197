use chrono::{DateTime, Duration, TimeZone, Utc};

use footy_value::decision::DecisionCandidate;
use footy_value::ensemble::ModelUsed;
use footy_value::feed::{Fixture, Quote};
use footy_value::ledger::{
    Ledger, LiveUpdate, RecordStatus, SqliteLedger, UpsertOutcome, performance_summary, record_id,
};
use footy_value::market::Market;

fn kickoff() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 2, 22, 17, 30, 0).unwrap()
}

fn candidate(fixture_id: u64, market: Market, odd: f64) -> DecisionCandidate {
    DecisionCandidate {
        fixture: Fixture {
            fixture_id,
            league_id: 78,
            home_id: 10,
            away_id: 20,
            kickoff: kickoff(),
        },
        market,
        quote: Quote {
            odd,
            provider: "book".to_string(),
        },
        model_prob_raw: 64.0,
        model_prob_calibrated: 63.0,
        market_prob: 100.0 / odd,
        fair_odd: 1.59,
        edge: 12.0,
        confidence: 72.5,
        stake_fraction: 0.06,
        model_used: ModelUsed::DixonColesWithPredictor,
        rating_prob: 65.0,
        predictor_prob: Some(60.0),
    }
}

fn temp_db(name: &str) -> std::path::PathBuf {
    std::env::temp_dir()
        .join(format!("footy_value_{name}_{}", std::process::id()))
        .join("ledger.sqlite")
}

#[test]
fn records_survive_reopen() {
    let path = temp_db("reopen");
    let now = kickoff() - Duration::days(1);
    {
        let mut ledger = SqliteLedger::open(&path).unwrap();
        assert_eq!(ledger.upsert(&candidate(1, Market::Over25, 2.0), now).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(ledger.upsert(&candidate(1, Market::BttsYes, 1.9), now).unwrap(), UpsertOutcome::Inserted);
    }
    let mut ledger = SqliteLedger::open(&path).unwrap();
    let records = ledger.load().unwrap();
    assert_eq!(records.len(), 2);
    let over = records.iter().find(|r| r.market == Market::Over25).unwrap();
    assert_eq!(over.model_used, ModelUsed::DixonColesWithPredictor);
    assert_eq!(over.kickoff, kickoff());
    assert_eq!(over.status, RecordStatus::Pending);

    let id = record_id(1, Market::Over25);
    let settled = ledger.resolve(&id, (1, 1), Some(1.8)).unwrap().unwrap();
    assert_eq!(settled.status, RecordStatus::Lost);
    assert_eq!(settled.clv_pct, Some(11.11));

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn resolved_records_ignore_later_updates() {
    let mut ledger = SqliteLedger::open_in_memory().unwrap();
    let now = kickoff() - Duration::days(2);
    ledger.upsert(&candidate(5, Market::Under25, 1.95), now).unwrap();
    let id = record_id(5, Market::Under25);
    ledger.resolve(&id, (0, 1), None).unwrap().unwrap();

    let update = LiveUpdate {
        odd: 2.05,
        edge: 20.0,
        confidence: 90.0,
    };
    assert!(!ledger.refresh(&id, &update, now).unwrap());
    assert_eq!(ledger.upsert(&candidate(5, Market::Under25, 2.05), now).unwrap(), UpsertOutcome::Frozen);

    let record = ledger.load().unwrap().remove(0);
    assert_eq!(record.status, RecordStatus::Won);
    assert_eq!(record.last_odd, 1.95);
    assert_eq!(record.confidence, 72.5);
    assert_eq!(record.closing_odd, Some(1.95));
    assert_eq!(record.clv_pct, Some(0.0));
}

#[test]
fn summary_over_stored_records() {
    let mut ledger = SqliteLedger::open_in_memory().unwrap();
    let now = kickoff() - Duration::days(3);
    for id in 1..=4 {
        ledger.upsert(&candidate(id, Market::Over25, 2.0), now).unwrap();
    }
    for (id, score) in [(1, (3, 0)), (2, (1, 0)), (3, (2, 2))] {
        ledger.resolve(&record_id(id, Market::Over25), score, None).unwrap().unwrap();
    }
    let s = performance_summary(&ledger.load().unwrap(), 200.0).unwrap();
    assert_eq!(s.resolved, 3);
    assert_eq!(s.won, 2);
    assert!((s.win_rate - 2.0 / 3.0).abs() < 1e-12);
    assert!((s.flat_yield_pct - 100.0 / 3.0).abs() < 1e-9);
    assert!(s.final_bankroll > 200.0);
}
