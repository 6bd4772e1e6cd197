use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use tracing_subscriber::EnvFilter;

use footy_value::config::EngineConfig;
use footy_value::decision::DecisionCandidate;
use footy_value::feed::{Fixture, MemoryFeed, PriceFeed, load_slate};
use footy_value::history::{self, HistoryDb};
use footy_value::league_params::load_cached_params;
use footy_value::ledger::{self, Ledger, MemoryLedger, SqliteLedger, performance_summary};
use footy_value::persist;
use footy_value::pipeline::Engine;
use footy_value::synthetic::SyntheticLeague;

const DEMO_LEAGUES: &[(u64, u32)] = &[(7, 39), (11, 140)];
const DEMO_SEASONS: usize = 3;

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    init_logging();

    let config = EngineConfig::load(path_arg("--config").as_deref())?;
    let mut engine = Engine::new(config, load_cached_params());

    let demo = has_flag("--demo");
    let (fixtures, feed, now) = if demo {
        load_demo(&mut engine)
    } else {
        load_live(&mut engine)?
    };

    let mut ledger: Box<dyn Ledger> = match path_arg("--ledger") {
        Some(path) => Box::new(SqliteLedger::open(&path)?),
        None if demo => Box::new(MemoryLedger::default()),
        None => {
            let path = ledger::default_ledger_path().context("unable to resolve ledger path")?;
            Box::new(SqliteLedger::open(&path)?)
        }
    };

    let models = engine.fit(now);
    println!("Rating models fitted: {models}");
    match engine.train() {
        Ok(report) => println!("Predictor trained on {} rows", report.rows),
        Err(err) => println!("Predictor unavailable: {err}"),
    }

    engine.recalibrate(ledger.as_ref())?;
    let settled = engine.settle(&feed, &feed, ledger.as_mut())?;
    let refreshed = engine.refresh_pending(&feed, ledger.as_mut(), now)?;
    let report = engine.scan(&fixtures, &feed, ledger.as_mut(), now)?;

    println!(
        "Fixtures: {} evaluated={} skipped={} ineligible={}",
        report.fixtures, report.evaluated, report.skipped, report.ineligible
    );
    println!(
        "Ledger: inserted={} refreshed={} settled={settled} repriced={refreshed}",
        report.inserted, report.refreshed
    );
    print_alerts(&report.alerts);
    for (reason, count) in engine.predictor().fallbacks().summary() {
        println!("Predictor fallback: {reason} x{count}");
    }

    let records = ledger.load()?;
    match performance_summary(&records, engine.config().initial_bankroll) {
        Some(s) => {
            println!();
            println!(
                "Resolved {} won {} ({:.1}%) flat yield {:+.2}% kelly yield {:+.2}%",
                s.resolved,
                s.won,
                s.win_rate * 100.0,
                s.flat_yield_pct,
                s.kelly_yield_pct
            );
            println!(
                "Bankroll {:.2} -> {:.2} ROI {:+.2}%",
                s.initial_bankroll, s.final_bankroll, s.roi_pct
            );
            if let Some(clv) = s.clv {
                println!(
                    "CLV avg {:+.2}% over {} picks, {} above +2% ({:.0}%)",
                    clv.avg_clv,
                    clv.count,
                    clv.positive,
                    clv.positive_rate * 100.0
                );
            }
        }
        None => println!("No resolved picks yet"),
    }

    if !demo && let Some(path) = persist::default_snapshot_path() {
        persist::save_snapshot(&path, engine.store(), engine.ensemble(), Utc::now())?;
    }
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Synthetic leagues with a round of fixtures one day out.
fn load_demo(engine: &mut Engine) -> (Vec<Fixture>, MemoryFeed, DateTime<Utc>) {
    let mut fixtures = Vec::new();
    let mut feed = MemoryFeed::default();
    let mut kickoff = None;
    for (i, (seed, league_id)) in DEMO_LEAGUES.iter().enumerate() {
        let league = SyntheticLeague::new(*seed, *league_id, 16);
        engine.set_league_matches(*league_id, league.simulate_seasons(DEMO_SEASONS));
        let at = league.next_kickoff(DEMO_SEASONS);
        let round = league.upcoming_fixtures(at, (i as u64 + 1) * 1_000);
        let book = league.price_book(&round, seed.wrapping_mul(31));
        for fx in &round {
            if let Some(p) = book.prices(fx.fixture_id) {
                feed.set_prices(fx.fixture_id, p);
            }
        }
        kickoff = Some(kickoff.map_or(at, |k: DateTime<Utc>| k.min(at)));
        fixtures.extend(round);
    }
    let now = kickoff.unwrap_or_else(Utc::now) - Duration::days(1);
    (fixtures, feed, now)
}

fn load_live(engine: &mut Engine) -> Result<(Vec<Fixture>, MemoryFeed, DateTime<Utc>)> {
    let db_path = path_arg("--db")
        .or_else(|| std::env::var("HIST_DB_PATH").ok().map(PathBuf::from))
        .or_else(history::default_db_path)
        .context("unable to resolve sqlite path")?;
    let mut db = HistoryDb::open(&db_path)?;
    if let Some(import) = path_arg("--import") {
        let matches = history::load_json_matches(&import)?;
        let n = db.upsert_matches(&matches)?;
        println!("Imported {n} matches from {}", import.display());
    }
    let loaded = engine.load_history(&db)?;
    if loaded == 0 {
        return Err(anyhow!("no historical matches in {}", db_path.display()));
    }

    if let Some(path) = persist::default_snapshot_path()
        && let Some(snapshot) = persist::load_snapshot(&path)?
    {
        engine.restore(snapshot);
    }

    let prices = path_arg("--prices").context("--prices <slate.json> is required without --demo")?;
    let (fixtures, feed) = load_slate(&prices)?;
    Ok((fixtures, feed, Utc::now()))
}

fn print_alerts(alerts: &[DecisionCandidate]) {
    if alerts.is_empty() {
        println!("No value picks");
        return;
    }
    println!();
    println!(
        "{:>10} {:>6} {:>6} {:<8} {:>6} {:>6} {:>6} {:>6} {:>6} {:<16}",
        "fixture", "home", "away", "market", "odd", "prob", "edge", "conf", "stake", "model"
    );
    for c in alerts {
        println!(
            "{:>10} {:>6} {:>6} {:<8} {:>6.2} {:>6.1} {:>6.1} {:>6.1} {:>5.1}% {:<16}",
            c.fixture.fixture_id,
            c.fixture.home_id,
            c.fixture.away_id,
            c.market.label(),
            c.quote.odd,
            c.model_prob_calibrated,
            c.edge,
            c.confidence,
            c.stake_fraction * 100.0,
            c.model_used.label()
        );
    }
}

fn has_flag(flag: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == flag)
}

fn path_arg(flag: &str) -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let prefix = format!("{flag}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(path) = arg.strip_prefix(&prefix) {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
        if arg == flag {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(PathBuf::from(next));
            }
        }
    }
    None
}
