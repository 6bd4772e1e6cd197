use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing_subscriber::EnvFilter;

use footy_value::calibration::{self, Metrics};
use footy_value::config::EngineConfig;
use footy_value::dixon_coles::{RatingStore, fit_league};
use footy_value::ensemble::{EnsembleState, rating_estimate};
use footy_value::features::{build_training_set, inference_features};
use footy_value::history::{self, HistoricalMatch, HistoryDb, HistorySource, MemoryHistory};
use footy_value::lambdas::FixtureContext;
use footy_value::league_params::{LeagueParamsTable, load_cached_params};
use footy_value::market::{Market, MarketScope, PerMarket};
use footy_value::predictor::{GoalsPredictor, PredictorOutcome};
use footy_value::synthetic::SyntheticLeague;

const DEFAULT_REFIT_EVERY: usize = 40;
const DEFAULT_WARMUP: f64 = 0.5;

/// Probabilities (0..1) collected for one market over the test window.
#[derive(Debug, Default)]
struct Series {
    rating: Vec<f64>,
    predictor: Vec<f64>,
    blend: Vec<f64>,
    outcomes: Vec<bool>,
    /// Outcomes of the rows the predictor answered for.
    predictor_outcomes: Vec<bool>,
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Rating,
    Predictor,
    Blend,
}

impl Series {
    fn column(&self, source: Source) -> (&[f64], &[bool]) {
        match source {
            Source::Rating => (self.rating.as_slice(), self.outcomes.as_slice()),
            Source::Predictor => (self.predictor.as_slice(), self.predictor_outcomes.as_slice()),
            Source::Blend => (self.blend.as_slice(), self.outcomes.as_slice()),
        }
    }
}

#[derive(Debug)]
struct LeagueReport {
    league_id: u32,
    train: usize,
    test: usize,
    skipped: usize,
    refits: usize,
    predictor_rows: Option<usize>,
    rating: PerMarket<Metrics>,
    predictor: PerMarket<Metrics>,
    blend: PerMarket<Metrics>,
}

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let config = EngineConfig::load(parse_path_arg("--config").as_deref())?;
    let params = load_cached_params();
    let refit_every = parse_usize_arg("--refit-every")
        .unwrap_or(DEFAULT_REFIT_EVERY)
        .max(1);
    let warmup = parse_f64_arg("--warmup")
        .unwrap_or(DEFAULT_WARMUP)
        .clamp(0.2, 0.9);

    let source: Box<dyn HistorySource> = if has_flag("--demo") {
        let mut matches = Vec::new();
        for (seed, league_id) in [(3_u64, 39_u32), (5, 78)] {
            matches.extend(SyntheticLeague::new(seed, league_id, 16).simulate_seasons(3));
        }
        Box::new(MemoryHistory::new(matches))
    } else {
        let db_path = parse_path_arg("--db")
            .or_else(|| std::env::var("HIST_DB_PATH").ok().map(PathBuf::from))
            .or_else(history::default_db_path)
            .context("unable to resolve sqlite path")?;
        Box::new(HistoryDb::open(&db_path)?)
    };

    let league_ids = match parse_league_ids_arg() {
        Some(ids) => ids,
        None => source.league_ids()?,
    };
    if league_ids.is_empty() {
        return Err(anyhow!("no league ids resolved"));
    }

    let mut reports = Vec::new();
    for league_id in league_ids {
        let matches = source.finished_matches(league_id)?;
        match walk_forward(league_id, &matches, &config, &params, refit_every, warmup) {
            Some(report) => reports.push(report),
            None => println!("league {league_id}: not enough matches ({})", matches.len()),
        }
    }

    for r in &reports {
        print_report(r);
    }
    Ok(())
}

fn walk_forward(
    league_id: u32,
    matches: &[HistoricalMatch],
    config: &EngineConfig,
    params: &LeagueParamsTable,
    refit_every: usize,
    warmup: f64,
) -> Option<LeagueReport> {
    let general = params.get(league_id, MarketScope::General);
    let split = ((matches.len() as f64 * warmup) as usize).max(general.min_matches);
    if split >= matches.len() {
        return None;
    }

    let (train_set, mut book) = build_training_set(&matches[..split]);
    let mut predictor = GoalsPredictor::untrained();
    let predictor_rows = if config.predictor_enabled {
        predictor
            .train(&train_set, &config.gbm, config.min_training_rows)
            .ok()
            .map(|r| r.rows)
    } else {
        None
    };
    let ensemble = EnsembleState::new(config.initial_predictor_weight, config.adaptive);

    let mut series: Vec<Series> = Market::ALL.iter().map(|_| Series::default()).collect();
    let mut store = RatingStore::default();
    let mut refits = 0;
    let mut skipped = 0;

    for (i, m) in matches.iter().enumerate().skip(split) {
        if (i - split) % refit_every == 0 {
            store = refit(&matches[..i], league_id, params, m.kickoff);
            refits += 1;
        }
        let ctx = FixtureContext::build(&book, &matches[..i], m.home_id, m.away_id, general.xi_decay, m.kickoff);
        let rating = match rating_estimate(&store, params, league_id, m.home_id, m.away_id, &ctx) {
            Ok(r) => r,
            Err(_) => {
                skipped += 1;
                book.absorb(m);
                continue;
            }
        };
        let predicted = match inference_features(&book, m.home_id, m.away_id) {
            Ok(features) if predictor.is_trained() => match predictor.predict(&features, m.kickoff) {
                PredictorOutcome::Probs(p) => Some(p),
                PredictorOutcome::Fallback(_) => None,
            },
            _ => None,
        };
        let Ok(combined) = ensemble.combine(&rating, predicted.as_ref(), None) else {
            skipped += 1;
            book.absorb(m);
            continue;
        };

        for market in Market::ALL {
            let s = &mut series[market.index()];
            let won = market.settle(m.home_goals, m.away_goals);
            s.rating.push(rating.probs.get(market) / 100.0);
            s.blend.push(combined.probs.get(market) / 100.0);
            s.outcomes.push(won);
            if let Some(p) = &predicted {
                s.predictor.push(p.get(market) / 100.0);
                s.predictor_outcomes.push(won);
            }
        }
        book.absorb(m);
    }

    let metrics = |source: Source| {
        PerMarket::from_fn(|market| {
            let (probs, outcomes) = series[market.index()].column(source);
            calibration::evaluate_probs(probs, outcomes)
        })
    };
    Some(LeagueReport {
        league_id,
        train: split,
        test: matches.len() - split,
        skipped,
        refits,
        predictor_rows,
        rating: metrics(Source::Rating),
        predictor: metrics(Source::Predictor),
        blend: metrics(Source::Blend),
    })
}

fn refit(history: &[HistoricalMatch], league_id: u32, params: &LeagueParamsTable, as_of: DateTime<Utc>) -> RatingStore {
    let mut store = RatingStore::default();
    store.absorb(fit_league(history, league_id, params, as_of));
    store
}

fn print_report(r: &LeagueReport) {
    println!();
    println!(
        "league {}: train={} test={} skipped={} refits={} predictor_rows={}",
        r.league_id,
        r.train,
        r.test,
        r.skipped,
        r.refits,
        r.predictor_rows
            .map(|n| n.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!(
        "  {:<10} {:>22} {:>22} {:>22}",
        "market", "rating brier/ll/acc", "predictor brier/ll/acc", "blend brier/ll/acc"
    );
    for market in Market::ALL {
        println!(
            "  {:<10} {:>22} {:>22} {:>22}",
            market.key(),
            fmt_metrics(&r.rating.get(market)),
            fmt_metrics(&r.predictor.get(market)),
            fmt_metrics(&r.blend.get(market))
        );
    }
}

fn fmt_metrics(m: &Metrics) -> String {
    if m.samples == 0 {
        return "n/a".to_string();
    }
    format!("{:.4}/{:.4}/{:.1}%", m.brier, m.log_loss, m.accuracy * 100.0)
}

fn has_flag(flag: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == flag)
}

fn arg_value(flag: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let prefix = format!("{flag}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&prefix) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == flag {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(next.trim().to_string());
            }
        }
    }
    None
}

fn parse_path_arg(flag: &str) -> Option<PathBuf> {
    arg_value(flag).map(PathBuf::from)
}

fn parse_usize_arg(flag: &str) -> Option<usize> {
    arg_value(flag).and_then(|v| v.parse::<usize>().ok())
}

fn parse_f64_arg(flag: &str) -> Option<f64> {
    arg_value(flag).and_then(|v| v.parse::<f64>().ok())
}

fn parse_league_ids_arg() -> Option<Vec<u32>> {
    let raw = arg_value("--leagues")?;
    let ids = raw
        .split(',')
        .filter_map(|part| part.trim().parse::<u32>().ok())
        .collect::<Vec<_>>();
    if ids.is_empty() { None } else { Some(ids) }
}
