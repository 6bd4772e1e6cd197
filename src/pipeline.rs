//! The batch driver: fit, train, scan a slate of fixtures, keep the ledger
//! current and settle finished matches.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::calibration::CalibrationTable;
use crate::config::EngineConfig;
use crate::decision::{DecisionCandidate, DecisionGate, inside_kickoff_buffer, sort_best_first};
use crate::dixon_coles::{RatingStore, fit_leagues_parallel};
use crate::ensemble::{Combined, EnsembleState, rating_estimate, sanity_check};
use crate::error::Unavailable;
use crate::features::{TrainingSet, build_training_set, inference_features};
use crate::feed::{Fixture, MarketPrices, OutcomeFeed, PriceFeed};
use crate::history::{HistoricalMatch, HistorySource, sort_chronologically};
use crate::lambdas::FixtureContext;
use crate::league_params::LeagueParamsTable;
use crate::ledger::{Ledger, LiveUpdate, RecordStatus, UpsertOutcome};
use crate::market::MarketScope;
use crate::persist::Snapshot;
use crate::predictor::{GoalsPredictor, PredictorOutcome, TrainingReport};
use crate::team_stats::TeamStatsBook;

/// Result of looking at one fixture.
#[derive(Debug, Clone, PartialEq)]
pub enum FixtureOutcome {
    /// Accepted picks, best first; empty when nothing cleared the gate.
    Evaluated(Vec<DecisionCandidate>),
    /// The numeric core gave no answer.
    Skipped(Unavailable),
    /// Not looked at.
    Ineligible(Ineligible),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    InsideKickoffBuffer,
    NoQuotes,
    NoOddInRange,
}

/// Finished matches of one league plus the running aggregates after them.
#[derive(Debug, Clone, Default)]
struct LeagueHistory {
    matches: Vec<HistoricalMatch>,
    book: TeamStatsBook,
}

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub fixtures: usize,
    pub evaluated: usize,
    pub skipped: usize,
    pub ineligible: usize,
    pub inserted: usize,
    pub refreshed: usize,
    /// Best pick per fixture, best first, cut to the alert limit.
    pub alerts: Vec<DecisionCandidate>,
}

/// What the rating path and the ensemble agreed on for a fixture.
struct Assessment {
    combined: Combined,
    quality: f64,
}

pub struct Engine {
    config: EngineConfig,
    params: LeagueParamsTable,
    store: RatingStore,
    leagues: BTreeMap<u32, LeagueHistory>,
    predictor: GoalsPredictor,
    ensemble: EnsembleState,
    calibration: CalibrationTable,
}

impl Engine {
    pub fn new(config: EngineConfig, params: LeagueParamsTable) -> Self {
        let ensemble = EnsembleState::new(config.initial_predictor_weight, config.adaptive);
        Self {
            config,
            params,
            store: RatingStore::default(),
            leagues: BTreeMap::new(),
            predictor: GoalsPredictor::untrained(),
            ensemble,
            calibration: CalibrationTable::priors(),
        }
    }

    /// Restores fitted ratings and the ensemble weight from a snapshot. The
    /// adaptive settings stay those of the current config.
    pub fn restore(&mut self, snapshot: Snapshot) {
        info!(
            saved_at = %snapshot.saved_at,
            models = snapshot.store.len(),
            weight = snapshot.ensemble.predictor_weight(),
            "restored snapshot"
        );
        self.store = snapshot.store;
        self.ensemble = snapshot.ensemble;
        if *self.ensemble.adaptive() != self.config.adaptive {
            debug!("snapshot adaptive settings replaced by config");
        }
        self.ensemble.set_adaptive(self.config.adaptive);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &RatingStore {
        &self.store
    }

    pub fn ensemble(&self) -> &EnsembleState {
        &self.ensemble
    }

    pub fn predictor(&self) -> &GoalsPredictor {
        &self.predictor
    }

    pub fn calibration(&self) -> &CalibrationTable {
        &self.calibration
    }

    pub fn league_ids(&self) -> Vec<u32> {
        self.leagues.keys().copied().collect()
    }

    pub fn match_count(&self) -> usize {
        self.leagues.values().map(|l| l.matches.len()).sum()
    }

    /// Replaces a league's history and rebuilds its aggregates.
    pub fn set_league_matches(&mut self, league_id: u32, mut matches: Vec<HistoricalMatch>) {
        matches.retain(|m| m.league_id == league_id);
        sort_chronologically(&mut matches);
        let book = TeamStatsBook::from_matches(&matches);
        self.leagues.insert(league_id, LeagueHistory { matches, book });
    }

    /// Pulls every league the source knows. Returns matches loaded.
    pub fn load_history(&mut self, source: &dyn HistorySource) -> Result<usize> {
        let mut total = 0;
        for league_id in source.league_ids()? {
            let matches = source.finished_matches(league_id)?;
            total += matches.len();
            self.set_league_matches(league_id, matches);
        }
        info!(leagues = self.leagues.len(), matches = total, "history loaded");
        Ok(total)
    }

    /// Fits every scope of every league as of `as_of`. Returns models stored.
    pub fn fit(&mut self, as_of: DateTime<Utc>) -> usize {
        let inputs: Vec<(u32, Vec<HistoricalMatch>)> = self
            .leagues
            .iter()
            .map(|(id, l)| (*id, l.matches.clone()))
            .collect();
        let mut store = RatingStore::default();
        for fit in fit_leagues_parallel(&inputs, &self.params, as_of) {
            store.absorb(fit);
        }
        self.store = store;
        self.store.len()
    }

    /// Trains the predictor on the replayed history of all leagues.
    pub fn train(&mut self) -> Result<TrainingReport, Unavailable> {
        if !self.config.predictor_enabled {
            return Err(Unavailable::PredictionFailure("predictor disabled".to_string()));
        }
        let mut set = TrainingSet::default();
        for league in self.leagues.values() {
            let (part, _) = build_training_set(&league.matches);
            set.rows.extend(part.rows);
            set.skipped += part.skipped;
        }
        self.predictor
            .train(&set, &self.config.gbm, self.config.min_training_rows)
    }

    /// Rebuilds the calibration table from the ledger's settled picks.
    pub fn recalibrate(&mut self, ledger: &dyn Ledger) -> Result<()> {
        let picks: Vec<_> = ledger.load()?.iter().filter_map(|r| r.settled_pick()).collect();
        self.calibration = CalibrationTable::from_settled(&picks);
        debug!(settled = picks.len(), "calibration rebuilt");
        Ok(())
    }

    fn gate(&self) -> DecisionGate<'_> {
        DecisionGate {
            config: &self.config.decision,
            calibration: &self.calibration,
        }
    }

    fn assess(&mut self, fixture: &Fixture, now: DateTime<Utc>) -> Result<Assessment, Unavailable> {
        let empty = LeagueHistory::default();
        let league = self.leagues.get(&fixture.league_id).unwrap_or(&empty);
        let xi = self.params.get(fixture.league_id, MarketScope::General).xi_decay;
        let ctx = FixtureContext::build(
            &league.book,
            &league.matches,
            fixture.home_id,
            fixture.away_id,
            xi,
            now,
        );
        let rating = rating_estimate(
            &self.store,
            &self.params,
            fixture.league_id,
            fixture.home_id,
            fixture.away_id,
            &ctx,
        )?;

        let predicted = if self.config.predictor_enabled && self.predictor.is_trained() {
            match inference_features(&league.book, fixture.home_id, fixture.away_id) {
                Ok(features) => match self.predictor.predict(&features, now) {
                    PredictorOutcome::Probs(p) => Some(p),
                    PredictorOutcome::Fallback(_) => None,
                },
                Err(err) => {
                    debug!(fixture_id = fixture.fixture_id, reason = err.kind(), "no predictor features");
                    None
                }
            }
        } else {
            None
        };

        let threshold = self
            .config
            .consensus_filter
            .then_some(self.config.consensus_threshold);
        let combined = self.ensemble.combine(&rating, predicted.as_ref(), threshold)?;
        sanity_check(&rating, &combined, &self.config.sanity)?;
        Ok(Assessment {
            combined,
            quality: rating.quality,
        })
    }

    /// Runs one fixture through ratings, predictor, ensemble and the gate.
    pub fn evaluate_fixture(
        &mut self,
        fixture: &Fixture,
        prices: &MarketPrices,
        now: DateTime<Utc>,
    ) -> FixtureOutcome {
        if inside_kickoff_buffer(fixture.kickoff, now, &self.config.decision) {
            return FixtureOutcome::Ineligible(Ineligible::InsideKickoffBuffer);
        }
        if prices.is_empty() {
            return FixtureOutcome::Ineligible(Ineligible::NoQuotes);
        }
        if !self.gate().any_odd_in_range(prices) {
            return FixtureOutcome::Ineligible(Ineligible::NoOddInRange);
        }
        match self.assess(fixture, now) {
            Ok(a) => FixtureOutcome::Evaluated(self.gate().evaluate_all(fixture, prices, &a.combined, a.quality)),
            Err(err) => {
                warn!(
                    fixture_id = fixture.fixture_id,
                    reason = err.kind(),
                    "fixture skipped: {err}"
                );
                FixtureOutcome::Skipped(err)
            }
        }
    }

    /// Evaluates a slate, stores every accepted market and returns the best
    /// pick per fixture as alerts.
    pub fn scan(
        &mut self,
        fixtures: &[Fixture],
        feed: &dyn PriceFeed,
        ledger: &mut dyn Ledger,
        now: DateTime<Utc>,
    ) -> Result<ScanReport> {
        let mut report = ScanReport {
            fixtures: fixtures.len(),
            ..ScanReport::default()
        };
        let mut best = Vec::new();
        for fixture in fixtures {
            let prices = feed.prices(fixture.fixture_id).unwrap_or_default();
            match self.evaluate_fixture(fixture, &prices, now) {
                FixtureOutcome::Evaluated(picks) => {
                    report.evaluated += 1;
                    for pick in &picks {
                        match ledger.upsert(pick, now)? {
                            UpsertOutcome::Inserted => report.inserted += 1,
                            UpsertOutcome::Refreshed => report.refreshed += 1,
                            UpsertOutcome::Frozen => {}
                        }
                    }
                    if let Some(top) = picks.into_iter().next() {
                        best.push(top);
                    }
                }
                FixtureOutcome::Skipped(_) => report.skipped += 1,
                FixtureOutcome::Ineligible(_) => report.ineligible += 1,
            }
        }

        sort_best_first(&mut best);
        best.truncate(self.config.decision.top_alerts);
        report.alerts = best;
        info!(
            fixtures = report.fixtures,
            evaluated = report.evaluated,
            skipped = report.skipped,
            inserted = report.inserted,
            refreshed = report.refreshed,
            alerts = report.alerts.len(),
            "scan complete"
        );
        Ok(report)
    }

    /// Re-prices pending records against the feed. Returns records refreshed.
    pub fn refresh_pending(
        &mut self,
        feed: &dyn PriceFeed,
        ledger: &mut dyn Ledger,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut refreshed = 0;
        for record in ledger.load()? {
            if record.status != RecordStatus::Pending
                || inside_kickoff_buffer(record.kickoff, now, &self.config.decision)
            {
                continue;
            }
            let Some(quote) = feed
                .prices(record.fixture_id)
                .and_then(|p| p.get(record.market).cloned())
            else {
                continue;
            };
            let fixture = Fixture {
                fixture_id: record.fixture_id,
                league_id: record.league_id,
                home_id: record.home_id,
                away_id: record.away_id,
                kickoff: record.kickoff,
            };
            let update = match self.assess(&fixture, now) {
                Ok(a) => {
                    let scored = self.gate().score(record.market, quote.odd, &a.combined, a.quality);
                    LiveUpdate {
                        odd: quote.odd,
                        edge: scored.edge,
                        confidence: scored.confidence,
                    }
                }
                Err(err) => {
                    debug!(fixture_id = record.fixture_id, reason = err.kind(), "refresh without model");
                    continue;
                }
            };
            if ledger.refresh(&record.record_id, &update, now)? {
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    /// Settles every pending record whose fixture has a final score, feeds
    /// the adaptive weight and rebuilds calibration. Returns records settled.
    pub fn settle(
        &mut self,
        outcomes: &dyn OutcomeFeed,
        closing: &dyn PriceFeed,
        ledger: &mut dyn Ledger,
    ) -> Result<usize> {
        let mut settled = 0;
        for record in ledger.load()? {
            if record.status != RecordStatus::Pending {
                continue;
            }
            let Some(score) = outcomes.final_score(record.fixture_id) else {
                continue;
            };
            let closing_odd = closing
                .prices(record.fixture_id)
                .and_then(|p| p.get(record.market).map(|q| q.odd));
            let Some(done) = ledger.resolve(&record.record_id, score, closing_odd)? else {
                continue;
            };
            settled += 1;
            if let Some(predictor_prob) = done.predictor_prob {
                self.ensemble
                    .record_outcome(done.rating_prob, predictor_prob, done.status == RecordStatus::Won);
            }
        }
        if settled > 0 {
            self.recalibrate(ledger)?;
            info!(settled, weight = self.ensemble.predictor_weight(), "records settled");
        }
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdaptiveConfig, DecisionConfig};
    use crate::ensemble::ModelUsed;
    use crate::feed::{MemoryFeed, Quote};
    use crate::gbm::GbmParams;
    use crate::ledger::{MemoryLedger, record_id};
    use crate::market::Market;
    use crate::predictor::MIN_TRAINING_ROWS;
    use crate::synthetic::SyntheticLeague;
    use chrono::{Duration, TimeZone};

    fn engine(config: EngineConfig) -> (Engine, SyntheticLeague) {
        let league = SyntheticLeague::new(8, 140, 10);
        let mut engine = Engine::new(config, LeagueParamsTable::builtin());
        engine.set_league_matches(140, league.simulate_seasons(3));
        (engine, league)
    }

    fn wide_odds() -> DecisionConfig {
        DecisionConfig {
            min_odd: 1.01,
            max_odd: 50.0,
            ..DecisionConfig::default()
        }
    }

    /// Rating path only, nothing filtered on confidence.
    fn open_gate() -> EngineConfig {
        EngineConfig {
            predictor_enabled: false,
            decision: DecisionConfig {
                min_confidence: 0.0,
                ..wide_odds()
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

    fn candidate(fixture_id: u64, rating_prob: f64, predictor_prob: Option<f64>) -> DecisionCandidate {
        DecisionCandidate {
            fixture: Fixture {
                fixture_id,
                league_id: 140,
                home_id: 1,
                away_id: 2,
                kickoff: Utc.with_ymd_and_hms(2030, 3, 1, 18, 0, 0).unwrap(),
            },
            market: Market::Over25,
            quote: Quote {
                odd: 2.0,
                provider: "book".to_string(),
            },
            model_prob_raw: 60.0,
            model_prob_calibrated: 60.0,
            market_prob: 50.0,
            fair_odd: 1.67,
            edge: 10.0,
            confidence: 70.0,
            stake_fraction: 0.05,
            model_used: ModelUsed::DixonColesWithPredictor,
            rating_prob,
            predictor_prob,
        }
    }

    #[test]
    fn every_accepted_market_is_recorded() {
        let (mut engine, league) = engine(open_gate());
        let kickoff = league.next_kickoff(3);
        let now = kickoff - Duration::days(1);
        engine.fit(now);

        let fixtures = league.upcoming_fixtures(kickoff, 1);
        let feed = flat_feed(&fixtures, 5.0);
        let mut accepted = 0;
        let mut with_picks = 0;
        for fx in &fixtures {
            let prices = feed.prices(fx.fixture_id).unwrap();
            if let FixtureOutcome::Evaluated(picks) = engine.evaluate_fixture(fx, &prices, now)
                && !picks.is_empty()
            {
                accepted += picks.len();
                with_picks += 1;
            }
        }
        assert!(accepted > with_picks, "accepted={accepted} fixtures={with_picks}");

        let mut ledger = MemoryLedger::default();
        let report = engine.scan(&fixtures, &feed, &mut ledger, now).unwrap();
        assert_eq!(report.inserted, accepted);
        assert_eq!(ledger.len(), accepted);

        // Alerts stay one per fixture.
        assert_eq!(report.alerts.len(), with_picks.min(engine.config().decision.top_alerts));
        let mut alerted: Vec<u64> = report.alerts.iter().map(|c| c.fixture.fixture_id).collect();
        alerted.sort_unstable();
        alerted.dedup();
        assert_eq!(alerted.len(), report.alerts.len());
    }

    #[test]
    fn default_consensus_threshold_vetoes_a_disagreeing_predictor() {
        let config = EngineConfig {
            decision: wide_odds(),
            gbm: GbmParams {
                n_estimators: 10,
                ..GbmParams::default()
            },
            ..EngineConfig::default()
        };
        assert!(config.consensus_filter);
        assert_eq!(config.consensus_threshold, 0.15);
        let (mut engine, league) = engine(config);
        let kickoff = league.next_kickoff(3);
        let now = kickoff - Duration::days(1);
        engine.fit(now);

        // Every training match ends 4-3, so the predictor is near-certain of
        // over 2.5 and btts while the ratings stay near even.
        let (mut set, _) = build_training_set(&engine.leagues[&140].matches);
        for row in &mut set.rows {
            row.home_goals = 4;
            row.away_goals = 3;
        }
        let gbm = engine.config.gbm;
        engine.predictor.train(&set, &gbm, MIN_TRAINING_ROWS).unwrap();

        let fixtures = league.upcoming_fixtures(kickoff, 1);
        let feed = flat_feed(&fixtures, 2.0);
        for fx in &fixtures {
            let prices = feed.prices(fx.fixture_id).unwrap();
            match engine.evaluate_fixture(fx, &prices, now) {
                FixtureOutcome::Skipped(Unavailable::ConsensusVeto { disagreement, .. }) => {
                    assert!(disagreement > 0.15, "{disagreement}")
                }
                other => panic!("expected veto, got {other:?}"),
            }
        }

        let mut ledger = MemoryLedger::default();
        let report = engine.scan(&fixtures, &feed, &mut ledger, now).unwrap();
        assert_eq!(report.skipped, fixtures.len());
        assert_eq!(report.inserted, 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn fixtures_near_kickoff_are_not_scanned() {
        let (mut engine, league) = engine(EngineConfig::default());
        let kickoff = league.next_kickoff(3);
        let fixtures = league.upcoming_fixtures(kickoff, 1);
        let feed = league.price_book(&fixtures, 3);
        let prices = feed.prices(fixtures[0].fixture_id).unwrap();
        assert_eq!(
            engine.evaluate_fixture(&fixtures[0], &prices, kickoff - Duration::minutes(10)),
            FixtureOutcome::Ineligible(Ineligible::InsideKickoffBuffer)
        );
        assert_eq!(
            engine.evaluate_fixture(&fixtures[0], &MarketPrices::default(), kickoff - Duration::days(1)),
            FixtureOutcome::Ineligible(Ineligible::NoQuotes)
        );
    }

    #[test]
    fn scan_then_settle_round_trip() {
        let (mut engine, league) = engine(open_gate());
        let kickoff = league.next_kickoff(3);
        let now = kickoff - Duration::days(2);
        assert!(engine.fit(now) > 0);

        let fixtures = league.upcoming_fixtures(kickoff, 100);
        let mut feed = flat_feed(&fixtures, 5.0);
        let mut ledger = MemoryLedger::default();
        let first = engine.scan(&fixtures, &feed, &mut ledger, now).unwrap();
        assert_eq!(first.evaluated + first.skipped, fixtures.len());
        assert!(first.inserted > 0);
        assert_eq!(ledger.len(), first.inserted);
        assert!(first.alerts.len() <= engine.config().decision.top_alerts);

        let second = engine.scan(&fixtures, &feed, &mut ledger, now).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.refreshed, first.inserted);

        for fx in &fixtures {
            feed.set_score(fx.fixture_id, 2, 1);
        }
        let settled = engine.settle(&feed, &feed, &mut ledger).unwrap();
        assert_eq!(settled, first.inserted);
        let records = ledger.load().unwrap();
        assert!(records.iter().all(|r| r.status.is_resolved() && r.final_score == Some((2, 1))));
        assert!(records.iter().all(|r| r.clv_pct == Some(0.0)));
        // Predictor off: nothing reaches the adaptive window.
        assert_eq!(engine.ensemble().observations(), 0);
    }

    #[test]
    fn settled_predictor_picks_move_the_adaptive_weight() {
        let config = EngineConfig {
            adaptive: AdaptiveConfig {
                window_size: 1,
                ..AdaptiveConfig::default()
            },
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(config, LeagueParamsTable::builtin());
        let now = Utc.with_ymd_and_hms(2030, 2, 1, 12, 0, 0).unwrap();
        let mut ledger = MemoryLedger::default();
        ledger.upsert(&candidate(1, 50.0, Some(90.0)), now).unwrap();
        ledger.upsert(&candidate(2, 50.0, Some(85.0)), now).unwrap();
        ledger.upsert(&candidate(3, 50.0, None), now).unwrap();

        let mut outcomes = MemoryFeed::default();
        for id in 1..=3 {
            outcomes.set_score(id, 3, 1);
        }
        let settled = engine.settle(&outcomes, &MemoryFeed::default(), &mut ledger).unwrap();
        assert_eq!(settled, 3);
        assert_eq!(ledger.get(&record_id(1, Market::Over25)).unwrap().status, RecordStatus::Won);
        // Two picks carried a predictor view, both sharper than the ratings.
        assert_eq!(engine.ensemble().observations(), 2);
        assert!((engine.ensemble().predictor_weight() - 0.35).abs() < 1e-12);
    }

    #[test]
    fn restore_keeps_configured_adaptive_settings() {
        let mut saved = EnsembleState::new(0.38, AdaptiveConfig::default());
        for _ in 0..30 {
            saved.record_outcome(55.0, 60.0, true);
        }
        let snapshot = Snapshot {
            saved_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            store: RatingStore::default(),
            ensemble: saved,
        };
        let adaptive = AdaptiveConfig {
            window_size: 10,
            max_weight: 0.30,
            ..AdaptiveConfig::default()
        };
        let mut engine = Engine::new(
            EngineConfig {
                adaptive,
                ..EngineConfig::default()
            },
            LeagueParamsTable::builtin(),
        );
        engine.restore(snapshot);
        assert_eq!(*engine.ensemble().adaptive(), adaptive);
        assert!((engine.ensemble().predictor_weight() - 0.30).abs() < 1e-12);
        assert_eq!(engine.ensemble().observations(), 20);
    }
}
