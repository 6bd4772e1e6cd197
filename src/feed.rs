//! Fixtures, prices and results as the engine consumes them.
//!
//! Fetching is somebody else's job: anything that can answer "what are the
//! quotes for this fixture" or "how did it finish" plugs in through
//! [`PriceFeed`] and [`OutcomeFeed`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::market::Market;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    pub fixture_id: u64,
    pub league_id: u32,
    pub home_id: u32,
    pub away_id: u32,
    pub kickoff: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub odd: f64,
    pub provider: String,
}

/// Up to one quote per market.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketPrices {
    quotes: BTreeMap<Market, Quote>,
}

impl MarketPrices {
    pub fn insert(&mut self, market: Market, quote: Quote) {
        self.quotes.insert(market, quote);
    }

    pub fn get(&self, market: Market) -> Option<&Quote> {
        self.quotes.get(&market)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Market, &Quote)> {
        self.quotes.iter().map(|(m, q)| (*m, q))
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

pub trait PriceFeed {
    fn prices(&self, fixture_id: u64) -> Option<MarketPrices>;
}

pub trait OutcomeFeed {
    fn final_score(&self, fixture_id: u64) -> Option<(u8, u8)>;
}

/// Prices and results held in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryFeed {
    #[serde(default)]
    prices: HashMap<u64, MarketPrices>,
    #[serde(default)]
    scores: HashMap<u64, (u8, u8)>,
}

impl MemoryFeed {
    pub fn set_prices(&mut self, fixture_id: u64, prices: MarketPrices) {
        self.prices.insert(fixture_id, prices);
    }

    pub fn set_score(&mut self, fixture_id: u64, home_goals: u8, away_goals: u8) {
        self.scores.insert(fixture_id, (home_goals, away_goals));
    }
}

impl PriceFeed for MemoryFeed {
    fn prices(&self, fixture_id: u64) -> Option<MarketPrices> {
        self.prices.get(&fixture_id).cloned()
    }
}

impl OutcomeFeed for MemoryFeed {
    fn final_score(&self, fixture_id: u64) -> Option<(u8, u8)> {
        self.scores.get(&fixture_id).copied()
    }
}

/// The JSON file the CLI reads: fixtures plus their quotes and any results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlateFile {
    pub fixtures: Vec<SlateEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlateEntry {
    #[serde(flatten)]
    pub fixture: Fixture,
    /// Market key (`over25`, `btts_no`, ...) to decimal odd.
    #[serde(default)]
    pub odds: BTreeMap<String, f64>,
    #[serde(default)]
    pub provider: Option<String>,
    /// Final score such as `"2-1"` once the match is over.
    #[serde(default)]
    pub score: Option<String>,
}

/// Reads a slate file into fixtures and a feed answering for them.
pub fn load_slate(path: &Path) -> Result<(Vec<Fixture>, MemoryFeed)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read slate {}", path.display()))?;
    let slate: SlateFile = serde_json::from_str(&raw).context("invalid slate json")?;
    Ok(slate_into_feed(slate))
}

pub fn slate_into_feed(slate: SlateFile) -> (Vec<Fixture>, MemoryFeed) {
    let mut feed = MemoryFeed::default();
    let mut fixtures = Vec::with_capacity(slate.fixtures.len());
    for entry in slate.fixtures {
        let provider = entry.provider.unwrap_or_else(|| "unknown".to_string());
        let mut prices = MarketPrices::default();
        for (key, odd) in &entry.odds {
            if let Some(market) = Market::from_key(key)
                && odd.is_finite()
                && *odd > 1.0
            {
                prices.insert(
                    market,
                    Quote {
                        odd: *odd,
                        provider: provider.clone(),
                    },
                );
            }
        }
        if !prices.is_empty() {
            feed.set_prices(entry.fixture.fixture_id, prices);
        }
        if let Some((h, a)) = entry.score.as_deref().and_then(crate::history::parse_score_pair) {
            feed.set_score(entry.fixture.fixture_id, h, a);
        }
        fixtures.push(entry.fixture);
    }
    (fixtures, feed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slate_parses_odds_and_scores() {
        let raw = r#"{"fixtures":[
            {"fixture_id":7,"league_id":39,"home_id":1,"away_id":2,
             "kickoff":"2025-01-04T15:00:00Z",
             "odds":{"over25":1.95,"BTTS No":2.05,"draw":3.1,"under25":0.9},
             "provider":"book","score":"2-1"}
        ]}"#;
        let slate: SlateFile = serde_json::from_str(raw).unwrap();
        let (fixtures, feed) = slate_into_feed(slate);
        assert_eq!(fixtures.len(), 1);
        let prices = feed.prices(7).unwrap();
        assert_eq!(prices.get(Market::Over25).unwrap().odd, 1.95);
        assert_eq!(prices.get(Market::BttsNo).unwrap().provider, "book");
        assert!(prices.get(Market::Under25).is_none());
        assert_eq!(feed.final_score(7), Some((2, 1)));
        assert!(feed.prices(8).is_none());
    }
}
