//! Market discovery and ranking.
//!
//! Scores candidate markets by expected daily reward under the venue's
//! quadratic rule, using live books to measure the competition actually
//! resting today rather than the venue's advertised competitiveness, then
//! filters the ranking through a recent-volatility check and picks the
//! first survivor.

use anyhow::{anyhow, bail, Result};
use tracing::{debug, info, warn};

use crate::clients::clob::{ClobClient, HttpBook, PricePoint};
use crate::clients::gamma::{GammaClient, GammaMarket};
use crate::config::DiscoveryConfig;
use crate::models::MarketParams;

/// Midpoint band inside which a single-sided book still earns a reduced
/// score; outside it the venue requires strict two-sidedness.
const TWO_SIDED_BAND: (f64, f64) = (0.10, 0.90);
/// Divisor applied to the dominant side inside the band.
const SINGLE_SIDED_PENALTY: f64 = 3.0;

/// Computed earning outlook for one candidate.
#[derive(Debug, Clone)]
pub struct EarningPotential {
    pub est_daily_earnings: f64,
    /// Daily earnings per unit of committed collateral.
    pub earning_efficiency: f64,
    /// Our share of the pool if we joined: own / (competition + own).
    pub ease_of_participation: f64,
    /// Ranking key. Equal to estimated daily earnings; ties break on
    /// condition id.
    pub total_score: f64,
    pub compatible: bool,
    pub incompatible_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RankedMarket {
    pub market: GammaMarket,
    pub q_effective: f64,
    pub midpoint: f64,
    pub volume_24hr: f64,
    pub potential: EarningPotential,
}

impl RankedMarket {
    pub fn to_market_params(&self) -> Result<MarketParams> {
        market_params_from(&self.market)
    }
}

pub fn market_params_from(market: &GammaMarket) -> Result<MarketParams> {
    if market.clob_token_ids.len() != 2 {
        bail!(
            "market {} has {} outcome tokens, need 2",
            market.condition_id,
            market.clob_token_ids.len()
        );
    }
    Ok(MarketParams {
        condition_id: market.condition_id.clone(),
        yes_token_id: market.clob_token_ids[0].clone(),
        no_token_id: market.clob_token_ids[1].clone(),
        tick_size: market.order_price_min_tick_size.unwrap_or(0.01),
        neg_risk: market.neg_risk.unwrap_or(false),
        rewards_min_size: market.rewards_min_size.unwrap_or(0.0),
        rewards_max_spread: market.rewards_max_spread.unwrap_or(0.0),
        rewards_daily_rate: market.rewards_daily_rate,
    })
}

// ----------------------------------------------------------------------
// Quadratic reward math
// ----------------------------------------------------------------------

/// Score of one resting order: ((max_spread - spread)/max_spread)^2 * size
/// when inside the band and at least the minimum size, else zero.
pub fn order_score(spread_cents: f64, size: f64, max_spread: f64, min_size: f64) -> f64 {
    if max_spread <= 0.0 || spread_cents > max_spread || spread_cents < 0.0 || size < min_size {
        return 0.0;
    }
    let closeness = (max_spread - spread_cents) / max_spread;
    closeness * closeness * size
}

/// Sum the quadratic scores of both halves of a live book.
pub fn book_scores(
    book: &HttpBook,
    midpoint: f64,
    max_spread: f64,
    min_size: f64,
) -> (f64, f64) {
    let q_bid: f64 = book
        .bids
        .iter()
        .map(|l| order_score((midpoint - l.price) * 100.0, l.size, max_spread, min_size))
        .sum();
    let q_ask: f64 = book
        .asks
        .iter()
        .map(|l| order_score((l.price - midpoint) * 100.0, l.size, max_spread, min_size))
        .sum();
    (q_bid, q_ask)
}

/// Effective market score. Inside the mid band a dominant side still
/// counts at one third; outside it only the balanced part does.
pub fn effective_score(q_one: f64, q_two: f64, midpoint: f64) -> f64 {
    let balanced = q_one.min(q_two);
    if midpoint >= TWO_SIDED_BAND.0 && midpoint <= TWO_SIDED_BAND.1 {
        balanced.max(q_one.max(q_two) / SINGLE_SIDED_PENALTY)
    } else {
        balanced
    }
}

/// Expected daily earnings for committing `liquidity` collateral, assuming
/// orders rest at half the max spread on each side (closeness 0.5, so the
/// quadratic factor is 0.25).
pub fn estimate_earnings(
    liquidity: f64,
    midpoint: f64,
    q_effective: f64,
    daily_pool: f64,
) -> (f64, f64) {
    if liquidity <= 0.0 || midpoint <= 0.0 || daily_pool <= 0.0 {
        return (0.0, 0.0);
    }
    let own_score = 0.25 * (liquidity / midpoint);
    let share = own_score / (q_effective + own_score);
    (share * daily_pool, share)
}

/// Compatibility check; returns the reason a market cannot be quoted.
fn incompatibility(market: &GammaMarket, cfg: &DiscoveryConfig) -> Option<String> {
    if !market.is_open_binary() {
        return Some("malformed or missing clob token ids".into());
    }
    if market.neg_risk.unwrap_or(false) {
        return Some("negative-risk market".into());
    }
    let min_size = market.rewards_min_size.unwrap_or(0.0);
    if cfg.liquidity_commitment < min_size {
        return Some(format!(
            "liquidity {:.0} below reward minimum size {:.0}",
            cfg.liquidity_commitment, min_size
        ));
    }
    let max_spread = market.rewards_max_spread.unwrap_or(0.0);
    let tick = market.order_price_min_tick_size.unwrap_or(0.01);
    // At least one tick must fit strictly inside the reward band.
    if max_spread <= 0.0 || tick * 100.0 >= max_spread {
        return Some(format!(
            "no tick-aligned placement inside {:.2} cent spread (tick {})",
            max_spread, tick
        ));
    }
    None
}

// ----------------------------------------------------------------------
// Volatility filter
// ----------------------------------------------------------------------

/// Verdict over one hour of price history. Rejects on aggregate drift, on
/// the sharpest consecutive move inside the lookback window, on fetch
/// trouble upstream, and on series too short to judge.
pub fn volatility_verdict(
    points: &[PricePoint],
    lookback_min: i64,
    threshold: f64,
) -> Result<(), String> {
    if points.len() < 2 {
        return Err(format!("only {} price points", points.len()));
    }
    let first = points.first().expect("nonempty").p;
    let last = points.last().expect("nonempty").p;
    if first <= 0.0 {
        return Err("degenerate starting price".into());
    }

    let aggregate = ((last - first) / first).abs();
    if aggregate > threshold {
        return Err(format!(
            "aggregate change {:.1}% over the hour",
            aggregate * 100.0
        ));
    }

    let window_start = points.last().expect("nonempty").t - lookback_min * 60;
    let mut max_move: f64 = 0.0;
    for pair in points.windows(2) {
        if pair[1].t < window_start {
            continue;
        }
        if pair[0].p > 0.0 {
            max_move = max_move.max(((pair[1].p - pair[0].p) / pair[0].p).abs());
        }
    }
    if max_move > threshold {
        return Err(format!(
            "consecutive move {:.1}% inside the lookback window",
            max_move * 100.0
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------

pub struct DiscoveryEngine<'a> {
    gamma: &'a GammaClient,
    clob: &'a ClobClient,
    cfg: DiscoveryConfig,
}

impl<'a> DiscoveryEngine<'a> {
    pub fn new(gamma: &'a GammaClient, clob: &'a ClobClient, cfg: DiscoveryConfig) -> Self {
        Self { gamma, clob, cfg }
    }

    /// Rank all candidate markets by estimated daily earnings.
    pub async fn discover(&self) -> Result<Vec<RankedMarket>> {
        let markets = self
            .gamma
            .reward_markets(self.cfg.liquidity_commitment.max(1.0) * 10.0, 20)
            .await?;
        info!(candidates = markets.len(), "discovery candidates fetched");

        let mut ranked = Vec::with_capacity(markets.len());

        // Books in batches: each batch is one HTTP round trip.
        for chunk in markets.chunks(20) {
            let token_ids: Vec<String> = chunk
                .iter()
                .filter_map(|m| m.clob_token_ids.first().cloned())
                .collect();
            let books = match self.clob.get_books(&token_ids).await {
                Ok(books) => books,
                Err(e) => {
                    warn!(error = %e, "book batch fetch failed, skipping chunk");
                    continue;
                }
            };

            for market in chunk {
                let Some(token_id) = market.clob_token_ids.first() else {
                    continue;
                };
                let Some(book) = books.iter().find(|b| &b.asset_id == token_id) else {
                    debug!(condition_id = %market.condition_id, "no live book, skipping");
                    continue;
                };
                if let Some(entry) = self.rank_one(market, book) {
                    ranked.push(entry);
                }
            }
        }

        // Total order: earnings descending, condition id as deterministic
        // tie break.
        ranked.sort_by(|a, b| {
            b.potential
                .total_score
                .partial_cmp(&a.potential.total_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.market.condition_id.cmp(&b.market.condition_id))
        });
        Ok(ranked)
    }

    fn rank_one(&self, market: &GammaMarket, book: &HttpBook) -> Option<RankedMarket> {
        let best_bid = book.bids.iter().map(|l| l.price).fold(f64::MIN, f64::max);
        let best_ask = book.asks.iter().map(|l| l.price).fold(f64::MAX, f64::min);
        if best_bid <= 0.0 || best_ask >= 1.0 || best_bid >= best_ask {
            debug!(condition_id = %market.condition_id, "book has no usable top, skipping");
            return None;
        }
        let midpoint = (best_bid + best_ask) / 2.0;

        let max_spread = market.rewards_max_spread.unwrap_or(0.0);
        let min_size = market.rewards_min_size.unwrap_or(0.0);
        let daily_pool = market.rewards_daily_rate.unwrap_or(0.0);

        let (q_bid, q_ask) = book_scores(book, midpoint, max_spread, min_size);
        let q_effective = effective_score(q_bid, q_ask, midpoint);

        let reason = incompatibility(market, &self.cfg);
        let (earnings, share) = estimate_earnings(
            self.cfg.liquidity_commitment,
            midpoint,
            q_effective,
            daily_pool,
        );

        Some(RankedMarket {
            market: market.clone(),
            q_effective,
            midpoint,
            volume_24hr: market.volume_24hr.unwrap_or(0.0),
            potential: EarningPotential {
                est_daily_earnings: earnings,
                earning_efficiency: if self.cfg.liquidity_commitment > 0.0 {
                    earnings / self.cfg.liquidity_commitment
                } else {
                    0.0
                },
                ease_of_participation: share,
                total_score: earnings,
                compatible: reason.is_none(),
                incompatible_reason: reason,
            },
        })
    }

    /// Full selection: rank, drop incompatibles, volatility-check the top
    /// of the list in order, return the first survivor.
    pub async fn select(&self) -> Result<RankedMarket> {
        self.select_where(|_| false).await
    }

    /// Like `select`, with a caller-supplied reason to skip a candidate
    /// before the volatility check (markets mid-liquidation, denylists).
    pub async fn select_where(
        &self,
        skip: impl Fn(&RankedMarket) -> bool,
    ) -> Result<RankedMarket> {
        let ranked = self.discover().await?;
        let candidates: Vec<RankedMarket> = ranked
            .into_iter()
            .filter(|r| r.potential.compatible)
            .take(self.cfg.max_candidates)
            .collect();

        if candidates.is_empty() {
            bail!("discovery produced no compatible markets");
        }

        for candidate in candidates {
            if skip(&candidate) {
                info!(
                    condition_id = %candidate.market.condition_id,
                    "candidate skipped by caller"
                );
                continue;
            }
            let token_id = candidate
                .market
                .clob_token_ids
                .first()
                .ok_or_else(|| anyhow!("candidate without token ids"))?;
            let verdict = match self.clob.prices_history(token_id, "1h").await {
                Ok(points) => volatility_verdict(
                    &points,
                    self.cfg.volatility_lookback_min,
                    self.cfg.max_hourly_change,
                ),
                // A fetch failure rejects the candidate, not the run.
                Err(e) => Err(format!("history fetch failed: {e}")),
            };
            match verdict {
                Ok(()) => {
                    info!(
                        condition_id = %candidate.market.condition_id,
                        slug = %candidate.market.slug,
                        est_daily = candidate.potential.est_daily_earnings,
                        "market selected"
                    );
                    return Ok(candidate);
                }
                Err(reason) => {
                    info!(
                        condition_id = %candidate.market.condition_id,
                        reason = %reason,
                        "candidate rejected by volatility filter"
                    );
                }
            }
        }
        bail!("every compatible candidate failed the volatility filter")
    }
}
