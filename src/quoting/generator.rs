//! Pure quote geometry.
//!
//! All arithmetic happens on the integer price grid. The quoted pair
//! always straddles the midpoint strictly and stays inside the reward
//! band, so every resting order scores under the venue's quadratic rule.

use anyhow::{bail, Result};

use crate::models::{MarketParams, Quote, QuotePair, Side, TickPrice, PRICE_SCALE};

/// Compute the two target quotes for a midpoint.
///
/// `spread_percent` scales the reward band: the full quoted spread
/// (ask - bid) is `rewards_max_spread * spread_percent` cents, so each
/// side rests half of that from the midpoint. Prices are rounded to the
/// market tick, clamped to the tradable band, and pushed outward one tick
/// when rounding would land on or through the midpoint.
pub fn generate_quotes(
    midpoint: f64,
    params: &MarketParams,
    spread_percent: f64,
    order_size: f64,
) -> Result<QuotePair> {
    if !(midpoint > 0.0 && midpoint < 1.0) {
        bail!("midpoint {} outside (0, 1)", midpoint);
    }
    if !(spread_percent > 0.0 && spread_percent <= 1.0) {
        bail!("spread_percent {} outside (0, 1]", spread_percent);
    }
    if order_size <= 0.0 {
        bail!("order size {} must be positive", order_size);
    }

    let tick = params.tick();
    if tick.0 <= 0 {
        bail!("market tick size {} is not positive", params.tick_size);
    }

    let mid = TickPrice::from_f64(midpoint);
    // Cents to grid units: one cent is PRICE_SCALE / 100 units. Half the
    // scaled band sits on each side of the midpoint.
    let half_band =
        (params.rewards_max_spread * spread_percent * (PRICE_SCALE as f64 / 100.0) / 2.0).round()
            as i64;

    let mut bid = TickPrice(mid.0 - half_band)
        .round_to_tick(tick)
        .clamp_tradable();
    let mut ask = TickPrice(mid.0 + half_band)
        .round_to_tick(tick)
        .clamp_tradable();

    // Rounding can land a quote on or through the midpoint; step outward
    // until the pair straddles it strictly.
    while bid.0 >= mid.0 && bid.0 - tick.0 >= TickPrice::MIN.0 {
        bid = TickPrice(bid.0 - tick.0);
    }
    while ask.0 <= mid.0 && ask.0 + tick.0 <= TickPrice::MAX.0 {
        ask = TickPrice(ask.0 + tick.0);
    }

    if bid.0 >= ask.0 {
        bail!(
            "degenerate quote geometry at midpoint {} (bid {} >= ask {})",
            midpoint,
            bid,
            ask
        );
    }

    Ok(QuotePair {
        bid: Quote {
            side: Side::Buy,
            price: bid,
            size: order_size,
        },
        ask: Quote {
            side: Side::Sell,
            price: ask,
            size: order_size,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(tick: f64, max_spread: f64) -> MarketParams {
        MarketParams {
            condition_id: "0xabc".into(),
            yes_token_id: "1".into(),
            no_token_id: "2".into(),
            tick_size: tick,
            neg_risk: false,
            rewards_min_size: 10.0,
            rewards_max_spread: max_spread,
            rewards_daily_rate: None,
        }
    }

    #[test]
    fn symmetric_pair_at_even_midpoint() {
        // Scenario: midpoint 0.50, max spread 4 cents, spread 0.5, tick
        // 0.01, size 25 -> (BUY 0.49, SELL 0.51), 25 shares each.
        let pair = generate_quotes(0.50, &params(0.01, 4.0), 0.5, 25.0).expect("quotes");
        assert_eq!(pair.bid.side, Side::Buy);
        assert_eq!(pair.bid.price, TickPrice::from_f64(0.49));
        assert_eq!(pair.bid.size, 25.0);
        assert_eq!(pair.ask.side, Side::Sell);
        assert_eq!(pair.ask.price, TickPrice::from_f64(0.51));
        assert_eq!(pair.ask.size, 25.0);
    }

    #[test]
    fn quotes_stay_on_grid_and_straddle_midpoint() {
        let p = params(0.01, 4.0);
        for mid_ticks in (1_000..=9_000).step_by(37) {
            let mid = mid_ticks as f64 / PRICE_SCALE as f64;
            let pair = generate_quotes(mid, &p, 0.5, 25.0).expect("quotes");
            let tick = p.tick();
            assert!(pair.bid.price.is_on_grid(tick), "bid off grid at {}", mid);
            assert!(pair.ask.price.is_on_grid(tick), "ask off grid at {}", mid);
            assert!(pair.bid.price >= TickPrice::MIN);
            assert!(pair.ask.price <= TickPrice::MAX);
            assert!(
                pair.bid.price.0 < mid_ticks && (mid_ticks as i64) < pair.ask.price.0,
                "pair does not straddle midpoint {}",
                mid
            );
        }
    }

    #[test]
    fn tight_band_still_straddles() {
        // Band narrower than a tick collapses onto the midpoint before the
        // outward adjustment.
        let pair = generate_quotes(0.50, &params(0.01, 1.0), 0.1, 25.0).expect("quotes");
        assert!(pair.bid.price < TickPrice::from_f64(0.50));
        assert!(pair.ask.price > TickPrice::from_f64(0.50));
        assert!(pair.bid.price < pair.ask.price);
    }

    #[test]
    fn off_grid_midpoint_rounds_outward() {
        // Midpoint 0.505 with a 1-cent tick: rounding the 1-cent band
        // would land the bid on 0.50 and the ask on 0.52.
        let pair = generate_quotes(0.505, &params(0.01, 2.0), 1.0, 25.0).expect("quotes");
        assert!(pair.bid.price.0 < 5_050);
        assert!(pair.ask.price.0 > 5_050);
        assert!(pair.bid.price.is_on_grid(TickPrice(100)));
    }

    #[test]
    fn fine_tick_markets_use_the_finer_grid() {
        let p = params(0.001, 3.0);
        let pair = generate_quotes(0.054, &p, 1.0, 25.0).expect("quotes");
        assert!(pair.bid.price.is_on_grid(TickPrice(10)));
        assert!(pair.ask.price.is_on_grid(TickPrice(10)));
        assert!(pair.bid.price.0 < 540 && 540 < pair.ask.price.0);
    }

    #[test]
    fn extreme_midpoints_clamp_into_tradable_band() {
        let pair = generate_quotes(0.02, &params(0.01, 4.0), 1.0, 25.0).expect("quotes");
        assert!(pair.bid.price >= TickPrice::MIN);
        assert!(pair.bid.price < pair.ask.price);

        let pair = generate_quotes(0.98, &params(0.01, 4.0), 1.0, 25.0).expect("quotes");
        assert!(pair.ask.price <= TickPrice::MAX);
        assert!(pair.bid.price < pair.ask.price);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let p = params(0.01, 4.0);
        assert!(generate_quotes(0.0, &p, 0.5, 25.0).is_err());
        assert!(generate_quotes(1.0, &p, 0.5, 25.0).is_err());
        assert!(generate_quotes(0.5, &p, 0.0, 25.0).is_err());
        assert!(generate_quotes(0.5, &p, 1.5, 25.0).is_err());
        assert!(generate_quotes(0.5, &p, 0.5, 0.0).is_err());
    }
}
