//! Session orchestration.
//!
//! Owns the wiring tree: the engine builds the clients, resolves the
//! market, reconciles position against the chain, then runs the feeds and
//! the quote controller until a shutdown signal lands. Fills flow
//! user feed -> position tracker -> controller trigger; midpoints flow
//! market feed -> controller.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::clients::chain::{BatchWallet, ChainClient, HttpSignerWallet};
use crate::clients::clob::ClobClient;
use crate::clients::gamma::GammaClient;
use crate::config::{ChainConfig, ClobCredentials, Config};
use crate::discovery::{market_params_from, DiscoveryEngine};
use crate::feeds::{MarketFeed, UserFeed, UserFeedEvent};
use crate::inventory::InventoryManager;
use crate::models::MarketParams;
use crate::orders::OrderTracker;
use crate::position::{PositionTracker, Reconciliation};
use crate::quoting::{QuoteController, RebalanceTrigger};
use crate::store::{FillStore, InitialCostBasis, LiquidationStage, LiquidationStore};

/// Run discovery alone and log the ranking. Used by `--discover`.
pub async fn run_discovery(cfg: &Config) -> Result<()> {
    let gamma = GammaClient::new(cfg.gamma_base.clone());
    let clob = ClobClient::new(cfg.clob_base.clone(), None);
    let engine = DiscoveryEngine::new(&gamma, &clob, cfg.discovery.clone());

    let ranked = engine.discover().await?;
    info!(candidates = ranked.len(), "discovery ranking");
    for (i, r) in ranked.iter().take(20).enumerate() {
        info!(
            rank = i + 1,
            slug = %r.market.slug,
            condition_id = %r.market.condition_id,
            est_daily = r.potential.est_daily_earnings,
            q_eff = r.q_effective,
            midpoint = r.midpoint,
            volume_24h = r.volume_24hr,
            compatible = r.potential.compatible,
            reason = r.potential.incompatible_reason.as_deref().unwrap_or("-"),
            "candidate"
        );
    }
    Ok(())
}

/// Resolve the market to quote: an explicit slug wins, otherwise the
/// discovery pipeline picks, skipping markets still being unwound.
async fn resolve_market(cfg: &Config) -> Result<MarketParams> {
    let gamma = GammaClient::new(cfg.gamma_base.clone());

    if let Some(slug) = &cfg.market_slug {
        let market = gamma
            .market_by_slug(slug)
            .await?
            .ok_or_else(|| anyhow!("no market found for slug {}", slug))?;
        if !market.is_open_binary() {
            bail!("market {} is not an open binary market", slug);
        }
        return market_params_from(&market);
    }

    let clob = ClobClient::new(cfg.clob_base.clone(), None);
    let liquidations = LiquidationStore::new(&cfg.data_dir);
    let engine = DiscoveryEngine::new(&gamma, &clob, cfg.discovery.clone());

    let selected = engine
        .select_where(|candidate| {
            // A market still being unwound must not be re-selected.
            liquidations
                .is_liquidating(&candidate.market.condition_id)
                .unwrap_or(false)
        })
        .await?;
    selected.to_market_params()
}

/// Operator-seeded cost basis for pre-existing inventory, when provided.
fn cost_basis_from_env() -> Option<InitialCostBasis> {
    let yes = std::env::var("INITIAL_COST_BASIS_YES")
        .ok()?
        .parse::<f64>()
        .ok()?;
    let no = std::env::var("INITIAL_COST_BASIS_NO")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(yes);
    Some(InitialCostBasis {
        yes_avg_price: yes,
        no_avg_price: no,
    })
}

/// The full market-making session.
pub async fn run_market_maker(cfg: Config) -> Result<()> {
    let params = resolve_market(&cfg).await?;
    cfg.validate_against_market(&params)
        .context("market validation")?;
    info!(
        condition_id = %params.condition_id,
        yes_token = %params.yes_token_id,
        no_token = %params.no_token_id,
        tick = params.tick_size,
        min_size = params.rewards_min_size,
        max_spread = params.rewards_max_spread,
        "market resolved"
    );

    let creds = ClobCredentials::from_env();
    if creds.is_none() && !cfg.dry_run {
        bail!("CLOB credentials are required outside dry run (CLOB_API_KEY / CLOB_SECRET / CLOB_PASSPHRASE / WALLET_ADDRESS)");
    }

    let clob = Arc::new(ClobClient::new(cfg.clob_base.clone(), creds.clone()));
    let store = FillStore::new(&cfg.data_dir);
    let liquidations = LiquidationStore::new(&cfg.data_dir);
    let orders = Arc::new(Mutex::new(OrderTracker::default()));

    // An operator-requested wind-down is recorded up front so a crashed
    // session still leaves the market marked for the next discovery run.
    if cfg.liquidate && !cfg.dry_run {
        liquidations.upsert(&params.condition_id, LiquidationStage::Passive)?;
        info!(condition_id = %params.condition_id, "market marked for liquidation");
    }

    // On-chain side: balances for reconciliation and the inventory
    // manager. Dry run works without any of it.
    let chain_cfg = ChainConfig::from_env();
    let chain = chain_cfg.clone().map(|c| Arc::new(ChainClient::new(c)));
    let owner = chain_cfg
        .as_ref()
        .map(|c| c.safe_address.clone())
        .filter(|s| !s.is_empty())
        .or_else(|| creds.as_ref().map(|c| c.address.clone()));

    // Inventory manager, when the chain side is fully configured. The
    // pre-flight (and any auto split) runs before the balance snapshot so
    // a split is already reflected in what the tracker sees.
    let inventory = match (&chain, &owner, HttpSignerWallet::from_env()) {
        (Some(chain), Some(owner), Some(wallet)) => {
            let wallet: Arc<dyn BatchWallet> = Arc::new(wallet);
            Some(InventoryManager::new(
                chain.clone(),
                wallet,
                params.clone(),
                cfg.inventory.clone(),
                owner.clone(),
            ))
        }
        _ => {
            if !cfg.dry_run && cfg.inventory.auto_split {
                warn!("SIGNER_URL not configured, auto split unavailable this session");
            }
            None
        }
    };

    if let Some(inventory) = &inventory {
        let report = inventory
            .ensure_inventory(cfg.quoting.order_size)
            .await
            .context("inventory pre-flight")?;
        if !report.ok {
            let reason = report.reason.unwrap_or_else(|| "unknown".into());
            if cfg.dry_run {
                warn!(reason = %reason, "pre-flight failed, continuing because this is a dry run");
            } else {
                bail!("pre-flight failed: {}", reason);
            }
        }
    }

    let (onchain_yes, onchain_no) = match (&chain, &owner) {
        (Some(chain), Some(owner)) => tokio::try_join!(
            chain.outcome_balance(owner, &params.yes_token_id),
            chain.outcome_balance(owner, &params.no_token_id),
        )
        .context("on-chain balance read")?,
        _ if cfg.dry_run => {
            warn!("no chain configuration, starting dry run from a flat position");
            (0.0, 0.0)
        }
        _ => bail!("RPC_URL and a funded wallet are required outside dry run"),
    };

    // Position reconciliation against the chain snapshot.
    let mut tracker = PositionTracker::new(params.clone(), store, cfg.limits.clone());
    match tracker.initialize(onchain_yes, onchain_no, cost_basis_from_env())? {
        Reconciliation::Seeded { yes, no } => {
            info!(yes, no, "tracking fresh position from on-chain snapshot");
        }
        Reconciliation::Consistent { yes, no, fills_replayed } => {
            info!(yes, no, fills_replayed, "position history consistent with chain");
        }
        Reconciliation::Reset {
            expected_yes,
            expected_no,
            actual_yes,
            actual_no,
        } => {
            warn!(
                expected_yes,
                expected_no,
                actual_yes,
                actual_no,
                "position history disagreed with chain and was reset"
            );
        }
    }
    let position = Arc::new(Mutex::new(tracker));

    // Wind-down sessions never quote: cancel whatever rests, merge the
    // neutral inventory, settle the ledger, exit.
    if cfg.liquidate {
        return run_liquidation(&cfg, &params, &clob, &liquidations, inventory.as_ref(), &position)
            .await;
    }

    // Channels and shutdown plumbing.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (midpoint_tx, midpoint_rx) = mpsc::channel(256);
    let (user_tx, mut user_rx) = mpsc::channel(256);

    let controller = QuoteController::new(
        params.clone(),
        cfg.quoting.clone(),
        clob.clone(),
        position.clone(),
        orders.clone(),
        cfg.dry_run,
        midpoint_rx,
        shutdown_rx.clone(),
    );
    let controller_handle = controller.handle();

    let market_feed = MarketFeed::new(
        cfg.feed.clone(),
        cfg.market_ws_url.clone(),
        vec![params.yes_token_id.clone(), params.no_token_id.clone()],
        params.yes_token_id.clone(),
        clob.clone(),
        midpoint_tx,
        shutdown_rx.clone(),
    );

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = market_feed.run().await {
            error!(error = %e, "market feed exited");
        }
    }));

    if let Some(creds) = creds {
        let user_feed = UserFeed::new(
            cfg.feed.clone(),
            cfg.user_ws_url.clone(),
            creds,
            params.clone(),
            orders.clone(),
            user_tx,
            shutdown_rx.clone(),
        );
        tasks.push(tokio::spawn(async move {
            if let Err(e) = user_feed.run().await {
                error!(error = %e, "user feed exited");
            }
        }));
    } else {
        info!("no credentials, user feed disabled for this dry run");
    }

    let controller_task = tokio::spawn(controller.run());

    // Ctrl-C flips the running flag; everything drains from there.
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    // Fill routing loop: the only writer to the position tracker.
    let mut shutdown_watch = shutdown_rx.clone();
    loop {
        tokio::select! {
            _ = shutdown_watch.changed() => {
                if *shutdown_watch.borrow() {
                    break;
                }
            }
            event = user_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    UserFeedEvent::Fill(fill) => {
                        let was_new = {
                            let mut position = position.lock();
                            match position.process_fill(&fill) {
                                Ok(was_new) => was_new,
                                Err(e) => {
                                    error!(fill_id = %fill.id, error = %e, "fill application failed");
                                    false
                                }
                            }
                        };
                        if was_new {
                            controller_handle.notify(RebalanceTrigger::FillActivity {
                                order_id: fill.order_id.clone(),
                            });
                        }
                    }
                    UserFeedEvent::OrderGone { order_id } => {
                        controller_handle.notify(RebalanceTrigger::OrderGone { order_id });
                    }
                }
            }
        }
    }

    // The controller cancels both sides on its way out.
    match controller_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "controller exited with error"),
        Err(e) => error!(error = %e, "controller task panicked"),
    }
    for task in tasks {
        let _ = task.await;
    }

    // Optionally free the mergeable half of the inventory now that no
    // orders rest against it.
    if cfg.inventory.merge_on_exit && !cfg.dry_run {
        if let Some(inventory) = &inventory {
            let neutral = position.lock().position_state().neutral_position;
            if neutral > 0.0 {
                match inventory.merge(neutral).await {
                    Ok(merged) => position.lock().adjust_position(-merged, -merged),
                    Err(e) => warn!(error = %e, "exit merge failed, tokens left as-is"),
                }
            }
        }
    }

    let economics = position.lock().economics().clone();
    info!(
        realized_pnl = economics.realized_pnl,
        pnl_complete = economics.complete,
        "session closed"
    );
    Ok(())
}

/// Cancel both sides, merge the neutral inventory, and settle the
/// liquidation ledger. A wind-down that ends flat clears its entry;
/// anything directional stays recorded for the next pass.
async fn run_liquidation(
    cfg: &Config,
    params: &MarketParams,
    clob: &ClobClient,
    liquidations: &LiquidationStore,
    inventory: Option<&InventoryManager>,
    position: &Arc<Mutex<PositionTracker>>,
) -> Result<()> {
    if cfg.dry_run {
        info!("[dry run] would cancel both sides and merge neutral inventory");
        return Ok(());
    }

    for token_id in [&params.yes_token_id, &params.no_token_id] {
        if let Err(e) = clob.cancel_token_orders(token_id).await {
            warn!(token_id = %token_id, error = %e, "liquidation cancel failed");
        }
    }

    if let Some(inventory) = inventory {
        let neutral = position.lock().position_state().neutral_position;
        if neutral > 0.0 {
            match inventory.merge(neutral).await {
                Ok(merged) => position.lock().adjust_position(-merged, -merged),
                Err(e) => warn!(error = %e, "liquidation merge failed, tokens left as-is"),
            }
        }
    }

    let state = position.lock().position_state();
    if state.yes_tokens.abs() < 1e-9 && state.no_tokens.abs() < 1e-9 {
        liquidations.remove(&params.condition_id)?;
        info!(condition_id = %params.condition_id, "liquidation complete");
    } else {
        info!(
            yes = state.yes_tokens,
            no = state.no_tokens,
            "directional remainder left for the next liquidation pass"
        );
    }
    Ok(())
}
