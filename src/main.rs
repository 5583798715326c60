use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use rand::Rng;

use tri_arb_bot::config::Config;
use tri_arb_bot::exchange::{DepthLevel, OrderBook, PivotMarket};
use tri_arb_bot::testing::SimulatedExchange;
use tri_arb_bot::{utils, PivotWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    utils::setup_logging()?;

    let config = Arc::new(Config::from_env());
    config.validate()?;

    if !config.paper_trading {
        anyhow::bail!(
            "live trading needs an exchange adapter wired in; set PAPER_TRADING=true to run \
             against the simulated exchange"
        );
    }

    let sim = SimulatedExchange::new();
    seed_paper_exchange(&sim, &config);
    sim.set_auto_fill(true);
    info!("📄 paper trading against the simulated exchange");

    let mut workers = Vec::new();
    for pivot in &config.pivot_markets {
        let worker = PivotWorker::new(pivot, sim.clone(), sim.clone(), sim.clone(), config.clone())?;
        tokio::spawn(worker.clone().run());
        workers.push(worker);
    }
    info!("{} worker(s) running, Ctrl-C to stop", workers.len());

    tokio::signal::ctrl_c().await?;
    for (pivot, worker) in config.pivot_markets.iter().zip(&workers) {
        info!("📊 {}: {}", pivot, worker.metrics().summary());
    }
    Ok(())
}

/// Seeds books and balances so the paper session has something to scan.
/// Forward gaps are drawn around the profit threshold, so most cycles come
/// up empty and some fire, which is the texture live markets have.
fn seed_paper_exchange(sim: &SimulatedExchange, config: &Config) {
    let mut rng = rand::thread_rng();

    let balances: HashMap<String, f64> = config
        .start_quantities
        .iter()
        .map(|(currency, quantity)| (currency.clone(), quantity * 100.0))
        .collect();
    sim.set_balances(balances);

    for pivot_name in &config.pivot_markets {
        let Ok(pivot) = PivotMarket::parse(pivot_name) else {
            continue;
        };
        let pivot_rate: f64 = rng.gen_range(0.01..0.1);
        sim.set_order_book(OrderBook {
            market: pivot_name.clone(),
            bids: vec![DepthLevel {
                rate: pivot_rate * 0.999,
                quantity: rng.gen_range(1.0..10.0),
            }],
            asks: vec![DepthLevel {
                rate: pivot_rate * 1.001,
                quantity: rng.gen_range(1.0..10.0),
            }],
        });

        for instrument in config.currencies_for(pivot_name) {
            let leg1_ask: f64 = rng.gen_range(0.0005..0.005);
            let gross: f64 = rng.gen_range(0.995..1.03);
            let leg2_bid = gross * leg1_ask / (pivot_rate * 0.999);
            sim.set_order_book(OrderBook {
                market: pivot.base_market(instrument),
                bids: vec![DepthLevel {
                    rate: leg1_ask * 0.998,
                    quantity: rng.gen_range(10.0..100.0),
                }],
                asks: vec![DepthLevel {
                    rate: leg1_ask,
                    quantity: rng.gen_range(10.0..100.0),
                }],
            });
            sim.set_order_book(OrderBook {
                market: pivot.quote_market(instrument),
                bids: vec![DepthLevel {
                    rate: leg2_bid,
                    quantity: rng.gen_range(10.0..100.0),
                }],
                asks: vec![DepthLevel {
                    rate: leg2_bid * 1.002,
                    quantity: rng.gen_range(10.0..100.0),
                }],
            });
        }
    }
}
