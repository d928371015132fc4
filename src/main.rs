use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fred::interfaces::ClientLike;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use groupcart::cart::{Cart, CartDetails, Order};
use groupcart::config::{self, Config};
use groupcart::coordination::node;
use groupcart::metrics::MetricsRegistry;
use groupcart::store::{CartStore, KeyDbStore};
use groupcart::{CartReader, CartUpdater, RequestContext, UpdaterConfig};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "groupcart", about = "Group-order cart coordinator")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/groupcart/config.yaml")]
    config: String,

    /// Print the Prometheus text exposition to stderr before exiting.
    #[arg(long)]
    dump_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current state of a cart.
    Read { cart_id: String },

    /// Merge quantities into a cart under the cart lock.
    Update {
        cart_id: String,

        /// `ITEM/DINER=QTY`; may be repeated.
        #[arg(long = "set", value_parser = parse_assignment)]
        set: Vec<Assignment>,

        /// Cart details as JSON (`{"item": {"diner": qty}}`), merged before
        /// any `--set` values.
        #[arg(long)]
        details: Option<String>,
    },

    /// Print per-item totals across all diners.
    Order { cart_id: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Assignment {
    item: String,
    diner: String,
    qty: u32,
}

fn parse_assignment(raw: &str) -> Result<Assignment, String> {
    let (target, qty) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected ITEM/DINER=QTY, got {raw:?}"))?;
    let (item, diner) = target
        .split_once('/')
        .ok_or_else(|| format!("expected ITEM/DINER before '=', got {target:?}"))?;
    if item.is_empty() || diner.is_empty() {
        return Err(format!("item and diner must be non-empty in {raw:?}"));
    }
    let qty = qty
        .parse::<u32>()
        .map_err(|e| format!("invalid quantity {qty:?}: {e}"))?;
    Ok(Assignment {
        item: item.to_string(),
        diner: diner.to_string(),
        qty,
    })
}

/// Build the partial cart a merge applies.
fn build_updates(cart_id: &str, details: Option<&str>, set: &[Assignment]) -> Result<Cart> {
    let mut updates = Cart::new(cart_id);
    if let Some(raw) = details {
        updates.cart_details =
            serde_json::from_str::<CartDetails>(raw).context("invalid --details JSON")?;
    }
    for a in set {
        updates.set_quantity(a.item.clone(), a.diner.clone(), a.qty);
    }
    Ok(updates)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run_command(
    command: Command,
    config: &Config,
    store: Arc<dyn CartStore>,
    metrics: &MetricsRegistry,
    node_id: &str,
) -> Result<String> {
    let reader = CartReader::new(Arc::clone(&store)).with_metrics(metrics.clone());

    match command {
        Command::Read { cart_id } => {
            let ctx = RequestContext::with_timeout(config.cart.read_timeout());
            let cart = reader.read(&ctx, &cart_id).await?;
            Ok(serde_json::to_string_pretty(&cart)?)
        }
        Command::Update {
            cart_id,
            set,
            details,
        } => {
            let updates = build_updates(&cart_id, details.as_deref(), &set)?;
            let updater = CartUpdater::new(store)
                .with_config(UpdaterConfig::from(&config.cart))
                .with_owner(node_id)
                .with_metrics(metrics.clone());

            let ctx = RequestContext::with_timeout(config.cart.update_timeout());
            let cart = updater
                .update(&ctx, &cart_id, move |mut cart| {
                    cart.merge(&updates);
                    cart
                })
                .await?;
            Ok(serde_json::to_string_pretty(&cart)?)
        }
        Command::Order { cart_id } => {
            let ctx = RequestContext::with_timeout(config.cart.read_timeout());
            let cart = reader.read(&ctx, &cart_id).await?;
            Ok(serde_json::to_string_pretty(&Order::from_cart(&cart))?)
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    tracing::info!(config_path = %cli.config, "starting groupcart");

    // ---- Node ID ----
    let node_id = node::node_id();
    tracing::info!(%node_id, "node identity established");

    // ---- Infrastructure clients ----
    let keydb = KeyDbStore::connect(&config.keydb).await?;
    let pool = keydb.pool().clone();
    let store: Arc<dyn CartStore> = Arc::new(keydb);

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    let result = run_command(cli.command, &config, store, &metrics, &node_id).await;

    if cli.dump_metrics {
        match metrics.encode() {
            Ok(text) => eprint!("{text}"),
            Err(e) => tracing::warn!(error = %e, "failed to encode metrics"),
        }
    }

    if let Err(e) = pool.quit().await {
        tracing::warn!(error = %e, "KeyDB pool did not shut down cleanly");
    }

    let output = result?;
    println!("{output}");
    Ok(())
}
