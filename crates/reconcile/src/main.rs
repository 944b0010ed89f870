//! Compare every product's cached balance with its ledger sum.
//!
//! Usage: `stockledger-reconcile [--repair] [--product <uuid>]`
//!
//! Exits non-zero when drift remains.

use std::process::ExitCode;

use anyhow::{Context, bail};
use serde::Serialize;

use stockledger_core::ProductId;
use stockledger_infra::{LedgerConfig, ReconciliationReport, Reconciler, bootstrap};
use stockledger_inventory::ProductFilter;

#[derive(Debug, Default)]
struct Args {
    repair: bool,
    product: Option<ProductId>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--repair" => parsed.repair = true,
            "--product" => {
                let raw = args.next().context("--product needs a value")?;
                parsed.product = Some(raw.parse().context("invalid --product")?);
            }
            other => bail!("unknown argument '{other}'"),
        }
    }
    Ok(parsed)
}

#[derive(Debug, Serialize)]
struct Summary {
    checked: usize,
    drifted: Vec<ReconciliationReport>,
    repaired: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    stockledger_observability::init();

    let args = parse_args(std::env::args().skip(1))?;
    let config = LedgerConfig::from_env().context("invalid configuration")?;
    let store = bootstrap::connect(&config)
        .await
        .context("failed to open stock store")?;
    let reconciler = Reconciler::new(store).with_lock_wait(config.lock_wait);

    let reports = match args.product {
        Some(product_id) => vec![reconciler.check(product_id).await?],
        None => reconciler.check_all(&ProductFilter::all()).await?,
    };

    let drifted: Vec<ReconciliationReport> =
        reports.iter().filter(|r| !r.is_consistent()).copied().collect();

    let mut repaired = 0;
    if args.repair {
        for report in &drifted {
            reconciler
                .rebuild(report.product_id)
                .await
                .with_context(|| format!("failed to rebuild {}", report.product_id))?;
            repaired += 1;
        }
    }

    let summary = Summary {
        checked: reports.len(),
        drifted,
        repaired,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    tracing::info!(
        checked = summary.checked,
        drifted = summary.drifted.len(),
        repaired = summary.repaired,
        "reconcile run complete"
    );

    if summary.drifted.len() > summary.repaired {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
