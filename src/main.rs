use anyhow::{Context, Result};
use campaign_engine::carrier::{CarrierGateway, HttpCarrierClient};
use campaign_engine::templates::TemplatePools;
use campaign_engine::{config, db, dispatch, planner};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "campaign-engine", about = "Multi-tenant SMS campaign dispatch engine")]
struct Args {
    /// Path to the YAML config file (defaults to ./config.yaml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print an example config and exit.
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cfg = config::load(args.config.as_deref()).context("loading configuration")?;
    cfg.ensure_dirs().context("creating data directory")?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
        format!("sqlite://{}/engine.db", cfg.app.data_dir.trim_end_matches('/'))
    });
    let pool = db::init_pool(&database_url).await.context("opening database")?;
    db::run_migrations(&pool).await.context("running migrations")?;

    let template_pools = Arc::new(
        TemplatePools::from_csv_path(&cfg.templates.csv_path).context("loading templates")?,
    );
    let carrier: Arc<dyn CarrierGateway> =
        Arc::new(HttpCarrierClient::from_config(&cfg).context("building carrier client")?);

    let planner_policy = cfg.planner_policy();
    let dispatch_policy = cfg.dispatch_policy();
    let poll_interval = Duration::from_millis(cfg.app.poll_interval_ms);
    let planner_interval = Duration::from_millis(cfg.app.planner_interval_ms);

    {
        let pool = pool.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = planner::run_planner_once(&pool, &planner_policy).await {
                    warn!(error = %err, "planner tick failed");
                }
                tokio::time::sleep(planner_interval).await;
            }
        });
    }

    for worker in 0..cfg.app.dispatch_workers {
        info!(worker, "starting dispatch worker");
        tokio::spawn(dispatch::run_worker(
            pool.clone(),
            Arc::clone(&carrier),
            Arc::clone(&template_pools),
            dispatch_policy,
            poll_interval,
        ));
    }

    info!(workers = cfg.app.dispatch_workers, "campaign engine running");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    Ok(())
}
