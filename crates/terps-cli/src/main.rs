use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use terps_storage::StoreClient;
use terps_sync::{RunReport, SweepReport, SyncConfig, SyncPipeline, UnitOutcome};

#[derive(Debug, Parser)]
#[command(name = "terps-cli")]
#[command(about = "Terps dining sync command-line interface")]
struct Cli {
    /// Print the run report as JSON instead of summary lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full run: hours, menus, retention sweep.
    Sync,
    /// Hours phase only.
    Hours,
    /// Menu phase only.
    Menus,
    /// Retention sweep only.
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::default();
    let store = store_from_env()?;
    let pipeline = SyncPipeline::over_http(config, store)?;
    let today = chrono::Local::now().date_naive();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let report = pipeline.run(today).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Hours => {
            let hall_ids = pipeline.load_location_ids().await?;
            let outcome = pipeline.sync_hours(&hall_ids, today).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("hours: {}", outcome_line(&outcome));
            }
        }
        Commands::Menus => {
            let hall_ids = pipeline.load_location_ids().await?;
            let units = pipeline.sync_menus(&hall_ids, today).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&units)?);
            } else {
                for (unit, outcome) in &units {
                    println!("{} {}: {}", unit.slug, unit.meal_period, outcome_line(outcome));
                }
            }
        }
        Commands::Sweep => {
            let sweep = pipeline.sweep(today).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&sweep)?);
            } else {
                print_sweep(&sweep);
            }
        }
    }

    Ok(())
}

/// Endpoint + service key come from the environment; absence is a fatal
/// startup error, nothing else is.
fn store_from_env() -> Result<StoreClient> {
    let base_url = std::env::var("SUPABASE_URL").context("SUPABASE_URL must be set")?;
    let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
        .context("SUPABASE_SERVICE_ROLE_KEY must be set")?;
    StoreClient::new(&base_url, &service_key)
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_report(report: &RunReport) {
    println!("sync run for {}", report.today);
    println!("  hours: {}", outcome_line(&report.hours));
    for (unit, outcome) in &report.menu_units {
        println!(
            "  {} {}: {}",
            unit.slug,
            unit.meal_period,
            outcome_line(outcome)
        );
    }
    print_sweep(&report.sweep);
}

fn print_sweep(sweep: &SweepReport) {
    println!(
        "  sweep (before {}): menus {}, hours {}",
        sweep.cutoff,
        sweep_line(&sweep.menus),
        sweep_line(&sweep.hours)
    );
}

fn outcome_line(outcome: &UnitOutcome) -> String {
    match outcome {
        UnitOutcome::Ok { rows_written } => format!("ok ({rows_written} rows)"),
        UnitOutcome::Failed { reason } => format!("failed: {reason}"),
    }
}

fn sweep_line(result: &Result<(), String>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(reason) => format!("failed: {reason}"),
    }
}
