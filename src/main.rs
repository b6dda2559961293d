use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use ticketstore::api::{self, AppState};
use ticketstore::store::shared;
use ticketstore::{
    Config, Dispatcher, HttpGateway, ListParams, MemoryGateway, RequestStatus, RequestView, Scheduler, Store, Tickets,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ticketstore")]
#[command(about = "TicketStore - maintenance request lifecycle and deadline tracking")]
#[command(version = env!("GIT_DESCRIBE"))]
struct Cli {
    /// Config file (default: ~/.config/ticketstore/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory, overrides the config file
    #[arg(short, long)]
    store_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API with the overdue poller and daily reminder
    Serve {
        /// Listen address, overrides the config file
        #[arg(short, long)]
        listen: Option<String>,

        /// Log notifications instead of sending them
        #[arg(long)]
        dry_run: bool,
    },

    /// Re-evaluate overdue flags once
    Check {
        /// Send alerts for newly overdue requests
        #[arg(long)]
        notify: bool,

        #[arg(long)]
        dry_run: bool,
    },

    /// Send reminders for requests that are still overdue
    Remind {
        #[arg(long)]
        dry_run: bool,
    },

    /// List requests visible to a user
    List {
        /// Id of the user to list as
        #[arg(short, long)]
        user: i64,

        /// Show closed requests instead of open ones
        #[arg(long)]
        archived: bool,

        /// Status to show, or ALL
        #[arg(long)]
        status: Option<String>,

        /// Only overdue requests
        #[arg(long)]
        overdue: bool,

        /// Case-insensitive description search
        #[arg(long)]
        search: Option<String>,

        /// Sort key as field[,asc|desc]; repeatable
        #[arg(long)]
        sort: Vec<String>,

        #[arg(long, default_value_t = 0)]
        page: i64,

        #[arg(long, default_value_t = 20)]
        size: i64,
    },

    /// Insert default roles and urgency categories
    Seed,
}

fn dispatcher(config: &Config, dry_run: bool) -> Result<Dispatcher> {
    if dry_run {
        return Ok(Dispatcher::new(Arc::new(MemoryGateway::new())));
    }
    let gateway = HttpGateway::new(&config.gateway_url, config.gateway_timeout())?;
    Ok(Dispatcher::new(Arc::new(gateway)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(store_path) = cli.store_path {
        config.store_path = store_path;
    }

    match cli.command {
        Commands::Serve { listen, dry_run } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            let addr = config.listen_addr()?;

            let store = Store::open(&config.store_path)?;
            let _lock = store.lock_exclusive()?;
            store.seed_defaults()?;
            let store = shared(store);

            let dispatcher = dispatcher(&config, dry_run)?;
            let scheduler = Scheduler::new(
                store.clone(),
                dispatcher.clone(),
                config.poll_interval_ms,
                &config.reminder_cron,
            )?;

            // Bring flags up to date without alerting on backlog
            scheduler.run_overdue_check(false).await?;
            scheduler.start().await;

            let state = Arc::new(AppState {
                tickets: Tickets::new(store, dispatcher.clone()),
                scheduler: scheduler.clone(),
            });
            api::serve(addr, state, async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown requested");
            })
            .await?;

            scheduler.shutdown().await;
            dispatcher.drain().await;
        }
        Commands::Check { notify, dry_run } => {
            let scheduler = open_scheduler(&config, dry_run)?;
            println!("Checking overdue requests...");
            let result = scheduler.run_overdue_check(notify).await?;
            println!(
                "Checked {} open requests: {} flags changed, {} alerts sent",
                result.checked, result.updated, result.alerts
            );
        }
        Commands::Remind { dry_run } => {
            let scheduler = open_scheduler(&config, dry_run)?;
            let run = scheduler.run_reminders().await?;
            if run.skipped_weekend {
                println!("Weekend, no reminders sent");
            } else {
                println!("Sent {} reminders", run.reminders);
            }
        }
        Commands::List {
            user,
            archived,
            status,
            overdue,
            search,
            sort,
            page,
            size,
        } => {
            let store = shared(Store::open(&config.store_path)?);
            let tickets = Tickets::new(store, dispatcher(&config, true)?);
            let caller = tickets.caller(user)?;
            let params = ListParams {
                archived,
                status,
                overdue,
                search_term: search,
                sort,
                page,
                size: size.max(1),
                ..Default::default()
            };
            let result = tickets.list(&caller, &params)?;
            for view in &result.content {
                print_view(view);
            }
            println!(
                "Page {} of {} ({} requests)",
                result.current_page + 1,
                result.total_pages.max(1),
                result.total_items
            );
        }
        Commands::Seed => {
            let store = Store::open(&config.store_path)?;
            println!("Seeding reference data...");
            store.seed_defaults()?;
            println!("Seed complete");
        }
    }

    Ok(())
}

fn open_scheduler(config: &Config, dry_run: bool) -> Result<Scheduler> {
    let store = shared(Store::open(&config.store_path)?);
    let scheduler = Scheduler::new(
        store,
        dispatcher(config, dry_run)?,
        config.poll_interval_ms,
        &config.reminder_cron,
    )?;
    Ok(scheduler)
}

fn print_view(view: &RequestView) {
    let status = match view.status {
        RequestStatus::InWork => view.status.as_str().yellow(),
        RequestStatus::Done => view.status.as_str().green(),
        RequestStatus::Closed => view.status.as_str().dimmed(),
    };
    let remaining = match view.days_remaining {
        Some(days) if days < 0 => format!("{}d", days).as_str().red(),
        Some(days) => format!("{}d", days).as_str().normal(),
        None => "-".dimmed(),
    };
    let overdue = if view.is_overdue { " OVERDUE".red().bold() } else { "".normal() };

    println!(
        "#{:<5} [{}] {:>5} {} | {} | {}{}",
        view.request_id,
        status,
        remaining,
        view.shop_name.as_deref().unwrap_or("?"),
        view.urgency_name.as_deref().unwrap_or("?"),
        view.description,
        overdue
    );
}
