use adbook::clock::SystemClock;
use adbook::config;
use adbook::contract::LoggingDocuments;
use adbook::db;
use adbook::notify::{NotificationHub, NotificationSink};
use adbook::outbox::{self, Dispatch, FanOut, LogSink};
use adbook::profile::SqlProfiles;
use adbook::schedule;
use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run migrations and the outbox worker until Ctrl-C.
    Serve,
    /// Preview whether a time window clashes with an active show.
    CheckWindow {
        /// `HH:MM-HH:MM`
        #[arg(long)]
        window: String,
        /// `daily` or a weekday list such as `mon,wed,fri`
        #[arg(long, default_value = "daily")]
        days: String,
        /// Show id to ignore, when moving an existing show
        #[arg(long)]
        exclude: Option<i64>,
    },
    /// List bookable broadcasts on a date.
    Broadcasts {
        #[arg(long)]
        date: NaiveDate,
    },
    /// Record that a customer has payout details on file.
    RegisterPayout {
        #[arg(long)]
        customer: i64,
    },
    /// Print the number of undelivered outbox tasks.
    OutboxStatus,
    /// Print an example configuration.
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Serve => serve(pool, &cfg).await?,
        Command::CheckWindow {
            window,
            days,
            exclude,
        } => match schedule::check_conflict(&pool, &window, &days, exclude).await? {
            Some(c) => println!(
                "conflict: show {} \"{}\" ({} {})",
                c.show_id, c.name, c.window, c.recurrence
            ),
            None => println!("free"),
        },
        Command::Broadcasts { date } => {
            for l in schedule::bookable_on(&pool, date, Utc::now()).await? {
                println!(
                    "#{} {} {} {} slots {}/{} ad {}m @ {}c/min",
                    l.broadcast.id,
                    l.broadcast.air_date,
                    l.show_window,
                    l.show_name,
                    l.broadcast.booked_slots,
                    l.broadcast.capacity,
                    l.broadcast.ad_minutes,
                    l.price_per_minute_cents
                );
            }
        }
        Command::RegisterPayout { customer } => {
            SqlProfiles::new(pool.clone())
                .register_payout_details(customer)
                .await?;
            info!(customer, "payout details registered");
        }
        Command::OutboxStatus => {
            println!("{}", db::count_remaining_outbox_tasks(&pool).await?);
        }
        Command::ExampleConfig => print!("{}", config::example()),
    }
    Ok(())
}

async fn serve(pool: db::Pool, cfg: &config::Config) -> Result<()> {
    let hub = Arc::new(NotificationHub::new(cfg.outbox.hub_capacity));
    let sinks: Vec<Box<dyn NotificationSink>> = vec![Box::new(Arc::clone(&hub)), Box::new(LogSink)];
    let sink = FanOut::new(sinks);
    let documents = LoggingDocuments;
    let clock = SystemClock;
    let retry = cfg.retry_policy();
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);

    let worker_pool = pool.clone();
    let worker = tokio::spawn(async move {
        let to = Dispatch {
            notifications: &sink,
            documents: &documents,
            clock: &clock,
        };
        loop {
            match outbox::process_next_task(&worker_pool, &to, retry).await {
                Ok(processed) => {
                    if !processed {
                        tokio::time::sleep(poll_sleep).await;
                    }
                }
                Err(err) => {
                    error!(?err, "outbox worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    // Drop channels whose subscribers have disconnected.
    let janitor_hub = Arc::clone(&hub);
    let janitor = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            let pruned = janitor_hub.prune().await;
            if pruned > 0 {
                debug!(pruned, "pruned idle notification channels");
            }
        }
    });

    info!("outbox worker running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    worker.abort();
    janitor.abort();
    pool.close().await;
    info!("stopped");
    Ok(())
}
