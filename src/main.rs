//! easytask CLI entry point

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use easytask::core::{CronSchedule, RunOutcome, TaskKind};
use easytask::{App, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "easytask", version, about = "Cron-driven script runner")]
struct Cli {
    /// Config file (default: ./easytask.yml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load tasks, start their triggers and serve the HTTP API
    Serve,
    /// List registered tasks
    List {
        /// List utility tasks instead of scheduled ones
        #[arg(long)]
        utils: bool,
    },
    /// Run a task now and print its output
    Run { id: String },
    /// Print the next fire times of a cron expression
    Next {
        expression: String,
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve => {
            let (config, app) = load(cli.config.as_deref())?;
            log::info!("easytask v{}", env!("CARGO_PKG_VERSION"));
            app.reload()?;
            let addr = config.listen_addr()?;
            easytask::server::serve(app.clone(), addr).await?;
            app.shutdown();
        }
        Command::List { utils } => {
            let (_, app) = load(cli.config.as_deref())?;
            let kind = if utils { TaskKind::Utility } else { TaskKind::Scheduled };
            for task in app.list_tasks(kind)? {
                match task.task.schedule {
                    Some(schedule) => println!(
                        "{:<24} {:<16} {}",
                        task.task.id,
                        schedule,
                        if task.task.enabled { "enabled" } else { "disabled" }
                    ),
                    None => println!("{}", task.task.id),
                }
            }
        }
        Command::Run { id } => {
            let (_, app) = load(cli.config.as_deref())?;
            let mut observer = app.subscribe(&id);
            let printer = tokio::spawn(async move {
                while let Some(line) = observer.recv().await {
                    println!("{}", line);
                }
            });

            let run = app.run_now(&id).await;
            // closing the channel lets the printer drain and exit
            drop(app);
            let _ = printer.await;

            let run = run?;
            if run.outcome != RunOutcome::Succeeded {
                anyhow::bail!("{} {}", run.task_id, run.outcome);
            }
        }
        Command::Next { expression, count } => {
            let schedule = CronSchedule::parse(&expression)?;
            for fire in schedule.upcoming(&Local::now(), count) {
                println!("{}", fire.format("%Y-%m-%d %H:%M %a"));
            }
        }
    }

    Ok(())
}

fn load(path: Option<&Path>) -> Result<(Config, Arc<App>)> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::auto_load()?,
    };
    let app = Arc::new(App::new(&config)?);
    Ok((config, app))
}
