use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use ansi_term::Colour;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::level_filters::LevelFilter;

use crate::{
    agent::start_agent,
    controller::Controller,
    storage::{session_store::keys, DASHBOARD_FILE},
    sync::summary::SummaryStatus,
    utils::{
        dir::create_application_default_path,
        logging::{enable_logging, AGENT_PREFIX, CLI_PREFIX},
    },
};

#[derive(Parser, Debug)]
#[command(name = "codetime", version, long_about = None)]
#[command(about = "Keeps your Code Time session in sync and uploads offline activity")]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
    )]
    dir: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        env = "CODETIME_API_ENDPOINT",
        help = "Overrides the api_endpoint setting"
    )]
    api_endpoint: Option<String>,
    #[arg(long, global = true, help = "Log filter, e.g. debug or trace")]
    log: Option<LevelFilter>,
    /// This option is for debugging purposes only.
    #[arg(long = "log-console", global = true)]
    log_console: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Show whether you are logged in and how much data is waiting")]
    Status {
        #[arg(long, help = "Ask the remote service even if the cached state is fresh")]
        force: bool,
    },
    #[command(about = "Log in through the browser and wait until the login is detected")]
    Login,
    #[command(about = "Forget the current account")]
    Logout,
    #[command(about = "Queue a telemetry payload for the next flush")]
    Track {
        #[arg(help = "Payload as a JSON object")]
        payload: String,
    },
    #[command(about = "Upload queued payloads now")]
    Flush,
    #[command(about = "Refresh and print the session summary dashboard")]
    Summary,
    #[command(about = "Push local preference changes to your profile")]
    Preferences,
    #[command(about = "Open the web dashboard, or the login page when logged out")]
    Dashboard,
    #[command(about = "Run the agent in the current console, flushing periodically")]
    Serve,
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let dir = match args.dir {
        Some(dir) => {
            tokio::fs::create_dir_all(&dir).await?;
            dir
        }
        None => create_application_default_path()?,
    };

    let prefix = match args.commands {
        Commands::Serve => AGENT_PREFIX,
        _ => CLI_PREFIX,
    };
    enable_logging(prefix, &dir.join("logs"), args.log, args.log_console)?;

    if let Commands::Serve = args.commands {
        return start_agent(dir, args.api_endpoint).await;
    }

    let controller = Controller::open(&dir, args.api_endpoint).await?;
    match args.commands {
        Commands::Status { force } => print_status(&controller, force).await,
        Commands::Login => {
            controller.handle_code_time_login().await?;
            println!("Waiting for the login to complete in the browser...");
            controller.wait_for_background_tasks().await;
            Ok(())
        }
        Commands::Logout => controller.logout().await,
        Commands::Track { payload } => {
            let payload: Value =
                serde_json::from_str(&payload).context("Payload must be valid JSON")?;
            controller.record_payload(&payload).await?;
            println!("Queued, {} payloads pending", controller.pending_payloads().await?);
            Ok(())
        }
        Commands::Flush => {
            match controller.send_offline_data().await {
                Some(report) if report.failed_batches > 0 => println!(
                    "{} {} of {} batches failed, their payloads were dropped",
                    Colour::Yellow.paint("Partially sent:"),
                    report.failed_batches,
                    report.batches
                ),
                Some(report) => println!(
                    "{} {} payloads in {} batches",
                    Colour::Green.paint("Sent"),
                    report.payloads,
                    report.batches
                ),
                None => println!("{}", Colour::Red.paint("Offline, payloads kept for later")),
            }
            controller.wait_for_background_tasks().await;
            Ok(())
        }
        Commands::Summary => print_summary(&controller, &dir).await,
        Commands::Preferences => {
            if controller.update_preferences().await {
                println!("Preferences updated");
            } else {
                println!("Preferences already up to date");
            }
            Ok(())
        }
        Commands::Dashboard => {
            controller.handle_kpm_clicked().await?;
            controller.wait_for_background_tasks().await;
            Ok(())
        }
        // Runs without a controller of its own, see above.
        Commands::Serve => Ok(()),
    }
}

async fn print_status(controller: &Arc<Controller>, force: bool) -> Result<()> {
    let status = controller.get_user_status(force).await;
    let online = controller.is_online().await;

    if status.logged_in {
        let name = controller
            .store()
            .get_string(keys::NAME)
            .await
            .unwrap_or_else(|| "unknown account".into());
        println!("{} as {name}", Colour::Green.paint("Logged in"));
    } else {
        println!("{}", Colour::Red.paint("Not logged in"));
    }
    if !online {
        println!("{}", Colour::Yellow.paint("Code Time service is unreachable"));
    }
    println!("{} payloads pending", controller.pending_payloads().await?);

    controller.wait_for_background_tasks().await;
    Ok(())
}

async fn print_summary(controller: &Controller, dir: &Path) -> Result<()> {
    if controller.fetch_session_summary_info().await == SummaryStatus::NoData {
        println!("{}", Colour::Yellow.paint("No session summary available"));
        return Ok(());
    }
    match tokio::fs::read_to_string(dir.join(DASHBOARD_FILE)).await {
        Ok(dashboard) => print!("{dashboard}"),
        Err(e) if e.kind() == ErrorKind::NotFound => println!("No data available"),
        Err(e) => Err(e)?,
    }
    Ok(())
}
