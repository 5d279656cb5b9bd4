#![deny(unsafe_code)]

mod command;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use workbench_agent::collab::{CollaboratorClient, DEFAULT_SEARCH_LIMIT, Station};
use workbench_agent::{
    AgentError, SessionController, Settings, SettingsStore, WorkbenchBus, WorkbenchEvent,
};

use crate::command::{Command, HELP};

#[derive(Debug, Parser)]
#[command(name = "workbench", version, about = "Terminal client for the field-agent chat stream")]
struct Cli {
    /// Settings file; defaults to the per-user config directory.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Overrides `api_base` from settings.
    #[arg(long, value_name = "URL")]
    api_base: Option<String>,
}

#[derive(Debug, Snafu)]
enum ConsoleError {
    #[snafu(display("failed to set up {what} on `{stage}`: {source}"))]
    Setup {
        stage: &'static str,
        what: &'static str,
        source: AgentError,
    },
    #[snafu(display("failed to read stdin on `{stage}`: {source}"))]
    ReadStdin {
        stage: &'static str,
        source: std::io::Error,
    },
}

type ConsoleResult<T> = Result<T, ConsoleError>;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "workbench exited with an error");
            eprintln!("workbench: {error}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(cli: Cli) -> ConsoleResult<()> {
    let store = SettingsStore::open_or_default(
        cli.config
            .unwrap_or_else(SettingsStore::default_config_path),
    );
    if let Some(api_base) = cli.api_base {
        store.replace(Settings {
            api_base,
            ..Settings::clone(&store.settings())
        });
    }
    let settings = store.settings();
    tracing::info!(
        api_base = %settings.api_base,
        config = ?store.config_path(),
        "starting workbench console"
    );

    let bus = WorkbenchBus::new();
    let _panels = render::attach_panels(&bus);
    let collaborator = CollaboratorClient::new(Arc::clone(&settings)).context(SetupSnafu {
        stage: "build-collaborator-client",
        what: "collaborator client",
    })?;
    let controller = SessionController::from_settings(&settings, bus.clone()).context(SetupSnafu {
        stage: "build-session-controller",
        what: "session controller",
    })?;
    let _bindings = controller.bind_bus(Some(collaborator.clone()));
    let transcript = tokio::spawn(render::follow_transcript(controller.subscribe_transcript()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context(ReadStdinSnafu {
        stage: "read-console-line",
    })? {
        match Command::parse(&line) {
            Command::Quit => break,
            Command::Help => println!("{HELP}"),
            Command::Usage(usage) => println!("{usage}"),
            Command::Chat(text) => {
                controller.send(&text);
            }
            Command::Ask {
                station_id,
                question,
            } => bus.emit(WorkbenchEvent::ask_station(
                Station::new(station_id, String::new()),
                question,
            )),
            Command::Select(station_id) => bus.emit(WorkbenchEvent::StationSelected(
                Station::new(station_id, String::new()),
            )),
            Command::Stations(city) => match collaborator.list_stations(&city).await {
                Ok(stations) => print_stations(&stations),
                Err(error) => report(&error),
            },
            Command::Search(query) => {
                match collaborator
                    .search_stations(&query, DEFAULT_SEARCH_LIMIT)
                    .await
                {
                    Ok(stations) => print_stations(&stations),
                    Err(error) => report(&error),
                }
            }
            Command::Coverage(station_id) => match collaborator.coverage(&station_id).await {
                Ok(estimate) => println!("{}", render::coverage_line(&estimate)),
                Err(error) => report(&error),
            },
        }
    }

    controller.cancel();
    drop(controller);
    if let Err(error) = transcript.await {
        tracing::debug!(error = %error, "transcript task ended abnormally");
    }
    Ok(())
}

fn print_stations(stations: &[Station]) {
    if stations.is_empty() {
        println!("no stations found");
        return;
    }
    for station in stations {
        println!("{}", render::station_line(station));
    }
}

fn report(error: &AgentError) {
    tracing::warn!(error = %error, "collaborator request failed");
    println!("[error] {error}");
}
