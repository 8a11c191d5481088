use crate::definition::{load_project, Project, DEFAULT_DEFINITION, DEFAULT_DEFINITION_NAME};
use crate::engine::environment::Environment;
use crate::engine::packager::Zip;
use crate::engine::progress::Progress;
use crate::engine::repository::{check_prerequisites, CONNECTIVITY_URL};
use crate::engine::{Engine, EngineSettings, Session, Step, Workflow};
use crate::logging::init_logging;
use crate::ui::menu::Menu;
use crate::ui::spinner::Spinner;
use crate::ui::{print_error, print_info, print_success, print_warning, report_error};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::BufReader;

mod definition;
mod engine;
mod logging;
mod ui;
mod utils;

#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "Build and package a Node.js project with a private toolchain")]
struct Cli {
    /// Project definition to use instead of the built-in one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory the repository is cloned into
    #[arg(short, long, global = true)]
    workdir: Option<PathBuf>,

    /// Answer yes to every confirmation
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive menu (default)
    Menu,
    /// Clone, provision, build and package
    Setup {
        /// Remove an existing checkout and clone again
        #[arg(long)]
        fresh: bool,
    },
    /// Provision, build and package an existing checkout
    Quick,
    /// Clone the repository
    Clone {
        #[arg(long)]
        fresh: bool,
    },
    /// Install or verify Node.js
    Node,
    /// Install or verify pnpm
    Pnpm,
    /// Build the project
    Build,
    /// Create the distributable archive
    Package,
    /// Remove temporary files
    Cleanup,
    /// Check every component
    Health,
    /// Show paths and versions
    Info,
}

fn load_definition(path: Option<&PathBuf>) -> anyhow::Result<Result<Project, miette::Report>> {
    let Some(path) = path else {
        return Ok(load_project(DEFAULT_DEFINITION, DEFAULT_DEFINITION_NAME));
    };

    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    Ok(load_project(&source, &path.display().to_string()))
}

async fn dispatch(engine: &Engine, command: Command, assume_yes: bool) -> anyhow::Result<()> {
    let mut session = Session::new(Environment::from_process());

    match command {
        Command::Menu => {
            let stdin = BufReader::new(tokio::io::stdin());
            Menu::new(engine, session, stdin, assume_yes).run().await?;
        }
        Command::Setup { fresh } => {
            let workflow = Workflow::complete().replace_repository(fresh);
            engine.run_workflow(&mut session, &workflow).await?;
            ui::show_summary(&session.stats);
        }
        Command::Quick => {
            engine.check_repository(&mut session).await?;
            engine.run_workflow(&mut session, &Workflow::quick()).await?;
            ui::show_summary(&session.stats);
        }
        Command::Clone { fresh } => {
            let workflow = Workflow::through(Step::Clone).replace_repository(fresh);
            engine.run_workflow(&mut session, &workflow).await?;
        }
        Command::Node => {
            engine
                .run_workflow(&mut session, &Workflow::through(Step::Node))
                .await?;
        }
        Command::Pnpm => {
            engine
                .run_workflow(&mut session, &Workflow::through(Step::Pnpm))
                .await?;
        }
        Command::Build => {
            engine
                .run_workflow(&mut session, &Workflow::through(Step::Build))
                .await?;
        }
        Command::Package => {
            engine
                .run_workflow(&mut session, &Workflow::through(Step::Package))
                .await?;
        }
        Command::Cleanup => {
            let removed = engine.cleanup_temp_files().await?;
            print_success(&format!("Removed {} temporary files", removed));
        }
        Command::Health => ui::show_health(&engine.health_check(&session).await),
        Command::Info => ui::show_info(engine, &session.stats),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let project = match load_definition(cli.config.as_ref())? {
        Ok(project) => project,
        Err(report) => {
            eprintln!("{:?}", report);
            return Ok(ExitCode::FAILURE);
        }
    };

    let workdir = match cli.workdir {
        Some(workdir) => workdir,
        None => std::env::current_dir().context("reading the current directory")?,
    };

    let settings = EngineSettings::new(&workdir, project);
    let progress: Arc<dyn Progress> = Arc::new(Spinner::new());
    init_logging(&settings.log_path(), cli.verbose, progress.clone())?;

    match check_prerequisites(&Environment::from_process(), CONNECTIVITY_URL).await {
        Ok(prerequisites) => {
            print_info(&prerequisites.git);
            if !prerequisites.sudo {
                print_warning("sudo not found, permissions will only be adjusted for the current user");
            }
            if !prerequisites.online {
                print_warning("No internet connection detected, downloads may fail");
            }
        }
        Err(e) => {
            report_error(&e);
            return Ok(ExitCode::FAILURE);
        }
    }

    let engine = Engine::new::<Zip>(settings, progress);
    let command = cli.command.unwrap_or(Command::Menu);

    tokio::select! {
        result = dispatch(&engine, command, cli.yes) => match result {
            Ok(()) => Ok(ExitCode::SUCCESS),
            Err(e) => {
                report_error(&e);
                Ok(ExitCode::FAILURE)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            println!();
            print_error("Interrupted");
            Ok(ExitCode::SUCCESS)
        }
    }
}
