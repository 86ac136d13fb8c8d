//! App Host - installs and runs packaged web applications
//!
//! An application package is a directory with a `manifest.app.toml`:
//!
//! ```toml
//! [app]
//! name = "Notes"
//! identifier = "org.example.notes"
//! version = "0.3.0"
//! main_document = "background.html"   # optional
//! local_path = "index.html"           # optional entry page
//!
//! [windows]
//! width = 1024
//!
//! [permissions]
//! contacts = "prompt"
//! ```
//!
//! # Lifecycle
//!
//! Launching opens the main document (or the entry page when there is none).
//! When only the main document is left open, the application is suspended:
//! `onSuspend` is dispatched if hosted content registered for it, and the main
//! document closes once content acknowledges the event. The host exits when
//! no application is running.
//!
//! # Environment Variables
//!
//! - `APP_HOST_LOG` - Log filter (default: config `log_filter`, then "info")

use anyhow::{bail, Context, Result};
use ext_storage::ApplicationStorage;
use std::env;
use std::path::PathBuf;
use std::rc::Rc;

mod config;
mod engine;
mod host;

use config::HostConfig;
use host::Host;

#[derive(Debug, PartialEq)]
enum Command {
    Install(PathBuf),
    Uninstall(String),
    List,
    Launch(String),
    Run(PathBuf),
}

#[derive(Debug, PartialEq)]
struct Options {
    config: Option<PathBuf>,
    command: Command,
}

fn usage() {
    eprintln!("app-host [--config <host.toml>] <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  --install <app-dir>   Validate and install an application package");
    eprintln!("  --uninstall <app-id>  Remove an installed application");
    eprintln!("  --list                List installed applications");
    eprintln!("  --launch <app-id>     Run an installed application");
    eprintln!("  --run <app-dir>       Run a package without installing it");
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Options> {
    let mut args = args.into_iter();
    let mut config = None;
    let mut command = None;

    while let Some(arg) = args.next() {
        let next = match arg.as_str() {
            "--config" => {
                config = Some(PathBuf::from(
                    args.next().context("--config requires a path")?,
                ));
                continue;
            }
            "--install" => Command::Install(PathBuf::from(
                args.next().context("--install requires a directory")?,
            )),
            "--uninstall" => {
                Command::Uninstall(args.next().context("--uninstall requires an app id")?)
            }
            "--list" => Command::List,
            "--launch" => Command::Launch(args.next().context("--launch requires an app id")?),
            "--run" => Command::Run(PathBuf::from(
                args.next().context("--run requires a directory")?,
            )),
            other => bail!("Unknown argument: {}", other),
        };
        if command.replace(next).is_some() {
            bail!("Only one command may be given");
        }
    }

    match command {
        Some(command) => Ok(Options { config, command }),
        None => bail!("No command given"),
    }
}

fn init_tracing(config: &HostConfig) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("APP_HOST_LOG").unwrap_or_else(|_| {
        EnvFilter::new(config.log_filter.as_deref().unwrap_or("info"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn open_storage(config: &HostConfig) -> Result<Rc<ApplicationStorage>> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let storage = ApplicationStorage::open(&db_path)
        .with_context(|| format!("opening application database {}", db_path.display()))?;
    Ok(Rc::new(storage))
}

fn main() -> Result<()> {
    let options = match parse_args(env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            usage();
            return Err(e);
        }
    };

    let config = HostConfig::load_or_default(options.config.as_deref())?;
    init_tracing(&config);

    let storage = open_storage(&config)?;
    let host = Host::new(storage, &config);

    match options.command {
        Command::Install(dir) => {
            let app_id = host.service().install(&dir)?;
            println!("Installed {}", app_id);
        }
        Command::Uninstall(app_id) => {
            host.service().uninstall(&app_id)?;
            println!("Uninstalled {}", app_id);
        }
        Command::List => {
            for app in host.service().installed_applications()? {
                println!("{}\t{}\t{}", app.id, app.installed_at, app.path.display());
            }
        }
        Command::Launch(app_id) => {
            host.service().launch(&app_id)?;
            run(host)?;
        }
        Command::Run(dir) => {
            host.service().launch_from_path(&dir)?;
            run(host)?;
        }
    }

    Ok(())
}

fn run(host: Host) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("creating tokio runtime")?;
    rt.block_on(host.run())
}
