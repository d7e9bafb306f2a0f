mod config;
mod db;
mod health;
mod lockout;
mod master;
mod outputs;
mod policy;
mod reader;
mod relay;
mod scheduler;
mod store;

use anyhow::{Context, Result};
use std::env;
use std::process::ExitCode;
use time::OffsetDateTime;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use config::{ReaderConfig, RestartMode};
use db::Db;
use outputs::OutputBoard;
use reader::CardReader;
use scheduler::{Controller, Step};
use store::{TokenStore, MASTER_TOKEN_ID};

/// `EX_TEMPFAIL`: the reader could not be recovered, restart the service.
pub const EXIT_RESTART: u8 = 75;

enum Exit {
    Shutdown,
    Restart,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:brewlock.db?mode=rwc".to_string());
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    config::apply(&cfg, &db).await?;
    info!(tokens = db.count_tokens().await?, "db ready");

    // ── Master token ────────────────────────────────────────────────
    let stored = match db.get_setting(MASTER_TOKEN_ID).await {
        Ok(v) => v,
        Err(e) => {
            warn!("store: master token setting unreadable: {e:#}");
            None
        }
    };
    let master_token = config::resolve_master_token(
        env::var("MASTER_TOKEN_ID").ok(),
        cfg.master_token_id.as_deref(),
        stored,
    );
    match &master_token {
        Some(_) => info!("master token configured"),
        None => warn!("no master token configured, master mode disabled"),
    }

    // ── Hardware ────────────────────────────────────────────────────
    let board = OutputBoard::new(&cfg.outputs).context("failed to set up outputs")?;
    let reader = open_reader(&cfg.reader).context("failed to set up card reader")?;

    let mut controller = Controller::new(
        &cfg,
        db,
        reader,
        board,
        master_token,
        OffsetDateTime::now_utc(),
    );

    let exit = run(&mut controller).await;
    controller.shutdown();
    drop(controller);

    match exit? {
        Exit::Shutdown => {
            info!("stopped");
            Ok(ExitCode::SUCCESS)
        }
        Exit::Restart => match cfg.runtime.restart {
            RestartMode::Exit => {
                error!(code = EXIT_RESTART, "exiting for restart");
                Ok(ExitCode::from(EXIT_RESTART))
            }
            RestartMode::Exec => Err(reexec()),
        },
    }
}

/// Step the controller until a signal arrives or a restart is needed.
async fn run<S: TokenStore, R: CardReader>(controller: &mut Controller<S, R>) -> Result<Exit> {
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    info!("access control loop started");
    loop {
        let pause = match controller.step(OffsetDateTime::now_utc()).await {
            Step::Continue(pause) => pause,
            Step::Restart => return Ok(Exit::Restart),
        };

        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                return Ok(Exit::Shutdown);
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                return Ok(Exit::Shutdown);
            }
            _ = sleep(pause) => {}
        }
    }
}

#[cfg(feature = "gpio")]
fn open_reader(cfg: &ReaderConfig) -> Result<reader::HardwareReader> {
    reader::HardwareReader::open(cfg)
}

#[cfg(not(feature = "gpio"))]
fn open_reader(_cfg: &ReaderConfig) -> Result<reader::ConsoleReader> {
    Ok(reader::ConsoleReader::spawn())
}

/// Replace this process with a fresh copy, same arguments. Only returns on
/// failure.
fn reexec() -> anyhow::Error {
    use std::os::unix::process::CommandExt;

    let exe = match env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return anyhow::Error::new(e).context("failed to locate own executable"),
    };
    warn!(exe = %exe.display(), "re-executing");
    let err = std::process::Command::new(&exe)
        .args(env::args_os().skip(1))
        .exec();
    anyhow::Error::new(err).context(format!("failed to re-exec {}", exe.display()))
}
