//! Singlebell - one alert tone across many processes.

mod app;
mod cli;
mod config;
mod ui;

use anyhow::{Context, Result};
use app::{App, Shared};
use cli::Args;
use config::Config;
use crossterm::{
    cursor::MoveToColumn,
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    style::Print,
    terminal::{Clear, ClearType, disable_raw_mode, enable_raw_mode},
};
use futures::StreamExt;
use singlebell::audio::NullBackend;
use singlebell::lease::Lease;
use singlebell::{AlertCoordinator, UnlockGate};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Setup logging. An interactive session owns the terminal, so its log
/// goes to a file; one-shot modes log to stderr.
fn setup_logging(verbose: bool, interactive: bool) -> Result<()> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    if interactive {
        let log_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("singlebell")
            .join("logs");
        fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("singlebell.log"))
            .context("Failed to open log file")?;

        tracing_subscriber::fmt()
            .with_writer(Mutex::new(log_file))
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(io::stderr)
            .with_env_filter(filter)
            .init();
    }

    debug!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if args.sample_config {
        print!("{}", config::sample_config());
        return Ok(());
    }

    setup_logging(args.verbose, args.is_interactive()).context("Failed to setup logging")?;

    let config = if let Some(ref path) = args.config {
        Config::load(path)?
    } else {
        Config::load_or_default()
    };

    if args.status {
        run_status(&args, &config)
    } else if args.stop {
        run_stop(&args, &config);
        Ok(())
    } else {
        run_interactive(&args, &config).await
    }
}

/// Print who holds the leases.
fn run_status(args: &Args, config: &Config) -> Result<()> {
    let shared = Shared::open(config, args);
    let playback = Lease::new(
        Arc::clone(&shared.store),
        config.lease.key.clone(),
        Duration::from_millis(config.lease.staleness_ms),
        Arc::clone(&shared.clock),
    );
    let active_tab = Lease::new(
        shared.store,
        config.active_tab.key.clone(),
        Duration::from_millis(config.active_tab.staleness_ms),
        shared.clock,
    );

    let report = ui::StatusReport::collect(&playback, &active_tab);
    println!("{}", ui::render_report(&report, args.json)?);
    Ok(())
}

/// Silence every process. This process never plays, so it needs no audio.
fn run_stop(args: &Args, config: &Config) {
    let shared = Shared::open(config, args);
    let gate = Arc::new(UnlockGate::new(Arc::new(NullBackend)));
    let coordinator = AlertCoordinator::new(
        config.coordinator_config(None),
        gate,
        shared.store,
        shared.bus,
        shared.clock,
    );
    coordinator.stop();
    info!("Stop sent");
}

/// Restores the terminal however the session ends.
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), Print("\r\n"));
    }
}

/// Run an interactive session until the user quits.
async fn run_interactive(args: &Args, config: &Config) -> Result<()> {
    let mut app = App::new(args, config);
    app.start();
    info!(owner = %app.coordinator.owner_id(), "Session started");

    let result = {
        let _guard = TerminalGuard::enter()?;
        let mut stdout = io::stdout();
        execute!(stdout, Print(ui::help_text()))?;
        run_app(&mut app, &mut stdout).await
    };

    app.shutdown();
    info!("Session ended");
    result
}

/// Main application loop.
async fn run_app(app: &mut App, stdout: &mut io::Stdout) -> Result<()> {
    let mut events = EventStream::new();
    let mut redraw = tokio::time::interval(Duration::from_millis(250));
    let mut heartbeat = tokio::time::interval(app.active_tab_heartbeat);

    loop {
        draw(app, stdout)?;

        tokio::select! {
            event = events.next() => match event {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                    handle_key_event(app, key).await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("Failed to read terminal event"),
                None => app.quit(),
            },
            _ = redraw.tick() => {}
            _ = heartbeat.tick() => app.heartbeat_active_tab(),
        }

        if app.should_quit() {
            break;
        }
    }

    Ok(())
}

fn draw(app: &App, stdout: &mut io::Stdout) -> Result<()> {
    execute!(
        stdout,
        MoveToColumn(0),
        Clear(ClearType::CurrentLine),
        Print(ui::render_status_line(app))
    )?;
    stdout.flush()?;
    Ok(())
}

/// Handle keyboard input.
async fn handle_key_event(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => app.quit(),
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => app.quit(),

        // Unlocking needs a real key press, which this is.
        KeyCode::Char('u') => app.unlock().await,
        KeyCode::Char('p') => app.play(),
        KeyCode::Char('s') => app.stop(),

        KeyCode::Char('h') | KeyCode::Char('?') => {
            app.toggle_help();
            if app.show_help {
                let _ = execute!(io::stdout(), Print("\r\n"), Print(ui::help_text()));
            }
        }

        _ => {}
    }
}
