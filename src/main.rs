use anyhow::{Context, Result};
use clap::Parser;
use quickdraw_duel::domain::duel::ThreadRandom;
use quickdraw_duel::domain::models::UserCommand;
use quickdraw_duel::domain::settings::SettingsService;
use quickdraw_duel::infrastructure::bluetooth::protocol;
use quickdraw_duel::infrastructure::bluetooth::simulated::{SimulatedBackend, SimulatedPeripheral};
use quickdraw_duel::infrastructure::bluetooth::{
    LinkBackend, LinkEvent, SessionConfig, TransportSession,
};
use quickdraw_duel::infrastructure::logging;
use quickdraw_duel::infrastructure::result_sink::{JsonLinesSink, ResultSink};
use quickdraw_duel::presentation::app::{AppEvent, AppOptions, DuelApp};
use quickdraw_duel::presentation::console;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "quickdraw",
    version,
    about = "Reaction-time duel against a bot, refereed from a BLE motion sensor"
)]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Use an in-process simulated sensor instead of Bluetooth
    #[arg(long)]
    simulate: bool,

    /// Reaction time of the simulated player after the start signal
    #[arg(long, value_name = "MS", default_value_t = 450)]
    swing_after_ms: u64,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Everything the duel loop needs besides the backend.
struct Wiring {
    session_config: SessionConfig,
    sink: Arc<dyn ResultSink>,
    options: AppOptions,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => SettingsService::from_path(path.clone()),
        None => SettingsService::new()?,
    };
    if !settings.exists() {
        if let Err(e) = settings.save() {
            eprintln!(
                "Could not write default settings to {}: {}",
                settings.path().display(),
                e
            );
        }
    }
    if let Some(level) = logging::level_for_verbosity(cli.verbose) {
        settings.get_mut().log_settings.level = level.to_string();
    }

    let _logging_guard = logging::init_logger(&settings.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Quickdraw Duel ({})", settings.path().display());

    let s = settings.get();
    let session_config = SessionConfig {
        service_uuid: protocol::parse_uuid(&s.ble_service_uuid)
            .context("ble_service_uuid in settings")?,
        name_prefix: s.device_name_prefix.clone(),
    };
    let results_path = settings.results_path();
    info!("Results stored in {}", results_path.display());

    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let wiring = Wiring {
        session_config,
        sink: Arc::new(JsonLinesSink::new(results_path)),
        options: AppOptions {
            scan_timeout: s.scan_timeout(),
            leaderboard_limit: s.leaderboard_limit,
        },
        link_rx,
        verbose: cli.verbose > 0,
    };

    if cli.simulate {
        let peripheral =
            SimulatedPeripheral::microbit(Some(Duration::from_millis(cli.swing_after_ms)));
        return run(SimulatedBackend::new(link_tx, peripheral), wiring).await;
    }

    #[cfg(windows)]
    {
        let backend = quickdraw_duel::infrastructure::bluetooth::windows::WinRtBackend::start(link_tx)
            .await
            .context("Failed to start Bluetooth")?;
        run(backend, wiring).await
    }

    #[cfg(not(windows))]
    {
        drop((link_tx, wiring));
        anyhow::bail!("No Bluetooth backend on this platform; run with --simulate")
    }
}

async fn run<B: LinkBackend + 'static>(backend: B, wiring: Wiring) -> Result<()> {
    let (events, app_rx) = mpsc::unbounded_channel();
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();

    let app = DuelApp::new(
        TransportSession::new(backend, wiring.session_config),
        ThreadRandom::new(),
        wiring.sink,
        events.clone(),
        ui_tx,
        wiring.options,
    );

    println!("{}", console::HELP);
    let presenter = tokio::spawn(console::present(ui_rx, wiring.verbose));
    console::spawn_stdin_reader(events.clone()).context("Failed to read commands")?;

    let _ = events.send(AppEvent::Command(UserCommand::Connect));
    drop(events);

    app.run(app_rx, wiring.link_rx).await;
    let _ = presenter.await;
    Ok(())
}
