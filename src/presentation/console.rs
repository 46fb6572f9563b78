//! Line-oriented console front end: reads commands from stdin and prints
//! whatever the duel loop reports.

use crate::domain::models::{
    DuelResult, LeaderboardEntry, LinkState, MessageSeverity, StatusMessage, UserCommand,
};
use crate::presentation::app::{AppEvent, UiUpdate};
use std::io::BufRead;
use tokio::sync::mpsc;
use tracing::debug;

pub const HELP: &str =
    "Commands: connect (c), duel (d), board (b), disconnect (x), quit (q)";

pub fn parse_command(input: &str) -> Option<UserCommand> {
    match input.trim().to_lowercase().as_str() {
        "connect" | "c" => Some(UserCommand::Connect),
        "duel" | "d" | "start" => Some(UserCommand::StartDuel),
        "board" | "b" | "leaderboard" => Some(UserCommand::ShowLeaderboard),
        "disconnect" | "x" => Some(UserCommand::Disconnect),
        "quit" | "q" | "exit" => Some(UserCommand::Quit),
        _ => None,
    }
}

/// Forward stdin commands to the loop. End of input quits.
pub fn spawn_stdin_reader(events: mpsc::UnboundedSender<AppEvent>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Some(command) => {
                        if events.send(AppEvent::Command(command)).is_err() {
                            return;
                        }
                        if command == UserCommand::Quit {
                            return;
                        }
                    }
                    None => println!("Unknown command {:?}. {}", line.trim(), HELP),
                }
            }
            debug!("stdin closed");
            let _ = events.send(AppEvent::Command(UserCommand::Quit));
        })?;
    Ok(())
}

pub fn verdict_text(result: &DuelResult) -> String {
    format!(
        "Result: {} Wins! Time: {:.3} s (Bot: {:.3} s)",
        result.winner(),
        result.player_time_seconds(),
        result.bot_time_seconds()
    )
}

pub fn leaderboard_text(entries: &[LeaderboardEntry]) -> String {
    if entries.is_empty() {
        return "No player victories recorded yet.".to_string();
    }
    entries
        .iter()
        .map(|e| format!("#{}. Time: {:.3} s", e.rank, e.player_time_seconds))
        .collect::<Vec<_>>()
        .join("\n")
}

fn status_text(status: &StatusMessage) -> String {
    match status.severity {
        MessageSeverity::Info => status.message.clone(),
        MessageSeverity::Success => format!("OK: {}", status.message),
        MessageSeverity::Warning => format!("Warning: {}", status.message),
        MessageSeverity::Error => format!("Error: {}", status.message),
    }
}

/// Text for one update, if it should be shown. `verbose` adds the raw
/// sensor readout and link transitions.
pub fn render(update: &UiUpdate, verbose: bool) -> Option<String> {
    match update {
        UiUpdate::Status(status) => Some(status_text(status)),
        UiUpdate::Link(state) => match state {
            LinkState::Disconnected => Some("Link closed.".to_string()),
            _ if verbose => Some(format!("Link: {}", state)),
            _ => None,
        },
        UiUpdate::Readout(sample) => verbose.then(|| sample.readout()),
        UiUpdate::Verdict(result) => Some(verdict_text(result)),
        UiUpdate::FalseStart => Some("Result: Too soon! (False start)".to_string()),
        UiUpdate::DuelAborted => Some("Duel aborted.".to_string()),
        UiUpdate::Leaderboard(Ok(entries)) => Some(leaderboard_text(entries)),
        UiUpdate::Leaderboard(Err(e)) => Some(format!("Could not load leaderboard: {}", e)),
        UiUpdate::ControlsEnabled(true) => Some("Type 'duel' to start.".to_string()),
        UiUpdate::ControlsEnabled(false) => None,
    }
}

/// Print updates until the loop goes away.
pub async fn present(mut ui_rx: mpsc::UnboundedReceiver<UiUpdate>, verbose: bool) {
    while let Some(update) = ui_rx.recv().await {
        if let Some(text) = render(&update, verbose) {
            println!("{}", text);
        }
    }
}
