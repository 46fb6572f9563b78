//! Duel Application Loop
//!
//! Single serialized context that owns the transport session and the
//! referee. Backend events, decoded lines, timer expiries and user commands
//! all arrive as messages and are applied one at a time, so a send can never
//! race a disconnect and a sample can never race the countdown.
//!
//! Output goes to the presenter as [`UiUpdate`]s.

use crate::domain::duel::{DuelOutcome, DuelReferee, RandomSource};
use crate::domain::errors::SinkError;
use crate::domain::models::{
    DuelResult, LeaderboardEntry, LinkState, StatusMessage, UserCommand,
};
use crate::domain::sample::SensorSample;
use crate::infrastructure::bluetooth::protocol::START_SIGNAL;
use crate::infrastructure::bluetooth::{LinkBackend, LinkEvent, TransportSession};
use crate::infrastructure::result_sink::ResultSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Work for the application loop.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Command(UserCommand),
    /// Decoded line from the peripheral
    Line(String),
    CountdownElapsed(u64),
    ScanTimedOut(u64),
    /// Completion report from work done off the loop
    Notice(StatusMessage),
}

/// What the presenter should show.
#[derive(Debug)]
pub enum UiUpdate {
    Status(StatusMessage),
    Link(LinkState),
    Readout(SensorSample),
    Verdict(DuelResult),
    FalseStart,
    DuelAborted,
    Leaderboard(Result<Vec<LeaderboardEntry>, SinkError>),
    /// Whether a new duel may be requested
    ControlsEnabled(bool),
}

#[derive(Debug, Clone)]
pub struct AppOptions {
    pub scan_timeout: Option<Duration>,
    pub leaderboard_limit: usize,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            scan_timeout: Some(Duration::from_secs(20)),
            leaderboard_limit: 10,
        }
    }
}

pub struct DuelApp<B: LinkBackend, R: RandomSource> {
    session: TransportSession<B>,
    referee: DuelReferee,
    rng: R,
    sink: Arc<dyn ResultSink>,
    events: mpsc::UnboundedSender<AppEvent>,
    ui: mpsc::UnboundedSender<UiUpdate>,
    options: AppOptions,
    countdown: Option<JoinHandle<()>>,
    scan_timer: Option<JoinHandle<()>>,
    scan_attempt: u64,
    controls_enabled: bool,
}

impl<B: LinkBackend, R: RandomSource> DuelApp<B, R> {
    pub fn new(
        mut session: TransportSession<B>,
        rng: R,
        sink: Arc<dyn ResultSink>,
        events: mpsc::UnboundedSender<AppEvent>,
        ui: mpsc::UnboundedSender<UiUpdate>,
        options: AppOptions,
    ) -> Self {
        let lines = events.clone();
        session.on_line(move |line| {
            let _ = lines.send(AppEvent::Line(line));
        });

        Self {
            session,
            referee: DuelReferee::new(),
            rng,
            sink,
            events,
            ui,
            options,
            countdown: None,
            scan_timer: None,
            scan_attempt: 0,
            controls_enabled: false,
        }
    }

    pub fn session(&self) -> &TransportSession<B> {
        &self.session
    }

    pub fn referee(&self) -> &DuelReferee {
        &self.referee
    }

    /// Drain both queues until the user quits.
    ///
    /// The application queue is always drained first. Lines decoded from a
    /// notification land there while that notification is handled, so they
    /// are applied before the next backend event is taken.
    pub async fn run(
        mut self,
        mut app_rx: mpsc::UnboundedReceiver<AppEvent>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        info!("Duel loop started");
        loop {
            tokio::select! {
                biased;

                event = app_rx.recv() => match event {
                    Some(event) => {
                        if !self.handle(event) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = link_rx.recv() => self.handle_link(event),
            }
        }
        self.shutdown();
        info!("Duel loop stopped");
    }

    /// Apply one application event. Returns `false` once the user quit.
    pub fn handle(&mut self, event: AppEvent) -> bool {
        match event {
            AppEvent::Command(command) => return self.handle_command(command),
            AppEvent::Line(line) => self.on_line(&line),
            AppEvent::CountdownElapsed(duel_id) => self.on_countdown(duel_id),
            AppEvent::ScanTimedOut(attempt) => {
                if attempt != self.scan_attempt {
                    debug!("Ignoring scan timer of attempt {}", attempt);
                    return true;
                }
                self.scan_timer = None;
                self.with_link_change(|session| session.scan_timed_out());
            }
            AppEvent::Notice(message) => self.notify(message),
        }
        true
    }

    /// Apply one backend event.
    pub fn handle_link(&mut self, event: LinkEvent) {
        if let Some(state) = self.session.handle_event(event) {
            self.on_link_changed(state);
        }
    }

    /// Cancel timers, call off any duel and release the link.
    pub fn shutdown(&mut self) {
        self.cancel_scan_timer();
        self.cancel_countdown();
        self.referee.abort();
        self.referee.reset();
        self.session.disconnect();
    }

    fn handle_command(&mut self, command: UserCommand) -> bool {
        debug!("Command: {:?}", command);
        match command {
            UserCommand::Connect => self.connect(),
            UserCommand::Disconnect => self.with_link_change(|session| session.disconnect()),
            UserCommand::StartDuel => self.start_duel(),
            UserCommand::ShowLeaderboard => self.show_leaderboard(),
            UserCommand::Quit => return false,
        }
        true
    }

    fn connect(&mut self) {
        self.cancel_scan_timer();
        self.scan_attempt += 1;

        let ui = self.ui.clone();
        self.with_link_change(move |session| {
            session.connect(move |status| {
                let _ = ui.send(UiUpdate::Status(StatusMessage::info(status)));
            })
        });

        if let (LinkState::Scanning, Some(timeout)) =
            (self.session.state(), self.options.scan_timeout)
        {
            let events = self.events.clone();
            let attempt = self.scan_attempt;
            self.scan_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events.send(AppEvent::ScanTimedOut(attempt));
            }));
        }
    }

    fn start_duel(&mut self) {
        if !self.session.is_ready() {
            self.notify(StatusMessage::warning("Not connected"));
            return;
        }

        match self.referee.arm(Instant::now(), &mut self.rng) {
            Ok(countdown) => {
                self.cancel_countdown();
                let events = self.events.clone();
                self.countdown = Some(tokio::spawn(async move {
                    tokio::time::sleep(countdown.delay).await;
                    let _ = events.send(AppEvent::CountdownElapsed(countdown.duel_id));
                }));
                self.notify(StatusMessage::info("Get ready..."));
                self.refresh_controls();
            }
            Err(e) => self.notify(StatusMessage::warning(e.to_string())),
        }
    }

    fn on_countdown(&mut self, duel_id: u64) {
        self.countdown = None;
        if !self.referee.countdown_elapsed(duel_id) {
            return;
        }
        self.session.send(START_SIGNAL);
        self.referee.mark_started(Instant::now());
        self.notify(StatusMessage::info("SHOOT!"));
    }

    fn on_line(&mut self, line: &str) {
        let sample = SensorSample::parse(line);
        let _ = self.ui.send(UiUpdate::Readout(sample));

        if let Some(outcome) = self.referee.on_sample(&sample, Instant::now()) {
            self.on_outcome(outcome);
        }
    }

    fn on_outcome(&mut self, outcome: DuelOutcome) {
        self.cancel_countdown();
        match outcome {
            DuelOutcome::Verdict(result) => {
                let _ = self.ui.send(UiUpdate::Verdict(result.clone()));
                self.save_result(result);
            }
            DuelOutcome::FalseStart => {
                let _ = self.ui.send(UiUpdate::FalseStart);
            }
            DuelOutcome::Aborted => {
                let _ = self.ui.send(UiUpdate::DuelAborted);
            }
        }
        self.refresh_controls();
    }

    /// Hand the result to the sink without holding up the loop.
    fn save_result(&self, result: DuelResult) {
        let sink = self.sink.clone();
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let notice = match sink.append(&result) {
                Ok(()) => StatusMessage::success("Result saved"),
                Err(e) => {
                    error!("{}", e);
                    StatusMessage::error(e.to_string())
                }
            };
            let _ = events.send(AppEvent::Notice(notice));
        });
    }

    fn show_leaderboard(&self) {
        let sink = self.sink.clone();
        let ui = self.ui.clone();
        let limit = self.options.leaderboard_limit;
        tokio::task::spawn_blocking(move || {
            let board = sink.top_player_wins(limit);
            if let Err(e) = &board {
                warn!("Leaderboard query failed: {}", e);
            }
            let _ = ui.send(UiUpdate::Leaderboard(board));
        });
    }

    /// Run a session operation and react if it moved the link state.
    fn with_link_change(&mut self, op: impl FnOnce(&mut TransportSession<B>)) {
        let before = self.session.state().clone();
        op(&mut self.session);
        let after = self.session.state().clone();
        if after != before {
            self.on_link_changed(after);
        }
    }

    fn on_link_changed(&mut self, state: LinkState) {
        let _ = self.ui.send(UiUpdate::Link(state.clone()));

        if state != LinkState::Scanning {
            self.cancel_scan_timer();
        }

        if !state.is_ready() && self.referee.in_progress() {
            warn!("Link {} during duel {}", state, self.referee.duel_id());
            self.cancel_countdown();
            self.referee.abort();
            self.on_outcome(DuelOutcome::Aborted);
            self.notify(StatusMessage::warning("Link lost - duel aborted"));
        }

        self.refresh_controls();
    }

    fn refresh_controls(&mut self) {
        let enabled = self.session.is_ready() && !self.referee.in_progress();
        if enabled != self.controls_enabled {
            self.controls_enabled = enabled;
            let _ = self.ui.send(UiUpdate::ControlsEnabled(enabled));
        }
    }

    fn cancel_countdown(&mut self) {
        if let Some(countdown) = self.countdown.take() {
            countdown.abort();
        }
    }

    fn cancel_scan_timer(&mut self) {
        if let Some(timer) = self.scan_timer.take() {
            timer.abort();
        }
    }

    fn notify(&self, message: StatusMessage) {
        let _ = self.ui.send(UiUpdate::Status(message));
    }
}
