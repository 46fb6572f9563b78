//! Duel Referee
//!
//! Timed state machine that arms a countdown, goes live when the start
//! signal is sent, and turns the first qualifying sensor sample into a
//! verdict against a randomized opponent.
//!
//! ```text
//!  Idle ──[arm]──▶ Armed ──[countdown]──▶ Live ──[swing]──▶ Resolved
//!                    │                     │                   │
//!                    └──[abort]────────────┴──[abort]──▶ Resolved
//!                                                              │
//!  Resolved ──[arm]──▶ Armed                                   │
//! ```
//!
//! The referee never reads a clock or a random generator on its own: both are
//! passed in by the caller, which keeps every transition deterministic under
//! test.

use crate::domain::errors::DuelError;
use crate::domain::models::{unix_millis, DuelResult, Winner};
use crate::domain::sample::SensorSample;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Opponent reaction time range in milliseconds, `[min, max)`.
pub const BOT_TIME_MIN_MS: u32 = 750;
pub const BOT_TIME_MAX_MS: u32 = 1800;

/// Countdown before the start signal in milliseconds, `[min, max]`.
pub const COUNTDOWN_MIN_MS: u64 = 3000;
pub const COUNTDOWN_MAX_MS: u64 = 6000;

/// Source of uniformly distributed values in `[0, 1)`.
pub trait RandomSource {
    fn next_unit(&mut self) -> f64;
}

/// Entropy-seeded source used outside tests.
pub struct ThreadRandom(StdRng);

impl ThreadRandom {
    pub fn new() -> Self {
        Self(StdRng::from_entropy())
    }
}

impl Default for ThreadRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for ThreadRandom {
    fn next_unit(&mut self) -> f64 {
        self.0.gen::<f64>()
    }
}

/// Replays a fixed list of values, wrapping around at the end.
#[cfg(test)]
pub(crate) struct SequenceSource {
    values: Vec<f64>,
    cursor: usize,
}

#[cfg(test)]
impl SequenceSource {
    pub(crate) fn new(values: Vec<f64>) -> Self {
        Self { values, cursor: 0 }
    }
}

#[cfg(test)]
impl RandomSource for SequenceSource {
    fn next_unit(&mut self) -> f64 {
        let value = self.values[self.cursor % self.values.len()];
        self.cursor += 1;
        value
    }
}

/// Map a unit draw onto whole milliseconds in `[min, min + span)`.
fn draw_millis(rng: &mut impl RandomSource, min: u64, span: u64) -> u64 {
    let unit = rng.next_unit().clamp(0.0, 1.0);
    let offset = ((unit * span as f64) as u64).min(span - 1);
    min + offset
}

/// Opponent reaction time in seconds, uniform in `[0.75, 1.80)`.
pub fn draw_bot_time(rng: &mut impl RandomSource) -> f32 {
    let span = u64::from(BOT_TIME_MAX_MS - BOT_TIME_MIN_MS);
    draw_millis(rng, u64::from(BOT_TIME_MIN_MS), span) as f32 / 1000.0
}

/// Countdown before the start signal, whole milliseconds in `[3.0, 6.0]` seconds.
pub fn draw_countdown(rng: &mut impl RandomSource) -> Duration {
    let span = COUNTDOWN_MAX_MS - COUNTDOWN_MIN_MS + 1;
    Duration::from_millis(draw_millis(rng, COUNTDOWN_MIN_MS, span))
}

/// Ties go to the bot.
pub fn decide_winner(player_time_seconds: f32, bot_time_seconds: f32) -> Winner {
    if player_time_seconds < bot_time_seconds {
        Winner::Player
    } else {
        Winner::Bot
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DuelOutcome {
    Verdict(DuelResult),
    /// A swing arrived before the start timestamp was recorded.
    FalseStart,
    /// The duel was called off (link lost or shutdown). No verdict.
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DuelState {
    Idle,
    Armed {
        deadline: Instant,
        bot_time_seconds: f32,
    },
    Live {
        started_at: Option<Instant>,
        bot_time_seconds: f32,
    },
    Resolved(DuelOutcome),
}

/// Countdown the caller must schedule after a successful [`DuelReferee::arm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    pub duel_id: u64,
    pub delay: Duration,
}

pub struct DuelReferee {
    state: DuelState,
    duel_id: u64,
}

impl DuelReferee {
    pub fn new() -> Self {
        Self {
            state: DuelState::Idle,
            duel_id: 0,
        }
    }

    pub fn state(&self) -> &DuelState {
        &self.state
    }

    /// Identifier of the most recently armed duel.
    pub fn duel_id(&self) -> u64 {
        self.duel_id
    }

    pub fn in_progress(&self) -> bool {
        matches!(self.state, DuelState::Armed { .. } | DuelState::Live { .. })
    }

    /// Start a new duel: draw the opponent time and countdown.
    ///
    /// Rejected without any state change while a duel is armed or live.
    pub fn arm(
        &mut self,
        now: Instant,
        rng: &mut impl RandomSource,
    ) -> Result<Countdown, DuelError> {
        if self.in_progress() {
            warn!("Duel request rejected: duel {} in progress", self.duel_id);
            return Err(DuelError::AlreadyInProgress);
        }

        let bot_time_seconds = draw_bot_time(rng);
        let delay = draw_countdown(rng);

        self.duel_id += 1;
        self.transition(DuelState::Armed {
            deadline: now + delay,
            bot_time_seconds,
        });
        info!(
            "Duel {} armed: countdown {} ms, bot {:.3} s",
            self.duel_id,
            delay.as_millis(),
            bot_time_seconds
        );

        Ok(Countdown {
            duel_id: self.duel_id,
            delay,
        })
    }

    /// Countdown fired. Returns `true` when the duel went live and the caller
    /// must now send the start signal and then call [`Self::mark_started`].
    ///
    /// Countdowns of earlier or cancelled duels are ignored.
    pub fn countdown_elapsed(&mut self, duel_id: u64) -> bool {
        match self.state {
            DuelState::Armed {
                bot_time_seconds, ..
            } if duel_id == self.duel_id => {
                self.transition(DuelState::Live {
                    started_at: None,
                    bot_time_seconds,
                });
                true
            }
            _ => {
                debug!("Ignoring stale countdown for duel {}", duel_id);
                false
            }
        }
    }

    /// Record the moment the start signal went out.
    pub fn mark_started(&mut self, now: Instant) {
        if let DuelState::Live {
            started_at: None,
            bot_time_seconds,
        } = self.state
        {
            self.transition(DuelState::Live {
                started_at: Some(now),
                bot_time_seconds,
            });
        }
    }

    /// Evaluate one sensor sample.
    ///
    /// Only a live duel looks at samples, and only a qualifying one resolves
    /// it; anything else leaves the state untouched.
    pub fn on_sample(&mut self, sample: &SensorSample, now: Instant) -> Option<DuelOutcome> {
        let DuelState::Live {
            started_at,
            bot_time_seconds,
        } = self.state
        else {
            return None;
        };

        if !sample.is_qualifying() {
            return None;
        }

        let Some(started_at) = started_at else {
            info!("Duel {}: false start", self.duel_id);
            self.transition(DuelState::Resolved(DuelOutcome::FalseStart));
            return Some(DuelOutcome::FalseStart);
        };

        let reaction_ms = now.saturating_duration_since(started_at).as_millis();
        let player_time_seconds = reaction_ms as f32 / 1000.0;
        let winner = decide_winner(player_time_seconds, bot_time_seconds);
        let result = DuelResult::new(
            player_time_seconds,
            bot_time_seconds,
            winner,
            unix_millis(),
        );

        info!(
            "Duel {}: {} wins ({:.3} s vs bot {:.3} s, magnitude {:.0})",
            self.duel_id, winner, player_time_seconds, bot_time_seconds, sample.magnitude
        );
        let outcome = DuelOutcome::Verdict(result);
        self.transition(DuelState::Resolved(outcome.clone()));
        Some(outcome)
    }

    /// Call off an armed or live duel. Returns whether anything was aborted.
    pub fn abort(&mut self) -> bool {
        if !self.in_progress() {
            return false;
        }
        info!("Duel {} aborted", self.duel_id);
        self.transition(DuelState::Resolved(DuelOutcome::Aborted));
        true
    }

    /// Drop whatever duel exists, e.g. when the session ends.
    pub fn reset(&mut self) {
        self.transition(DuelState::Idle);
    }

    fn transition(&mut self, next: DuelState) {
        debug!("Duel state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

impl Default for DuelReferee {
    fn default() -> Self {
        Self::new()
    }
}
