//! Result Sink
//!
//! Append-only store of finished duels plus the fastest-player-wins query
//! behind the leaderboard.

use crate::domain::errors::SinkError;
use crate::domain::models::{DuelResult, LeaderboardEntry, Winner};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub trait ResultSink: Send + Sync {
    fn append(&self, result: &DuelResult) -> Result<(), SinkError>;

    /// Player-won duels, fastest first, at most `limit` of them.
    fn top_player_wins(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, SinkError>;
}

/// Rank Player wins by reaction time, starting at 1.
pub fn rank_player_wins<'a>(
    results: impl IntoIterator<Item = &'a DuelResult>,
    limit: usize,
) -> Vec<LeaderboardEntry> {
    let mut times: Vec<f32> = results
        .into_iter()
        .filter(|r| r.winner() == Winner::Player)
        .map(|r| r.player_time_seconds())
        .collect();
    times.sort_by(|a, b| a.total_cmp(b));

    times
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, player_time_seconds)| LeaderboardEntry {
            rank: i + 1,
            player_time_seconds,
        })
        .collect()
}

/// One JSON document per line.
pub struct JsonLinesSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<DuelResult>, SinkError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No results file at {} yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(SinkError::Read(e)),
        };

        let results = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(i, line)| match serde_json::from_str(line) {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!("Skipping malformed result on line {}: {}", i + 1, e);
                    None
                }
            })
            .collect();
        Ok(results)
    }
}

impl ResultSink for JsonLinesSink {
    fn append(&self, result: &DuelResult) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(result)?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(SinkError::Write)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(SinkError::Write)?;
        file.write_all(line.as_bytes()).map_err(SinkError::Write)?;

        info!("Result saved to {}", self.path.display());
        Ok(())
    }

    fn top_player_wins(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, SinkError> {
        let results = self.read_all()?;
        Ok(rank_player_wins(&results, limit))
    }
}

/// Process-local sink.
#[derive(Default)]
pub struct MemorySink {
    results: Mutex<Vec<DuelResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<DuelResult> {
        self.results
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

impl ResultSink for MemorySink {
    fn append(&self, result: &DuelResult) -> Result<(), SinkError> {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        Ok(())
    }

    fn top_player_wins(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, SinkError> {
        let results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rank_player_wins(results.iter(), limit))
    }
}
