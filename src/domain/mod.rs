//! Platform-free duel logic and shared models.

pub mod duel;
pub mod errors;
pub mod models;
pub mod sample;
pub mod settings;
