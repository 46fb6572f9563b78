//! Reaction-time duel refereed from a wireless motion sensor.

pub mod domain;
pub mod infrastructure;
pub mod presentation;
