//! Bluetooth Module
//!
//! Line-oriented link to the sensor peripheral over BLE.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   TransportSession                      │
//! │   (state machine - public API for the application)      │
//! └──────────┬──────────────────┬───────────────────────────┘
//!            │ commands         │ LinkEvent
//!            ▼                  │
//! ┌─────────────────────┐  ┌────┴───────┐  ┌──────────┐
//! │    LinkBackend      │  │  Framing   │  │ Protocol │
//! │                     │  │            │  │          │
//! │ - WinRtBackend      │  │ - line     │  │ - UUIDs  │
//! │ - SimulatedBackend  │  │   reassembly│ │ - props  │
//! └─────────────────────┘  └────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Service identifiers, channel properties, line encoding
//! - [`framing`] - Reassembly of notification chunks into lines
//! - [`backend`] - Platform boundary and the events it reports
//! - [`session`] - Connection lifecycle and send/receive surface
//! - [`simulated`] - In-process peripheral for tests and demo runs

pub mod backend;
pub mod framing;
pub mod protocol;
pub mod session;
pub mod simulated;
#[cfg(windows)]
pub mod windows;

pub use backend::{LinkBackend, LinkEvent, LinkEventSender};
pub use session::{SessionConfig, TransportSession};
