//! Link Backend
//!
//! Boundary between the transport session and a platform Bluetooth stack.
//! Commands go down through [`LinkBackend`] and return immediately; their
//! results come back later as [`LinkEvent`]s on a single channel that the
//! application loop drains in order.

use crate::domain::errors::TransportError;
use crate::domain::models::PeripheralHandle;
use crate::infrastructure::bluetooth::protocol::{ChannelInfo, ServiceInfo, WriteMode};
use tokio::sync::mpsc;

/// Something the Bluetooth stack reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Advertisement from a named device
    Discovered(PeripheralHandle),
    Connected,
    /// Connection attempt failed with a platform status code
    ConnectFailed(i32),
    CapabilitiesDiscovered(Vec<ServiceInfo>),
    /// Service discovery failed with a platform status code
    DiscoveryFailed(i32),
    /// Raw notification or indication payload
    Notification(Vec<u8>),
    Disconnected,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Non-blocking command surface of a Bluetooth stack.
///
/// An `Err` means the command could not even be issued; failures of an
/// issued command are reported as events.
pub trait LinkBackend: Send {
    fn radio_enabled(&self) -> bool;

    fn start_scan(&mut self) -> Result<(), TransportError>;

    fn stop_scan(&mut self);

    fn connect(&mut self, peripheral: &PeripheralHandle) -> Result<(), TransportError>;

    fn discover_capabilities(&mut self) -> Result<(), TransportError>;

    /// Subscribe to a channel by writing its CCCD.
    fn enable_notifications(
        &mut self,
        channel: &ChannelInfo,
        indicate: bool,
    ) -> Result<(), TransportError>;

    fn write(
        &mut self,
        channel: &ChannelInfo,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    /// Release the link and everything hanging off it. Safe to repeat.
    fn close(&mut self);
}
