//! Simulated Backend
//!
//! In-process stand-in for a Bluetooth stack. A recording backend keeps a log
//! of every command. With a [`SimulatedPeripheral`] attached the backend
//! answers like a well-behaved sensor: it is discovered on scan, accepts the
//! connection, reports the UART service, and after receiving the start signal
//! streams a resting reading followed by a swing.

use crate::domain::errors::TransportError;
use crate::domain::models::PeripheralHandle;
use crate::infrastructure::bluetooth::backend::{LinkBackend, LinkEvent, LinkEventSender};
use crate::infrastructure::bluetooth::protocol::{
    self, ChannelInfo, ServiceInfo, WriteMode, DEFAULT_NAME_PREFIX, START_SIGNAL,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A backend command as the simulated stack saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    StartScan,
    StopScan,
    Connect(String),
    DiscoverCapabilities,
    EnableNotifications { channel: Uuid, indicate: bool },
    Write {
        channel: Uuid,
        payload: Vec<u8>,
        mode: WriteMode,
    },
    Close,
}

/// Behaviour of the simulated sensor.
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub id: String,
    pub name: String,
    pub services: Vec<ServiceInfo>,
    /// Delay between the start signal and the swing. `None` never swings.
    pub swing_after: Option<Duration>,
    pub resting_line: String,
    pub swing_line: String,
}

impl SimulatedPeripheral {
    pub fn microbit(swing_after: Option<Duration>) -> Self {
        Self {
            id: "SIM-0001".to_string(),
            name: format!("{} [sim]", DEFAULT_NAME_PREFIX),
            services: vec![protocol::uart_service()],
            swing_after,
            resting_line: "12,-40,1010".to_string(),
            swing_line: "1580,-420,610".to_string(),
        }
    }
}

pub struct SimulatedBackend {
    events: LinkEventSender,
    peripheral: Option<SimulatedPeripheral>,
    radio: bool,
    linked: bool,
    /// Bumped on every close so swings scheduled on an old link are dropped.
    link_generation: Arc<AtomicU64>,
    calls: Option<Vec<BackendCall>>,
}

impl SimulatedBackend {
    /// Backend that answers every command like `peripheral` would. Keeps no
    /// call log unless [`with_call_log`](Self::with_call_log) is used.
    pub fn new(events: LinkEventSender, peripheral: SimulatedPeripheral) -> Self {
        Self::build(events, Some(peripheral), None)
    }

    /// Backend that only records commands; events are injected by the caller.
    pub fn recording(events: LinkEventSender) -> Self {
        Self::build(events, None, Some(Vec::new()))
    }

    fn build(
        events: LinkEventSender,
        peripheral: Option<SimulatedPeripheral>,
        calls: Option<Vec<BackendCall>>,
    ) -> Self {
        Self {
            events,
            peripheral,
            radio: true,
            linked: false,
            link_generation: Arc::new(AtomicU64::new(0)),
            calls,
        }
    }

    pub fn with_call_log(mut self) -> Self {
        self.calls.get_or_insert_with(Vec::new);
        self
    }

    pub fn with_radio(mut self, enabled: bool) -> Self {
        self.radio = enabled;
        self
    }

    /// Commands seen so far. Empty when no call log is kept.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.clone().unwrap_or_default()
    }

    fn record(&mut self, call: BackendCall) {
        if let Some(calls) = &mut self.calls {
            calls.push(call);
        }
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("Simulated event dropped: receiver closed");
        }
    }

    fn schedule_swing(&self, peripheral: &SimulatedPeripheral, swing_after: Duration) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No runtime available, simulated swing skipped");
                return;
            }
        };

        let events = self.events.clone();
        let generation = self.link_generation.clone();
        let expected = generation.load(Ordering::SeqCst);
        let resting = protocol::encode_line(&peripheral.resting_line);
        let swing = protocol::encode_line(&peripheral.swing_line);

        handle.spawn(async move {
            let still_linked = || generation.load(Ordering::SeqCst) == expected;

            tokio::time::sleep(swing_after / 2).await;
            if !still_linked() {
                return;
            }
            let _ = events.send(LinkEvent::Notification(resting));

            tokio::time::sleep(swing_after - swing_after / 2).await;
            if !still_linked() {
                return;
            }
            // Split mid-line the way a small MTU would.
            let (head, tail) = swing.split_at(swing.len() / 2);
            let _ = events.send(LinkEvent::Notification(head.to_vec()));
            let _ = events.send(LinkEvent::Notification(tail.to_vec()));
            debug!("Simulated swing sent");
        });
    }
}

impl LinkBackend for SimulatedBackend {
    fn radio_enabled(&self) -> bool {
        self.radio
    }

    fn start_scan(&mut self) -> Result<(), TransportError> {
        self.record(BackendCall::StartScan);
        if let Some(peripheral) = &self.peripheral {
            self.emit(LinkEvent::Discovered(PeripheralHandle {
                id: peripheral.id.clone(),
                name: peripheral.name.clone(),
            }));
        }
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.record(BackendCall::StopScan);
    }

    fn connect(&mut self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        self.record(BackendCall::Connect(peripheral.id.clone()));
        if self.peripheral.is_some() {
            self.linked = true;
            self.emit(LinkEvent::Connected);
        }
        Ok(())
    }

    fn discover_capabilities(&mut self) -> Result<(), TransportError> {
        self.record(BackendCall::DiscoverCapabilities);
        if let Some(peripheral) = &self.peripheral {
            self.emit(LinkEvent::CapabilitiesDiscovered(peripheral.services.clone()));
        }
        Ok(())
    }

    fn enable_notifications(
        &mut self,
        channel: &ChannelInfo,
        indicate: bool,
    ) -> Result<(), TransportError> {
        self.record(BackendCall::EnableNotifications {
            channel: channel.uuid,
            indicate,
        });
        Ok(())
    }

    fn write(
        &mut self,
        channel: &ChannelInfo,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        self.record(BackendCall::Write {
            channel: channel.uuid,
            payload: payload.to_vec(),
            mode,
        });

        if !self.linked || payload != protocol::encode_line(START_SIGNAL).as_slice() {
            return Ok(());
        }
        if let Some(peripheral) = &self.peripheral {
            info!("Simulated peripheral received start signal");
            if let Some(swing_after) = peripheral.swing_after {
                self.schedule_swing(peripheral, swing_after);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.record(BackendCall::Close);
        self.linked = false;
        self.link_generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle(peripheral: &SimulatedPeripheral) -> PeripheralHandle {
        PeripheralHandle {
            id: peripheral.id.clone(),
            name: peripheral.name.clone(),
        }
    }

    fn writer() -> ChannelInfo {
        protocol::uart_service()
            .channels
            .into_iter()
            .find(|c| c.properties.can_write())
            .unwrap()
    }

    #[tokio::test]
    async fn test_answers_handshake() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peripheral = SimulatedPeripheral::microbit(None);
        let mut backend = SimulatedBackend::new(tx, peripheral.clone());

        backend.start_scan().unwrap();
        backend.connect(&handle(&peripheral)).unwrap();
        backend.discover_capabilities().unwrap();

        assert_eq!(rx.recv().await, Some(LinkEvent::Discovered(handle(&peripheral))));
        assert_eq!(rx.recv().await, Some(LinkEvent::Connected));
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::CapabilitiesDiscovered(vec![protocol::uart_service()]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_swings_after_start_signal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peripheral = SimulatedPeripheral::microbit(Some(Duration::from_millis(400)));
        let mut backend = SimulatedBackend::new(tx, peripheral.clone());
        backend.connect(&handle(&peripheral)).unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::Connected));

        backend
            .write(&writer(), b"SHOOT\n", WriteMode::WithoutResponse)
            .unwrap();

        let mut bytes = Vec::new();
        for _ in 0..3 {
            match rx.recv().await {
                Some(LinkEvent::Notification(chunk)) => bytes.extend(chunk),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(bytes, b"12,-40,1010\n1580,-420,610\n".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_swing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peripheral = SimulatedPeripheral::microbit(Some(Duration::from_millis(400)));
        let mut backend = SimulatedBackend::new(tx, peripheral.clone());
        backend.connect(&handle(&peripheral)).unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::Connected));

        backend
            .write(&writer(), b"SHOOT\n", WriteMode::WithoutResponse)
            .unwrap();
        backend.close();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_recording_backend_stays_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut backend = SimulatedBackend::recording(tx);
        backend.start_scan().unwrap();
        backend.stop_scan();

        assert!(rx.try_recv().is_err());
        assert_eq!(
            backend.calls(),
            vec![BackendCall::StartScan, BackendCall::StopScan]
        );
    }

    #[test]
    fn test_call_log_is_opt_in() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peripheral = SimulatedPeripheral::microbit(None);
        let mut backend = SimulatedBackend::new(tx.clone(), peripheral.clone());
        backend.start_scan().unwrap();
        backend.connect(&handle(&peripheral)).unwrap();
        backend.close();
        assert!(backend.calls().is_empty());

        let mut logged = SimulatedBackend::new(tx, peripheral.clone()).with_call_log();
        logged.start_scan().unwrap();
        logged.connect(&handle(&peripheral)).unwrap();
        assert_eq!(
            logged.calls(),
            vec![
                BackendCall::StartScan,
                BackendCall::Connect(peripheral.id.clone())
            ]
        );
    }
}
