//! Transport Session
//!
//! Owns the link lifecycle: scan for the peripheral, connect, negotiate the
//! UART service, subscribe to its notifying channels, and expose a
//! send-line / receive-line surface on top of the frame decoder.
//!
//! ```text
//!  Idle ──▶ Scanning ──▶ Connecting ──▶ DiscoveringCapabilities ──▶ Ready
//!   │          │             │                   │                    │
//!   │          └─────────────┴───────────────────┴──▶ Failed          │
//!   └──[radio off]──▶ Failed                                          │
//!                                                   Disconnected ◀────┘
//! ```
//!
//! Every mutation of [`LinkState`] goes through `transition`. Backend results
//! arrive through [`TransportSession::handle_event`]; events that do not fit
//! the current state are dropped.

use crate::domain::errors::TransportError;
use crate::domain::models::{LinkState, PeripheralHandle};
use crate::infrastructure::bluetooth::backend::{LinkBackend, LinkEvent};
use crate::infrastructure::bluetooth::framing::FrameDecoder;
use crate::infrastructure::bluetooth::protocol::{self, ChannelInfo, ServiceInfo, WriteMode};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub type StatusCallback = Box<dyn FnMut(&str) + Send>;
pub type LineHandler = Box<dyn FnMut(String) + Send>;

/// What to look for while pairing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub service_uuid: Uuid,
    pub name_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::UART_SERVICE_UUID,
            name_prefix: protocol::DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

/// Channels resolved during negotiation. Gone as soon as the link is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    pub writer: Option<ChannelInfo>,
    pub write_mode: WriteMode,
    pub notifiers: Vec<ChannelInfo>,
}

pub struct TransportSession<B: LinkBackend> {
    backend: B,
    config: SessionConfig,
    state: LinkState,
    scanning: bool,
    peripheral: Option<PeripheralHandle>,
    capabilities: Option<CapabilitySet>,
    decoder: FrameDecoder,
    on_status: Option<StatusCallback>,
    on_line: Option<LineHandler>,
}

impl<B: LinkBackend> TransportSession<B> {
    pub fn new(backend: B, config: SessionConfig) -> Self {
        Self {
            backend,
            config,
            state: LinkState::Idle,
            scanning: false,
            peripheral: None,
            capabilities: None,
            decoder: FrameDecoder::new(),
            on_status: None,
            on_line: None,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn capabilities(&self) -> Option<&CapabilitySet> {
        self.capabilities.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Register the consumer of decoded lines, replacing any previous one.
    pub fn on_line(&mut self, handler: impl FnMut(String) + Send + 'static) {
        if self.on_line.replace(Box::new(handler)).is_some() {
            debug!("Line handler replaced");
        }
    }

    /// Begin the Idle → Ready sequence, reporting milestones to `on_status`.
    ///
    /// Anything left from an earlier attempt (scan, link, capabilities,
    /// partial line) is released first.
    pub fn connect(&mut self, on_status: impl FnMut(&str) + Send + 'static) {
        self.on_status = Some(Box::new(on_status));

        if self.state != LinkState::Idle {
            info!("Restarting connection from {}", self.state);
            self.release();
            self.transition(LinkState::Idle);
        }

        if !self.backend.radio_enabled() {
            self.fail(TransportError::Unavailable);
            return;
        }

        self.transition(LinkState::Scanning);
        self.status("Scanning...");

        match self.backend.start_scan() {
            Ok(()) => self.scanning = true,
            Err(e) => self.fail(e),
        }
    }

    /// Write one line to the peripheral. Never blocks and never retries.
    ///
    /// Outside `Ready`, or without a writable channel, this only logs.
    pub fn send(&mut self, line: &str) {
        if !self.state.is_ready() {
            debug!("send ignored: not ready ({}) line={:?}", self.state, line);
            return;
        }

        let Some(caps) = &self.capabilities else {
            debug!("send ignored: no capabilities line={:?}", line);
            return;
        };
        let Some(writer) = caps.writer.clone() else {
            debug!("send ignored: no writable channel line={:?}", line);
            return;
        };
        let mode = caps.write_mode;

        let payload = protocol::encode_line(line);
        match self.backend.write(&writer, &payload, mode) {
            Ok(()) => debug!(
                "TX-> {} mode={:?} bytes={} text={:?}",
                writer.uuid,
                mode,
                payload.len(),
                line
            ),
            Err(e) => warn!("Write of {:?} dropped: {}", line, e),
        }
    }

    /// Tear the link down from any state. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        self.release();
        if !matches!(self.state, LinkState::Idle | LinkState::Disconnected) {
            self.transition(LinkState::Disconnected);
            self.status("Disconnected");
        }
    }

    /// Give up on a scan that found nothing.
    pub fn scan_timed_out(&mut self) {
        if self.state != LinkState::Scanning {
            return;
        }
        self.release();
        self.fail(TransportError::DiscoveryTimeout(self.config.name_prefix.clone()));
    }

    /// Apply one backend event. Returns the new state if it changed.
    pub fn handle_event(&mut self, event: LinkEvent) -> Option<LinkState> {
        let before = self.state.clone();

        match event {
            LinkEvent::Discovered(peripheral) => self.on_discovered(peripheral),
            LinkEvent::Connected => self.on_connected(),
            LinkEvent::ConnectFailed(code) => self.on_connect_failed(code),
            LinkEvent::CapabilitiesDiscovered(services) => self.on_capabilities(&services),
            LinkEvent::DiscoveryFailed(code) => {
                if self.state == LinkState::DiscoveringCapabilities {
                    self.release();
                    self.fail(TransportError::DiscoveryFailed(code));
                }
            }
            LinkEvent::Notification(bytes) => self.on_notification(&bytes),
            LinkEvent::Disconnected => self.on_link_lost(),
        }

        (self.state != before).then(|| self.state.clone())
    }

    fn on_discovered(&mut self, peripheral: PeripheralHandle) {
        if self.state != LinkState::Scanning {
            trace!("Ignoring advertisement from {:?} in {}", peripheral.name, self.state);
            return;
        }
        if !peripheral.name.starts_with(&self.config.name_prefix) {
            trace!("Skipping {:?}", peripheral.name);
            return;
        }

        // Stop before connecting: at most one attempt per scan.
        self.stop_scan();
        self.status(&format!("Found {} - connecting...", peripheral.name));
        self.decoder.reset();
        self.capabilities = None;
        self.transition(LinkState::Connecting);

        let result = self.backend.connect(&peripheral);
        self.peripheral = Some(peripheral);
        if let Err(e) = result {
            self.release();
            self.fail(e);
        }
    }

    fn on_connected(&mut self) {
        if self.state != LinkState::Connecting {
            debug!("Ignoring connect event in {}", self.state);
            return;
        }
        if let Some(peripheral) = self.peripheral.take() {
            info!("Link up with {} ({})", peripheral.name, peripheral.id);
        }

        self.transition(LinkState::DiscoveringCapabilities);
        self.status("Connected - discovering services...");

        if let Err(e) = self.backend.discover_capabilities() {
            self.release();
            self.fail(e);
        }
    }

    fn on_connect_failed(&mut self, code: i32) {
        match self.state {
            LinkState::Connecting | LinkState::DiscoveringCapabilities => {
                self.release();
                self.fail(TransportError::ConnectFailure(code));
            }
            LinkState::Ready => {
                warn!("Link dropped with status {}", code);
                self.on_link_lost();
            }
            _ => debug!("Ignoring connect failure {} in {}", code, self.state),
        }
    }

    fn on_capabilities(&mut self, services: &[ServiceInfo]) {
        if self.state != LinkState::DiscoveringCapabilities {
            debug!("Ignoring stale service discovery in {}", self.state);
            return;
        }

        let Some(service) = services.iter().find(|s| s.uuid == self.config.service_uuid) else {
            error!("Service {} not found among {} service(s)", self.config.service_uuid, services.len());
            self.release();
            self.fail(TransportError::CapabilityMissing(format!(
                "service {}",
                self.config.service_uuid
            )));
            return;
        };

        let writer = service
            .channels
            .iter()
            .find(|c| c.properties.can_write())
            .cloned();
        let write_mode = writer
            .as_ref()
            .map(|c| WriteMode::preferred(c.properties))
            .unwrap_or(WriteMode::WithResponse);

        let mut notifiers = Vec::new();
        for channel in &service.channels {
            debug!("Channel {} props={:?}", channel.uuid, channel.properties);
            if !channel.properties.can_subscribe() {
                continue;
            }
            let indicate = channel.properties.indicate;
            if let Err(e) = self.backend.enable_notifications(channel, indicate) {
                warn!("Could not subscribe to {}: {}", channel.uuid, e);
            }
            notifiers.push(channel.clone());
        }

        match &writer {
            Some(w) => info!("Ready: writer={} mode={:?}", w.uuid, write_mode),
            None => warn!("Ready without a writable channel; sends will be ignored"),
        }

        self.capabilities = Some(CapabilitySet {
            writer,
            write_mode,
            notifiers,
        });
        self.transition(LinkState::Ready);
        self.status("Ready");
    }

    fn on_notification(&mut self, bytes: &[u8]) {
        if self.state != LinkState::Ready {
            debug!("Dropping {} byte(s) received in {}", bytes.len(), self.state);
            return;
        }
        trace!("RX<- {} byte(s)", bytes.len());

        let Self {
            decoder, on_line, ..
        } = self;
        for line in decoder.feed(bytes) {
            match on_line.as_mut() {
                Some(handler) => handler(line),
                None => trace!("No line handler, dropping {:?}", line),
            }
        }
    }

    fn on_link_lost(&mut self) {
        if !self.state.holds_link() {
            debug!("Ignoring disconnect in {}", self.state);
            return;
        }
        self.release();
        self.transition(LinkState::Disconnected);
        self.status("Disconnected");
    }

    fn stop_scan(&mut self) {
        if self.scanning {
            self.backend.stop_scan();
            self.scanning = false;
        }
    }

    /// Free scan, link and everything resolved on it.
    fn release(&mut self) {
        self.stop_scan();
        if self.state.holds_link() {
            self.backend.close();
        }
        self.peripheral = None;
        self.capabilities = None;
        self.decoder.reset();
    }

    fn fail(&mut self, error: TransportError) {
        warn!("Transport failure: {}", error);
        let reason = error.to_string();
        self.status(&reason);
        self.transition(LinkState::Failed(reason));
    }

    fn transition(&mut self, next: LinkState) {
        if self.state != next {
            debug!("Link state: {} -> {}", self.state, next);
        }
        self.state = next;
    }

    fn status(&mut self, message: &str) {
        info!("{}", message);
        if let Some(on_status) = &mut self.on_status {
            on_status(message);
        }
    }
}

impl<B: LinkBackend> Drop for TransportSession<B> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{
        uart_service, ChannelProperties, UART_RX_CHAR_UUID, UART_SERVICE_UUID, UART_TX_CHAR_UUID,
    };
    use crate::infrastructure::bluetooth::simulated::{BackendCall, SimulatedBackend};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    type Log = Arc<Mutex<Vec<String>>>;

    fn session() -> TransportSession<SimulatedBackend> {
        let (tx, _rx) = mpsc::unbounded_channel();
        TransportSession::new(SimulatedBackend::recording(tx), SessionConfig::default())
    }

    fn recorder() -> (Log, impl FnMut(&str) + Send + 'static) {
        let log: Log = Arc::default();
        let sink = log.clone();
        (log, move |s: &str| sink.lock().unwrap().push(s.to_string()))
    }

    fn microbit() -> PeripheralHandle {
        PeripheralHandle {
            id: "F1C2A3B4D5E6".to_string(),
            name: "BBC micro:bit [tazog]".to_string(),
        }
    }

    fn ready_session() -> TransportSession<SimulatedBackend> {
        let mut session = session();
        session.connect(|_| {});
        session.handle_event(LinkEvent::Discovered(microbit()));
        session.handle_event(LinkEvent::Connected);
        session.handle_event(LinkEvent::CapabilitiesDiscovered(vec![uart_service()]));
        assert_eq!(session.state(), &LinkState::Ready);
        session
    }

    fn writes(session: &TransportSession<SimulatedBackend>) -> Vec<BackendCall> {
        session
            .backend()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BackendCall::Write { .. }))
            .collect()
    }

    #[test]
    fn test_radio_off_fails_fast() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let backend = SimulatedBackend::recording(tx).with_radio(false);
        let mut session = TransportSession::new(backend, SessionConfig::default());
        let (log, on_status) = recorder();

        session.connect(on_status);

        assert_eq!(session.state(), &LinkState::Failed("Bluetooth is OFF".into()));
        assert!(session.backend().calls().is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["Bluetooth is OFF"]);
    }

    #[test]
    fn test_handshake_reaches_ready() {
        let mut session = session();
        let (log, on_status) = recorder();
        session.connect(on_status);
        assert_eq!(session.state(), &LinkState::Scanning);

        let other = PeripheralHandle {
            id: "1".into(),
            name: "Headphones".into(),
        };
        assert_eq!(session.handle_event(LinkEvent::Discovered(other)), None);

        assert_eq!(
            session.handle_event(LinkEvent::Discovered(microbit())),
            Some(LinkState::Connecting)
        );
        assert_eq!(
            session.handle_event(LinkEvent::Connected),
            Some(LinkState::DiscoveringCapabilities)
        );
        assert_eq!(
            session.handle_event(LinkEvent::CapabilitiesDiscovered(vec![uart_service()])),
            Some(LinkState::Ready)
        );

        assert_eq!(
            session.backend().calls(),
            vec![
                BackendCall::StartScan,
                BackendCall::StopScan,
                BackendCall::Connect("F1C2A3B4D5E6".into()),
                BackendCall::DiscoverCapabilities,
                BackendCall::EnableNotifications {
                    channel: UART_TX_CHAR_UUID,
                    indicate: true,
                },
            ]
        );
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "Scanning...",
                "Found BBC micro:bit [tazog] - connecting...",
                "Connected - discovering services...",
                "Ready",
            ]
        );

        let caps = session.capabilities().unwrap();
        assert_eq!(caps.writer.as_ref().unwrap().uuid, UART_RX_CHAR_UUID);
        assert_eq!(caps.write_mode, WriteMode::WithoutResponse);
        assert_eq!(caps.notifiers.len(), 1);
    }

    #[test]
    fn test_only_one_connection_attempt_per_scan() {
        let mut session = session();
        session.connect(|_| {});
        session.handle_event(LinkEvent::Discovered(microbit()));
        session.handle_event(LinkEvent::Discovered(microbit()));

        let connects = session
            .backend()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BackendCall::Connect(_)))
            .count();
        assert_eq!(connects, 1);
    }

    #[test]
    fn test_every_notifying_channel_is_subscribed() {
        let mut session = session();
        session.connect(|_| {});
        session.handle_event(LinkEvent::Discovered(microbit()));
        session.handle_event(LinkEvent::Connected);

        let mut service = uart_service();
        let extra = Uuid::from_u128(0xfeed);
        service.channels.push(ChannelInfo {
            uuid: extra,
            properties: ChannelProperties {
                notify: true,
                ..Default::default()
            },
        });
        session.handle_event(LinkEvent::CapabilitiesDiscovered(vec![service]));

        let calls = session.backend().calls();
        assert!(calls.contains(&BackendCall::EnableNotifications {
            channel: UART_TX_CHAR_UUID,
            indicate: true,
        }));
        assert!(calls.contains(&BackendCall::EnableNotifications {
            channel: extra,
            indicate: false,
        }));
        assert_eq!(session.capabilities().unwrap().notifiers.len(), 2);
    }

    #[test]
    fn test_missing_service_fails_and_releases_link() {
        let mut session = session();
        session.connect(|_| {});
        session.handle_event(LinkEvent::Discovered(microbit()));
        session.handle_event(LinkEvent::Connected);

        let unrelated = ServiceInfo {
            uuid: Uuid::from_u128(0x180f),
            channels: vec![],
        };
        let next = session.handle_event(LinkEvent::CapabilitiesDiscovered(vec![unrelated]));

        assert!(matches!(next, Some(LinkState::Failed(_))));
        assert!(session.capabilities().is_none());
        assert_eq!(session.backend().calls().last(), Some(&BackendCall::Close));
    }

    #[test]
    fn test_connect_failure_is_terminal() {
        let mut session = session();
        let (log, on_status) = recorder();
        session.connect(on_status);
        session.handle_event(LinkEvent::Discovered(microbit()));
        session.handle_event(LinkEvent::ConnectFailed(133));

        assert_eq!(
            session.state(),
            &LinkState::Failed("Connection failed (status=133)".into())
        );
        assert_eq!(
            log.lock().unwrap().last().map(String::as_str),
            Some("Connection failed (status=133)")
        );
        // Late events from the dead attempt change nothing.
        assert_eq!(session.handle_event(LinkEvent::Connected), None);
    }

    #[test]
    fn test_send_before_ready_is_ignored() {
        let mut session = session();
        session.send("SHOOT");
        session.connect(|_| {});
        session.send("SHOOT");
        assert!(writes(&session).is_empty());
    }

    #[test]
    fn test_send_appends_terminator_and_uses_preferred_mode() {
        let mut session = ready_session();
        session.send("SHOOT");

        assert_eq!(
            writes(&session),
            vec![BackendCall::Write {
                channel: UART_RX_CHAR_UUID,
                payload: b"SHOOT\n".to_vec(),
                mode: WriteMode::WithoutResponse,
            }]
        );
    }

    #[test]
    fn test_send_falls_back_to_write_with_response() {
        let mut session = session();
        session.connect(|_| {});
        session.handle_event(LinkEvent::Discovered(microbit()));
        session.handle_event(LinkEvent::Connected);
        let service = ServiceInfo {
            uuid: UART_SERVICE_UUID,
            channels: vec![ChannelInfo {
                uuid: UART_RX_CHAR_UUID,
                properties: ChannelProperties {
                    write: true,
                    ..Default::default()
                },
            }],
        };
        session.handle_event(LinkEvent::CapabilitiesDiscovered(vec![service]));
        session.send("SHOOT");

        assert!(matches!(
            writes(&session).as_slice(),
            [BackendCall::Write {
                mode: WriteMode::WithResponse,
                ..
            }]
        ));
    }

    #[test]
    fn test_ready_without_writer_ignores_send() {
        let mut session = session();
        session.connect(|_| {});
        session.handle_event(LinkEvent::Discovered(microbit()));
        session.handle_event(LinkEvent::Connected);
        let mut service = uart_service();
        service.channels.retain(|c| !c.properties.can_write());
        session.handle_event(LinkEvent::CapabilitiesDiscovered(vec![service]));

        assert!(session.is_ready());
        session.send("SHOOT");
        assert!(writes(&session).is_empty());
    }

    #[test]
    fn test_notifications_become_ordered_lines() {
        let mut session = ready_session();
        let lines: Log = Arc::default();
        let sink = lines.clone();
        session.on_line(move |line| sink.lock().unwrap().push(line));

        session.handle_event(LinkEvent::Notification(b"10,20".to_vec()));
        session.handle_event(LinkEvent::Notification(b",30\n\n40,50,60\n7".to_vec()));
        session.handle_event(LinkEvent::Notification(b",8,9\n".to_vec()));

        assert_eq!(
            *lines.lock().unwrap(),
            vec!["10,20,30", "40,50,60", "7,8,9"]
        );
    }

    #[test]
    fn test_on_line_replaces_previous_handler() {
        let mut session = ready_session();
        let first: Log = Arc::default();
        let second: Log = Arc::default();
        let a = first.clone();
        let b = second.clone();
        session.on_line(move |line| a.lock().unwrap().push(line));
        session.on_line(move |line| b.lock().unwrap().push(line));

        session.handle_event(LinkEvent::Notification(b"1,2,3\n".to_vec()));

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(*second.lock().unwrap(), vec!["1,2,3"]);
    }

    #[test]
    fn test_link_drop_clears_capabilities() {
        let mut session = ready_session();
        let lines: Log = Arc::default();
        let sink = lines.clone();
        session.on_line(move |line| sink.lock().unwrap().push(line));
        session.handle_event(LinkEvent::Notification(b"1,2".to_vec()));

        assert_eq!(
            session.handle_event(LinkEvent::Disconnected),
            Some(LinkState::Disconnected)
        );
        assert!(session.capabilities().is_none());

        session.send("SHOOT");
        assert!(writes(&session).is_empty());
        session.handle_event(LinkEvent::Notification(b",3\n".to_vec()));
        assert!(lines.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disconnect_mid_discovery_then_fresh_connect() {
        let mut session = session();
        session.connect(|_| {});
        session.handle_event(LinkEvent::Discovered(microbit()));
        session.handle_event(LinkEvent::Connected);
        assert_eq!(session.state(), &LinkState::DiscoveringCapabilities);

        session.disconnect();
        assert_eq!(session.state(), &LinkState::Disconnected);
        assert_eq!(session.backend().calls().last(), Some(&BackendCall::Close));

        session.connect(|_| {});
        assert_eq!(session.state(), &LinkState::Scanning);
        assert!(session.capabilities().is_none());

        // Result of the abandoned discovery arrives late.
        assert_eq!(
            session.handle_event(LinkEvent::CapabilitiesDiscovered(vec![uart_service()])),
            None
        );
        assert!(session.capabilities().is_none());
        assert_eq!(session.backend().calls().last(), Some(&BackendCall::StartScan));
    }

    #[test]
    fn test_connect_while_scanning_cancels_scan() {
        let mut session = session();
        session.connect(|_| {});
        session.connect(|_| {});

        assert_eq!(
            session.backend().calls(),
            vec![
                BackendCall::StartScan,
                BackendCall::StopScan,
                BackendCall::StartScan,
            ]
        );
        assert_eq!(session.state(), &LinkState::Scanning);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut session = ready_session();
        session.disconnect();
        session.disconnect();

        let closes = session
            .backend()
            .calls()
            .into_iter()
            .filter(|c| c == &BackendCall::Close)
            .count();
        assert_eq!(closes, 1);
        assert_eq!(session.state(), &LinkState::Disconnected);

        let mut idle = self::session();
        idle.disconnect();
        assert_eq!(idle.state(), &LinkState::Idle);
    }

    #[test]
    fn test_scan_timeout_fails_scan() {
        let mut session = session();
        session.connect(|_| {});
        session.scan_timed_out();

        assert_eq!(
            session.state(),
            &LinkState::Failed("No device named \"BBC micro:bit...\" found".into())
        );
        assert_eq!(session.backend().calls().last(), Some(&BackendCall::StopScan));

        // Timer firing after the scan matched is harmless.
        let mut connected = ready_session();
        connected.scan_timed_out();
        assert!(connected.is_ready());
    }
}
