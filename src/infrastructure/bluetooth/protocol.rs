//! Sensor Peripheral Protocol
//!
//! Identifiers and wire format for talking to the sensor peripheral over its
//! UART-style GATT service: newline-terminated UTF-8 text in both directions.

use anyhow::{Context, Result};
use uuid::Uuid;

/// UART service exposed by the peripheral (Nordic UART layout)
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Channel the central writes to
pub const UART_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Channel the peripheral notifies or indicates on
pub const UART_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD values
pub const CCCD_ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];
pub const CCCD_ENABLE_INDICATION: [u8; 2] = [0x02, 0x00];

/// Advertised name prefix of the expected peripheral
pub const DEFAULT_NAME_PREFIX: &str = "BBC micro:bit";

/// Line sent when the duel goes live
pub const START_SIGNAL: &str = "SHOOT";

pub const LINE_TERMINATOR: u8 = b'\n';

/// Capabilities a GATT characteristic advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelProperties {
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl ChannelProperties {
    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A characteristic of the peripheral's service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub uuid: Uuid,
    pub properties: ChannelProperties,
}

/// A service and its characteristics, as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub channels: Vec<ChannelInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

impl WriteMode {
    /// Prefer write-without-response when the channel offers it.
    pub fn preferred(properties: ChannelProperties) -> Self {
        if properties.write_without_response {
            Self::WithoutResponse
        } else {
            Self::WithResponse
        }
    }
}

/// Service layout of a stock peripheral: one writable channel, one
/// indicating channel.
pub fn uart_service() -> ServiceInfo {
    ServiceInfo {
        uuid: UART_SERVICE_UUID,
        channels: vec![
            ChannelInfo {
                uuid: UART_TX_CHAR_UUID,
                properties: ChannelProperties {
                    indicate: true,
                    ..Default::default()
                },
            },
            ChannelInfo {
                uuid: UART_RX_CHAR_UUID,
                properties: ChannelProperties {
                    write: true,
                    write_without_response: true,
                    ..Default::default()
                },
            },
        ],
    }
}

/// Encode an outbound line: UTF-8 bytes plus the terminator.
pub fn encode_line(line: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(LINE_TERMINATOR);
    bytes
}

/// Parse a UUID string from settings
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim()).with_context(|| format!("Invalid UUID format: {}", uuid_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        assert_eq!(uuid, UART_SERVICE_UUID);
        assert!(parse_uuid("6e400001").is_err());
    }

    #[test]
    fn test_encode_line() {
        assert_eq!(encode_line(START_SIGNAL), b"SHOOT\n".to_vec());
    }

    #[test]
    fn test_write_mode_preference() {
        let both = ChannelProperties {
            write: true,
            write_without_response: true,
            ..Default::default()
        };
        let acked = ChannelProperties {
            write: true,
            ..Default::default()
        };
        assert_eq!(WriteMode::preferred(both), WriteMode::WithoutResponse);
        assert_eq!(WriteMode::preferred(acked), WriteMode::WithResponse);
    }

    #[test]
    fn test_uart_layout() {
        let service = uart_service();
        assert_eq!(service.channels.iter().filter(|c| c.properties.can_write()).count(), 1);
        assert!(service.channels[0].properties.can_subscribe());
    }
}
