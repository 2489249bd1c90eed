use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::LinkError;

pub const HELLO_LEN: usize = 17;

/// Identity a station sends before anything else: its serial number and
/// firmware version, unframed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub serial: [u8; 16],
    pub firmware_version: u8,
}

impl Hello {
    /// Serial number as configured in the charger settings.
    pub fn serial_number(&self) -> String {
        hex::encode(self.serial)
    }

    pub fn to_bytes(&self) -> [u8; HELLO_LEN] {
        let mut bytes = [0u8; HELLO_LEN];
        bytes[..16].copy_from_slice(&self.serial);
        bytes[16] = self.firmware_version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HELLO_LEN]) -> Self {
        let mut serial = [0u8; 16];
        serial.copy_from_slice(&bytes[..16]);
        Hello {
            serial,
            firmware_version: bytes[16],
        }
    }
}

pub async fn read_hello<R>(reader: &mut R, timeout: Duration) -> Result<Hello, LinkError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; HELLO_LEN];
    tokio::time::timeout(timeout, reader.read_exact(&mut bytes))
        .await
        .map_err(|_| LinkError::Timeout("handshake"))??;
    Ok(Hello::from_bytes(&bytes))
}
