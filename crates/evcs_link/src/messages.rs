//! Typed messages carried in frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use crc_all::CrcAlgo;
use evcs_core::{PilotVoltage, ProximityPilotAmps, Sample, Telemetry};

use crate::{Frame, LinkError};

// Server to station
pub const PING: u8 = 1;
pub const FIRMWARE_CHUNK: u8 = 2;
pub const COLLECT_DATA: u8 = 3;
pub const SET_PWM: u8 = 4;
pub const SET_CONTACTOR: u8 = 5;

// Station to server
pub const PONG: u8 = 1;
pub const TELEMETRY: u8 = 2;
pub const ACK: u8 = 3;

pub const ACK_OK: u8 = 0;

/// Fixed part of a telemetry payload; device log lines follow it.
pub const TELEMETRY_MIN_LEN: usize = 64;

const CRC32_INIT: u32 = 0xFFFF_FFFF;

const CRC32: CrcAlgo<u32> = CrcAlgo::<u32>::new(
    0x04C1_1DB7, // polynomial
    32,          // width
    CRC32_INIT,  // init
    0xFFFF_FFFF, // xorout
    true,        // reflect
);

/// CRC-32 (IEEE) as checked by the station's bootloader.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = CRC32_INIT;
    CRC32.update_crc(&mut crc, data);
    CRC32.finish_crc(&crc)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    FirmwareChunk {
        offset: u32,
        total: u32,
        /// CRC-32 of the whole image, repeated in every chunk.
        crc32: u32,
        data: Bytes,
    },
    CollectData,
    SetPwm(u8),
    SetContactor(bool),
}

impl Request {
    pub fn message_type(&self) -> u8 {
        match self {
            Request::Ping => PING,
            Request::FirmwareChunk { .. } => FIRMWARE_CHUNK,
            Request::CollectData => COLLECT_DATA,
            Request::SetPwm(_) => SET_PWM,
            Request::SetContactor(_) => SET_CONTACTOR,
        }
    }

    pub fn into_frame(self) -> Frame {
        let message_type = self.message_type();
        match self {
            Request::Ping | Request::CollectData => Frame::empty(message_type),
            Request::FirmwareChunk {
                offset,
                total,
                crc32,
                data,
            } => {
                let mut payload = BytesMut::with_capacity(12 + data.len());
                payload.put_u32(offset);
                payload.put_u32(total);
                payload.put_u32(crc32);
                payload.extend_from_slice(&data);
                Frame::new(message_type, payload.freeze())
            }
            Request::SetPwm(duty) => Frame::new(message_type, vec![duty]),
            Request::SetContactor(on) => Frame::new(message_type, vec![u8::from(on)]),
        }
    }

    /// Decode a request as the station sees it.
    pub fn from_frame(frame: &Frame) -> Result<Request, LinkError> {
        let mut payload = frame.payload.clone();
        match frame.message_type {
            PING => Ok(Request::Ping),
            COLLECT_DATA => Ok(Request::CollectData),
            FIRMWARE_CHUNK if payload.len() >= 12 => {
                let offset = payload.get_u32();
                let total = payload.get_u32();
                let crc32 = payload.get_u32();
                Ok(Request::FirmwareChunk {
                    offset,
                    total,
                    crc32,
                    data: payload,
                })
            }
            SET_PWM if payload.len() == 1 => Ok(Request::SetPwm(payload[0])),
            SET_CONTACTOR if payload.len() == 1 => Ok(Request::SetContactor(payload[0] != 0)),
            FIRMWARE_CHUNK | SET_PWM | SET_CONTACTOR => Err(LinkError::Malformed {
                what: "request",
                len: payload.len(),
            }),
            other => Err(LinkError::UnknownMessageType(other)),
        }
    }
}

/// Split a firmware image into upload requests.
pub fn firmware_chunks(image: &Bytes, chunk_size: usize) -> Vec<Request> {
    let chunk_size = chunk_size.max(1);
    let total = image.len() as u32;
    let crc32 = crc32(image);
    (0..image.len())
        .step_by(chunk_size)
        .map(|offset| Request::FirmwareChunk {
            offset: offset as u32,
            total,
            crc32,
            data: image.slice(offset..(offset + chunk_size).min(image.len())),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Pong { firmware_version: u8 },
    Telemetry(Telemetry),
    Ack { request_type: u8, status: u8 },
}

impl Inbound {
    pub fn from_frame(frame: &Frame, received_at: DateTime<Utc>) -> Result<Inbound, LinkError> {
        let payload = &frame.payload;
        match frame.message_type {
            PONG if payload.len() == 1 => Ok(Inbound::Pong {
                firmware_version: payload[0],
            }),
            PONG => Err(LinkError::Malformed {
                what: "pong",
                len: payload.len(),
            }),
            TELEMETRY => parse_telemetry(payload, received_at).map(Inbound::Telemetry),
            ACK if payload.len() == 2 => Ok(Inbound::Ack {
                request_type: payload[0],
                status: payload[1],
            }),
            ACK => Err(LinkError::Malformed {
                what: "ack",
                len: payload.len(),
            }),
            other => Err(LinkError::UnknownMessageType(other)),
        }
    }

    /// Encode as the station sends it.
    pub fn into_frame(self) -> Frame {
        match self {
            Inbound::Pong { firmware_version } => Frame::new(PONG, vec![firmware_version]),
            Inbound::Telemetry(telemetry) => Frame::new(TELEMETRY, encode_telemetry(&telemetry)),
            Inbound::Ack {
                request_type,
                status,
            } => Frame::new(ACK, vec![request_type, status]),
        }
    }
}

pub fn parse_telemetry(payload: &[u8], received_at: DateTime<Utc>) -> Result<Telemetry, LinkError> {
    if payload.len() < TELEMETRY_MIN_LEN {
        return Err(LinkError::Malformed {
            what: "telemetry",
            len: payload.len(),
        });
    }
    let mut buf = payload;

    let contactor_on = buf.get_u8() != 0;
    let pwm_percent = buf.get_u8();
    let pilot = buf.get_u8();
    let pilot_voltage = PilotVoltage::from_wire(pilot).ok_or(LinkError::InvalidValue {
        field: "pilot voltage",
        value: pilot,
    })?;
    let proximity = buf.get_u8();
    let proximity_pilot =
        ProximityPilotAmps::from_wire(proximity).ok_or(LinkError::InvalidValue {
            field: "proximity pilot",
            value: proximity,
        })?;

    // L1..L3 millivolts, then L1..L3 milliamps
    let mut samples = [Sample::default(); 6];
    for sample in &mut samples {
        let value = buf.get_i32();
        let tag = buf.get_i32();
        *sample = Sample::new(value, tag);
    }

    let wifi_rssi = buf.get_i32();
    let uptime_secs = buf.get_u32();
    let fault_flags = buf.get_u32();
    let log_messages = buf
        .split(|byte| *byte == 0)
        .filter(|line| !line.is_empty())
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect();

    Ok(Telemetry {
        contactor_on,
        pwm_percent,
        pilot_voltage,
        proximity_pilot,
        phase_millivolts: [samples[0], samples[1], samples[2]],
        phase_milliamps: [samples[3], samples[4], samples[5]],
        wifi_rssi,
        uptime_secs,
        fault_flags,
        log_messages,
        received_at,
    })
}

pub fn encode_telemetry(telemetry: &Telemetry) -> Bytes {
    let mut buf = BytesMut::with_capacity(TELEMETRY_MIN_LEN);
    buf.put_u8(u8::from(telemetry.contactor_on));
    buf.put_u8(telemetry.pwm_percent);
    buf.put_u8(telemetry.pilot_voltage.to_wire());
    buf.put_u8(telemetry.proximity_pilot.to_wire());
    for sample in telemetry
        .phase_millivolts
        .iter()
        .chain(&telemetry.phase_milliamps)
    {
        buf.put_i32(sample.value);
        buf.put_i32(sample.tag);
    }
    buf.put_i32(telemetry.wifi_rssi);
    buf.put_u32(telemetry.uptime_secs);
    buf.put_u32(telemetry.fault_flags);
    for line in &telemetry.log_messages {
        buf.extend_from_slice(line.as_bytes());
        buf.put_u8(0);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_telemetry() -> Telemetry {
        Telemetry {
            contactor_on: true,
            pwm_percent: 27,
            pilot_voltage: PilotVoltage::ReadyToCharge,
            proximity_pilot: ProximityPilotAmps::Amp20,
            phase_millivolts: [
                Sample::new(231_000, 1),
                Sample::new(229_500, 0),
                Sample::new(-1, -1),
            ],
            phase_milliamps: [Sample::new(15_800, 3), Sample::new(0, 0), Sample::new(0, 0)],
            wifi_rssi: -71,
            uptime_secs: 86_400,
            fault_flags: 0x0000_0100,
            log_messages: vec!["rcd self test ok".into(), "pwm 27".into()],
            received_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_telemetry_layout() {
        let mut telemetry = sample_telemetry();
        telemetry.log_messages.clear();
        let bytes = encode_telemetry(&telemetry);
        assert_eq!(bytes.len(), TELEMETRY_MIN_LEN);
        assert_eq!(&bytes[..4], &[1, 27, 2, 2]);
        // first voltage sample
        assert_eq!(&bytes[4..12], &[0x00, 0x03, 0x86, 0x58, 0, 0, 0, 1]);
        // uptime right after the rssi
        assert_eq!(&bytes[56..60], &86_400u32.to_be_bytes());
    }

    #[test]
    fn test_telemetry_decodes() {
        let telemetry = sample_telemetry();
        let bytes = encode_telemetry(&telemetry);
        let decoded = parse_telemetry(&bytes, telemetry.received_at).unwrap();
        assert_eq!(decoded, telemetry);
        assert_eq!(decoded.measured_amps(), 16);
    }

    #[test]
    fn test_telemetry_rejects_short_payload() {
        let bytes = encode_telemetry(&sample_telemetry());
        assert!(matches!(
            parse_telemetry(&bytes[..63], Utc::now()),
            Err(LinkError::Malformed { what: "telemetry", len: 63 })
        ));
    }

    #[test]
    fn test_telemetry_rejects_unknown_pilot() {
        let mut bytes = encode_telemetry(&sample_telemetry()).to_vec();
        bytes[2] = 9;
        assert!(matches!(
            parse_telemetry(&bytes, Utc::now()),
            Err(LinkError::InvalidValue { value: 9, .. })
        ));
    }

    #[test]
    fn test_request_frames() {
        assert_eq!(Request::SetPwm(54).into_frame(), Frame::new(SET_PWM, vec![54]));
        assert_eq!(
            Request::SetContactor(true).into_frame(),
            Frame::new(SET_CONTACTOR, vec![1])
        );
        assert_eq!(Request::Ping.into_frame(), Frame::empty(PING));

        let frame = Request::SetContactor(false).into_frame();
        assert_eq!(Request::from_frame(&frame).unwrap(), Request::SetContactor(false));
        assert!(matches!(
            Request::from_frame(&Frame::empty(SET_PWM)),
            Err(LinkError::Malformed { .. })
        ));
    }

    #[test]
    fn test_inbound_frames() {
        let now = Utc::now();
        assert_eq!(
            Inbound::from_frame(&Frame::new(PONG, vec![7]), now).unwrap(),
            Inbound::Pong {
                firmware_version: 7
            }
        );
        assert_eq!(
            Inbound::from_frame(&Frame::new(ACK, vec![SET_PWM, ACK_OK]), now).unwrap(),
            Inbound::Ack {
                request_type: SET_PWM,
                status: ACK_OK
            }
        );
        assert!(matches!(
            Inbound::from_frame(&Frame::empty(42), now),
            Err(LinkError::UnknownMessageType(42))
        ));
        assert!(matches!(
            Inbound::from_frame(&Frame::new(ACK, vec![1]), now),
            Err(LinkError::Malformed { what: "ack", .. })
        ));
    }

    #[test]
    fn test_crc32_check_values() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(&[0u8; 64]), 0x758D_6336);
    }

    #[test]
    fn test_firmware_chunks() {
        let image = Bytes::from((0..10_000u32).map(|i| i as u8).collect::<Vec<u8>>());
        let chunks = firmware_chunks(&image, 4096);
        assert_eq!(chunks.len(), 3);

        let mut reassembled = Vec::new();
        for chunk in &chunks {
            let Request::FirmwareChunk {
                offset,
                total,
                crc32: chunk_crc,
                data,
            } = chunk
            else {
                panic!("not a firmware chunk: {chunk:?}");
            };
            assert_eq!(*offset as usize, reassembled.len());
            assert_eq!(*total, 10_000);
            assert_eq!(*chunk_crc, crc32(&image));
            reassembled.extend_from_slice(data);
        }
        assert_eq!(reassembled, image.to_vec());

        let frame = chunks[2].clone().into_frame();
        assert_eq!(frame.payload.len(), 12 + 10_000 - 8192);
        assert_eq!(Request::from_frame(&frame).unwrap(), chunks[2]);
    }
}
