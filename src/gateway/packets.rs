//! Semtech packet-forwarder wire format (GWMP v2).
//!
//! Semi-compact binary framing: version byte, 2-byte random token, type
//! byte, 8-byte gateway MAC on gateway-originated packets, then a JSON
//! body for PUSH_DATA / PULL_RESP / TX_ACK.

use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::{
    PKT_PULL_ACK, PKT_PULL_DATA, PKT_PULL_RESP, PKT_PUSH_ACK, PKT_PUSH_DATA, PKT_TX_ACK,
    PROTOCOL_VERSION,
};
use crate::error::SimulatorError;
use crate::forwarder::RadioFrame;

/// An uplink frame as reported to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rxpk {
    /// UTC time of reception, ISO 8601
    pub time: String,
    /// Concentrator counter, microseconds
    pub tmst: u32,
    /// GPS time of reception, milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmms: Option<i64>,
    /// Concentrator channel
    pub chan: u32,
    /// RF chain
    pub rfch: u32,
    /// Frequency in MHz
    pub freq: f64,
    /// CRC status: 1 OK
    pub stat: i8,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    pub rssi: i16,
    pub lsnr: f32,
    pub size: u16,
    /// Base64 PHY payload
    pub data: String,
}

impl Rxpk {
    /// Wraps a radio frame popped from the uplink queue. The propagation
    /// model has no signal physics; RSSI/SNR are nominal constants.
    pub fn from_frame(frame: &RadioFrame) -> Self {
        Rxpk {
            time: frame.received_at.to_rfc3339(),
            tmst: frame.tmst,
            tmms: Some(frame.tmms),
            chan: frame.channel as u32,
            rfch: 0,
            freq: frame.frequency as f64 / 1_000_000.0,
            stat: 1,
            modu: frame.modulation.clone(),
            datr: frame.data_rate.clone(),
            codr: frame.code_rate.clone(),
            rssi: -60,
            lsnr: 7.0,
            size: frame.size() as u16,
            data: base64::engine::general_purpose::STANDARD.encode(&frame.payload),
        }
    }
}

/// Gateway status block inside PUSH_DATA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stat {
    pub time: String,
    pub lati: f64,
    pub long: f64,
    pub alti: i32,
    /// Radio packets received
    pub rxnb: u32,
    /// Radio packets received with a valid CRC
    pub rxok: u32,
    /// Radio packets forwarded
    pub rxfw: u32,
    /// Upstream datagrams acknowledged, percent
    pub ackr: f64,
    /// Downlink datagrams received
    pub dwnb: u32,
    /// Packets emitted
    pub txnb: u32,
}

/// A downlink transmission order inside PULL_RESP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Txpk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imme: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    /// Frequency in MHz
    pub freq: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfch: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub powe: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modu: Option<String>,
    pub datr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipol: Option<bool>,
    pub size: u16,
    /// Base64 PHY payload
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ncrc: Option<bool>,
}

impl Txpk {
    pub fn frequency_hz(&self) -> u32 {
        (self.freq * 1_000_000.0).round() as u32
    }

    pub fn phy_payload(&self) -> Result<Vec<u8>, SimulatorError> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| SimulatorError::FrameParse(format!("txpk data: {e}")))
    }
}

/// PUSH_DATA JSON body.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PushDataPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rxpk: Option<Vec<Rxpk>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat: Option<Stat>,
}

/// PULL_RESP JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRespPayload {
    pub txpk: Txpk,
}

/// TX_ACK JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxAckPayload {
    pub txpk_ack: TxpkAck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxpkAck {
    pub error: String,
}

/// A parsed or to-be-sent forwarder datagram.
#[derive(Debug, Clone)]
pub enum GwmpPacket {
    PushData {
        token: u16,
        mac: u64,
        payload: PushDataPayload,
    },
    PushAck {
        token: u16,
    },
    PullData {
        token: u16,
        mac: u64,
    },
    PullAck {
        token: u16,
    },
    PullResp {
        token: u16,
        payload: PullRespPayload,
    },
    TxAck {
        token: u16,
        mac: u64,
        payload: Option<TxAckPayload>,
    },
}

impl GwmpPacket {
    pub fn random_token() -> u16 {
        rand::thread_rng().gen()
    }

    pub fn token(&self) -> u16 {
        match self {
            GwmpPacket::PushData { token, .. }
            | GwmpPacket::PushAck { token }
            | GwmpPacket::PullData { token, .. }
            | GwmpPacket::PullAck { token }
            | GwmpPacket::PullResp { token, .. }
            | GwmpPacket::TxAck { token, .. } => *token,
        }
    }

    /// Serializes the datagram.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SimulatorError> {
        let mut out = vec![PROTOCOL_VERSION];
        out.extend_from_slice(&self.token().to_be_bytes());
        match self {
            GwmpPacket::PushData { mac, payload, .. } => {
                out.push(PKT_PUSH_DATA);
                out.extend_from_slice(&mac.to_be_bytes());
                out.extend_from_slice(serde_json::to_string(payload)?.as_bytes());
            }
            GwmpPacket::PushAck { .. } => out.push(PKT_PUSH_ACK),
            GwmpPacket::PullData { mac, .. } => {
                out.push(PKT_PULL_DATA);
                out.extend_from_slice(&mac.to_be_bytes());
            }
            GwmpPacket::PullAck { .. } => out.push(PKT_PULL_ACK),
            GwmpPacket::PullResp { payload, .. } => {
                out.push(PKT_PULL_RESP);
                out.extend_from_slice(serde_json::to_string(payload)?.as_bytes());
            }
            GwmpPacket::TxAck { mac, payload, .. } => {
                out.push(PKT_TX_ACK);
                out.extend_from_slice(&mac.to_be_bytes());
                if let Some(payload) = payload {
                    out.extend_from_slice(serde_json::to_string(payload)?.as_bytes());
                }
            }
        }
        Ok(out)
    }

    /// Parses a received datagram.
    pub fn parse(bytes: &[u8]) -> Result<Self, SimulatorError> {
        if bytes.len() < 4 {
            return Err(SimulatorError::FrameParse("datagram too short".into()));
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(SimulatorError::FrameParse(format!(
                "unsupported protocol version {}",
                bytes[0]
            )));
        }
        let token = u16::from_be_bytes([bytes[1], bytes[2]]);
        let kind = bytes[3];
        let rest = &bytes[4..];

        let mac_of = |rest: &[u8]| -> Result<u64, SimulatorError> {
            if rest.len() < 8 {
                return Err(SimulatorError::FrameParse("missing gateway MAC".into()));
            }
            Ok(u64::from_be_bytes(rest[..8].try_into().unwrap()))
        };

        match kind {
            PKT_PUSH_DATA => {
                let mac = mac_of(rest)?;
                let payload = serde_json::from_slice(&rest[8..])
                    .map_err(|e| SimulatorError::FrameParse(format!("PUSH_DATA body: {e}")))?;
                Ok(GwmpPacket::PushData { token, mac, payload })
            }
            PKT_PUSH_ACK => Ok(GwmpPacket::PushAck { token }),
            PKT_PULL_DATA => Ok(GwmpPacket::PullData {
                token,
                mac: mac_of(rest)?,
            }),
            PKT_PULL_ACK => Ok(GwmpPacket::PullAck { token }),
            PKT_PULL_RESP => {
                let payload = serde_json::from_slice(rest)
                    .map_err(|e| SimulatorError::FrameParse(format!("PULL_RESP body: {e}")))?;
                Ok(GwmpPacket::PullResp { token, payload })
            }
            PKT_TX_ACK => {
                let mac = mac_of(rest)?;
                let payload = if rest.len() > 8 {
                    Some(
                        serde_json::from_slice(&rest[8..])
                            .map_err(|e| SimulatorError::FrameParse(format!("TX_ACK body: {e}")))?,
                    )
                } else {
                    None
                };
                Ok(GwmpPacket::TxAck { token, mac, payload })
            }
            other => Err(SimulatorError::FrameParse(format!(
                "unknown packet type 0x{other:02X}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn frame() -> RadioFrame {
        RadioFrame {
            channel: 2,
            frequency: 868_500_000,
            modulation: "LORA".into(),
            data_rate: "SF9BW125".into(),
            code_rate: "4/5".into(),
            payload: vec![0x40, 0x01, 0x02, 0x03].into(),
            received_at: Utc::now(),
            tmst: 123,
            tmms: 456,
        }
    }

    #[test]
    fn push_data_round_trips() {
        let packet = GwmpPacket::PushData {
            token: 0xBEEF,
            mac: 0x0102_0304_0506_0708,
            payload: PushDataPayload {
                rxpk: Some(vec![Rxpk::from_frame(&frame())]),
                stat: None,
            },
        };
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[3], PKT_PUSH_DATA);
        match GwmpPacket::parse(&bytes).unwrap() {
            GwmpPacket::PushData { token, mac, payload } => {
                assert_eq!(token, 0xBEEF);
                assert_eq!(mac, 0x0102_0304_0506_0708);
                let rxpk = &payload.rxpk.unwrap()[0];
                assert_eq!(rxpk.freq, 868.5);
                assert_eq!(rxpk.size, 4);
                assert_eq!(rxpk.datr, "SF9BW125");
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn pull_resp_decodes_txpk() {
        let txpk = Txpk {
            imme: Some(true),
            tmst: None,
            freq: 869.525,
            rfch: Some(0),
            powe: Some(14),
            modu: Some("LORA".into()),
            datr: "SF12BW125".into(),
            codr: Some("4/5".into()),
            ipol: Some(true),
            size: 3,
            data: base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]),
            ncrc: None,
        };
        let packet = GwmpPacket::PullResp {
            token: 7,
            payload: PullRespPayload { txpk },
        };
        let bytes = packet.to_bytes().unwrap();
        match GwmpPacket::parse(&bytes).unwrap() {
            GwmpPacket::PullResp { payload, .. } => {
                assert_eq!(payload.txpk.frequency_hz(), 869_525_000);
                assert_eq!(payload.txpk.phy_payload().unwrap(), vec![1, 2, 3]);
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn short_datagrams_are_rejected() {
        assert!(GwmpPacket::parse(&[0x02, 0x00]).is_err());
        assert!(GwmpPacket::parse(&[0x01, 0, 0, 0]).is_err());
        assert!(GwmpPacket::parse(&[0x02, 0, 0, 0x7F]).is_err());
    }
}
