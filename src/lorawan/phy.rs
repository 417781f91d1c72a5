//! PHY payload framing: MHDR, join-request and join-accept.
//!
//! Byte layouts follow LoRaWAN 1.0.x: all multi-byte fields little-endian,
//! MIC appended as the final four bytes of every PHY payload.

use crate::constants::MIC_SIZE;
use crate::error::SimulatorError;
use crate::lorawan::crypto::{self, AesKey};

/// LoRaWAN message types (MHDR bits 7:5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest = 0,
    JoinAccept = 1,
    UnconfirmedDataUp = 2,
    UnconfirmedDataDown = 3,
    ConfirmedDataUp = 4,
    ConfirmedDataDown = 5,
    RejoinRequest = 6,
    Proprietary = 7,
}

impl MType {
    pub fn from_mhdr(mhdr: u8) -> Self {
        match mhdr >> 5 {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedDataUp,
            3 => MType::UnconfirmedDataDown,
            4 => MType::ConfirmedDataUp,
            5 => MType::ConfirmedDataDown,
            6 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    /// MHDR byte for this type, major version LoRaWAN R1.
    pub fn mhdr(self) -> u8 {
        (self as u8) << 5
    }

    pub fn is_downlink(self) -> bool {
        matches!(
            self,
            MType::JoinAccept | MType::UnconfirmedDataDown | MType::ConfirmedDataDown
        )
    }
}

/// A raw LoRaWAN PHY payload as carried over the radio fabric.
#[derive(Debug, Clone, PartialEq)]
pub struct PhyPayload {
    pub bytes: Vec<u8>,
}

impl PhyPayload {
    pub fn new(bytes: Vec<u8>) -> Self {
        PhyPayload { bytes }
    }

    /// Message type from the MHDR byte.
    pub fn mtype(&self) -> Result<MType, SimulatorError> {
        let mhdr = self
            .bytes
            .first()
            .ok_or_else(|| SimulatorError::FrameParse("empty PHY payload".into()))?;
        Ok(MType::from_mhdr(*mhdr))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Join-request content (OTA activation, device side).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinRequest {
    pub join_eui: u64,
    pub dev_eui: u64,
    pub dev_nonce: u16,
}

impl JoinRequest {
    /// Serializes MHDR | JoinEUI | DevEUI | DevNonce | MIC(AppKey).
    pub fn to_phy(&self, app_key: &AesKey) -> PhyPayload {
        let mut bytes = Vec::with_capacity(1 + 8 + 8 + 2 + MIC_SIZE);
        bytes.push(MType::JoinRequest.mhdr());
        bytes.extend_from_slice(&self.join_eui.to_le_bytes());
        bytes.extend_from_slice(&self.dev_eui.to_le_bytes());
        bytes.extend_from_slice(&self.dev_nonce.to_le_bytes());
        let mic = crypto::compute_join_mic(app_key, &bytes);
        bytes.extend_from_slice(&mic);
        PhyPayload::new(bytes)
    }

    /// Parses and MIC-checks a join-request (used by canned bridges).
    pub fn from_phy(phy: &PhyPayload, app_key: &AesKey) -> Result<Self, SimulatorError> {
        let bytes = &phy.bytes;
        if bytes.len() != 1 + 8 + 8 + 2 + MIC_SIZE {
            return Err(SimulatorError::FrameParse(format!(
                "join-request length {}",
                bytes.len()
            )));
        }
        let body = &bytes[..bytes.len() - MIC_SIZE];
        let mic = crypto::compute_join_mic(app_key, body);
        if mic != bytes[bytes.len() - MIC_SIZE..] {
            return Err(SimulatorError::InvalidMic("join-request".into()));
        }
        Ok(JoinRequest {
            join_eui: u64::from_le_bytes(bytes[1..9].try_into().unwrap()),
            dev_eui: u64::from_le_bytes(bytes[9..17].try_into().unwrap()),
            dev_nonce: u16::from_le_bytes(bytes[17..19].try_into().unwrap()),
        })
    }
}

/// Join-accept content after decryption.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinAccept {
    pub join_nonce: [u8; 3],
    pub net_id: [u8; 3],
    pub dev_addr: u32,
    /// RX1DROffset (bits 6:4) and RX2DataRate (bits 3:0)
    pub dl_settings: u8,
    /// RX1 delay in seconds; 0 means 1 s
    pub rx_delay: u8,
    /// Optional EU868-style CFList: five 3-byte frequencies in 100 Hz + type byte
    pub cf_list: Option<[u8; 16]>,
}

impl JoinAccept {
    pub fn rx1_dr_offset(&self) -> u8 {
        (self.dl_settings >> 4) & 0x07
    }

    pub fn rx2_data_rate(&self) -> u8 {
        self.dl_settings & 0x0F
    }

    pub fn rx1_delay_secs(&self) -> u8 {
        if self.rx_delay & 0x0F == 0 {
            1
        } else {
            self.rx_delay & 0x0F
        }
    }

    /// New-channel frequencies from the CFList, in Hz.
    pub fn cf_list_frequencies(&self) -> Vec<u32> {
        let Some(list) = &self.cf_list else {
            return Vec::new();
        };
        // CFListType 0 carries frequencies; anything else is a channel mask
        if list[15] != 0 {
            return Vec::new();
        }
        list[..15]
            .chunks(3)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], 0]) * 100)
            .filter(|f| *f > 0)
            .collect()
    }

    /// Decrypts and MIC-checks a join-accept PHY payload.
    pub fn from_phy(phy: &PhyPayload, app_key: &AesKey) -> Result<Self, SimulatorError> {
        let bytes = &phy.bytes;
        if bytes.is_empty() || MType::from_mhdr(bytes[0]) != MType::JoinAccept {
            return Err(SimulatorError::FrameParse("not a join-accept".into()));
        }
        let clear = crypto::decrypt_join_accept(app_key, &bytes[1..]);
        // 12 fixed bytes + MIC, optionally a 16-byte CFList before the MIC
        if clear.len() != 12 + MIC_SIZE && clear.len() != 12 + 16 + MIC_SIZE {
            return Err(SimulatorError::FrameParse(format!(
                "join-accept length {}",
                clear.len()
            )));
        }
        let body_len = clear.len() - MIC_SIZE;
        let mut mic_input = Vec::with_capacity(1 + body_len);
        mic_input.push(bytes[0]);
        mic_input.extend_from_slice(&clear[..body_len]);
        let mic = crypto::compute_join_mic(app_key, &mic_input);
        if mic != clear[body_len..] {
            return Err(SimulatorError::InvalidMic("join-accept".into()));
        }

        let cf_list = if body_len == 12 + 16 {
            let mut list = [0u8; 16];
            list.copy_from_slice(&clear[12..28]);
            Some(list)
        } else {
            None
        };

        Ok(JoinAccept {
            join_nonce: clear[0..3].try_into().unwrap(),
            net_id: clear[3..6].try_into().unwrap(),
            dev_addr: u32::from_le_bytes(clear[6..10].try_into().unwrap()),
            dl_settings: clear[10],
            rx_delay: clear[11],
            cf_list,
        })
    }

    /// Builds the encrypted wire form (server side; used by canned bridges).
    pub fn to_phy(&self, app_key: &AesKey) -> PhyPayload {
        let mhdr = MType::JoinAccept.mhdr();
        let mut clear = Vec::with_capacity(12 + 16 + MIC_SIZE);
        clear.extend_from_slice(&self.join_nonce);
        clear.extend_from_slice(&self.net_id);
        clear.extend_from_slice(&self.dev_addr.to_le_bytes());
        clear.push(self.dl_settings);
        clear.push(self.rx_delay);
        if let Some(list) = &self.cf_list {
            clear.extend_from_slice(list);
        }

        let mut mic_input = Vec::with_capacity(1 + clear.len());
        mic_input.push(mhdr);
        mic_input.extend_from_slice(&clear);
        let mic = crypto::compute_join_mic(app_key, &mic_input);
        clear.extend_from_slice(&mic);

        let mut bytes = vec![mhdr];
        bytes.extend_from_slice(&crypto::encrypt_join_accept(app_key, &clear));
        PhyPayload::new(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_key() -> AesKey {
        AesKey::new([0x11; 16])
    }

    #[test]
    fn join_request_round_trips() {
        let req = JoinRequest {
            join_eui: 0x0102_0304_0506_0708,
            dev_eui: 0x1112_1314_1516_1718,
            dev_nonce: 0xBEEF,
        };
        let phy = req.to_phy(&app_key());
        assert_eq!(phy.mtype().unwrap(), MType::JoinRequest);
        assert_eq!(JoinRequest::from_phy(&phy, &app_key()).unwrap(), req);
    }

    #[test]
    fn join_accept_round_trips_with_cf_list() {
        let mut cf = [0u8; 16];
        let freq = 867_100_000u32 / 100;
        cf[0..3].copy_from_slice(&freq.to_le_bytes()[..3]);
        let acc = JoinAccept {
            join_nonce: [1, 2, 3],
            net_id: [0x13, 0x00, 0x00],
            dev_addr: 0x2601_4B22,
            dl_settings: 0x23, // RX1DROffset=2, RX2DataRate=3
            rx_delay: 1,
            cf_list: Some(cf),
        };
        let phy = acc.to_phy(&app_key());
        let parsed = JoinAccept::from_phy(&phy, &app_key()).unwrap();
        assert_eq!(parsed, acc);
        assert_eq!(parsed.rx1_dr_offset(), 2);
        assert_eq!(parsed.rx2_data_rate(), 3);
        assert_eq!(parsed.cf_list_frequencies(), vec![867_100_000]);
    }

    #[test]
    fn tampered_join_accept_fails_mic() {
        let acc = JoinAccept {
            join_nonce: [1, 2, 3],
            net_id: [0, 0, 0],
            dev_addr: 1,
            dl_settings: 0,
            rx_delay: 1,
            cf_list: None,
        };
        let mut phy = acc.to_phy(&app_key());
        let last = phy.bytes.len() - 1;
        phy.bytes[last] ^= 0xFF;
        assert!(JoinAccept::from_phy(&phy, &app_key()).is_err());
    }
}
