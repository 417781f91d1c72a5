//! MAC-layer framing: FHDR, FCtrl and data frames.
//!
//! `DataFrame` is the clear-text view of a data message. Encoding
//! encrypts the FRMPayload with the appropriate session key and appends
//! the MIC; decoding resolves the 16-bit on-air counter against the last
//! known 32-bit value, checks the MIC, then decrypts.

use bitflags::bitflags;

use crate::constants::{MAX_FOPTS_LEN, MIC_SIZE};
use crate::error::SimulatorError;
use crate::lorawan::crypto::{self, AesKey, Direction};
use crate::lorawan::phy::{MType, PhyPayload};

bitflags! {
    /// FCtrl flag bits (the low nibble is the FOpts length).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FCtrl: u8 {
        const ADR         = 0x80;
        const ADR_ACK_REQ = 0x40;
        const ACK         = 0x20;
        /// FPending on downlinks, Class B on uplinks
        const F_PENDING   = 0x10;
    }
}

/// Frame header: device address, control bits, counter, piggybacked FOpts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fhdr {
    pub dev_addr: u32,
    pub fctrl: FCtrl,
    /// Low 16 bits of the frame counter as carried on air
    pub fcnt: u16,
    pub fopts: Vec<u8>,
}

/// A clear-text LoRaWAN data message.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub mtype: MType,
    pub fhdr: Fhdr,
    pub fport: Option<u8>,
    /// Clear FRMPayload; empty when fport is None
    pub frm_payload: Vec<u8>,
}

impl DataFrame {
    /// Selects the session key encrypting the FRMPayload: NwkSKey for
    /// FPort 0 (MAC-only), AppSKey otherwise.
    fn payload_key<'k>(fport: u8, nwk_skey: &'k AesKey, app_skey: &'k AesKey) -> &'k AesKey {
        if fport == 0 {
            nwk_skey
        } else {
            app_skey
        }
    }

    /// Serializes, encrypts and signs the frame with the full 32-bit
    /// frame counter `fcnt32` (its low 16 bits go on air).
    pub fn encode(
        &self,
        nwk_skey: &AesKey,
        app_skey: &AesKey,
        fcnt32: u32,
    ) -> Result<PhyPayload, SimulatorError> {
        if self.fhdr.fopts.len() > MAX_FOPTS_LEN {
            return Err(SimulatorError::FrameParse(format!(
                "FOpts too long: {}",
                self.fhdr.fopts.len()
            )));
        }
        let dir = if self.mtype.is_downlink() {
            Direction::Down
        } else {
            Direction::Up
        };

        let mut bytes = Vec::with_capacity(13 + self.fhdr.fopts.len() + self.frm_payload.len());
        bytes.push(self.mtype.mhdr());
        bytes.extend_from_slice(&self.fhdr.dev_addr.to_le_bytes());
        bytes.push(self.fhdr.fctrl.bits() | self.fhdr.fopts.len() as u8);
        bytes.extend_from_slice(&(fcnt32 as u16).to_le_bytes());
        bytes.extend_from_slice(&self.fhdr.fopts);

        if let Some(fport) = self.fport {
            bytes.push(fport);
            let key = Self::payload_key(fport, nwk_skey, app_skey);
            let encrypted = crypto::encrypt_frm_payload(
                key,
                self.fhdr.dev_addr,
                fcnt32,
                dir,
                &self.frm_payload,
            );
            bytes.extend_from_slice(&encrypted);
        }

        let mic = crypto::compute_data_mic(nwk_skey, &bytes, self.fhdr.dev_addr, fcnt32, dir);
        bytes.extend_from_slice(&mic);
        Ok(PhyPayload::new(bytes))
    }

    /// Parses, MIC-checks and decrypts a data message.
    ///
    /// `last_fcnt` is the highest frame counter accepted so far in this
    /// direction; the on-air 16-bit counter is extended against it.
    /// Returns the clear frame and the resolved 32-bit counter.
    pub fn decode(
        phy: &PhyPayload,
        nwk_skey: &AesKey,
        app_skey: &AesKey,
        last_fcnt: u32,
    ) -> Result<(DataFrame, u32), SimulatorError> {
        let bytes = &phy.bytes;
        if bytes.len() < 1 + 7 + MIC_SIZE {
            return Err(SimulatorError::FrameParse(format!(
                "data frame too short: {}",
                bytes.len()
            )));
        }
        let mtype = MType::from_mhdr(bytes[0]);
        if matches!(
            mtype,
            MType::JoinRequest | MType::JoinAccept | MType::RejoinRequest | MType::Proprietary
        ) {
            return Err(SimulatorError::FrameParse("not a data frame".into()));
        }
        let dir = if mtype.is_downlink() {
            Direction::Down
        } else {
            Direction::Up
        };

        let dev_addr = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
        let fctrl_byte = bytes[5];
        let fopts_len = (fctrl_byte & 0x0F) as usize;
        let fcnt16 = u16::from_le_bytes(bytes[6..8].try_into().unwrap());

        let header_end = 8 + fopts_len;
        if bytes.len() < header_end + MIC_SIZE {
            return Err(SimulatorError::FrameParse("FOpts length overruns frame".into()));
        }
        let fopts = bytes[8..header_end].to_vec();

        // Extend the on-air counter against the last accepted value.
        let mut fcnt32 = (last_fcnt & 0xFFFF_0000) | fcnt16 as u32;
        if fcnt32 < last_fcnt {
            fcnt32 = fcnt32.wrapping_add(0x1_0000);
        }

        let body = &bytes[..bytes.len() - MIC_SIZE];
        let mic = crypto::compute_data_mic(nwk_skey, body, dev_addr, fcnt32, dir);
        if mic != bytes[bytes.len() - MIC_SIZE..] {
            return Err(SimulatorError::InvalidMic(format!("devaddr {dev_addr:08x}")));
        }

        let rest = &bytes[header_end..bytes.len() - MIC_SIZE];
        let (fport, frm_payload) = if rest.is_empty() {
            (None, Vec::new())
        } else {
            let fport = rest[0];
            let key = Self::payload_key(fport, nwk_skey, app_skey);
            let clear = crypto::encrypt_frm_payload(key, dev_addr, fcnt32, dir, &rest[1..]);
            (Some(fport), clear)
        };

        Ok((
            DataFrame {
                mtype,
                fhdr: Fhdr {
                    dev_addr,
                    fctrl: FCtrl::from_bits_truncate(fctrl_byte),
                    fcnt: fcnt16,
                    fopts,
                },
                fport,
                frm_payload,
            },
            fcnt32,
        ))
    }
}
