//! # LoRaWAN 1.0.x Protocol Layer
//!
//! Frame structures, MAC commands, session cryptography and regional
//! parameters. The layer is deliberately device-sided: it builds the
//! frames an end-device emits and parses the frames a network server
//! sends back.

pub mod commands;
pub mod crypto;
pub mod mac;
pub mod phy;
pub mod region;

pub use commands::{DownlinkMacCommand, UplinkMacCommand};
pub use crypto::{AesKey, Direction};
pub use mac::{DataFrame, FCtrl, Fhdr};
pub use phy::{JoinAccept, JoinRequest, MType, PhyPayload};
pub use region::{Channel, Region};
