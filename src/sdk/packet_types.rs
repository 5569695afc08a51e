use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

use crate::config::{BIG_OFFSET_UNIT_COARSE_USEC, BIG_OFFSET_UNIT_FINE_USEC, ISO_INTERVAL_UNIT_USEC};
use crate::sdk::common::bit::{BitReader, BitWriter};
use crate::{BIT, BIT_MASK_LEN};

pub const BIG_INFO_LEN: usize = 33;
pub const BIG_INFO_ENC_LEN: usize = 57;
pub const BIS_PDU_HDR_LEN: usize = 2;
pub const MIC_LEN: usize = 4;
pub const CHAN_MAP_LEN: usize = 5;
pub const FRAMED_SEG_HDR_LEN: usize = 2;
pub const FRAMED_TIME_OFFSET_LEN: usize = 3;

pub const BIG_CTRL_BIS_NUM: u8 = 0;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduError {
    #[error("PDU too short")]
    TooShort,
    #[error("invalid BIG Info length {0}")]
    InvalidLength(usize),
    #[error("field {0} out of range")]
    InvalidField(&'static str),
    #[error("unknown BIG control opcode {0:#04x}")]
    UnknownOpcode(u8),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Phy {
    #[default]
    Le1M = 0,
    Le2M = 1,
    LeCoded = 2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Framing {
    #[default]
    Unframed = 0,
    Framed = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BigEncInfo {
    pub giv: [u8; 8],
    pub gskd: [u8; 16],
}

/// BIG Info as carried in the ACAD of AUX_SYNC_IND.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BigInfo {
    pub big_offset: u16,
    pub big_offset_coarse: bool,
    /// 1.25 ms units.
    pub iso_interval: u16,
    pub num_bis: u8,
    pub nse: u8,
    pub bn: u8,
    pub sub_interval_usec: u32,
    pub pto: u8,
    pub bis_spacing_usec: u32,
    pub irc: u8,
    pub max_pdu: u8,
    pub seed_access_addr: u32,
    pub sdu_interval_usec: u32,
    pub max_sdu: u16,
    pub base_crc_init: u16,
    pub chan_map: u64,
    pub phy: Phy,
    pub bis_payload_count: u64,
    pub framing: Framing,
    pub enc: Option<BigEncInfo>,
}

impl BigInfo {
    pub fn parse(data: &[u8]) -> Result<BigInfo, PduError> {
        if data.len() != BIG_INFO_LEN && data.len() != BIG_INFO_ENC_LEN {
            return Err(PduError::InvalidLength(data.len()));
        }

        let mut r = BitReader::new(data);
        let mut field = |bits: usize| r.read(bits).ok_or(PduError::TooShort);

        let big_offset = field(14)? as u16;
        let big_offset_coarse = field(1)? != 0;
        let iso_interval = field(12)? as u16;
        let num_bis = field(5)? as u8;
        let nse = field(5)? as u8;
        let bn = field(3)? as u8;
        let sub_interval_usec = field(20)? as u32;
        let pto = field(4)? as u8;
        let bis_spacing_usec = field(20)? as u32;
        let irc = field(4)? as u8;
        let max_pdu = field(8)? as u8;
        let _rfu = field(8)?;
        let seed_access_addr = field(32)? as u32;
        let sdu_interval_usec = field(20)? as u32;
        let max_sdu = field(12)? as u16;
        let base_crc_init = field(16)? as u16;
        let chan_map = field(37)?;
        let phy = Phy::from_u64(field(3)?).ok_or(PduError::InvalidField("PHY"))?;
        let bis_payload_count = field(39)?;
        let framing = Framing::from_u64(field(1)?).ok_or(PduError::InvalidField("Framing"))?;

        let enc = if data.len() == BIG_INFO_ENC_LEN {
            let mut giv = [0u8; 8];
            giv.copy_from_slice(&data[BIG_INFO_LEN..BIG_INFO_LEN + 8]);
            let mut gskd = [0u8; 16];
            gskd.copy_from_slice(&data[BIG_INFO_LEN + 8..BIG_INFO_ENC_LEN]);
            Some(BigEncInfo { giv, gskd })
        } else {
            None
        };

        let info = BigInfo {
            big_offset,
            big_offset_coarse,
            iso_interval,
            num_bis,
            nse,
            bn,
            sub_interval_usec,
            pto,
            bis_spacing_usec,
            irc,
            max_pdu,
            seed_access_addr,
            sdu_interval_usec,
            max_sdu,
            base_crc_init,
            chan_map,
            phy,
            bis_payload_count,
            framing,
            enc,
        };
        info.validate()?;

        Ok(info)
    }

    /// Serializes in ACAD order; returns the number of octets written.
    pub fn write(&self, out: &mut [u8; BIG_INFO_ENC_LEN]) -> usize {
        out.fill(0);
        let mut w = BitWriter::new(out);
        let fields: [(u64, usize); 20] = [
            (self.big_offset as u64, 14),
            (self.big_offset_coarse as u64, 1),
            (self.iso_interval as u64, 12),
            (self.num_bis as u64, 5),
            (self.nse as u64, 5),
            (self.bn as u64, 3),
            (self.sub_interval_usec as u64, 20),
            (self.pto as u64, 4),
            (self.bis_spacing_usec as u64, 20),
            (self.irc as u64, 4),
            (self.max_pdu as u64, 8),
            (0, 8),
            (self.seed_access_addr as u64, 32),
            (self.sdu_interval_usec as u64, 20),
            (self.max_sdu as u64, 12),
            (self.base_crc_init as u64, 16),
            (self.chan_map, 37),
            (self.phy as u64, 3),
            (self.bis_payload_count, 39),
            (self.framing as u64, 1),
        ];
        for (value, bits) in fields {
            // Widths are fixed above and sum to the unencrypted length.
            let _ = w.write(value & BIT_MASK_LEN!(bits), bits);
        }
        if let Some(enc) = &self.enc {
            let _ = w.write_bytes(&enc.giv);
            let _ = w.write_bytes(&enc.gskd);
        }

        w.len()
    }

    fn validate(&self) -> Result<(), PduError> {
        if self.num_bis == 0 {
            return Err(PduError::InvalidField("Num_BIS"));
        }
        if self.nse == 0 || self.bn == 0 || self.irc == 0 {
            return Err(PduError::InvalidField("NSE/BN/IRC"));
        }
        if self.nse % self.bn != 0 || self.nse < self.bn * self.irc {
            return Err(PduError::InvalidField("NSE"));
        }
        if (self.pto == 0) != (self.nse == self.bn * self.irc) {
            return Err(PduError::InvalidField("PTO"));
        }
        if self.iso_interval == 0 {
            return Err(PduError::InvalidField("ISO_Interval"));
        }
        Ok(())
    }

    pub fn encrypted(&self) -> bool {
        self.enc.is_some()
    }

    pub fn iso_interval_usec(&self) -> u32 {
        self.iso_interval as u32 * ISO_INTERVAL_UNIT_USEC
    }

    pub fn offset_unit_usec(&self) -> u32 {
        if self.big_offset_coarse {
            BIG_OFFSET_UNIT_COARSE_USEC
        } else {
            BIG_OFFSET_UNIT_FINE_USEC
        }
    }

    pub fn offset_usec(&self) -> u32 {
        self.big_offset as u32 * self.offset_unit_usec()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Llid {
    /// End fragment of an SDU, or a complete SDU.
    UnframedEnd = 0,
    /// Start or continuation fragment of an SDU.
    UnframedCont = 1,
    Framed = 2,
    BigCtrl = 3,
}

/// BIS Data / BIG Control PDU header: LLID(2) CSSN(3) CSTF(1) RFU(2) | Length(8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BisPduHeader {
    pub llid: Llid,
    pub cssn: u8,
    pub cstf: bool,
    pub len: u8,
}

impl BisPduHeader {
    // CSSN and CSTF are excluded from the CCM additional data.
    pub const AAD_MASK: u8 = !0x3C;

    pub fn parse(data: &[u8]) -> Result<BisPduHeader, PduError> {
        if data.len() < BIS_PDU_HDR_LEN {
            return Err(PduError::TooShort);
        }

        let b0 = data[0];
        Ok(BisPduHeader {
            llid: Llid::from_u8(b0 & 0x03).ok_or(PduError::InvalidField("LLID"))?,
            cssn: (b0 >> 2) & 0x07,
            cstf: b0 & BIT!(5) != 0,
            len: data[1],
        })
    }

    pub fn to_bytes(&self) -> [u8; BIS_PDU_HDR_LEN] {
        let b0 = (self.llid as u8) | ((self.cssn & 0x07) << 2) | ((self.cstf as u8) << 5);
        [b0, self.len]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum BigCtrlOpcode {
    ChannelMapInd = 0x00,
    TerminateInd = 0x01,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BigCtrlPdu {
    ChannelMapInd { chan_map: u64, instant: u16 },
    TerminateInd { reason: u8, instant: u16 },
}

impl BigCtrlPdu {
    /// Parses a decrypted control payload (header stripped).
    pub fn parse(payload: &[u8]) -> Result<BigCtrlPdu, PduError> {
        let (&opcode, body) = payload.split_first().ok_or(PduError::TooShort)?;

        match BigCtrlOpcode::from_u8(opcode) {
            Some(BigCtrlOpcode::ChannelMapInd) => {
                if body.len() < CHAN_MAP_LEN + 2 {
                    return Err(PduError::TooShort);
                }
                let mut map = [0u8; 8];
                map[..CHAN_MAP_LEN].copy_from_slice(&body[..CHAN_MAP_LEN]);
                Ok(BigCtrlPdu::ChannelMapInd {
                    chan_map: u64::from_le_bytes(map) & BIT_MASK_LEN!(37),
                    instant: u16::from_le_bytes([body[CHAN_MAP_LEN], body[CHAN_MAP_LEN + 1]]),
                })
            }
            Some(BigCtrlOpcode::TerminateInd) => {
                if body.len() < 3 {
                    return Err(PduError::TooShort);
                }
                Ok(BigCtrlPdu::TerminateInd {
                    reason: body[0],
                    instant: u16::from_le_bytes([body[1], body[2]]),
                })
            }
            None => Err(PduError::UnknownOpcode(opcode)),
        }
    }

    pub fn write(&self, out: &mut heapless::Vec<u8, 8>) {
        out.clear();
        match *self {
            BigCtrlPdu::ChannelMapInd { chan_map, instant } => {
                let _ = out.push(BigCtrlOpcode::ChannelMapInd as u8);
                let _ = out.extend_from_slice(&chan_map.to_le_bytes()[..CHAN_MAP_LEN]);
                let _ = out.extend_from_slice(&instant.to_le_bytes());
            }
            BigCtrlPdu::TerminateInd { reason, instant } => {
                let _ = out.push(BigCtrlOpcode::TerminateInd as u8);
                let _ = out.push(reason);
                let _ = out.extend_from_slice(&instant.to_le_bytes());
            }
        }
    }
}

/// Framed PDU segment header: SC(1) CMPLT(1) RFU(6) | Length(8) [Time_Offset(24) when SC = 0].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramedSegHeader {
    pub sc: bool,
    pub cmplt: bool,
    /// Segment length, time offset included.
    pub len: u8,
    pub time_offset: Option<u32>,
}

impl FramedSegHeader {
    /// Returns the header and the number of octets it occupies.
    pub fn parse(data: &[u8]) -> Result<(FramedSegHeader, usize), PduError> {
        if data.len() < FRAMED_SEG_HDR_LEN {
            return Err(PduError::TooShort);
        }

        let sc = data[0] & BIT!(0) != 0;
        let cmplt = data[0] & BIT!(1) != 0;
        let len = data[1];

        if sc {
            return Ok((FramedSegHeader { sc, cmplt, len, time_offset: None }, FRAMED_SEG_HDR_LEN));
        }

        if (len as usize) < FRAMED_TIME_OFFSET_LEN || data.len() < FRAMED_SEG_HDR_LEN + FRAMED_TIME_OFFSET_LEN {
            return Err(PduError::TooShort);
        }
        let time_offset = u32::from_le_bytes([data[2], data[3], data[4], 0]);

        Ok((
            FramedSegHeader { sc, cmplt, len, time_offset: Some(time_offset) },
            FRAMED_SEG_HDR_LEN + FRAMED_TIME_OFFSET_LEN,
        ))
    }

    /// Payload octets following the header.
    pub fn data_len(&self) -> usize {
        match self.time_offset {
            Some(_) => (self.len as usize).saturating_sub(FRAMED_TIME_OFFSET_LEN),
            None => self.len as usize,
        }
    }
}

/// Access address of BIS `n` (1..=31); `n` = 0 yields the BIG control subevent address.
pub fn bis_access_addr(seed_access_addr: u32, n: u8) -> u32 {
    let d = (35 * n as u32) % 42;

    let mut dw = 0u32;
    if d & 1 != 0 {
        dw |= 0x3F << 26;
    }
    dw |= ((d >> 1) & 1) << 24;
    for k in 2..6 {
        dw |= ((d >> k) & 1) << (24 - k);
    }

    seed_access_addr ^ dw
}

pub fn big_ctrl_access_addr(seed_access_addr: u32) -> u32 {
    bis_access_addr(seed_access_addr, BIG_CTRL_BIS_NUM)
}

/// 24 bit CRC init: BaseCRCInit in the upper 16 bits, BIS number in the lower 8.
pub fn bis_crc_init(base_crc_init: u16, n: u8) -> u32 {
    ((base_crc_init as u32) << 8) | n as u32
}
