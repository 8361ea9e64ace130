//! H.264 NAL unit classification and Annex B helpers.
//!
//! Annex B byte streams separate NAL units with start codes (`00 00 01` or
//! `00 00 00 01`). This module classifies units and splits complete buffers;
//! the streaming reader lives in [`crate::annexb`].

use bytes::Bytes;

/// Four-byte Annex B start code written in front of every emitted unit.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit types relevant for H.264.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NalUnitType {
    /// Non-IDR slice (P/B frame).
    NonIdrSlice = 1,
    /// IDR slice (keyframe).
    IdrSlice = 5,
    /// Supplemental Enhancement Information.
    Sei = 6,
    /// Sequence Parameter Set.
    Sps = 7,
    /// Picture Parameter Set.
    Pps = 8,
    /// Access Unit Delimiter.
    Aud = 9,
    /// Other/unknown NAL type.
    Other = 0,
}

impl From<u8> for NalUnitType {
    fn from(byte: u8) -> Self {
        match byte & 0x1F {
            1 => NalUnitType::NonIdrSlice,
            5 => NalUnitType::IdrSlice,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            _ => NalUnitType::Other,
        }
    }
}

impl NalUnitType {
    /// SPS or PPS.
    pub fn is_parameter_set(self) -> bool {
        matches!(self, Self::Sps | Self::Pps)
    }

    /// A coded picture slice.
    pub fn is_picture(self) -> bool {
        matches!(self, Self::NonIdrSlice | Self::IdrSlice)
    }
}

/// A single NAL unit extracted from an Annex B stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    /// The NAL unit type.
    pub nal_type: NalUnitType,
    /// The NAL unit data (including the NAL header byte, excluding start code).
    pub data: Bytes,
}

impl NalUnit {
    /// Build a unit from its bytes; `None` for an empty unit.
    pub fn from_bytes(data: Bytes) -> Option<Self> {
        let header = *data.first()?;
        Some(Self {
            nal_type: NalUnitType::from(header),
            data,
        })
    }

    /// Whether this slice opens a new picture.
    ///
    /// `first_mb_in_slice` is the first field of the slice header and is
    /// ue(v) coded, so a zero value is a single set bit.
    pub fn starts_picture(&self) -> bool {
        self.data.get(1).map_or(true, |b| b & 0x80 != 0)
    }
}

/// Locate the next start code at or after `from`.
///
/// Returns the offset of the start code and its length (3 or 4).
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if i > 0 && data[i - 1] == 0 {
                return Some((i - 1, 4));
            }
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

/// Parse a complete Annex B buffer into individual NAL units.
///
/// Start codes and trailing zero bytes are stripped from each unit.
pub fn parse_annex_b(data: &[u8]) -> Vec<NalUnit> {
    let mut nals = Vec::new();
    let Some((mut start, mut code_len)) = find_start_code(data, 0) else {
        return nals;
    };

    loop {
        let nal_start = start + code_len;
        let next = find_start_code(data, nal_start);
        let nal_end = next.map_or(data.len(), |(pos, _)| pos);

        let unit = trim_trailing_zeros(&data[nal_start..nal_end]);
        if let Some(nal) = NalUnit::from_bytes(Bytes::copy_from_slice(unit)) {
            nals.push(nal);
        }

        match next {
            Some((pos, len)) => {
                start = pos;
                code_len = len;
            }
            None => break,
        }
    }

    nals
}

pub(crate) fn trim_trailing_zeros(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &data[..end]
}
