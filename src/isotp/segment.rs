//! Outbound segmentation of a payload into CAN frames.
//!
//! The segmenter is stateless per call and knows nothing about timing; the
//! link driver in [super] paces consecutive frames according to the peer's
//! flow control, the segmenter only produces the frames.

use crate::channel::CanFrame;

use super::{FramingError, FramingResult, IsoTpSettings};

/// Largest payload expressible with the standard 12 bit first-frame length
pub const MAX_STANDARD_LENGTH: usize = 0xFFF;

/// Payload bytes carried by a first frame (standard / escaped encoding)
const FF_DATA: usize = 6;
const FF_ESCAPED_DATA: usize = 2;
/// Payload bytes carried by a consecutive frame
const CF_DATA: usize = 7;

fn finish(mut data: Vec<u8>, settings: &IsoTpSettings) -> Vec<u8> {
    if settings.pad_frame {
        data.resize(8, settings.padding_byte);
    }
    data
}

/// Builds the single frame for a payload of at most 7 bytes.
pub fn single_frame(tx_id: u32, payload: &[u8], settings: &IsoTpSettings) -> FramingResult<CanFrame> {
    if payload.len() > 7 {
        return Err(FramingError::PayloadTooLarge {
            length: payload.len(),
            max: 7,
        });
    }
    let mut data = Vec::with_capacity(8);
    data.push(payload.len() as u8);
    data.extend_from_slice(payload);
    Ok(CanFrame::new(
        tx_id,
        &finish(data, settings),
        settings.can_use_ext_addr,
    ))
}

/// Walks a payload through its first frame and consecutive frames.
#[derive(Debug)]
pub struct Segmenter {
    payload: Vec<u8>,
    tx_id: u32,
    settings: IsoTpSettings,
    pos: usize,
    sn: u8,
}

impl Segmenter {
    /// Starts a segmented transfer. Fails for payloads that fit a single
    /// frame (use [single_frame]) or exceed 32 bits of length.
    pub fn new(tx_id: u32, payload: &[u8], settings: IsoTpSettings) -> FramingResult<Self> {
        if payload.len() <= 7 {
            return Err(FramingError::ProtocolError(
                "payload fits a single frame".into(),
            ));
        }
        if payload.len() > u32::MAX as usize {
            return Err(FramingError::PayloadTooLarge {
                length: payload.len(),
                max: u32::MAX as usize,
            });
        }
        Ok(Self {
            payload: payload.to_vec(),
            tx_id,
            settings,
            pos: 0,
            sn: 0,
        })
    }

    /// Emits the first frame. Payloads beyond [MAX_STANDARD_LENGTH] use the
    /// length escape sequence with a 32 bit big-endian length.
    pub fn first_frame(&mut self) -> CanFrame {
        let len = self.payload.len();
        let mut data = Vec::with_capacity(8);
        if len <= MAX_STANDARD_LENGTH {
            data.push(0x10 | ((len >> 8) as u8 & 0x0F));
            data.push(len as u8);
            data.extend_from_slice(&self.payload[..FF_DATA]);
            self.pos = FF_DATA;
        } else {
            data.push(0x10);
            data.push(0x00);
            data.extend_from_slice(&(len as u32).to_be_bytes());
            data.extend_from_slice(&self.payload[..FF_ESCAPED_DATA]);
            self.pos = FF_ESCAPED_DATA;
        }
        self.sn = 1;
        CanFrame::new(self.tx_id, &data, self.settings.can_use_ext_addr)
    }

    /// Emits the next consecutive frame, or None once the payload is spent.
    /// Sequence numbers run 1, 2, .. 15, 0, 1, .. modulo 16.
    pub fn next_consecutive(&mut self) -> Option<CanFrame> {
        if self.pos >= self.payload.len() {
            return None;
        }
        let take = CF_DATA.min(self.payload.len() - self.pos);
        let mut data = Vec::with_capacity(8);
        data.push(0x20 | self.sn);
        data.extend_from_slice(&self.payload[self.pos..self.pos + take]);
        self.pos += take;
        self.sn = (self.sn + 1) & 0x0F;
        let data = if self.pos >= self.payload.len() {
            // Only the final frame is padded; intermediate frames are full
            finish(data, &self.settings)
        } else {
            data
        };
        Some(CanFrame::new(
            self.tx_id,
            &data,
            self.settings.can_use_ext_addr,
        ))
    }

    /// Bytes already emitted
    pub fn position(&self) -> usize {
        self.pos
    }

    /// True once every payload byte has been emitted
    pub fn is_complete(&self) -> bool {
        self.pos >= self.payload.len()
    }
}

/// Produces the complete frame sequence for a payload, assuming an
/// unrestricted flow-control window (BS = 0). The link driver uses
/// [Segmenter] directly so it can pause at block boundaries.
pub fn segment_unpaced(
    tx_id: u32,
    payload: &[u8],
    settings: &IsoTpSettings,
) -> FramingResult<Vec<CanFrame>> {
    if payload.len() <= 7 {
        return Ok(vec![single_frame(tx_id, payload, settings)?]);
    }
    let mut seg = Segmenter::new(tx_id, payload, *settings)?;
    let mut out = vec![seg.first_frame()];
    while let Some(cf) = seg.next_consecutive() {
        out.push(cf);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> IsoTpSettings {
        IsoTpSettings::default()
    }

    #[test]
    fn empty_payload_is_a_single_frame() {
        let f = single_frame(0x7E0, &[], &settings()).unwrap();
        assert_eq!(f.data()[0], 0x00);
        assert_eq!(f.data().len(), 8);
    }

    #[test]
    fn seven_bytes_fit_one_frame() {
        let f = single_frame(0x7E0, &[1, 2, 3, 4, 5, 6, 7], &settings()).unwrap();
        assert_eq!(f.data(), &[0x07, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn first_frame_carries_length_and_six_bytes() {
        let payload: Vec<u8> = (0..20).collect();
        let mut seg = Segmenter::new(0x7E0, &payload, settings()).unwrap();
        let ff = seg.first_frame();
        assert_eq!(ff.data()[0], 0x10);
        assert_eq!(ff.data()[1], 20);
        assert_eq!(&ff.data()[2..], &payload[..6]);
    }

    #[test]
    fn sequence_numbers_wrap_modulo_16() {
        // 6 + 17*7 = 125 bytes => 17 consecutive frames, SN 1..15,0,1,2
        let payload: Vec<u8> = (0..125).collect();
        let mut seg = Segmenter::new(0x7E0, &payload, settings()).unwrap();
        seg.first_frame();
        let mut sns = Vec::new();
        while let Some(cf) = seg.next_consecutive() {
            sns.push(cf.data()[0] & 0x0F);
        }
        let expected: Vec<u8> = (1..=17).map(|i| (i % 16) as u8).collect();
        assert_eq!(sns, expected);
    }

    #[test]
    fn oversize_payload_uses_escape_sequence() {
        let payload = vec![0xA5u8; 0x1234];
        let mut seg = Segmenter::new(0x7E0, &payload, settings()).unwrap();
        let ff = seg.first_frame();
        assert_eq!(ff.data()[0], 0x10);
        assert_eq!(ff.data()[1], 0x00);
        assert_eq!(&ff.data()[2..6], &0x1234u32.to_be_bytes());
        assert_eq!(&ff.data()[6..], &payload[..2]);
    }

    #[test]
    fn unpaced_frame_count_matches_formula() {
        for len in [8usize, 62, 63, 64, 4095] {
            let payload = vec![0u8; len];
            let frames = segment_unpaced(0x7E0, &payload, &settings()).unwrap();
            let expected_cfs = (len - 6).div_ceil(7);
            assert_eq!(frames.len(), 1 + expected_cfs, "payload len {}", len);
        }
    }
}
