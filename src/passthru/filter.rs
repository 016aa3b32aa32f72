//! Inbound message filters.
//!
//! A channel only sees traffic matching one of its pass filters (block
//! filters veto first). Flow-control filters additionally carry a canned
//! response the manager transmits whenever a matching ISO-TP first frame
//! arrives, so segmented transfers keep moving without a round trip through
//! the protocol layer.

use crate::channel::{ChannelError, ChannelResult};

use super::PassThruFrame;

/// Filter behaviour
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum FilterKind {
    /// Accept matching frames
    Pass,
    /// Reject matching frames, overriding pass filters
    Block,
    /// Accept matching frames and auto-answer ISO-TP first frames
    FlowControl,
}

/// One installed filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    /// Filter id, unique within its channel
    pub id: u32,
    /// Behaviour
    pub kind: FilterKind,
    mask: Vec<u8>,
    pattern: Vec<u8>,
    flow_control_payload: Option<Vec<u8>>,
}

impl Filter {
    /// Validates and builds a filter. Mask and pattern must be non-empty and
    /// of equal length; a flow-control filter must carry its response
    /// payload, the other kinds must not.
    pub fn new(
        id: u32,
        kind: FilterKind,
        mask: Vec<u8>,
        pattern: Vec<u8>,
        flow_control_payload: Option<Vec<u8>>,
    ) -> ChannelResult<Self> {
        if mask.is_empty() || pattern.is_empty() {
            return Err(ChannelError::FilterInvalid {
                reason: "mask and pattern must be non-empty".into(),
            });
        }
        if mask.len() != pattern.len() {
            return Err(ChannelError::FilterInvalid {
                reason: format!(
                    "mask length {} does not match pattern length {}",
                    mask.len(),
                    pattern.len()
                ),
            });
        }
        match kind {
            FilterKind::FlowControl if flow_control_payload.is_none() => {
                return Err(ChannelError::FilterInvalid {
                    reason: "flow control filter needs a response payload".into(),
                })
            }
            FilterKind::Pass | FilterKind::Block if flow_control_payload.is_some() => {
                return Err(ChannelError::FilterInvalid {
                    reason: "only flow control filters carry a response payload".into(),
                })
            }
            _ => {}
        }
        Ok(Self {
            id,
            kind,
            mask,
            pattern,
            flow_control_payload,
        })
    }

    /// Tests a frame's data block against this filter:
    /// `(data & mask) == (pattern & mask)` element-wise over the filter
    /// length. Frames shorter than the filter never match.
    pub fn matches(&self, frame: &PassThruFrame) -> bool {
        let data = frame.data();
        if data.len() < self.mask.len() {
            return false;
        }
        self.mask
            .iter()
            .zip(&self.pattern)
            .zip(data)
            .all(|((m, p), d)| d & m == p & m)
    }

    /// Canned flow-control response, present on [FilterKind::FlowControl]
    pub fn flow_control_payload(&self) -> Option<&[u8]> {
        self.flow_control_payload.as_deref()
    }
}

/// Applies a channel's filter set to one inbound frame.
///
/// Returns `(accept, respond)`: whether the frame should be delivered to the
/// channel, and the flow-control filter whose canned response should be sent,
/// if any.
pub fn evaluate<'a>(filters: &'a [Filter], frame: &PassThruFrame) -> (bool, Option<&'a Filter>) {
    if filters
        .iter()
        .filter(|f| f.kind == FilterKind::Block)
        .any(|f| f.matches(frame))
    {
        return (false, None);
    }
    let mut accept = false;
    let mut responder = None;
    for f in filters {
        match f.kind {
            FilterKind::Pass if f.matches(frame) => accept = true,
            FilterKind::FlowControl if f.matches(frame) => {
                accept = true;
                responder = Some(f);
            }
            _ => {}
        }
    }
    (accept, responder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passthru::Protocol;

    fn frame(id: u32, payload: &[u8]) -> PassThruFrame {
        PassThruFrame::with_can_id(Protocol::Iso15765, id, payload, false).unwrap()
    }

    fn id_filter(kind: FilterKind, id: u32, fc: Option<Vec<u8>>) -> Filter {
        Filter::new(
            0,
            kind,
            vec![0xFF; 4],
            id.to_be_bytes().to_vec(),
            fc,
        )
        .unwrap()
    }

    #[test]
    fn mask_length_must_match_pattern() {
        let err = Filter::new(0, FilterKind::Pass, vec![0xFF; 4], vec![0x07, 0xE8], None);
        assert!(matches!(err, Err(ChannelError::FilterInvalid { .. })));
    }

    #[test]
    fn flow_control_filter_requires_payload() {
        let err = Filter::new(0, FilterKind::FlowControl, vec![0xFF], vec![0x07], None);
        assert!(matches!(err, Err(ChannelError::FilterInvalid { .. })));
    }

    #[test]
    fn pass_filter_matches_on_masked_bytes() {
        let f = id_filter(FilterKind::Pass, 0x7E8, None);
        assert!(f.matches(&frame(0x7E8, &[0x01])));
        assert!(!f.matches(&frame(0x7E9, &[0x01])));
    }

    #[test]
    fn partial_mask_ignores_unmasked_bits() {
        // Accept the whole 0x7E8..0x7EF response range
        let f = Filter::new(
            1,
            FilterKind::Pass,
            vec![0xFF, 0xFF, 0xFF, 0xF8],
            0x7E8u32.to_be_bytes().to_vec(),
            None,
        )
        .unwrap();
        assert!(f.matches(&frame(0x7E8, &[])));
        assert!(f.matches(&frame(0x7EF, &[])));
        assert!(!f.matches(&frame(0x7E0, &[])));
    }

    #[test]
    fn block_overrides_pass() {
        let filters = vec![
            id_filter(FilterKind::Pass, 0x7E8, None),
            id_filter(FilterKind::Block, 0x7E8, None),
        ];
        let (accept, _) = evaluate(&filters, &frame(0x7E8, &[0x01]));
        assert!(!accept);
    }

    #[test]
    fn unmatched_frame_is_dropped() {
        let filters = vec![id_filter(FilterKind::Pass, 0x7E8, None)];
        let (accept, _) = evaluate(&filters, &frame(0x123, &[]));
        assert!(!accept);
    }

    #[test]
    fn flow_control_filter_offers_response() {
        let fc_payload = vec![0x00, 0x00, 0x07, 0xE0, 0x30, 0x00, 0x00];
        let filters = vec![id_filter(
            FilterKind::FlowControl,
            0x7E8,
            Some(fc_payload.clone()),
        )];
        let (accept, responder) = evaluate(&filters, &frame(0x7E8, &[0x10, 0x14]));
        assert!(accept);
        assert_eq!(
            responder.unwrap().flow_control_payload().unwrap(),
            &fc_payload[..]
        );
    }
}
