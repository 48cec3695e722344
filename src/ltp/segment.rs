// LTP segment codec
//
// Header: one byte (version high nibble, segment type low nibble),
// SDNV engine id, SDNV session id, one byte extension counts (header
// high nibble, trailer low nibble), then extensions and the per-type
// body. The dispatcher peeks only the header fields and never trusts
// the body before the owning node parses it.

use crate::error::{DtnError, Result};
use crate::sdnv;
use bytes::{Buf, BufMut, BytesMut};

pub const LTP_VERSION: u8 = 0;

/// Low-nibble segment type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegType {
    /// Red data; flags decompose from codes 0-3.
    RedData {
        checkpoint: bool,
        eorp: bool,
        eob: bool,
    },
    /// Green data; code 7 carries EOB.
    GreenData { eob: bool },
    ReportSegment,
    ReportAck,
    CancelBySender,
    CancelAckByReceiver,
    CancelByReceiver,
    CancelAckBySender,
}

impl SegType {
    pub fn code(&self) -> u8 {
        match self {
            SegType::RedData {
                checkpoint,
                eorp,
                eob,
            } => match (checkpoint, eorp, eob) {
                (false, _, _) => 0,
                (true, false, _) => 1,
                (true, true, false) => 2,
                (true, true, true) => 3,
            },
            SegType::GreenData { eob: false } => 4,
            SegType::GreenData { eob: true } => 7,
            SegType::ReportSegment => 8,
            SegType::ReportAck => 9,
            SegType::CancelBySender => 10,
            SegType::CancelAckByReceiver => 11,
            SegType::CancelByReceiver => 12,
            SegType::CancelAckBySender => 13,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => SegType::RedData {
                checkpoint: false,
                eorp: false,
                eob: false,
            },
            1 => SegType::RedData {
                checkpoint: true,
                eorp: false,
                eob: false,
            },
            2 => SegType::RedData {
                checkpoint: true,
                eorp: true,
                eob: false,
            },
            3 => SegType::RedData {
                checkpoint: true,
                eorp: true,
                eob: true,
            },
            4..=6 => SegType::GreenData { eob: false },
            7 => SegType::GreenData { eob: true },
            8 => SegType::ReportSegment,
            9 => SegType::ReportAck,
            10 => SegType::CancelBySender,
            11 => SegType::CancelAckByReceiver,
            12 => SegType::CancelByReceiver,
            13 => SegType::CancelAckBySender,
            other => {
                return Err(DtnError::Protocol(format!(
                    "unknown LTP segment type {}",
                    other
                )))
            }
        })
    }

    pub fn is_data(&self) -> bool {
        matches!(self, SegType::RedData { .. } | SegType::GreenData { .. })
    }

    /// True for segments addressed at a session we originated (report
    /// and cancel traffic flowing back to the sender).
    pub fn toward_sender(&self) -> bool {
        matches!(
            self,
            SegType::ReportSegment | SegType::CancelAckByReceiver | SegType::CancelByReceiver
        )
    }
}

/// Session cancellation reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    UserCancelled = 0,
    Unreachable = 1,
    RetransLimitExceeded = 2,
    Miscolored = 3,
    SystemCancelled = 4,
    /// Retransmission-cycle / inactivity limit (RXMTCYCEX).
    RetransCycleExceeded = 5,
}

impl CancelReason {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::UserCancelled,
            1 => Self::Unreachable,
            2 => Self::RetransLimitExceeded,
            3 => Self::Miscolored,
            5 => Self::RetransCycleExceeded,
            _ => Self::SystemCancelled,
        }
    }
}

/// One reception claim, offset relative to the report's lower bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegBody {
    Data {
        client_service: u64,
        offset: u64,
        /// (checkpoint id, report serial) when the DS is a checkpoint.
        checkpoint: Option<(u64, u64)>,
        payload: Vec<u8>,
    },
    Report {
        report_serial: u64,
        checkpoint_id: u64,
        lower_bound: u64,
        upper_bound: u64,
        claims: Vec<Claim>,
    },
    ReportAck {
        report_serial: u64,
    },
    Cancel {
        reason: CancelReason,
    },
    CancelAck,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub engine_id: u64,
    pub session_id: u64,
    pub seg_type: SegType,
    /// Opaque security extensions: (tag, contents).
    pub header_ext: Vec<(u8, Vec<u8>)>,
    pub trailer_ext: Vec<(u8, Vec<u8>)>,
    pub body: SegBody,
}

/// Header fields the dispatcher needs before trusting anything else.
#[derive(Debug, Clone, Copy)]
pub struct PeekedHeader {
    pub engine_id: u64,
    pub session_id: u64,
    pub seg_type: SegType,
}

/// Parse only the fixed header; cheap and safe on hostile input.
pub fn peek_header(data: &[u8]) -> Result<PeekedHeader> {
    let mut buf = data;
    if !buf.has_remaining() {
        return Err(DtnError::Protocol("empty datagram".to_string()));
    }
    let first = buf.get_u8();
    if first >> 4 != LTP_VERSION {
        return Err(DtnError::Protocol(format!(
            "unsupported LTP version {}",
            first >> 4
        )));
    }
    let seg_type = SegType::from_code(first & 0x0f)?;
    let engine_id = sdnv::decode(&mut buf)?;
    let session_id = sdnv::decode(&mut buf)?;
    Ok(PeekedHeader {
        engine_id,
        session_id,
        seg_type,
    })
}

impl Segment {
    pub fn data(
        engine_id: u64,
        session_id: u64,
        client_service: u64,
        offset: u64,
        payload: Vec<u8>,
        seg_type: SegType,
        checkpoint: Option<(u64, u64)>,
    ) -> Self {
        debug_assert_eq!(
            checkpoint.is_some(),
            matches!(seg_type, SegType::RedData { checkpoint: true, .. })
        );
        Self {
            engine_id,
            session_id,
            seg_type,
            header_ext: Vec::new(),
            trailer_ext: Vec::new(),
            body: SegBody::Data {
                client_service,
                offset,
                checkpoint,
                payload,
            },
        }
    }

    pub fn report(
        engine_id: u64,
        session_id: u64,
        report_serial: u64,
        checkpoint_id: u64,
        lower_bound: u64,
        upper_bound: u64,
        claims: Vec<Claim>,
    ) -> Self {
        Self {
            engine_id,
            session_id,
            seg_type: SegType::ReportSegment,
            header_ext: Vec::new(),
            trailer_ext: Vec::new(),
            body: SegBody::Report {
                report_serial,
                checkpoint_id,
                lower_bound,
                upper_bound,
                claims,
            },
        }
    }

    pub fn report_ack(engine_id: u64, session_id: u64, report_serial: u64) -> Self {
        Self {
            engine_id,
            session_id,
            seg_type: SegType::ReportAck,
            header_ext: Vec::new(),
            trailer_ext: Vec::new(),
            body: SegBody::ReportAck { report_serial },
        }
    }

    pub fn cancel(
        engine_id: u64,
        session_id: u64,
        by_sender: bool,
        reason: CancelReason,
    ) -> Self {
        Self {
            engine_id,
            session_id,
            seg_type: if by_sender {
                SegType::CancelBySender
            } else {
                SegType::CancelByReceiver
            },
            header_ext: Vec::new(),
            trailer_ext: Vec::new(),
            body: SegBody::Cancel { reason },
        }
    }

    pub fn cancel_ack(engine_id: u64, session_id: u64, by_receiver: bool) -> Self {
        Self {
            engine_id,
            session_id,
            seg_type: if by_receiver {
                SegType::CancelAckByReceiver
            } else {
                SegType::CancelAckBySender
            },
            header_ext: Vec::new(),
            trailer_ext: Vec::new(),
            body: SegBody::CancelAck,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8((LTP_VERSION << 4) | self.seg_type.code());
        sdnv::encode(self.engine_id, &mut buf);
        sdnv::encode(self.session_id, &mut buf);
        let counts =
            ((self.header_ext.len() as u8 & 0x0f) << 4) | (self.trailer_ext.len() as u8 & 0x0f);
        buf.put_u8(counts);
        for (tag, contents) in &self.header_ext {
            buf.put_u8(*tag);
            sdnv::encode(contents.len() as u64, &mut buf);
            buf.put_slice(contents);
        }
        match &self.body {
            SegBody::Data {
                client_service,
                offset,
                checkpoint,
                payload,
            } => {
                sdnv::encode(*client_service, &mut buf);
                sdnv::encode(*offset, &mut buf);
                sdnv::encode(payload.len() as u64, &mut buf);
                if let Some((checkpoint_id, report_serial)) = checkpoint {
                    sdnv::encode(*checkpoint_id, &mut buf);
                    sdnv::encode(*report_serial, &mut buf);
                }
                buf.put_slice(payload);
            }
            SegBody::Report {
                report_serial,
                checkpoint_id,
                lower_bound,
                upper_bound,
                claims,
            } => {
                sdnv::encode(*report_serial, &mut buf);
                sdnv::encode(*checkpoint_id, &mut buf);
                sdnv::encode(*lower_bound, &mut buf);
                sdnv::encode(*upper_bound, &mut buf);
                sdnv::encode(claims.len() as u64, &mut buf);
                for claim in claims {
                    sdnv::encode(claim.offset, &mut buf);
                    sdnv::encode(claim.length, &mut buf);
                }
            }
            SegBody::ReportAck { report_serial } => {
                sdnv::encode(*report_serial, &mut buf);
            }
            SegBody::Cancel { reason } => {
                buf.put_u8(*reason as u8);
            }
            SegBody::CancelAck => {}
        }
        for (tag, contents) in &self.trailer_ext {
            buf.put_u8(*tag);
            sdnv::encode(contents.len() as u64, &mut buf);
            buf.put_slice(contents);
        }
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if !buf.has_remaining() {
            return Err(DtnError::Protocol("empty segment".to_string()));
        }
        let first = buf.get_u8();
        if first >> 4 != LTP_VERSION {
            return Err(DtnError::Protocol(format!(
                "unsupported LTP version {}",
                first >> 4
            )));
        }
        let seg_type = SegType::from_code(first & 0x0f)?;
        let engine_id = sdnv::decode(&mut buf)?;
        let session_id = sdnv::decode(&mut buf)?;
        if !buf.has_remaining() {
            return Err(DtnError::Protocol("truncated LTP header".to_string()));
        }
        let counts = buf.get_u8();
        let header_ext = decode_extensions(&mut buf, counts >> 4)?;

        let body = match seg_type {
            SegType::RedData { .. } | SegType::GreenData { .. } => {
                let is_checkpoint = matches!(
                    seg_type,
                    SegType::RedData {
                        checkpoint: true,
                        ..
                    }
                );
                let client_service = sdnv::decode(&mut buf)?;
                let offset = sdnv::decode(&mut buf)?;
                let length = sdnv::decode(&mut buf)? as usize;
                let checkpoint = if is_checkpoint {
                    Some((sdnv::decode(&mut buf)?, sdnv::decode(&mut buf)?))
                } else {
                    None
                };
                if buf.remaining() < length {
                    return Err(DtnError::Protocol(format!(
                        "DS claims {} bytes, {} remain",
                        length,
                        buf.remaining()
                    )));
                }
                let payload = buf[..length].to_vec();
                buf.advance(length);
                SegBody::Data {
                    client_service,
                    offset,
                    checkpoint,
                    payload,
                }
            }
            SegType::ReportSegment => {
                let report_serial = sdnv::decode(&mut buf)?;
                let checkpoint_id = sdnv::decode(&mut buf)?;
                let lower_bound = sdnv::decode(&mut buf)?;
                let upper_bound = sdnv::decode(&mut buf)?;
                let count = sdnv::decode(&mut buf)? as usize;
                if count > 1024 {
                    return Err(DtnError::Protocol(format!(
                        "implausible claim count {}",
                        count
                    )));
                }
                let mut claims = Vec::with_capacity(count);
                for _ in 0..count {
                    claims.push(Claim {
                        offset: sdnv::decode(&mut buf)?,
                        length: sdnv::decode(&mut buf)?,
                    });
                }
                SegBody::Report {
                    report_serial,
                    checkpoint_id,
                    lower_bound,
                    upper_bound,
                    claims,
                }
            }
            SegType::ReportAck => SegBody::ReportAck {
                report_serial: sdnv::decode(&mut buf)?,
            },
            SegType::CancelBySender | SegType::CancelByReceiver => {
                if !buf.has_remaining() {
                    return Err(DtnError::Protocol("truncated cancel".to_string()));
                }
                SegBody::Cancel {
                    reason: CancelReason::from_u8(buf.get_u8()),
                }
            }
            SegType::CancelAckByReceiver | SegType::CancelAckBySender => SegBody::CancelAck,
        };

        let trailer_ext = decode_extensions(&mut buf, counts & 0x0f)?;
        Ok(Self {
            engine_id,
            session_id,
            seg_type,
            header_ext,
            trailer_ext,
            body,
        })
    }
}

fn decode_extensions(buf: &mut &[u8], count: u8) -> Result<Vec<(u8, Vec<u8>)>> {
    let mut extensions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if !buf.has_remaining() {
            return Err(DtnError::Protocol("truncated extension".to_string()));
        }
        let tag = buf.get_u8();
        let len = sdnv::decode(buf)? as usize;
        if buf.remaining() < len {
            return Err(DtnError::Protocol("truncated extension body".to_string()));
        }
        extensions.push((tag, buf[..len].to_vec()));
        buf.advance(len);
    }
    Ok(extensions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_roundtrip() {
        for code in 0..=13u8 {
            let seg_type = SegType::from_code(code).unwrap();
            // 5 and 6 normalize to the canonical green code 4
            if code == 5 || code == 6 {
                assert_eq!(seg_type.code(), 4);
            } else {
                assert_eq!(seg_type.code(), code);
            }
        }
        assert!(SegType::from_code(14).is_err());
    }

    #[test]
    fn test_checkpoint_data_roundtrip() {
        let segment = Segment::data(
            7,
            42,
            1,
            2800,
            vec![0xab; 100],
            SegType::RedData {
                checkpoint: true,
                eorp: true,
                eob: true,
            },
            Some((3, 0)),
        );
        let decoded = Segment::decode(&segment.encode()).unwrap();
        assert_eq!(decoded, segment);
    }

    #[test]
    fn test_report_roundtrip_with_claims() {
        let segment = Segment::report(
            7,
            42,
            1,
            3,
            0,
            4200,
            vec![
                Claim {
                    offset: 0,
                    length: 1400,
                },
                Claim {
                    offset: 2800,
                    length: 1400,
                },
            ],
        );
        let decoded = Segment::decode(&segment.encode()).unwrap();
        assert_eq!(decoded, segment);
    }

    #[test]
    fn test_peek_matches_decode() {
        let segment = Segment::cancel(9, 5, false, CancelReason::RetransCycleExceeded);
        let encoded = segment.encode();
        let peeked = peek_header(&encoded).unwrap();
        assert_eq!(peeked.engine_id, 9);
        assert_eq!(peeked.session_id, 5);
        assert_eq!(peeked.seg_type, SegType::CancelByReceiver);
        assert!(peeked.seg_type.toward_sender());
    }

    #[test]
    fn test_truncated_ds_rejected() {
        let segment = Segment::data(
            1,
            1,
            1,
            0,
            vec![0; 64],
            SegType::RedData {
                checkpoint: false,
                eorp: false,
                eob: false,
            },
            None,
        );
        let mut encoded = segment.encode();
        encoded.truncate(encoded.len() - 10);
        assert!(Segment::decode(&encoded).is_err());
    }

    #[test]
    fn test_extension_roundtrip() {
        let mut segment = Segment::report_ack(1, 2, 3);
        segment.header_ext.push((0x00, vec![1, 2, 3, 4]));
        segment.trailer_ext.push((0x01, vec![9; 8]));
        let decoded = Segment::decode(&segment.encode()).unwrap();
        assert_eq!(decoded, segment);
    }
}
