// Administrative record codecs
//
// BP6 admin payloads start with `(admin_type << 4) | flags`; BP7 wraps
// the record in a 2-element array `[admin_type, body]`. Status reports,
// custody signals and aggregate custody signals are the records the
// daemon produces and consumes; BIBE and petition bodies pass through
// opaque.

use crate::bundle::model::{Bundle, BundleTimestamp};
use crate::error::{DtnError, Result};
use crate::naming::EndpointId;
use crate::sdnv;
use bytes::{Buf, BufMut, BytesMut};

pub const ADMIN_STATUS_REPORT: u8 = 1;
pub const ADMIN_CUSTODY_SIGNAL: u8 = 2;
pub const ADMIN_AGGREGATE_CUSTODY_SIGNAL: u8 = 4;
pub const ADMIN_ANNOUNCE: u8 = 5;
pub const ADMIN_MULTICAST_PETITION: u8 = 6;
pub const ADMIN_BIBE: u8 = 7;

// BP7 admin types differ from the BP6 nibble codes.
pub const ADMIN_V7_STATUS_REPORT: u8 = 1;
pub const ADMIN_V7_BIBE: u8 = 3;
pub const ADMIN_V7_CUSTODY_SIGNAL: u8 = 4;
pub const ADMIN_V7_IMC_BRIEFING: u8 = 5;

const ADMIN_FLAG_FOR_FRAGMENT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusReportReason {
    NoAdditionalInfo = 0,
    LifetimeExpired = 1,
    ForwardedUnidirectional = 2,
    TransmissionCancelled = 3,
    DepletedStorage = 4,
    EndpointIdUnintelligible = 5,
    NoRouteToDest = 6,
    NoTimelyContact = 7,
    BlockUnintelligible = 8,
}

impl StatusReportReason {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::LifetimeExpired,
            2 => Self::ForwardedUnidirectional,
            3 => Self::TransmissionCancelled,
            4 => Self::DepletedStorage,
            5 => Self::EndpointIdUnintelligible,
            6 => Self::NoRouteToDest,
            7 => Self::NoTimelyContact,
            8 => Self::BlockUnintelligible,
            _ => Self::NoAdditionalInfo,
        }
    }
}

/// Which lifecycle points a single report asserts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub received: bool,
    pub custody_accepted: bool,
    pub forwarded: bool,
    pub delivered: bool,
    pub deleted: bool,
}

impl StatusFlags {
    pub fn received() -> Self {
        Self {
            received: true,
            ..Default::default()
        }
    }

    pub fn custody_accepted() -> Self {
        Self {
            custody_accepted: true,
            ..Default::default()
        }
    }

    pub fn delivered() -> Self {
        Self {
            delivered: true,
            ..Default::default()
        }
    }

    pub fn deleted() -> Self {
        Self {
            deleted: true,
            ..Default::default()
        }
    }

    fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.received {
            byte |= 0x01;
        }
        if self.custody_accepted {
            byte |= 0x02;
        }
        if self.forwarded {
            byte |= 0x04;
        }
        if self.delivered {
            byte |= 0x08;
        }
        if self.deleted {
            byte |= 0x10;
        }
        byte
    }

    fn from_byte(byte: u8) -> Self {
        Self {
            received: byte & 0x01 != 0,
            custody_accepted: byte & 0x02 != 0,
            forwarded: byte & 0x04 != 0,
            delivered: byte & 0x08 != 0,
            deleted: byte & 0x10 != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub flags: StatusFlags,
    pub reason: StatusReportReason,
    pub is_fragment: bool,
    pub frag_offset: u64,
    pub frag_length: u64,
    /// Seconds since the DTN epoch the asserted event happened.
    pub event_time: u64,
    pub creation_ts: BundleTimestamp,
    pub source: EndpointId,
}

impl StatusReport {
    pub fn for_bundle(
        bundle: &Bundle,
        flags: StatusFlags,
        reason: StatusReportReason,
        event_time: u64,
    ) -> Self {
        Self {
            flags,
            reason,
            is_fragment: bundle.is_fragment,
            frag_offset: bundle.frag_offset,
            frag_length: bundle.frag_length,
            event_time,
            creation_ts: bundle.creation_ts,
            source: bundle.source.clone(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        let mut first = ADMIN_STATUS_REPORT << 4;
        if self.is_fragment {
            first |= ADMIN_FLAG_FOR_FRAGMENT;
        }
        buf.put_u8(first);
        buf.put_u8(self.flags.to_byte());
        buf.put_u8(self.reason as u8);
        if self.is_fragment {
            sdnv::encode(self.frag_offset, &mut buf);
            sdnv::encode(self.frag_length, &mut buf);
        }
        sdnv::encode(self.event_time, &mut buf);
        sdnv::encode(self.creation_ts.dtn_time, &mut buf);
        sdnv::encode(self.creation_ts.seq, &mut buf);
        put_eid(&mut buf, &self.source);
        buf.to_vec()
    }

    fn decode_body(is_fragment: bool, buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(DtnError::Protocol("short status report".to_string()));
        }
        let flags = StatusFlags::from_byte(buf.get_u8());
        let reason = StatusReportReason::from_u8(buf.get_u8());
        let (frag_offset, frag_length) = if is_fragment {
            (sdnv::decode(buf)?, sdnv::decode(buf)?)
        } else {
            (0, 0)
        };
        let event_time = sdnv::decode(buf)?;
        let creation_ts = BundleTimestamp::new(sdnv::decode(buf)?, sdnv::decode(buf)?);
        let source = get_eid(buf)?;
        Ok(Self {
            flags,
            reason,
            is_fragment,
            frag_offset,
            frag_length,
            event_time,
            creation_ts,
            source,
        })
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum CustodySignalReason {
    NoAdditionalInfo = 0,
    RedundantReception = 3,
    DepletedStorage = 4,
    EndpointIdUnintelligible = 5,
    NoRouteToDest = 6,
    NoTimelyContact = 7,
    BlockUnintelligible = 8,
}

impl CustodySignalReason {
    pub fn from_u8(v: u8) -> Self {
        match v {
            3 => Self::RedundantReception,
            4 => Self::DepletedStorage,
            5 => Self::EndpointIdUnintelligible,
            6 => Self::NoRouteToDest,
            7 => Self::NoTimelyContact,
            8 => Self::BlockUnintelligible,
            _ => Self::NoAdditionalInfo,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodySignal {
    pub succeeded: bool,
    pub reason: CustodySignalReason,
    pub is_fragment: bool,
    pub frag_offset: u64,
    pub frag_length: u64,
    pub signal_time: u64,
    pub creation_ts: BundleTimestamp,
    pub source: EndpointId,
}

impl CustodySignal {
    pub fn for_bundle(
        bundle: &Bundle,
        succeeded: bool,
        reason: CustodySignalReason,
        signal_time: u64,
    ) -> Self {
        Self {
            succeeded,
            reason,
            is_fragment: bundle.is_fragment,
            frag_offset: bundle.frag_offset,
            frag_length: bundle.frag_length,
            signal_time,
            creation_ts: bundle.creation_ts,
            source: bundle.source.clone(),
        }
    }

    /// GBOF fields of the bundle this signal refers to.
    pub fn gbof(&self) -> crate::bundle::Gbof {
        crate::bundle::Gbof {
            source: self.source.clone(),
            creation_ts: self.creation_ts,
            is_fragment: self.is_fragment,
            frag_offset: self.frag_offset,
            frag_length: self.frag_length,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        let mut first = ADMIN_CUSTODY_SIGNAL << 4;
        if self.is_fragment {
            first |= ADMIN_FLAG_FOR_FRAGMENT;
        }
        buf.put_u8(first);
        let mut status = self.reason as u8;
        if self.succeeded {
            status |= 0x80;
        }
        buf.put_u8(status);
        if self.is_fragment {
            sdnv::encode(self.frag_offset, &mut buf);
            sdnv::encode(self.frag_length, &mut buf);
        }
        sdnv::encode(self.signal_time, &mut buf);
        sdnv::encode(self.creation_ts.dtn_time, &mut buf);
        sdnv::encode(self.creation_ts.seq, &mut buf);
        put_eid(&mut buf, &self.source);
        buf.to_vec()
    }

    fn decode_body(is_fragment: bool, buf: &mut &[u8]) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(DtnError::Protocol("short custody signal".to_string()));
        }
        let status = buf.get_u8();
        let succeeded = status & 0x80 != 0;
        let reason = CustodySignalReason::from_u8(status & 0x7f);
        let (frag_offset, frag_length) = if is_fragment {
            (sdnv::decode(buf)?, sdnv::decode(buf)?)
        } else {
            (0, 0)
        };
        let signal_time = sdnv::decode(buf)?;
        let creation_ts = BundleTimestamp::new(sdnv::decode(buf)?, sdnv::decode(buf)?);
        let source = get_eid(buf)?;
        Ok(Self {
            succeeded,
            reason,
            is_fragment,
            frag_offset,
            frag_length,
            signal_time,
            creation_ts,
            source,
        })
    }
}

/// One run of consecutive custody IDs inside an aggregate signal.
///
/// The first id of an entry is `prev_right_edge + gap + 1`, with the
/// initial right edge at zero, so `{1,2,4}` encodes as
/// `(gap=0, fill=2), (gap=1, fill=1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcsEntry {
    pub gap: u64,
    pub fill: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcsPayload {
    pub succeeded: bool,
    pub reason: CustodySignalReason,
    pub entries: Vec<AcsEntry>,
}

impl AcsPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(ADMIN_AGGREGATE_CUSTODY_SIGNAL << 4);
        let mut status = self.reason as u8;
        if self.succeeded {
            status |= 0x80;
        }
        buf.put_u8(status);
        for entry in &self.entries {
            sdnv::encode(entry.gap, &mut buf);
            sdnv::encode(entry.fill, &mut buf);
        }
        buf.to_vec()
    }

    fn decode_body(buf: &mut &[u8]) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(DtnError::Protocol("short aggregate signal".to_string()));
        }
        let status = buf.get_u8();
        let succeeded = status & 0x80 != 0;
        let reason = CustodySignalReason::from_u8(status & 0x7f);
        let mut entries = Vec::new();
        while buf.has_remaining() {
            let gap = sdnv::decode(buf)?;
            let fill = sdnv::decode(buf)?;
            if fill == 0 {
                return Err(DtnError::Protocol("zero-length ACS fill".to_string()));
            }
            entries.push(AcsEntry { gap, fill });
        }
        if entries.is_empty() {
            return Err(DtnError::Protocol("empty aggregate signal".to_string()));
        }
        Ok(Self {
            succeeded,
            reason,
            entries,
        })
    }

    /// Expand the run-length entries to the custody-id set, ascending.
    pub fn custody_ids(&self) -> Vec<u64> {
        let mut ids = Vec::new();
        let mut right_edge = 0u64;
        for entry in &self.entries {
            let start = right_edge + entry.gap + 1;
            for id in start..start + entry.fill {
                ids.push(id);
            }
            right_edge = start + entry.fill - 1;
        }
        ids
    }
}

#[derive(Debug, Clone)]
pub enum AdminRecord {
    StatusReport(StatusReport),
    CustodySignal(CustodySignal),
    Acs(AcsPayload),
    Announce(Vec<u8>),
    MulticastPetition(Vec<u8>),
    Bibe(Vec<u8>),
}

impl AdminRecord {
    /// Parse a BP6 admin payload by its typecode nibble.
    pub fn parse_v6(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(DtnError::Protocol("empty admin payload".to_string()));
        }
        let admin_type = payload[0] >> 4;
        let for_fragment = payload[0] & ADMIN_FLAG_FOR_FRAGMENT != 0;
        let mut body = &payload[1..];
        match admin_type {
            ADMIN_STATUS_REPORT => Ok(AdminRecord::StatusReport(StatusReport::decode_body(
                for_fragment,
                &mut body,
            )?)),
            ADMIN_CUSTODY_SIGNAL => Ok(AdminRecord::CustodySignal(CustodySignal::decode_body(
                for_fragment,
                &mut body,
            )?)),
            ADMIN_AGGREGATE_CUSTODY_SIGNAL => {
                Ok(AdminRecord::Acs(AcsPayload::decode_body(&mut body)?))
            }
            ADMIN_ANNOUNCE => Ok(AdminRecord::Announce(body.to_vec())),
            ADMIN_MULTICAST_PETITION => Ok(AdminRecord::MulticastPetition(body.to_vec())),
            ADMIN_BIBE => Ok(AdminRecord::Bibe(body.to_vec())),
            other => Err(DtnError::Protocol(format!(
                "unknown admin typecode {}",
                other
            ))),
        }
    }

    /// Parse a BP7 admin payload: a 2-element array `[type, body]`
    /// where the body is an embedded byte string.
    pub fn parse_v7(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        if !buf.has_remaining() || buf.get_u8() != 0x82 {
            return Err(DtnError::Protocol(
                "admin payload is not a 2-element array".to_string(),
            ));
        }
        let admin_type = get_cbor_uint(&mut buf)?;
        let body = get_cbor_bytes(&mut buf)?;
        let mut slice = &body[..];
        match admin_type as u8 {
            ADMIN_V7_STATUS_REPORT => {
                let for_fragment = !slice.is_empty() && slice[0] & ADMIN_FLAG_FOR_FRAGMENT != 0;
                if slice.is_empty() {
                    return Err(DtnError::Protocol("short status report".to_string()));
                }
                slice = &slice[1..];
                Ok(AdminRecord::StatusReport(StatusReport::decode_body(
                    for_fragment,
                    &mut slice,
                )?))
            }
            ADMIN_V7_CUSTODY_SIGNAL => {
                let for_fragment = !slice.is_empty() && slice[0] & ADMIN_FLAG_FOR_FRAGMENT != 0;
                if slice.is_empty() {
                    return Err(DtnError::Protocol("short custody signal".to_string()));
                }
                slice = &slice[1..];
                Ok(AdminRecord::CustodySignal(CustodySignal::decode_body(
                    for_fragment,
                    &mut slice,
                )?))
            }
            ADMIN_V7_BIBE => Ok(AdminRecord::Bibe(body)),
            ADMIN_V7_IMC_BRIEFING => Ok(AdminRecord::MulticastPetition(body)),
            other => Err(DtnError::Protocol(format!("unknown admin type {}", other))),
        }
    }

    /// Wrap a BP6-shaped record body as a BP7 admin payload.
    pub fn encode_v7(admin_type: u8, body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(body.len() + 8);
        buf.put_u8(0x82);
        put_cbor_uint(&mut buf, u64::from(admin_type));
        put_cbor_bytes(&mut buf, body);
        buf.to_vec()
    }
}

fn put_eid(buf: &mut BytesMut, eid: &EndpointId) {
    let text = eid.to_string();
    sdnv::encode(text.len() as u64, buf);
    buf.put_slice(text.as_bytes());
}

fn get_eid(buf: &mut &[u8]) -> Result<EndpointId> {
    let len = sdnv::decode(buf)? as usize;
    if buf.remaining() < len {
        return Err(DtnError::Protocol("truncated EID".to_string()));
    }
    let text = std::str::from_utf8(&buf[..len])
        .map_err(|_| DtnError::Protocol("EID is not UTF-8".to_string()))?
        .to_string();
    buf.advance(len);
    EndpointId::parse(&text)
}

fn put_cbor_uint(buf: &mut BytesMut, value: u64) {
    if value < 24 {
        buf.put_u8(value as u8);
    } else if value <= u64::from(u8::MAX) {
        buf.put_u8(0x18);
        buf.put_u8(value as u8);
    } else if value <= u64::from(u16::MAX) {
        buf.put_u8(0x19);
        buf.put_u16(value as u16);
    } else if value <= u64::from(u32::MAX) {
        buf.put_u8(0x1a);
        buf.put_u32(value as u32);
    } else {
        buf.put_u8(0x1b);
        buf.put_u64(value);
    }
}

fn get_cbor_uint(buf: &mut &[u8]) -> Result<u64> {
    if !buf.has_remaining() {
        return Err(DtnError::Protocol("truncated admin payload".to_string()));
    }
    let initial = buf.get_u8();
    if initial >> 5 != 0 {
        return Err(DtnError::Protocol("expected unsigned int".to_string()));
    }
    match initial & 0x1f {
        v @ 0..=23 => Ok(u64::from(v)),
        24 if buf.remaining() >= 1 => Ok(u64::from(buf.get_u8())),
        25 if buf.remaining() >= 2 => Ok(u64::from(buf.get_u16())),
        26 if buf.remaining() >= 4 => Ok(u64::from(buf.get_u32())),
        27 if buf.remaining() >= 8 => Ok(buf.get_u64()),
        _ => Err(DtnError::Protocol("truncated admin payload".to_string())),
    }
}

fn put_cbor_bytes(buf: &mut BytesMut, data: &[u8]) {
    let len = data.len() as u64;
    if len < 24 {
        buf.put_u8(0x40 | len as u8);
    } else if len <= u64::from(u8::MAX) {
        buf.put_u8(0x58);
        buf.put_u8(len as u8);
    } else if len <= u64::from(u16::MAX) {
        buf.put_u8(0x59);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(0x5a);
        buf.put_u32(len as u32);
    }
    buf.put_slice(data);
}

fn get_cbor_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    if !buf.has_remaining() {
        return Err(DtnError::Protocol("truncated admin payload".to_string()));
    }
    let initial = buf.get_u8();
    if initial >> 5 != 2 {
        return Err(DtnError::Protocol("expected byte string".to_string()));
    }
    let len = match initial & 0x1f {
        v @ 0..=23 => u64::from(v),
        24 if buf.remaining() >= 1 => u64::from(buf.get_u8()),
        25 if buf.remaining() >= 2 => u64::from(buf.get_u16()),
        26 if buf.remaining() >= 4 => u64::from(buf.get_u32()),
        _ => return Err(DtnError::Protocol("truncated admin payload".to_string())),
    } as usize;
    if buf.remaining() < len {
        return Err(DtnError::Protocol("truncated byte string".to_string()));
    }
    let data = buf[..len].to_vec();
    buf.advance(len);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_report_roundtrip() {
        let report = StatusReport {
            flags: StatusFlags::delivered(),
            reason: StatusReportReason::NoAdditionalInfo,
            is_fragment: false,
            frag_offset: 0,
            frag_length: 0,
            event_time: 123456,
            creation_ts: BundleTimestamp::new(1000, 42),
            source: EndpointId::ipn(5, 1),
        };
        let encoded = report.encode();
        match AdminRecord::parse_v6(&encoded).unwrap() {
            AdminRecord::StatusReport(decoded) => assert_eq!(decoded, report),
            other => panic!("wrong record: {:?}", other),
        }
    }

    #[test]
    fn test_custody_signal_fragment_roundtrip() {
        let signal = CustodySignal {
            succeeded: false,
            reason: CustodySignalReason::RedundantReception,
            is_fragment: true,
            frag_offset: 100,
            frag_length: 400,
            signal_time: 99,
            creation_ts: BundleTimestamp::new(2000, 7),
            source: EndpointId::ipn(9, 3),
        };
        let encoded = signal.encode();
        match AdminRecord::parse_v6(&encoded).unwrap() {
            AdminRecord::CustodySignal(decoded) => {
                assert_eq!(decoded, signal);
                assert!(decoded.gbof().is_fragment);
            }
            other => panic!("wrong record: {:?}", other),
        }
    }

    #[test]
    fn test_acs_run_length_expansion() {
        let payload = AcsPayload {
            succeeded: true,
            reason: CustodySignalReason::NoAdditionalInfo,
            entries: vec![AcsEntry { gap: 0, fill: 2 }, AcsEntry { gap: 1, fill: 1 }],
        };
        assert_eq!(payload.custody_ids(), vec![1, 2, 4]);
        let encoded = payload.encode();
        match AdminRecord::parse_v6(&encoded).unwrap() {
            AdminRecord::Acs(decoded) => assert_eq!(decoded.custody_ids(), vec![1, 2, 4]),
            other => panic!("wrong record: {:?}", other),
        }
    }

    #[test]
    fn test_v7_wrapping() {
        let signal = CustodySignal {
            succeeded: true,
            reason: CustodySignalReason::NoAdditionalInfo,
            is_fragment: false,
            frag_offset: 0,
            frag_length: 0,
            signal_time: 5,
            creation_ts: BundleTimestamp::new(10, 0),
            source: EndpointId::ipn(1, 1),
        };
        let body = signal.encode();
        // v7 embeds the same body bytes minus the leading nibble byte,
        // which the v6 encoder already produced; reuse wholesale.
        let wrapped = AdminRecord::encode_v7(ADMIN_V7_CUSTODY_SIGNAL, &body);
        match AdminRecord::parse_v7(&wrapped).unwrap() {
            AdminRecord::CustodySignal(decoded) => assert_eq!(decoded, signal),
            other => panic!("wrong record: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_typecode_rejected() {
        assert!(AdminRecord::parse_v6(&[0x30, 0x00]).is_err());
        assert!(AdminRecord::parse_v6(&[]).is_err());
    }
}
