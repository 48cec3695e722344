// Whole-bundle framing
//
// The byte image used wherever a complete bundle travels as opaque
// data: LTP session blocks and restage files. Per bundle: a length-
// prefixed metadata record followed by the raw payload bytes; frames
// concatenate.

use crate::bundle::{Bundle, BundleMeta, BundleRef, Payload};
use crate::error::{DtnError, Result};
use bytes::{Buf, BufMut, BytesMut};

pub fn encode_bundle_frame(bundle: &BundleRef) -> Result<Vec<u8>> {
    let meta = bundle.meta();
    let meta_bytes = bincode::serde::encode_to_vec(&meta, bincode::config::standard())?;
    let payload = bundle.payload.read_all()?;
    let mut buf = BytesMut::with_capacity(meta_bytes.len() + payload.len() + 12);
    buf.put_u32_le(meta_bytes.len() as u32);
    buf.put_slice(&meta_bytes);
    buf.put_u64_le(payload.len() as u64);
    buf.put_slice(&payload);
    Ok(buf.to_vec())
}

/// Decode a run of concatenated frames.
pub fn decode_bundle_frames(data: &[u8]) -> Result<Vec<BundleRef>> {
    let mut buf = data;
    let mut bundles = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(DtnError::Protocol("truncated bundle frame".to_string()));
        }
        let meta_len = buf.get_u32_le() as usize;
        if buf.remaining() < meta_len + 8 {
            return Err(DtnError::Protocol("truncated bundle frame".to_string()));
        }
        let (meta, _): (BundleMeta, _) =
            bincode::serde::decode_from_slice(&buf[..meta_len], bincode::config::standard())?;
        buf.advance(meta_len);
        let payload_len = buf.get_u64_le() as usize;
        if buf.remaining() < payload_len {
            return Err(DtnError::Protocol("truncated bundle payload".to_string()));
        }
        let payload = Payload::in_memory(buf[..payload_len].to_vec());
        buf.advance(payload_len);
        bundles.push(Bundle::from_meta(meta, payload));
    }
    Ok(bundles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::EndpointId;

    #[test]
    fn test_frame_roundtrip() {
        let a = Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
            .creation_ts(5, 0)
            .payload(Payload::in_memory(vec![1; 48]))
            .build(1);
        let b = Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(3, 1))
            .creation_ts(5, 1)
            .payload(Payload::in_memory(vec![2; 16]))
            .build(2);
        let mut data = encode_bundle_frame(&a).unwrap();
        data.extend(encode_bundle_frame(&b).unwrap());
        let decoded = decode_bundle_frames(&data).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].payload.read_all().unwrap(), vec![1; 48]);
        assert_eq!(decoded[1].dest, EndpointId::ipn(3, 1));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let bundle = Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
            .payload(Payload::in_memory(vec![0; 32]))
            .build(1);
        let data = encode_bundle_frame(&bundle).unwrap();
        assert!(decode_bundle_frames(&data[..data.len() - 5]).is_err());
    }
}
