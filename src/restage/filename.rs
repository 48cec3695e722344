// Restage filename grammar
//
// A restaged bundle's filename carries its full GBOF plus expiration:
//
//   src_<eid>_dst_<eid>_bts_<YYYY-DDD-HHMMSS>_<dtntime>_<seq>
//     _frg_<off>_<len>_pay_<len>_exp_<YYYY-DDD-HHMMSS>_<dtntime>
//
// with `_` the field separator and `-` the EID field separator, both
// fixed at link creation and required to differ. Parsing strips the
// tokens left to right; decoder output must reproduce the encoder's
// GBOF and expiration exactly.

use crate::bundle::{Bundle, BundleTimestamp, Gbof, DTN_TIME_EPOCH_UNIX};
use crate::error::{DtnError, Result};
use crate::naming::EndpointId;
use chrono::{DateTime, Utc};

/// Everything a filename encodes about a restaged bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFileDesc {
    pub src: EndpointId,
    pub dst: EndpointId,
    pub creation_ts: BundleTimestamp,
    pub frag_offset: u64,
    pub frag_length: u64,
    pub payload_len: u64,
    /// Absolute expiration in seconds since the DTN epoch.
    pub exp_dtn_time: u64,
}

impl BundleFileDesc {
    pub fn for_bundle(bundle: &Bundle) -> Self {
        Self {
            src: bundle.source.clone(),
            dst: bundle.dest.clone(),
            creation_ts: bundle.creation_ts,
            frag_offset: if bundle.is_fragment { bundle.frag_offset } else { 0 },
            frag_length: if bundle.is_fragment { bundle.frag_length } else { 0 },
            payload_len: bundle.payload.len(),
            exp_dtn_time: bundle.expiration_dtn_time(),
        }
    }

    pub fn gbof(&self) -> Gbof {
        Gbof {
            source: self.src.clone(),
            creation_ts: self.creation_ts,
            is_fragment: self.frag_length > 0,
            frag_offset: self.frag_offset,
            frag_length: self.frag_length,
        }
    }

    /// Remaining lifetime in seconds at `now_dtn`.
    pub fn remaining_ttl(&self, now_dtn: u64) -> u64 {
        self.exp_dtn_time.saturating_sub(now_dtn)
    }
}

/// Quota-subject directory name: `src_<scheme>-<node>` or
/// `dst_<scheme>-<node>`.
pub fn format_dirname(by_dst: bool, eid: &EndpointId, eid_sep: char) -> String {
    let prefix = if by_dst { "dst" } else { "src" };
    match eid {
        EndpointId::Ipn { node, .. } => format!("{}_ipn{}{}", prefix, eid_sep, node),
        EndpointId::Imc { group, .. } => format!("{}_imc{}{}", prefix, eid_sep, group),
        EndpointId::Dtn { authority, .. } => {
            format!("{}_dtn{}{}", prefix, eid_sep, sanitize(authority))
        }
        EndpointId::Null => format!("{}_dtn{}none", prefix, eid_sep),
    }
}

fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '+' })
        .collect()
}

/// `YYYY-DDD-HHMMSS` with the ordinal day of year. The dashes are part
/// of the date format, not field separators.
fn format_human_time(dtn_time: u64) -> String {
    let unix = (DTN_TIME_EPOCH_UNIX + dtn_time) as i64;
    let dt: DateTime<Utc> = DateTime::from_timestamp(unix, 0).unwrap_or_default();
    dt.format("%Y-%j-%H%M%S").to_string()
}

fn format_eid(eid: &EndpointId, eid_sep: char) -> String {
    match eid {
        EndpointId::Ipn { node, service } => format!("ipn{}{}{}{}", eid_sep, node, eid_sep, service),
        EndpointId::Imc { group, service } => format!("imc{}{}{}{}", eid_sep, group, eid_sep, service),
        EndpointId::Dtn { authority, path } => format!(
            "dtn{}{}{}{}",
            eid_sep,
            sanitize(authority),
            eid_sep,
            sanitize(path.trim_start_matches('/'))
        ),
        EndpointId::Null => format!("dtn{}none{}0", eid_sep, eid_sep),
    }
}

fn parse_eid(text: &str, eid_sep: char) -> Result<EndpointId> {
    let parts: Vec<&str> = text.split(eid_sep).collect();
    if parts.len() != 3 {
        return Err(DtnError::InvalidInput(format!(
            "EID field '{}' does not split into scheme{}node{}service",
            text, eid_sep, eid_sep
        )));
    }
    match parts[0] {
        "ipn" => Ok(EndpointId::Ipn {
            node: parse_num(parts[1])?,
            service: parse_num(parts[2])?,
        }),
        "imc" => Ok(EndpointId::Imc {
            group: parse_num(parts[1])?,
            service: parse_num(parts[2])?,
        }),
        "dtn" => {
            if parts[1] == "none" {
                Ok(EndpointId::Null)
            } else {
                let path = if parts[2].is_empty() {
                    String::new()
                } else {
                    format!("/{}", parts[2])
                };
                Ok(EndpointId::Dtn {
                    authority: parts[1].to_string(),
                    path,
                })
            }
        }
        other => Err(DtnError::InvalidInput(format!("unknown scheme '{}'", other))),
    }
}

fn parse_num(text: &str) -> Result<u64> {
    text.parse::<u64>()
        .map_err(|_| DtnError::InvalidInput(format!("bad number '{}'", text)))
}

pub fn format_bundle_filename(desc: &BundleFileDesc, field_sep: char, eid_sep: char) -> String {
    let fs = field_sep;
    format!(
        "src{fs}{src}{fs}dst{fs}{dst}{fs}bts{fs}{bts_human}{fs}{bts}{fs}{seq}{fs}frg{fs}{off}{fs}{flen}{fs}pay{fs}{pay}{fs}exp{fs}{exp_human}{fs}{exp}",
        src = format_eid(&desc.src, eid_sep),
        dst = format_eid(&desc.dst, eid_sep),
        bts_human = format_human_time(desc.creation_ts.dtn_time),
        bts = desc.creation_ts.dtn_time,
        seq = desc.creation_ts.seq,
        off = desc.frag_offset,
        flen = desc.frag_length,
        pay = desc.payload_len,
        exp_human = format_human_time(desc.exp_dtn_time),
        exp = desc.exp_dtn_time,
    )
}

pub fn parse_bundle_filename(
    filename: &str,
    field_sep: char,
    eid_sep: char,
) -> Result<BundleFileDesc> {
    let fields: Vec<&str> = filename.split(field_sep).collect();
    // src <eid> dst <eid> bts <human> <dtn> <seq> frg <off> <len>
    // pay <len> exp <human> <dtn>
    if fields.len() != 16 {
        return Err(DtnError::InvalidInput(format!(
            "filename has {} fields, expected 16",
            fields.len()
        )));
    }
    let expect = |index: usize, token: &str| -> Result<()> {
        if fields[index] == token {
            Ok(())
        } else {
            Err(DtnError::InvalidInput(format!(
                "expected token '{}' at field {}, found '{}'",
                token, index, fields[index]
            )))
        }
    };
    expect(0, "src")?;
    expect(2, "dst")?;
    expect(4, "bts")?;
    expect(8, "frg")?;
    expect(11, "pay")?;
    expect(13, "exp")?;

    Ok(BundleFileDesc {
        src: parse_eid(fields[1], eid_sep)?,
        dst: parse_eid(fields[3], eid_sep)?,
        creation_ts: BundleTimestamp::new(parse_num(fields[6])?, parse_num(fields[7])?),
        frag_offset: parse_num(fields[9])?,
        frag_length: parse_num(fields[10])?,
        payload_len: parse_num(fields[12])?,
        exp_dtn_time: parse_num(fields[15])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> BundleFileDesc {
        BundleFileDesc {
            src: EndpointId::ipn(5, 1),
            dst: EndpointId::ipn(9, 2),
            creation_ts: BundleTimestamp::new(725_846_400, 3),
            frag_offset: 0,
            frag_length: 0,
            payload_len: 1_048_576,
            exp_dtn_time: 725_850_000,
        }
    }

    #[test]
    fn test_roundtrip_default_separators() {
        let original = desc();
        let name = format_bundle_filename(&original, '_', '-');
        assert!(name.starts_with("src_ipn-5-1_dst_ipn-9-2_bts_"));
        assert!(name.contains("_pay_1048576_exp_"));
        let parsed = parse_bundle_filename(&name, '_', '-').unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.gbof(), original.gbof());
    }

    #[test]
    fn test_roundtrip_fragment_and_custom_separators() {
        let mut original = desc();
        original.frag_offset = 1024;
        original.frag_length = 2048;
        let name = format_bundle_filename(&original, '#', '~');
        let parsed = parse_bundle_filename(&name, '#', '~').unwrap();
        assert_eq!(parsed, original);
        assert!(parsed.gbof().is_fragment);
    }

    #[test]
    fn test_roundtrip_dtn_scheme() {
        let mut original = desc();
        original.src = EndpointId::Dtn {
            authority: "nodea".to_string(),
            path: "/svc".to_string(),
        };
        let name = format_bundle_filename(&original, '_', '-');
        let parsed = parse_bundle_filename(&name, '_', '-').unwrap();
        assert_eq!(parsed.src, original.src);
    }

    #[test]
    fn test_human_time_is_ordinal() {
        // 2023-001 00:00:00 UTC = dtn time for 2023-01-01
        let dtn = 1_672_531_200 - DTN_TIME_EPOCH_UNIX;
        assert_eq!(format_human_time(dtn), "2023-001-000000");
    }

    #[test]
    fn test_malformed_names_rejected() {
        assert!(parse_bundle_filename("notafilename", '_', '-').is_err());
        assert!(parse_bundle_filename("src_ipn-1-1_dst_ipn-2-2_bts_x", '_', '-').is_err());
        let name = format_bundle_filename(&desc(), '_', '-');
        // wrong eid separator
        assert!(parse_bundle_filename(&name, '_', '~').is_err());
    }

    #[test]
    fn test_dirname_formats() {
        assert_eq!(format_dirname(false, &EndpointId::ipn(5, 1), '-'), "src_ipn-5");
        assert_eq!(format_dirname(true, &EndpointId::ipn(9, 2), '-'), "dst_ipn-9");
    }
}
