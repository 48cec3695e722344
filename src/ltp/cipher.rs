// LTP authentication contract
//
// Each direction carries (suite, key id, engine name). The engine
// treats crypto as an opaque sign/verify pair over the segment's
// header and trailer extension bytes; suites 0, 1 and 255 are
// recognized, None means no extensions at all. Suite negotiation and
// real key material live outside the core.

use crate::error::{DtnError, Result};

pub const AUTH_EXT_TAG: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    /// HMAC-SHA1 style keyed suite.
    Suite0,
    /// Stronger keyed suite.
    Suite1,
    /// The null suite: fixed-content extension, no key.
    Suite255,
}

impl CipherSuite {
    pub fn from_i32(v: i32) -> Result<Option<Self>> {
        match v {
            -1 => Ok(None),
            0 => Ok(Some(CipherSuite::Suite0)),
            1 => Ok(Some(CipherSuite::Suite1)),
            255 => Ok(Some(CipherSuite::Suite255)),
            other => Err(DtnError::Configuration(format!(
                "unrecognized LTP cipher suite {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CipherConfig {
    pub suite: Option<CipherSuite>,
    pub key_id: Option<u32>,
    pub engine_name: String,
}

impl CipherConfig {
    pub fn none(engine_name: &str) -> Self {
        Self {
            suite: None,
            key_id: None,
            engine_name: engine_name.to_string(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.suite.is_some()
    }
}

/// Opaque sign/verify over segment bytes. Implementations own key
/// lookup; the engine only moves extension bytes around.
pub trait LtpCipher: Send + Sync {
    /// Produce the trailer extension contents for an outbound segment.
    fn sign(&self, config: &CipherConfig, segment_bytes: &[u8]) -> Result<Vec<u8>>;

    /// Verify an inbound segment's trailer extension contents.
    fn verify(&self, config: &CipherConfig, segment_bytes: &[u8], tag: &[u8]) -> Result<()>;
}

/// The null suite: a one-byte constant tag. Anything else configured
/// without a real cipher implementation is a configuration error.
pub struct NullCipher;

impl LtpCipher for NullCipher {
    fn sign(&self, config: &CipherConfig, _segment_bytes: &[u8]) -> Result<Vec<u8>> {
        match config.suite {
            None => Ok(Vec::new()),
            Some(CipherSuite::Suite255) => Ok(vec![0xc0]),
            Some(other) => Err(DtnError::Configuration(format!(
                "suite {:?} requires a keyed cipher implementation",
                other
            ))),
        }
    }

    fn verify(&self, config: &CipherConfig, _segment_bytes: &[u8], tag: &[u8]) -> Result<()> {
        match config.suite {
            None => Ok(()),
            Some(CipherSuite::Suite255) => {
                if tag == [0xc0] {
                    Ok(())
                } else {
                    Err(DtnError::Protocol("bad null-suite tag".to_string()))
                }
            }
            Some(other) => Err(DtnError::Configuration(format!(
                "suite {:?} requires a keyed cipher implementation",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_recognition() {
        assert_eq!(CipherSuite::from_i32(-1).unwrap(), None);
        assert_eq!(CipherSuite::from_i32(0).unwrap(), Some(CipherSuite::Suite0));
        assert_eq!(
            CipherSuite::from_i32(255).unwrap(),
            Some(CipherSuite::Suite255)
        );
        assert!(CipherSuite::from_i32(7).is_err());
    }

    #[test]
    fn test_null_suite_roundtrip() {
        let cipher = NullCipher;
        let config = CipherConfig {
            suite: Some(CipherSuite::Suite255),
            key_id: None,
            engine_name: "test".to_string(),
        };
        let tag = cipher.sign(&config, b"segment").unwrap();
        cipher.verify(&config, b"segment", &tag).unwrap();
        assert!(cipher.verify(&config, b"segment", &[0x00]).is_err());
    }
}
