use crate::bootstrap;
use crate::InjectError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use std::fmt;
use std::str::FromStr;

/// Hex SHA-224 of `bytes`, the same text `sha224sum` prints.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha224::digest(bytes))
}

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode base64 text, ignoring embedded whitespace (the bootstrap wraps lines).
pub fn decode(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(compact)
}

/// Which way an artifact is travelling relative to the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to instance.
    Push,
    /// Instance to host.
    Pull,
}

/// The agent operation a bootstrap script asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryPoint {
    Install,
    Dump,
    Load,
}

impl EntryPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Dump => "dump",
            Self::Load => "load",
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Self::Install),
            "dump" => Ok(Self::Dump),
            "load" => Ok(Self::Load),
            other => Err(format!(
                "unknown entry point '{other}' (expected install, dump, or load)"
            )),
        }
    }
}

/// The unit moved across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedPayload {
    pub checksum: String,
    pub encoded: String,
    /// Empty for payloads printed back by the agent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bootstrap: String,
}

/// Anything that can be shipped into an instance and rebuilt there.
pub trait Injectable: Serialize + DeserializeOwned {
    fn entry_point(&self, direction: Direction) -> EntryPoint;

    fn serialize_payload(&self, direction: Direction) -> Result<SerializedPayload, InjectError> {
        let bytes = serde_json::to_vec(self)?;
        let checksum = digest(&bytes);
        let encoded = encode(&bytes);
        let bootstrap = bootstrap::render(self.entry_point(direction), &checksum, &encoded);
        Ok(SerializedPayload {
            checksum,
            encoded,
            bootstrap,
        })
    }

    /// Rebuild from `encoded`, refusing anything whose digest differs from
    /// `checksum`. Text that is not valid base64 counts as a mismatch.
    fn deserialize_payload(checksum: &str, encoded: &str) -> Result<Self, InjectError> {
        let expected = checksum.trim().to_ascii_lowercase();
        let bytes = decode(encoded).map_err(|e| InjectError::Integrity {
            expected: expected.clone(),
            actual: format!("undecodable payload ({e})"),
        })?;
        let actual = digest(&bytes);
        if actual != expected {
            return Err(InjectError::Integrity { expected, actual });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<u32>,
    }

    impl Injectable for Sample {
        fn entry_point(&self, _direction: Direction) -> EntryPoint {
            EntryPoint::Install
        }
    }

    fn sample() -> Sample {
        Sample {
            name: "sample".to_owned(),
            values: vec![1, 2, 3],
        }
    }

    #[test]
    fn digest_matches_sha224sum() {
        assert_eq!(
            digest(b""),
            "d14a028c2a3a2bc9476102bb288234c415a2b01f828ea62ac5b3e42f"
        );
        assert_eq!(digest(b"abc").len(), 56);
    }

    #[test]
    fn decode_ignores_line_wrapping() {
        let encoded = encode(&[7u8; 100]);
        let wrapped = format!("{}\n{}\n", &encoded[..60], &encoded[60..]);
        assert_eq!(decode(&wrapped).unwrap(), vec![7u8; 100]);
    }

    #[test]
    fn payload_roundtrip() {
        let payload = sample().serialize_payload(Direction::Push).unwrap();
        assert!(payload.bootstrap.contains(&payload.checksum));
        let back = Sample::deserialize_payload(&payload.checksum, &payload.encoded).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn any_flipped_bit_is_an_integrity_error() {
        let payload = sample().serialize_payload(Direction::Push).unwrap();
        let bytes = payload.encoded.as_bytes();
        for i in 0..bytes.len() {
            for bit in 0..7 {
                let mut tampered = bytes.to_vec();
                tampered[i] ^= 1 << bit;
                let tampered = String::from_utf8(tampered).unwrap();
                let err = Sample::deserialize_payload(&payload.checksum, &tampered).unwrap_err();
                assert!(
                    matches!(err, InjectError::Integrity { .. }),
                    "byte {i} bit {bit}: {err}"
                );
            }
        }
    }

    #[test]
    fn wrong_checksum_is_rejected() {
        let payload = sample().serialize_payload(Direction::Push).unwrap();
        let err = Sample::deserialize_payload(&digest(b"other"), &payload.encoded).unwrap_err();
        match err {
            InjectError::Integrity { actual, .. } => assert_eq!(actual, payload.checksum),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn entry_point_parse() {
        assert_eq!("dump".parse::<EntryPoint>().unwrap(), EntryPoint::Dump);
        assert!("run".parse::<EntryPoint>().is_err());
        assert_eq!(EntryPoint::Load.to_string(), "load");
    }

    #[test]
    fn agent_output_omits_empty_bootstrap() {
        let payload = SerializedPayload {
            checksum: "c".to_owned(),
            encoded: "e".to_owned(),
            bootstrap: String::new(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("bootstrap"));
        let back: SerializedPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
