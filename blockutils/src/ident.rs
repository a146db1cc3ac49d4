use std::fmt::Display;

use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// A proper UUID, or a relaxed string identifier for something that is not
/// one.
///
/// Block device metadata mixes both: ext4 and LUKS volumes carry real UUIDs,
/// while FAT filesystems have short serials like `8AA2-EE49` and MBR disks
/// have `0x`-prefixed 32-bit ids. Identity preservation has to carry either
/// form through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockId {
    Uuid(Uuid),
    Relaxed(String),
}

impl BlockId {
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            BlockId::Uuid(uuid) => Some(*uuid),
            BlockId::Relaxed(_) => None,
        }
    }
}

impl From<&str> for BlockId {
    fn from(value: &str) -> Self {
        match Uuid::parse_str(value) {
            Ok(uuid) => Self::Uuid(uuid),
            Err(_) => Self::Relaxed(value.to_string()),
        }
    }
}

impl From<String> for BlockId {
    fn from(value: String) -> Self {
        value.as_str().into()
    }
}

impl From<Uuid> for BlockId {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockId::Uuid(uuid) => write!(f, "{}", uuid.hyphenated()),
            BlockId::Relaxed(s) => write!(f, "{s}"),
        }
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(String::deserialize(deserializer)?.as_str().into())
    }
}

impl Serialize for BlockId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let uuid_cases = [
            "00000000-0000-0000-0000-000000000000",
            "6ba7b810-9dad-11d1-80b4-00c04fd430c8",
            "fedcba98-7654-3210-fedc-ba9876543210",
        ];
        for case in uuid_cases {
            let parsed = BlockId::from(case);
            assert_eq!(parsed, BlockId::Uuid(Uuid::parse_str(case).unwrap()));
            assert_eq!(parsed.to_string(), case);
            assert!(parsed.as_uuid().is_some());
        }

        let relaxed_cases = ["8AA2-EE49", "0x1b2c3d4e", "not a uuid"];
        for case in relaxed_cases {
            let parsed = BlockId::from(case);
            assert_eq!(parsed, BlockId::Relaxed(case.to_string()));
            assert_eq!(parsed.to_string(), case);
            assert!(parsed.as_uuid().is_none());
        }
    }

    #[test]
    fn test_serde() {
        let id: BlockId = serde_json::from_str("\"8AA2-EE49\"").unwrap();
        assert_eq!(id, BlockId::Relaxed("8AA2-EE49".into()));
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"8AA2-EE49\"");
    }
}
