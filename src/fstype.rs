use serde::{Serialize, Serializer};
use strum_macros::{Display, EnumString};

/// Filesystem (or container) signature of a partition, in blkid's TYPE
/// vocabulary.
///
/// Only the types with a dedicated clone/resize strategy get their own
/// variant; anything else is carried through verbatim in `Other` so it can
/// still be reported and block-copied.
#[derive(Debug, Clone, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum FsType {
    Ext2,
    Ext3,
    Ext4,
    Ntfs,
    Vfat,
    Xfs,
    /// LUKS encrypted container, treated as an opaque payload when cloning.
    #[strum(serialize = "crypto_LUKS")]
    Luks,
    Swap,
    #[strum(default)]
    Other(String),
}

impl FsType {
    pub fn parse(blkid_type: &str) -> Self {
        blkid_type
            .parse()
            .unwrap_or_else(|_| FsType::Other(blkid_type.to_string()))
    }

    pub fn is_ext(&self) -> bool {
        matches!(self, FsType::Ext2 | FsType::Ext3 | FsType::Ext4)
    }
}

impl Serialize for FsType {
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
    fn test_parse() {
        assert_eq!(FsType::parse("ext4"), FsType::Ext4);
        assert_eq!(FsType::parse("crypto_LUKS"), FsType::Luks);
        assert_eq!(FsType::parse("swap"), FsType::Swap);
        assert_eq!(
            FsType::parse("LVM2_member"),
            FsType::Other("LVM2_member".into())
        );
    }

    #[test]
    fn test_display_roundtrip() {
        for name in ["ext2", "ext3", "ext4", "ntfs", "vfat", "xfs", "crypto_LUKS", "swap", "btrfs"]
        {
            assert_eq!(FsType::parse(name).to_string(), name);
        }
    }

    #[test]
    fn test_is_ext() {
        assert!(FsType::Ext2.is_ext());
        assert!(FsType::Ext4.is_ext());
        assert!(!FsType::Xfs.is_ext());
        assert!(!FsType::Other("ext4x".into()).is_ext());
    }

    #[test]
    fn test_serialize() {
        assert_eq!(serde_json::to_string(&FsType::Luks).unwrap(), "\"crypto_LUKS\"");
        assert_eq!(
            serde_json::to_string(&FsType::Other("btrfs".into())).unwrap(),
            "\"btrfs\""
        );
    }
}
