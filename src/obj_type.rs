//! Object types, as they appear in packfiles.

use anyhow::{bail, Result};

/// Possible types for a git object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjType {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjType {
    /// To the strings used when hashing an object ("<type> <size>\0<content>").
    pub fn to_str(&self) -> &'static str {
        match self {
            ObjType::Commit => "commit",
            ObjType::Tree => "tree",
            ObjType::Blob => "blob",
            ObjType::Tag => "tag",
        }
    }

    /// The 3-bit code used in pack object headers.
    /// See gitformat-pack(5) "Object types".
    pub fn code(&self) -> u8 {
        match self {
            ObjType::Commit => 1,
            ObjType::Tree => 2,
            ObjType::Blob => 3,
            ObjType::Tag => 4,
        }
    }
}

/// Entry types in a pack stream: a terminator, a plain object, or a
/// deltified object. Code 0 never comes from an upstream server; it is the
/// end-of-stream marker of our own archive dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackEntryType {
    End,
    Base(ObjType),
    OfsDelta,
    RefDelta,
}

impl PackEntryType {
    /// Get the pack entry type from its numeric code.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(PackEntryType::End),
            1 => Ok(PackEntryType::Base(ObjType::Commit)),
            2 => Ok(PackEntryType::Base(ObjType::Tree)),
            3 => Ok(PackEntryType::Base(ObjType::Blob)),
            4 => Ok(PackEntryType::Base(ObjType::Tag)),
            6 => Ok(PackEntryType::OfsDelta),
            7 => Ok(PackEntryType::RefDelta),
            _ => bail!("unknown pack object type: {}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for t in [ObjType::Commit, ObjType::Tree, ObjType::Blob, ObjType::Tag] {
            assert_eq!(
                PackEntryType::from_code(t.code()).unwrap(),
                PackEntryType::Base(t)
            );
        }
        assert_eq!(PackEntryType::from_code(0).unwrap(), PackEntryType::End);
        assert_eq!(PackEntryType::from_code(6).unwrap(), PackEntryType::OfsDelta);
        assert_eq!(PackEntryType::from_code(7).unwrap(), PackEntryType::RefDelta);
        assert!(PackEntryType::from_code(5).is_err());
    }
}
