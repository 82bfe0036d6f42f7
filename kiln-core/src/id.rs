use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Unique identifier for one microVM instance.
///
/// The textual form is exactly 32 lowercase hex characters with no
/// separators, so it splices into socket and rootfs-copy filenames (and
/// network-namespace names) as-is. [`VmId::from_str`] only accepts that
/// form back, which is what makes residue filenames attributable to a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId(Uuid);

/// A string was not the textual form of a [`VmId`].
#[derive(Debug, thiserror::Error)]
#[error("invalid VM id {0:?}: expected 32 lowercase hex characters")]
pub struct InvalidVmId(String);

impl VmId {
    /// Number of characters in the textual form.
    pub const TEXT_LEN: usize = 32;

    /// Creates a new random `VmId` (128 bits of entropy).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

impl FromStr for VmId {
    type Err = InvalidVmId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() == Self::TEXT_LEN
            && s.chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !well_formed {
            return Err(InvalidVmId(s.to_owned()));
        }
        Uuid::try_parse(s)
            .map(Self)
            .map_err(|_| InvalidVmId(s.to_owned()))
    }
}
