//! Protocol version announced in the `connected` greeting.

/// Version spoken by this build.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// A `major.minor` protocol version.
///
/// Only the major number is sent on the wire; a bump means old clients can
/// no longer talk to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Incremented on breaking changes.
    pub major: u8,
    /// Incremented on additive changes.
    pub minor: u8,
}

impl Version {
    /// Whether a server greeting with `major` can be talked to.
    #[must_use]
    pub fn accepts_major(&self, major: u8) -> bool {
        self.major == major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_same_major_only() {
        assert!(PROTOCOL_VERSION.accepts_major(1));
        assert!(!PROTOCOL_VERSION.accepts_major(0));
        assert!(!PROTOCOL_VERSION.accepts_major(2));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "1.0");
    }
}
