//! Connection constructor flags.
//!
//! The bit values match the flag set rirc has always exposed, so existing
//! configuration that stores them numerically keeps working.

use bitflags::bitflags;

use crate::error::IoError;

bitflags! {
    /// Address-family, TLS and verification options for a connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        const IPV_UNSPEC        = 1 << 1;
        const IPV_4             = 1 << 2;
        const IPV_6             = 1 << 3;
        const TLS_ENABLED       = 1 << 4;
        const TLS_DISABLED      = 1 << 5;
        const TLS_VRFY_DISABLED = 1 << 6;
        const TLS_VRFY_OPTIONAL = 1 << 7;
        const TLS_VRFY_REQUIRED = 1 << 8;
    }
}

/// Which address families the resolver may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Unspecified,
    V4,
    V6,
}

impl AddressFamily {
    /// Returns `true` if `addr` belongs to this family.
    pub fn accepts(self, addr: &std::net::SocketAddr) -> bool {
        match self {
            Self::Unspecified => true,
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }
}

/// How strictly the server certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verify {
    /// No certificate checks at all.
    Disabled,
    /// Checks run; failures are reported as warnings only.
    Optional,
    /// Any verification failure aborts the handshake.
    #[default]
    Required,
}

/// Whether the link is wrapped in TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    #[default]
    Disabled,
    Enabled(Verify),
}

impl TlsMode {
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled(_))
    }
}

/// Typed view of a [`Flags`] set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionOptions {
    pub family: AddressFamily,
    pub tls: TlsMode,
}

impl TryFrom<Flags> for ConnectionOptions {
    type Error = IoError;

    /// Unset groups take their defaults: any address family, plaintext,
    /// and `required` verification once TLS is enabled.
    fn try_from(flags: Flags) -> Result<Self, IoError> {
        let family = match (
            flags.contains(Flags::IPV_4),
            flags.contains(Flags::IPV_6),
            flags.contains(Flags::IPV_UNSPEC),
        ) {
            (true, true, _) => return Err(IoError::InvalidFlags("both IPv4-only and IPv6-only")),
            (true, false, true) | (false, true, true) => {
                return Err(IoError::InvalidFlags("address family both set and unspecified"));
            }
            (true, false, false) => AddressFamily::V4,
            (false, true, false) => AddressFamily::V6,
            (false, false, _) => AddressFamily::Unspecified,
        };

        let verify_bits = flags
            & (Flags::TLS_VRFY_DISABLED | Flags::TLS_VRFY_OPTIONAL | Flags::TLS_VRFY_REQUIRED);
        if verify_bits.bits().count_ones() > 1 {
            return Err(IoError::InvalidFlags("more than one verification policy"));
        }
        let verify = if verify_bits.contains(Flags::TLS_VRFY_DISABLED) {
            Verify::Disabled
        } else if verify_bits.contains(Flags::TLS_VRFY_OPTIONAL) {
            Verify::Optional
        } else {
            Verify::Required
        };

        let tls = match (
            flags.contains(Flags::TLS_ENABLED),
            flags.contains(Flags::TLS_DISABLED),
        ) {
            (true, true) => return Err(IoError::InvalidFlags("TLS both enabled and disabled")),
            (true, false) => TlsMode::Enabled(verify),
            (false, _) => TlsMode::Disabled,
        };

        Ok(Self { family, tls })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_flags_take_defaults() {
        let opts = ConnectionOptions::try_from(Flags::empty()).unwrap();
        assert_eq!(opts.family, AddressFamily::Unspecified);
        assert_eq!(opts.tls, TlsMode::Disabled);
    }

    #[test]
    fn tls_defaults_to_required_verification() {
        let opts = ConnectionOptions::try_from(Flags::TLS_ENABLED | Flags::IPV_6).unwrap();
        assert_eq!(opts.family, AddressFamily::V6);
        assert_eq!(opts.tls, TlsMode::Enabled(Verify::Required));
    }

    #[test]
    fn explicit_verification_policy() {
        let opts =
            ConnectionOptions::try_from(Flags::TLS_ENABLED | Flags::TLS_VRFY_OPTIONAL).unwrap();
        assert_eq!(opts.tls, TlsMode::Enabled(Verify::Optional));

        // Policy without TLS is accepted and ignored.
        let opts = ConnectionOptions::try_from(Flags::TLS_VRFY_DISABLED).unwrap();
        assert_eq!(opts.tls, TlsMode::Disabled);
    }

    #[test]
    fn contradictory_flags_rejected() {
        assert!(ConnectionOptions::try_from(Flags::IPV_4 | Flags::IPV_6).is_err());
        assert!(ConnectionOptions::try_from(Flags::TLS_ENABLED | Flags::TLS_DISABLED).is_err());
        assert!(
            ConnectionOptions::try_from(Flags::TLS_VRFY_OPTIONAL | Flags::TLS_VRFY_REQUIRED)
                .is_err()
        );
    }

    #[test]
    fn bit_values_are_stable() {
        assert_eq!(Flags::IPV_UNSPEC.bits(), 0x002);
        assert_eq!(Flags::TLS_ENABLED.bits(), 0x010);
        assert_eq!(Flags::TLS_VRFY_REQUIRED.bits(), 0x100);
    }

    #[test]
    fn family_filter() {
        let v4: std::net::SocketAddr = "127.0.0.1:6667".parse().unwrap();
        let v6: std::net::SocketAddr = "[::1]:6667".parse().unwrap();
        assert!(AddressFamily::V4.accepts(&v4));
        assert!(!AddressFamily::V4.accepts(&v6));
        assert!(AddressFamily::Unspecified.accepts(&v6));
    }
}
