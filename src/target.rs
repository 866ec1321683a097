//! Console target variants (spec.md §9 REDESIGN: "no inheritance; a single
//! lookup table suffices").
//!
//! Every PS4-vs-PS5 difference in the pipeline — wake port, discovery
//! protocol-version string, session-init path — is resolved through one
//! `ConsoleTarget::constants()` call. No component branches on the target
//! elsewhere.

/// Closed set of console target variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsoleTarget {
    Ps4V1,
    Ps5V1,
    Ps5Future,
}

/// Per-variant wire constants.
#[derive(Debug, Clone, Copy)]
pub struct TargetConstants {
    pub wake_port: u16,
    pub discovery_port: u16,
    pub protocol_version: &'static str,
    pub session_init_path: &'static str,
    pub rp_key_type: u8,
}

impl ConsoleTarget {
    pub fn constants(self) -> TargetConstants {
        match self {
            ConsoleTarget::Ps4V1 => TargetConstants {
                wake_port: 987,
                discovery_port: 987,
                protocol_version: "00020020",
                session_init_path: "/sie/ps4/rp/sess/init",
                rp_key_type: 0,
            },
            ConsoleTarget::Ps5V1 => TargetConstants {
                wake_port: 9302,
                discovery_port: 9302,
                protocol_version: "00030010",
                session_init_path: "/sie/ps5/rp/sess/init",
                rp_key_type: 1,
            },
            ConsoleTarget::Ps5Future => TargetConstants {
                wake_port: 9302,
                discovery_port: 9302,
                protocol_version: "00030010",
                session_init_path: "/sie/ps5/rp/sess/init",
                rp_key_type: 2,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps5_uses_9302_and_v3_protocol_string() {
        let c = ConsoleTarget::Ps5V1.constants();
        assert_eq!(c.wake_port, 9302);
        assert_eq!(c.protocol_version, "00030010");
    }

    #[test]
    fn ps4_uses_987_and_v2_protocol_string() {
        let c = ConsoleTarget::Ps4V1.constants();
        assert_eq!(c.wake_port, 987);
        assert_eq!(c.protocol_version, "00020020");
    }
}
