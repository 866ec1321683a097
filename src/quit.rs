//! Quit reasons and their classification (spec.md §3 `QuitReason`, §4.F,
//! §7 user-visible messages).

/// Closed set of reasons the console or control plane gives for ending a
/// session. Additional raw reasons observed on the wire but not in this set
/// fall back to `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuitReason {
    SessionRequestUnknown,
    SessionRequestConnectionRefused,
    SessionRequestRpInUse,
    SessionRequestRpCrash,
    PsnRegistFailed,
    Normal,
    Stopped,
    Other(String),
}

impl QuitReason {
    /// During CONNECTING/AUTHENTICATING, only these reasons promote the
    /// session to ERROR; everything else is logged and ignored (spec.md
    /// §4.F "Quit handling").
    ///
    /// This is an explicit, closed list drawn from spec.md §9's open
    /// question about the critical-during-setup set; see `DESIGN.md` for
    /// why these five and not others.
    pub fn is_critical_during_setup(&self) -> bool {
        matches!(
            self,
            QuitReason::SessionRequestUnknown
                | QuitReason::SessionRequestConnectionRefused
                | QuitReason::SessionRequestRpInUse
                | QuitReason::SessionRequestRpCrash
                | QuitReason::PsnRegistFailed
        )
    }

    /// While STREAMING, any reason other than a graceful stop is an error
    /// (spec.md §4.F: "In STREAMING, any error quit reason promotes to
    /// ERROR").
    pub fn is_error_during_streaming(&self) -> bool {
        !matches!(self, QuitReason::Normal | QuitReason::Stopped)
    }

    /// Fixed, human-readable text for known reasons; unclassified reasons
    /// pass their raw text through verbatim (spec.md §7).
    pub fn user_message(&self) -> String {
        match self {
            QuitReason::SessionRequestUnknown => "An unknown error occurred".to_string(),
            QuitReason::SessionRequestConnectionRefused => {
                "The connection to the console was refused".to_string()
            }
            QuitReason::SessionRequestRpInUse => {
                "Remote Play is already in use by another device".to_string()
            }
            QuitReason::SessionRequestRpCrash => {
                "Remote Play crashed on the console".to_string()
            }
            QuitReason::PsnRegistFailed => "PSN account verification failed".to_string(),
            QuitReason::Normal => "The session ended normally".to_string(),
            QuitReason::Stopped => "The session was stopped".to_string(),
            QuitReason::Other(raw) => raw.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_reasons_are_exactly_the_documented_five() {
        let critical = [
            QuitReason::SessionRequestUnknown,
            QuitReason::SessionRequestConnectionRefused,
            QuitReason::SessionRequestRpInUse,
            QuitReason::SessionRequestRpCrash,
            QuitReason::PsnRegistFailed,
        ];
        for reason in critical {
            assert!(reason.is_critical_during_setup(), "{reason:?} should be critical");
        }
        assert!(!QuitReason::Normal.is_critical_during_setup());
        assert!(!QuitReason::Stopped.is_critical_during_setup());
        assert!(!QuitReason::Other("vendor_specific".into()).is_critical_during_setup());
    }

    #[test]
    fn only_normal_and_stopped_are_non_error_during_streaming() {
        assert!(!QuitReason::Normal.is_error_during_streaming());
        assert!(!QuitReason::Stopped.is_error_during_streaming());
        assert!(QuitReason::SessionRequestRpCrash.is_error_during_streaming());
        assert!(QuitReason::Other("weird".into()).is_error_during_streaming());
    }

    #[test]
    fn unclassified_reason_passes_text_through_verbatim() {
        let reason = QuitReason::Other("vendor-specific-code-77".into());
        assert_eq!(reason.user_message(), "vendor-specific-code-77");
    }

    #[test]
    fn rp_in_use_maps_to_documented_message() {
        assert_eq!(
            QuitReason::SessionRequestRpInUse.user_message(),
            "Remote Play is already in use by another device"
        );
    }
}
