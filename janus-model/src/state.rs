use serde::{Deserialize, Serialize};

/// Lifecycle state of a flash job.
///
/// `Done`, `Failed` and `Cancelled` are terminal: once entered, the job
/// record never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Queued,
    Writing,
    Verifying,
    Expanding,
    Resizing,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    /// Whether this state is a sink (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Pipeline stage a job is currently executing (or last executed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Write,
    Verify,
    Expand,
    Resize,
}

/// Operator hint about the USB generation behind a grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UsbHint {
    #[serde(rename = "2.0")]
    Usb2,
    #[serde(rename = "3.0")]
    Usb3,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Writing.is_terminal());
        assert!(!JobState::Resizing.is_terminal());
    }

    #[test]
    fn serialized_forms_match_wire_protocol() {
        assert_eq!(
            serde_json::to_string(&JobState::Verifying).unwrap(),
            "\"VERIFYING\""
        );
        assert_eq!(serde_json::to_string(&JobStage::Write).unwrap(), "\"write\"");
        assert_eq!(serde_json::to_string(&UsbHint::Usb3).unwrap(), "\"3.0\"");
        assert_eq!(
            serde_json::from_str::<UsbHint>("\"unknown\"").unwrap(),
            UsbHint::Unknown
        );
    }
}
