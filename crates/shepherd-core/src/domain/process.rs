use serde::{Deserialize, Serialize};

/// Persisted tracking entry for a spawned queue subprocess.
///
/// Entries are partitioned by `server_id`; a worker only ever reads or deletes
/// its own server's slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub server_id: String,
    pub queue_name: String,
    pub process_pid: u32,
    pub worker_pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// `None` when the process was killed by a signal and has no exit code.
    Exited(Option<i32>),
}

impl ProcessState {
    pub fn is_running(self) -> bool {
        matches!(self, ProcessState::Running)
    }
}

/// Human readable text for a shell exit code.
pub fn exit_code_text(code: Option<i32>) -> &'static str {
    match code {
        Some(0) => "OK",
        Some(1) => "General error",
        Some(2) => "Misuse of shell builtins",
        Some(126) => "Invoked command cannot execute",
        Some(127) => "Command not found",
        Some(128) => "Invalid exit argument",
        Some(129) => "Hangup",
        Some(130) => "Interrupt",
        Some(131) => "Quit and dump core",
        Some(132) => "Illegal instruction",
        Some(133) => "Trace/breakpoint trap",
        Some(134) => "Process aborted",
        Some(135) => "Bus error: \"access to undefined portion of memory object\"",
        Some(136) => "Floating point exception: \"erroneous arithmetic operation\"",
        Some(137) => "Kill (terminate immediately)",
        Some(138) => "User-defined 1",
        Some(139) => "Segmentation violation",
        Some(140) => "User-defined 2",
        Some(141) => "Write to pipe with no reader",
        Some(142) => "Signal raised by alarm",
        Some(143) => "Termination (request to terminate)",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some(0), "OK")]
    #[case(Some(1), "General error")]
    #[case(Some(127), "Command not found")]
    #[case(Some(137), "Kill (terminate immediately)")]
    #[case(Some(42), "Unknown error")]
    #[case(None, "Unknown error")]
    fn exit_codes_map_to_text(#[case] code: Option<i32>, #[case] expected: &str) {
        assert_eq!(exit_code_text(code), expected);
    }
}
