//! STX/ETX framing for resumable chunked log streaming.

use crate::models::RunStatus;

const STX: u8 = 0x02;
const ETX: u8 = 0x03;

pub enum LogPhase {
    Plan,
    Apply,
}

impl LogPhase {
    /// Whether `status` is terminal for *this* phase's log stream — the plan
    /// log becomes terminal well before the run itself does.
    pub fn is_terminal_for(&self, status: RunStatus) -> bool {
        use RunStatus::*;
        match self {
            LogPhase::Plan => matches!(
                status,
                Planned | Confirmed | Applying | Applied | Errored | Discarded | Canceled
            ),
            LogPhase::Apply => matches!(status, Applied | Errored | Discarded | Canceled),
        }
    }
}

/// Frames `payload[offset..offset+limit]` with a leading STX at offset 0 and
/// a trailing ETX once the phase is terminal and the window reaches the end
/// of the stored payload.
pub fn frame_chunk(payload: &[u8], offset: usize, limit: usize, phase_terminal: bool) -> Vec<u8> {
    let end = (offset + limit).min(payload.len());
    let slice = if offset >= payload.len() { &[][..] } else { &payload[offset..end] };

    let mut out = Vec::with_capacity(slice.len() + 2);
    if offset == 0 {
        out.push(STX);
    }
    out.extend_from_slice(slice);
    if phase_terminal && offset + limit >= payload.len() {
        out.push(ETX);
    }
    out
}

/// Response for a missing blob: empty while not yet terminal, `STX+ETX`
/// (an empty-but-framed stream) once the phase has finished.
pub fn frame_missing(phase_terminal: bool) -> Vec<u8> {
    if phase_terminal {
        vec![STX, ETX]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_chunk_gets_leading_stx() {
        let chunk = frame_chunk(b"hello world", 0, 5, false);
        assert_eq!(chunk, vec![STX, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn middle_chunk_has_no_stx() {
        let chunk = frame_chunk(b"hello world", 5, 5, false);
        assert!(!chunk.contains(&STX));
    }

    #[test]
    fn last_chunk_gets_etx_only_when_terminal() {
        let not_terminal = frame_chunk(b"hello", 0, 100, false);
        assert!(!not_terminal.contains(&ETX));

        let terminal = frame_chunk(b"hello", 0, 100, true);
        assert!(terminal.ends_with(&[ETX]));
    }

    #[test]
    fn missing_blob_before_terminal_is_empty() {
        assert!(frame_missing(false).is_empty());
    }

    #[test]
    fn missing_blob_after_terminal_is_stx_etx() {
        assert_eq!(frame_missing(true), vec![STX, ETX]);
    }

    #[test]
    fn plan_log_terminal_states() {
        assert!(LogPhase::Plan.is_terminal_for(RunStatus::Planned));
        assert!(!LogPhase::Plan.is_terminal_for(RunStatus::Planning));
    }

    #[test]
    fn apply_log_terminal_states_are_narrower_than_plan() {
        assert!(!LogPhase::Apply.is_terminal_for(RunStatus::Planned));
        assert!(LogPhase::Apply.is_terminal_for(RunStatus::Applied));
    }
}
