use crate::message::types;

/// Which pipe a line of child output arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Substrings that mark a stderr line as a real failure. The CLI prints its
/// normal progress on stderr, so anything else there is informational.
const ERROR_MARKERS: [&str; 3] = ["error", "failed", "cannot"];

/// Map a line of watcher output to its message type.
pub fn classify(stream: StreamKind, line: &str) -> &'static str {
    match stream {
        StreamKind::Stdout => types::OUTPUT,
        StreamKind::Stderr => {
            let lower = line.to_lowercase();
            if ERROR_MARKERS.iter().any(|m| lower.contains(m)) {
                types::ERROR
            } else {
                types::OUTPUT
            }
        }
    }
}
