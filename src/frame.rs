//! line classification for the `data:`-framed response protocol.

/// prefix of a data frame. the single space after the colon is optional.
pub const DATA_PREFIX: &str = "data:";
/// payload that marks normal end of stream.
pub const TERMINAL_SENTINEL: &str = "[DONE]";

/// one classified line of the response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `: ...` keepalive or comment.
    Comment,
    /// empty or whitespace-only line.
    Blank,
    /// a `data:` line, payload trimmed.
    Data(String),
    /// `data: [DONE]`.
    Terminal,
    /// any other frame type (`event:`, `id:`, garbage). skipped.
    Other,
}

impl Frame {
    /// frames the session acts on; everything else is dropped silently.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Frame::Data(_) | Frame::Terminal)
    }
}

pub fn classify(line: &str) -> Frame {
    if line.trim().is_empty() {
        return Frame::Blank;
    }
    if line.starts_with(':') {
        return Frame::Comment;
    }
    let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
        return Frame::Other;
    };
    let payload = rest.trim();
    if payload == TERMINAL_SENTINEL {
        Frame::Terminal
    } else {
        Frame::Data(payload.to_string())
    }
}
