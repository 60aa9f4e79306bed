use std::{error::Error, fmt, io};

/// The pipeline's result type.
pub type Result<T> = std::result::Result<T, PipelineErr>;

/// Every failure of the training pipeline.
///
/// None of these are recovered from: they abort the run on both processes and the
/// only way back is resuming from the last epoch checkpoint.
#[derive(Debug)]
pub enum PipelineErr {
    /// A memory handle can't be mapped by this device context.
    HandleInvalid { reason: String },
    /// The peer process is gone.
    ChannelClosed { link: &'static str },
    /// A sample, mean or checkpoint tensor is missing or malformed.
    Decode { path: String, detail: String },
    /// A token or request arrived out of the expected sequence.
    ProtocolViolation {
        state: &'static str,
        expected: &'static str,
        got: &'static str,
    },
    /// The configuration was rejected at startup.
    Config(String),
    /// The compute graph failed during a step.
    Compute(String),
    /// The checkpoint store failed to read or write.
    Checkpoint { path: String, detail: String },
    Io(io::Error),
}

impl PipelineErr {
    pub(crate) fn decode(path: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self::Decode {
            path: path.into(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn handle(reason: impl Into<String>) -> Self {
        Self::HandleInvalid {
            reason: reason.into(),
        }
    }

    /// Maps a receive or send failure on `link`, a vanished peer becomes `ChannelClosed`.
    pub(crate) fn on_link(link: &'static str, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Self::ChannelClosed { link },
            _ => Self::Io(e),
        }
    }
}

impl fmt::Display for PipelineErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineErr::HandleInvalid { reason } => write!(f, "invalid memory handle: {reason}"),
            PipelineErr::ChannelClosed { link } => write!(f, "channel closed: {link}"),
            PipelineErr::Decode { path, detail } => write!(f, "failed to decode {path}: {detail}"),
            PipelineErr::ProtocolViolation {
                state,
                expected,
                got,
            } => write!(
                f,
                "protocol violation while {state}: expected {expected}, got {got}"
            ),
            PipelineErr::Config(msg) => write!(f, "invalid config: {msg}"),
            PipelineErr::Compute(msg) => write!(f, "compute step failed: {msg}"),
            PipelineErr::Checkpoint { path, detail } => {
                write!(f, "checkpoint error at {path}: {detail}")
            }
            PipelineErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for PipelineErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PipelineErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PipelineErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<PipelineErr> for io::Error {
    fn from(value: PipelineErr) -> Self {
        match value {
            PipelineErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vanished_peer_maps_to_channel_closed() {
        let e = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(
            PipelineErr::on_link("control", e),
            PipelineErr::ChannelClosed { link: "control" }
        ));

        let e = io::Error::new(io::ErrorKind::InvalidData, "garbage");
        assert!(matches!(
            PipelineErr::on_link("control", e),
            PipelineErr::Io(_)
        ));
    }
}
