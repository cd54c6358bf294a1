/// Messaging between the orchestrator and its stage worker processes
pub mod ipc;
pub mod protocol;

pub use ipc::{IpcChannel, IpcReader, IpcWriter, DEFAULT_MAX_FRAME_LEN};
pub use protocol::{HandlerMessage, WorkerMessage};

/// IPC transport errors
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Peer connection closed")]
    PeerClosed,

    #[error("Frame too large: {size} bytes (max: {max_size})")]
    TooLarge { size: usize, max_size: usize },

    #[error("Frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[source] std::str::Utf8Error),

    #[error("Malformed frame: {source}")]
    Decode {
        frame: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Encode(#[source] serde_json::Error),
}

impl IpcError {
    /// Whether the connection is still usable after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IpcError::Decode { .. } | IpcError::TooLarge { .. } | IpcError::InvalidUtf8(_)
        )
    }
}

pub type IpcResult<T> = Result<T, IpcError>;
