use std::io;

/// Error taxonomy for the migration core (SPEC_FULL.md §7). Every variant is
/// fatal to the in-progress migration attempt; the core does not retry.
#[derive(thiserror::Error, Debug)]
pub enum MigrationError {
    #[error("transient I/O error reading sector {sector} ({nr_sectors} sectors): {source}")]
    TransientRead {
        sector: u64,
        nr_sectors: u32,
        #[source]
        source: io::Error,
    },

    #[error("protocol frame error: {0}")]
    ProtocolFrame(String),

    #[error("unknown block device {0:?}")]
    UnknownDevice(String),

    #[error("shared-base images are not supported on the synchronous bulk path")]
    ConfigReject,

    #[error("stream reported an error")]
    StreamError,

    #[error("failed to enqueue task")]
    EnqueueTask,
}

pub type Result<T> = std::result::Result<T, MigrationError>;
