pub mod digest;
pub mod types;

// Re-export primary types for convenience.
pub use digest::{DIGEST_LEN, Digest, DigestParseError};
pub use types::{
    Direction, ErrorKind, FileManifestEntry, FileOutcome, ProgressSnapshot, SessionResult,
    SessionStatus, TransferStatus,
};
