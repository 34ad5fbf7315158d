use std::io;

/// Errors returned by volume operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid path")]
    InvalidPath,

    #[error("device not found")]
    DeviceNotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid header magic")]
    InvalidMagic,

    #[error("unsupported header version {0}")]
    UnsupportedVersion(u16),

    #[error("header checksum mismatch")]
    ChecksumMismatch,

    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("no keyslot matches the passphrase")]
    InvalidPassphrase,

    #[error("invalid keyslot {0}")]
    InvalidKeyslot(u8),

    #[error("cannot remove the last remaining keyslot")]
    NoKeyslots,

    #[error("unsupported KDF {0}")]
    UnsupportedKdf(String),

    #[error("unsupported hash {0}")]
    UnsupportedHash(String),

    #[error("unsupported cipher {0}")]
    UnsupportedCipher(String),

    #[error("invalid KDF parameter: {0}")]
    InvalidKdfParams(&'static str),

    #[error("invalid key size {0}")]
    InvalidKeySize(usize),

    #[error("invalid sector size {0}")]
    InvalidSectorSize(u32),

    #[error("invalid size")]
    InvalidSize,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("invalid token: {0}")]
    InvalidToken(&'static str),

    #[error("token {0} not found")]
    TokenNotFound(u8),

    #[error("volume {0} is already unlocked")]
    AlreadyUnlocked(String),

    #[error("volume {0} is not unlocked")]
    NotUnlocked(String),

    #[error("container is locked by another process")]
    LockBusy,

    #[error("operation not supported on this platform")]
    PlatformUnsupported,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify an I/O error from opening the container path.
    pub(crate) fn from_open(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::DeviceNotFound,
            io::ErrorKind::PermissionDenied => Error::PermissionDenied,
            _ => Error::Io(err),
        }
    }
}
