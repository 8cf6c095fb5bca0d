//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Veildht crate error enum.
pub enum Error {
    /// Indicates that a key was built from a slice of the wrong length.
    #[error("Invalid key size: {0}")]
    InvalidKeySize(usize),

    /// Indicates that a tag label does not fit the fixed tag width.
    #[error("Tag label too long: {0} bytes")]
    TagTooLong(usize),
}
