//! Common error types.

/// Error type for cell related errors.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// There were not enough bits or refs in the cell slice.
    #[error("cell underflow")]
    CellUnderflow,
    /// There were not enough bits or refs capacity in the cell builder.
    #[error("cell overflow")]
    CellOverflow,
    /// Something tried to load a pruned branch cell.
    #[error("pruned branch access")]
    PrunedBranchAccess,
    /// Tried to read an exotic cell as an ordinary one.
    #[error("unexpected exotic cell")]
    UnexpectedExoticCell,
    /// Tried to parse an exotic structure from an ordinary cell.
    #[error("unexpected ordinary cell")]
    UnexpectedOrdinaryCell,
    /// Cell contains invalid descriptor or data.
    #[error("invalid cell")]
    InvalidCell,
    /// Data does not satisfy some constraints.
    #[error("invalid data")]
    InvalidData,
    /// Merkle proof does not contain the root cell.
    #[error("empty proof")]
    EmptyProof,
    /// Tree of cells is too deep.
    #[error("cell depth overflow")]
    DepthOverflow,
}

/// Error type for hash bytes parsing related errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseHashBytesError {
    /// Failed to parse base64 encoded bytes.
    #[cfg(feature = "base64")]
    #[error("invalid base64 string")]
    InvalidBase64(#[from] base64::DecodeSliceError),
    /// Failed to parse hex encoded bytes.
    #[error("invalid hex string")]
    InvalidHex(#[from] hex::FromHexError),
    /// Error for an unexpected string length.
    #[error("expected string of 44 or 64 bytes")]
    UnexpectedStringLength,
}
