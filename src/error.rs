use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateError {
    #[error("Target bitrate too low to fit the minimum layer overhead")]
    RateTooLow,
    #[error("Truncation point count {0} exceeds the format limit of 163")]
    TruncationPointLimit(usize),
    #[error("Destination too small")]
    DestinationTooSmall,
    #[error("Invalid parameter: decomposition levels")]
    InvalidParameterDecompositionLevels,
    #[error("Invalid parameter: code-block size")]
    InvalidParameterCodeBlockSize,
    #[error("Invalid parameter: precinct size")]
    InvalidParameterPrecinctSize,
    #[error("Invalid parameter: layer schedule")]
    InvalidParameterLayers,
    #[error("Invalid parameter: progression bounds")]
    InvalidParameterProgression,
    #[error("Invalid parameter: image or tile geometry")]
    InvalidParameterGeometry,
    #[error("Code-block does not belong to any subband of its resolution level")]
    OrphanCodeBlock,
}
