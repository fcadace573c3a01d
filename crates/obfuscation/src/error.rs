use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObfuscationError {
    #[error("{0} requires an initializer but none was supplied")]
    MissingInitializer(&'static str),

    #[error("Substitution table is not a permutation of 0..=255")]
    InvalidSubstitutionTable,

    #[error("Invalid obfuscation layer {0} (expected 1..=4)")]
    InvalidLayer(u8),

    #[error("Framed packet too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Padding length {padding} exceeds body length {available}")]
    CorruptPadding { padding: usize, available: usize },

    #[error("Combo index {index} out of range for layer {layer}")]
    ComboOutOfRange { layer: u8, index: usize },
}
