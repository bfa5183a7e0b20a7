use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Malformed relay message: {0}")]
    Malformed(String),

    #[error("Unknown relay message type: {0}")]
    UnknownMessage(String),

    #[error("Event id mismatch: claimed {claimed}, computed {computed}")]
    IdMismatch { claimed: String, computed: String },

    #[error("Event pubkey does not match signer")]
    SignerMismatch,

    #[error("Crypto error: {0}")]
    Crypto(#[from] dm_crypto::CryptoError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
