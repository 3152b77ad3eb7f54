//! Envelope encryption for at-rest secrets and random token generation.

pub mod generate;
pub mod keys;
pub mod seal;

pub use generate::{random_alphanumeric, random_from_alphabet};
pub use keys::{FileSecretStorage, NativeKeyProvider, SecretProvider, SecretStorage};
pub use seal::{seal, unseal, SealError, SymmetricKey, ALGORITHM_AESGCM};
