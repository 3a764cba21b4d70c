pub mod aead;
pub mod constants;
pub mod error;
