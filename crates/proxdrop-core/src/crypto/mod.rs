//! 凭据交换使用的加密：P-256 ECDH + AES-256-CTR

pub mod session;

pub use session::{SessionCipher, SessionKeys};
