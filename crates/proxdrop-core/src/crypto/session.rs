//! 会话密钥
//!
//! - 每个进程生成一次 P-256 密钥对，只对外发布公钥
//! - ECDH 原始共享密钥（32 字节）直接作为 AES-256 密钥，不经过 KDF
//! - AES-256-CTR，IV 固定为字符串 "0102030405060708" 的 ASCII 字节
//!
//! 固定 IV 是协议线格式的一部分。同一派生密钥加密多条消息时会复用密钥流，
//! 所以每次凭据交换都由发送端生成一次性密钥对。

use std::sync::{Arc, OnceLock};

use aes::cipher::{KeyIvInit, StreamCipher};
use anyhow::{Context, anyhow};
use base64::{Engine as _, engine::general_purpose};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

const AES_IV: &[u8; 16] = b"0102030405060708";

/// 本地 ECDH 密钥对
pub struct SessionKeys {
    secret: SecretKey,
    public_key_b64: String,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("public_key", &self.public_key_b64)
            .finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// 生成新的密钥对
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        // X.509 SubjectPublicKeyInfo DER，P-256 公钥固定编码为有效 DER
        let der = secret
            .public_key()
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .unwrap_or_default();

        Self {
            secret,
            public_key_b64: general_purpose::STANDARD.encode(der),
        }
    }

    /// 进程级密钥对，首次使用时生成，进程结束前不变
    pub fn process() -> Arc<SessionKeys> {
        static KEYS: OnceLock<Arc<SessionKeys>> = OnceLock::new();
        KEYS.get_or_init(|| Arc::new(SessionKeys::generate())).clone()
    }

    /// Base64 编码的公钥
    pub fn public_key(&self) -> &str {
        &self.public_key_b64
    }

    /// 用对端公钥派生会话密钥
    ///
    /// 对端公钥可以是 SPKI DER，也可以是 65 字节的 SEC1 非压缩点。
    pub fn derive_session_key(&self, peer_public_key_b64: &str) -> anyhow::Result<SessionCipher> {
        let peer_bytes = general_purpose::STANDARD
            .decode(peer_public_key_b64)
            .context("peer public key is not valid base64")?;

        let peer = if peer_bytes.len() == 65 && peer_bytes[0] == 0x04 {
            PublicKey::from_sec1_bytes(&peer_bytes)
                .map_err(|e| anyhow!("Invalid SEC1 public key: {}", e))?
        } else {
            PublicKey::from_public_key_der(&peer_bytes)
                .map_err(|e| anyhow!("Invalid SPKI public key: {}", e))?
        };

        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());

        let mut key = [0u8; 32];
        key.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(SessionCipher { key })
    }
}

/// 单次凭据交换使用的对称密钥
pub struct SessionCipher {
    key: [u8; 32],
}

impl SessionCipher {
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut buffer = plaintext.as_bytes().to_vec();
        Aes256Ctr::new(&self.key.into(), AES_IV.into()).apply_keystream(&mut buffer);
        general_purpose::STANDARD.encode(buffer)
    }

    pub fn decrypt(&self, ciphertext_b64: &str) -> anyhow::Result<String> {
        let mut buffer = general_purpose::STANDARD
            .decode(ciphertext_b64)
            .context("ciphertext is not valid base64")?;
        Aes256Ctr::new(&self.key.into(), AES_IV.into()).apply_keystream(&mut buffer);
        String::from_utf8(buffer).context("decrypted text is not UTF-8")
    }
}

impl Drop for SessionCipher {
    fn drop(&mut self) {
        self.key.fill(0);
    }
}
