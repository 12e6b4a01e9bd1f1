//! HTTPS/WSS 所用的 TLS 配置
//!
//! 发送端每次启动服务都生成新的自签名证书。接收端不校验证书链和主机名：
//! 对端身份已经由 BLE 交换和本地直连网络确定，证书只用于加密链路。

use anyhow::Context;
use native_tls::{Identity, TlsAcceptor, TlsConnector};

/// 用新生成的自签名证书构造 TLS 服务端
pub fn self_signed_acceptor() -> anyhow::Result<tokio_native_tls::TlsAcceptor> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["proxdrop.local".to_string()])
            .context("Failed to generate self-signed certificate")?;

    let identity = Identity::from_pkcs8(cert.pem().as_bytes(), key_pair.serialize_pem().as_bytes())
        .context("Failed to load TLS identity")?;
    let acceptor = TlsAcceptor::new(identity).context("Failed to build TLS acceptor")?;

    Ok(acceptor.into())
}

/// 接受任意证书的 TLS 客户端配置
pub fn insecure_connector() -> anyhow::Result<TlsConnector> {
    TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .context("Failed to build TLS connector")
}
