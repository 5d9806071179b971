//! TLS 证书加载与自签名生成。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::fs;
use tracing::info;

use crate::config::TlsSection;

/// 构建 Rustls 配置（证书文件缺失时生成自签名证书）。
pub async fn build_rustls_config(
    tls: &TlsSection,
    host: IpAddr,
) -> Result<RustlsConfig, std::io::Error> {
    let (cert_path, key_path) = if !tls.certfile.is_empty() && !tls.keyfile.is_empty() {
        (PathBuf::from(&tls.certfile), PathBuf::from(&tls.keyfile))
    } else {
        generate_self_signed_paths(host)?
    };

    let cert = fs::read(&cert_path).await?;
    let key = fs::read(&key_path).await?;
    RustlsConfig::from_pem(cert, key).await
}

/// 生成自签名证书并返回文件路径。
fn generate_self_signed_paths(host: IpAddr) -> Result<(PathBuf, PathBuf), std::io::Error> {
    let cert = generate_simple_self_signed([host.to_string()])
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    let cert_path = std::env::temp_dir().join("reefshare-cert.pem");
    let key_path = std::env::temp_dir().join("reefshare-key.pem");
    std::fs::write(&cert_path, cert.cert.pem())?;
    std::fs::write(&key_path, cert.key_pair.serialize_pem())?;
    info!("generated self-signed cert: {:?}", cert_path);
    Ok((cert_path, key_path))
}
