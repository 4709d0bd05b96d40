//! TLS 证书加载与自签名生成。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::fs;
use tracing::info;

use crate::config::Args;

/// 构建 Rustls 配置，纯 HTTP 时返回 `None`。证书与私钥优先于
/// `--tls-self-signed`。
pub async fn build_rustls_config(args: &Args, host: IpAddr) -> io::Result<Option<RustlsConfig>> {
    let (cert_path, key_path) = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => (PathBuf::from(cert), PathBuf::from(key)),
        (Some(_), None) | (None, Some(_)) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "--tls-cert and --tls-key must be given together",
            ));
        }
        (None, None) if args.tls_self_signed => generate_self_signed_paths(host)?,
        (None, None) => return Ok(None),
    };

    let cert = fs::read(&cert_path).await?;
    let key = fs::read(&key_path).await?;
    RustlsConfig::from_pem(cert, key).await.map(Some)
}

fn generate_self_signed_paths(host: IpAddr) -> io::Result<(PathBuf, PathBuf)> {
    let cert = generate_simple_self_signed([host.to_string(), "localhost".to_string()])
        .map_err(|err| io::Error::other(err.to_string()))?;
    let cert_path = std::env::temp_dir().join("voldrive-cert.pem");
    let key_path = std::env::temp_dir().join("voldrive-key.pem");
    std::fs::write(&cert_path, cert.cert.pem())?;
    std::fs::write(&key_path, cert.key_pair.serialize_pem())?;
    info!(path = ?cert_path, "generated self-signed certificate");
    Ok((cert_path, key_path))
}
