//! Dial, mutual TLS, HTTP/1.1 Upgrade handshake, and mux/session
//! construction (spec §4.10, §6 "Transport bootstrap" / "TLS").
//!
//! Neither side speaks real HTTP beyond this one handshake: the Upgrade
//! exchange exists only to borrow a format firewalls and proxies already
//! understand before handing the raw, now-opaque connection to the
//! multiplexer. `httparse` parses just enough of the client's request
//! line and the server's status line to verify the handshake succeeded;
//! nothing here holds onto an HTTP connection afterwards.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, instrument};
use yamux::Mode;

use crate::config::{ClientBootstrapConfig, ServerBootstrapConfig, TlsConfig};
use crate::error::ArpcError;
use crate::mux::{MuxConfig, YamuxMux};

type TlsClientStream = tokio_rustls::client::TlsStream<TcpStream>;
type TlsServerStream = tokio_rustls::server::TlsStream<TcpStream>;

/// Loads a certificate chain and private key off disk for either TLS role.
fn load_identity(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ArpcError> {
    let cert_file = std::fs::File::open(cert_path).map_err(ArpcError::Io)?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(ArpcError::Io)?;

    let key_file = std::fs::File::open(key_path).map_err(ArpcError::Io)?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(ArpcError::Io)?
        .ok_or_else(|| ArpcError::Protocol(format!("no private key found in {key_path:?}")))?;

    Ok((certs, key))
}

fn load_root_store(ca_path: &Path) -> Result<rustls::RootCertStore, ArpcError> {
    let ca_file = std::fs::File::open(ca_path).map_err(ArpcError::Io)?;
    let ca_certs = rustls_pemfile::certs(&mut std::io::BufReader::new(ca_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(ArpcError::Io)?;

    let mut store = rustls::RootCertStore::empty();
    for cert in ca_certs {
        store.add(cert).map_err(|e| ArpcError::Protocol(format!("bad CA certificate: {e}")))?;
    }
    Ok(store)
}

/// Client side of spec §4.10: dial, complete mutual TLS, perform the
/// Upgrade handshake, hand the raw stream to a fresh [`YamuxMux`].
#[instrument(skip(tls, bootstrap))]
pub async fn dial(
    tls: &TlsConfig,
    bootstrap: &ClientBootstrapConfig,
    mux_config: MuxConfig,
) -> Result<YamuxMux<TlsClientStream>, ArpcError> {
    let (certs, key) = load_identity(&tls.cert_path, &tls.key_path)?;
    let root_store = load_root_store(&tls.ca_path)?;

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(certs, key)
        .map_err(|e| ArpcError::Protocol(format!("bad client TLS identity: {e}")))?;
    let connector = TlsConnector::from(Arc::new(tls_config));

    let tcp = TcpStream::connect(&bootstrap.endpoint).await.map_err(ArpcError::Io)?;
    tcp.set_nodelay(true).map_err(ArpcError::Io)?;

    let host = bootstrap
        .endpoint
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(&bootstrap.endpoint)
        .to_string();
    let server_name = ServerName::try_from(host)
        .map_err(|e| ArpcError::Protocol(format!("invalid server name: {e}")))?;

    let mut tls_stream = connector.connect(server_name, tcp).await.map_err(ArpcError::Io)?;

    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: tcp\r\n\
         Connection: Upgrade\r\n\
         X-Client-Identity: {identity}\r\n\
         X-Protocol-Version: {version}\r\n\
         \r\n",
        path = bootstrap.upgrade_path,
        host = bootstrap.endpoint,
        identity = bootstrap.client_identity,
        version = bootstrap.protocol_version,
    );
    tls_stream.write_all(request.as_bytes()).await.map_err(ArpcError::Io)?;
    tls_stream.flush().await.map_err(ArpcError::Io)?;

    read_http_response_head(&mut tls_stream).await?;
    info!(endpoint = %bootstrap.endpoint, "bootstrap handshake complete");

    Ok(YamuxMux::new(tls_stream, mux_config, Mode::Client))
}

/// Reads and validates the server's status line and header block,
/// stopping exactly at the blank line that ends it so no bytes belonging
/// to the mux are consumed.
async fn read_http_response_head<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Result<(), ArpcError> {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.map_err(ArpcError::Io)?;
        buf.push(byte[0]);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            break;
        }
        if buf.len() > 8 * 1024 {
            return Err(ArpcError::Protocol("bootstrap response headers too large".into()));
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; 16];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&buf)
        .map_err(|e| ArpcError::Protocol(format!("malformed bootstrap response: {e}")))?;

    match response.code {
        Some(101) => Ok(()),
        Some(code) => Err(ArpcError::Protocol(format!(
            "bootstrap upgrade rejected with status {code}"
        ))),
        None => Err(ArpcError::Protocol("incomplete bootstrap response".into())),
    }
}

/// Reads and validates the client's request line and header block up to
/// and including the Upgrade request, leaving the stream positioned at
/// the start of the mux's own bytes.
async fn read_http_request_head<S: tokio::io::AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<String, ArpcError> {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.map_err(ArpcError::Io)?;
        buf.push(byte[0]);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            break;
        }
        if buf.len() > 8 * 1024 {
            return Err(ArpcError::Protocol("bootstrap request headers too large".into()));
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; 16];
    let mut request = httparse::Request::new(&mut headers);
    request
        .parse(&buf)
        .map_err(|e| ArpcError::Protocol(format!("malformed bootstrap request: {e}")))?;

    let path = request.path.unwrap_or("").to_string();
    let has_upgrade = request
        .headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("upgrade") && h.value.eq_ignore_ascii_case(b"tcp"));
    if !has_upgrade {
        return Err(ArpcError::Protocol("bootstrap request missing Upgrade: tcp".into()));
    }
    Ok(path)
}

/// Server side of spec §4.10: accept HTTPS, authenticate the client
/// certificate (rustls verifies it against `ca_path` during the
/// handshake itself; this function only checks a certificate was
/// actually presented), hijack the connection on the configured upgrade
/// path, write `101 Switching Protocols`, hand the raw connection to a
/// fresh [`YamuxMux`].
#[instrument(skip(tls, bootstrap))]
pub async fn accept(
    tls: &TlsConfig,
    bootstrap: &ServerBootstrapConfig,
    mux_config: MuxConfig,
) -> Result<YamuxMux<TlsServerStream>, ArpcError> {
    let (certs, key) = load_identity(&tls.cert_path, &tls.key_path)?;
    let root_store = load_root_store(&tls.ca_path)?;
    let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store))
        .build()
        .map_err(|e| ArpcError::Protocol(format!("bad client verifier config: {e}")))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .map_err(|e| ArpcError::Protocol(format!("bad server TLS identity: {e}")))?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(&bootstrap.bind_addr).await.map_err(ArpcError::Io)?;
    let (tcp, peer) = listener.accept().await.map_err(ArpcError::Io)?;
    tcp.set_nodelay(true).map_err(ArpcError::Io)?;

    let mut tls_stream = acceptor.accept(tcp).await.map_err(ArpcError::Io)?;

    let (_, server_conn) = tls_stream.get_ref();
    if server_conn.peer_certificates().map(<[_]>::is_empty).unwrap_or(true) {
        return Err(ArpcError::Protocol("client presented no certificate".into()));
    }

    let path = read_http_request_head(&mut tls_stream).await?;
    if path != bootstrap.upgrade_path {
        return Err(ArpcError::Protocol(format!(
            "unexpected upgrade path {path}, want {}",
            bootstrap.upgrade_path
        )));
    }

    tls_stream
        .write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\n")
        .await
        .map_err(ArpcError::Io)?;
    tls_stream.flush().await.map_err(ArpcError::Io)?;

    info!(%peer, "bootstrap handshake complete");
    Ok(YamuxMux::new(tls_stream, mux_config, Mode::Server))
}
