use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::config::TlsPaths;

/// Build the acceptor for pgwire's TLS upgrade. `None` keeps the server on
/// plaintext.
pub fn load_tls_acceptor(paths: Option<&TlsPaths>) -> io::Result<Option<TlsAcceptor>> {
    let Some(paths) = paths else {
        return Ok(None);
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(open(&paths.cert)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates in {}", paths.cert.display()),
        ));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(open(&paths.key)?))?.ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("no private key in {}", paths.key.display()),
        )
    })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn open(path: &Path) -> io::Result<File> {
    File::open(path).map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}
