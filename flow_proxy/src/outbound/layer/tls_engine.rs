//! The TLS state machine the pump drives. Only the byte plumbing lives here;
//! record processing and cryptography belong to the engine.

use crate::{utils::HostName, Error, Result};

use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use once_cell::sync::Lazy;
use tokio_rustls::rustls::{self, ClientConfig, ClientConnection, RootCertStore, ServerName};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeAction {
    /// More ciphertext must be exchanged with the peer.
    WantIo,
    Done,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Plaintext {
    Data(Vec<u8>),
    /// Nothing decrypted yet; feed more ciphertext.
    WantRead,
    /// The peer sent close_notify.
    Closed,
}

pub trait TlsEngine {
    /// Must be called once before the handshake starts.
    fn set_server_name(&mut self, host: &HostName) -> Result<()>;

    /// Runs one handshake step over the ciphertext fed so far.
    fn handshake(&mut self) -> Result<HandshakeAction>;

    fn feed_ciphertext(&mut self, data: &[u8]) -> Result<()>;

    /// Drains ciphertext waiting to be sent; empty when there is none.
    fn take_ciphertext(&mut self) -> Result<Vec<u8>>;

    /// Returns how many bytes of `data` the engine accepted.
    fn write_plaintext(&mut self, data: &[u8]) -> Result<usize>;

    fn take_plaintext(&mut self, max: usize) -> Result<Plaintext>;

    fn send_close_notify(&mut self);
}

static CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let mut certs = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(native) => {
            for cert in native {
                let _ = certs.add(&rustls::Certificate(cert.0));
            }
        }
        Err(e) => log::warn!("could not load native root certificates: {}", e),
    }

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(certs)
        .with_no_client_auth();
    Arc::new(config)
});

/// [`TlsEngine`] backed by a rustls client connection verified against the
/// platform's root certificates.
#[derive(Default)]
pub struct RustlsEngine {
    conn: Option<ClientConnection>,
}

impl RustlsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn conn(&mut self) -> Result<&mut ClientConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Tls("server name not set".into()))
    }
}

impl TlsEngine for RustlsEngine {
    fn set_server_name(&mut self, host: &HostName) -> Result<()> {
        let name = match host.ip() {
            Some(ip) => ServerName::IpAddress(ip),
            None => ServerName::try_from(host.to_string().as_str())
                .map_err(|e| Error::Tls(e.to_string()))?,
        };
        let mut conn = ClientConnection::new(CONFIG.clone(), name)?;
        conn.set_buffer_limit(None);
        self.conn = Some(conn);
        Ok(())
    }

    fn handshake(&mut self) -> Result<HandshakeAction> {
        let conn = self.conn()?;
        Ok(if conn.is_handshaking() {
            HandshakeAction::WantIo
        } else {
            HandshakeAction::Done
        })
    }

    fn feed_ciphertext(&mut self, mut data: &[u8]) -> Result<()> {
        let conn = self.conn()?;
        while !data.is_empty() {
            if conn.read_tls(&mut data)? == 0 {
                break;
            }
            conn.process_new_packets()?;
        }
        Ok(())
    }

    fn take_ciphertext(&mut self) -> Result<Vec<u8>> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        while conn.wants_write() {
            conn.write_tls(&mut out)?;
        }
        Ok(out)
    }

    fn write_plaintext(&mut self, data: &[u8]) -> Result<usize> {
        let conn = self.conn()?;
        conn.writer().write_all(data)?;
        Ok(data.len())
    }

    fn take_plaintext(&mut self, max: usize) -> Result<Plaintext> {
        let conn = self.conn()?;
        let mut buf = vec![0; max];
        match conn.reader().read(&mut buf) {
            Ok(0) => Ok(Plaintext::Closed),
            Ok(n) => {
                buf.truncate(n);
                Ok(Plaintext::Data(buf))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Plaintext::WantRead),
            Err(e) => Err(e.into()),
        }
    }

    fn send_close_notify(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.send_close_notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_is_produced_first() {
        let mut engine = RustlsEngine::new();
        assert!(engine.handshake().is_err());

        engine
            .set_server_name(&HostName::Domain("example.com".into()))
            .unwrap();
        assert_eq!(engine.handshake().unwrap(), HandshakeAction::WantIo);

        let hello = engine.take_ciphertext().unwrap();
        // handshake record, TLS 1.x
        assert_eq!(hello[0], 0x16);
        assert_eq!(hello[1], 0x03);
        assert!(engine.take_ciphertext().unwrap().is_empty());
        assert_eq!(engine.take_plaintext(16).unwrap(), Plaintext::WantRead);
    }

    #[test]
    fn garbage_from_server_fails() {
        let mut engine = RustlsEngine::new();
        engine
            .set_server_name(&HostName::V4([127, 0, 0, 1].into()))
            .unwrap();
        engine.take_ciphertext().unwrap();
        assert!(engine.feed_ciphertext(b"definitely not tls\r\n\r\n").is_err());
    }
}
