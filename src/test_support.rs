//! In-process DoT resolver used by the tests.
//!
//! Reads one length-prefixed query per connection and echoes it back framed.
//! A query whose first message byte is [`DELAY_MARKER`] is answered after
//! [`MOCK_DELAY`]; one starting with [`DROP_MARKER`] gets the connection
//! dropped without an answer. While [`MockUpstream::set_refusing`] is on,
//! connections are closed before the TLS handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use crate::upstream::Upstream;

pub const DELAY_MARKER: u8 = 0xD1;
pub const DROP_MARKER: u8 = 0xDD;
pub const MOCK_DELAY: Duration = Duration::from_millis(300);

pub struct MockUpstream {
    addr: SocketAddr,
    cert: CertificateDer<'static>,
    received: mpsc::UnboundedReceiver<Vec<u8>>,
    refusing: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let key = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("self-signed cert");
        let cert = key.cert.der().clone();
        let private = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()));

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], private)
            .expect("server config");
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        let (tx, received) = mpsc::unbounded_channel();
        let refusing = Arc::new(AtomicBool::new(false));

        let refuse = Arc::clone(&refusing);
        let task = tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };
                if refuse.load(Ordering::SeqCst) {
                    drop(tcp);
                    continue;
                }
                let acceptor = acceptor.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    let mut len_buf = [0u8; 2];
                    if tls.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let mut msg = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                    if tls.read_exact(&mut msg).await.is_err() {
                        return;
                    }

                    let mut framed = len_buf.to_vec();
                    framed.extend_from_slice(&msg);
                    let _ = tx.send(framed.clone());

                    match msg.first() {
                        Some(&DROP_MARKER) => return,
                        Some(&DELAY_MARKER) => tokio::time::sleep(MOCK_DELAY).await,
                        _ => {}
                    }
                    if tls.write_all(&framed).await.is_ok() {
                        let _ = tls.shutdown().await;
                    }
                });
            }
        });

        Self {
            addr,
            cert,
            received,
            refusing,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_refusing(&self, on: bool) {
        self.refusing.store(on, Ordering::SeqCst);
    }

    /// Upstream pointed at this mock and trusting its certificate.
    pub fn upstream(&self) -> Upstream {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.cert.clone()).expect("trust mock cert");
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Upstream::new(self.addr.to_string())
            .with_tls_name("localhost")
            .with_tls_config(Arc::new(config))
    }

    /// Next framed query the mock read off the wire.
    pub async fn next_query(&mut self) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(2), self.received.recv())
            .await
            .expect("mock saw no query")
            .expect("mock channel closed")
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}
