use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised by the listeners and the upstream forwarder.
///
/// Only `Bind` ever leaves a `listen_*` call; everything else ends the single
/// request that raised it and is logged by the task handling that request.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("accept tcp connection failed: {0}")]
    Accept(#[source] io::Error),

    #[error("read client query failed: {0}")]
    Read(#[source] io::Error),

    #[error("reply to {peer} failed: {source}")]
    Reply {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("dns message of {0} bytes does not fit a 16-bit length prefix")]
    Frame(usize),

    #[error("connect to upstream {upstream} failed: {source}")]
    Dial {
        upstream: String,
        #[source]
        source: io::Error,
    },

    #[error("send query to upstream {upstream} failed: {source}")]
    Send {
        upstream: String,
        #[source]
        source: io::Error,
    },

    #[error("receive response from upstream {upstream} failed: {source}")]
    Receive {
        upstream: String,
        #[source]
        source: io::Error,
    },

    #[error("upstream {upstream} round trip timed out")]
    Timeout { upstream: String },

    #[error("tls trust configuration: {0}")]
    Tls(String),
}

impl ProxyError {
    pub(crate) fn bind(addr: impl ToString, source: io::Error) -> Self {
        ProxyError::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}
