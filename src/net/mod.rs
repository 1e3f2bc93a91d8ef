//! RPC plumbing: length-prefixed frames over TCP, mutual TLS when an
//! identity is configured.

#![cfg(feature = "net")]

mod frame;
mod server;
mod tls;

pub use frame::{read_frame, write_frame, MAX_FRAME_LEN};
pub use server::{RpcClient, RpcServer, RpcServerConfig, RpcServerHandle};
pub use tls::{load_identity_from_pem, load_trust_store_from_pem, TlsIdentity, TlsTrustStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame of {observed} bytes exceeds limit {limit}")]
    FrameTooLarge { observed: usize, limit: usize },

    #[error("connection closed by peer")]
    Closed,
}
