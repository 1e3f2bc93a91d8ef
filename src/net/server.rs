use super::frame::{read_frame, write_frame};
use super::tls::{TlsIdentity, TlsTrustStore};
use super::NetError;
use crate::scm::RpcHandler;
use crate::wire::{decode_message, encode_message, RpcReply, RpcRequest};
use log::{info, warn};
use rustls::client::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection, Stream};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub struct RpcServerConfig {
    pub bind: SocketAddr,
    /// Mutual TLS; `None` serves plaintext (insecure clusters only).
    pub tls: Option<(TlsIdentity, TlsTrustStore)>,
}

pub struct RpcServerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl RpcServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Blocking datanode/client RPC server: accept loop on one thread, one
/// thread per connection, frames dispatched to the [`RpcHandler`].
pub struct RpcServer;

impl RpcServer {
    pub fn spawn(
        config: RpcServerConfig,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<RpcServerHandle, NetError> {
        let listener = TcpListener::bind(config.bind)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let tls_config = match &config.tls {
            Some((identity, trust)) => Some(Arc::new(identity.server_config(trust)?)),
            None => None,
        };
        info!(
            "event=rpc_server_listen addr={local_addr} tls={}",
            tls_config.is_some()
        );
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let join = thread::spawn(move || {
            while !shutdown_flag.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        let tls = tls_config.clone();
                        thread::spawn(move || {
                            let outcome = match tls {
                                Some(tls) => serve_tls(stream, tls, handler),
                                None => serve_plain(stream, handler),
                            };
                            if let Err(err) = outcome {
                                if !matches!(err, NetError::Closed) {
                                    warn!("event=rpc_connection_error peer={peer} error={err}");
                                }
                            }
                        });
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(25));
                    }
                    Err(err) => {
                        warn!("event=rpc_accept_error addr={local_addr} error={err}");
                        break;
                    }
                }
            }
        });
        Ok(RpcServerHandle {
            shutdown,
            join: Some(join),
            local_addr,
        })
    }
}

fn serve_plain(mut stream: TcpStream, handler: Arc<dyn RpcHandler>) -> Result<(), NetError> {
    stream.set_nodelay(true)?;
    loop {
        let payload = read_frame(&mut stream)?;
        let reply = dispatch(&payload, handler.as_ref());
        write_frame(&mut stream, &reply)?;
    }
}

fn serve_tls(
    mut stream: TcpStream,
    tls: Arc<ServerConfig>,
    handler: Arc<dyn RpcHandler>,
) -> Result<(), NetError> {
    stream.set_nodelay(true)?;
    let mut connection = ServerConnection::new(tls)?;
    let mut tls_stream = Stream::new(&mut connection, &mut stream);
    loop {
        let payload = read_frame(&mut tls_stream)?;
        let reply = dispatch(&payload, handler.as_ref());
        write_frame(&mut tls_stream, &reply)?;
    }
}

fn dispatch(payload: &[u8], handler: &dyn RpcHandler) -> Vec<u8> {
    let reply = match decode_message::<RpcRequest>(payload) {
        Ok(request) => handler.handle(request),
        Err(err) => RpcReply {
            request_id: 0,
            code: err.result_code(),
            message: err.to_string(),
            body: None,
        },
    };
    encode_message(&reply)
}

/// Minimal blocking client for the framed RPC surface. Reconnects lazily
/// after transport errors; request ids are per-client monotonic.
pub struct RpcClient {
    addr: SocketAddr,
    server_name: ServerName,
    tls: Option<Arc<ClientConfig>>,
    stream: Option<TcpStream>,
    tls_session: Option<ClientConnection>,
    next_request_id: AtomicU64,
}

impl RpcClient {
    pub fn connect(addr: SocketAddr) -> Self {
        Self {
            addr,
            server_name: ServerName::try_from("localhost").expect("static server name parses"),
            tls: None,
            stream: None,
            tls_session: None,
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn connect_tls(
        addr: SocketAddr,
        host: &str,
        identity: &TlsIdentity,
        trust: &TlsTrustStore,
    ) -> Result<Self, NetError> {
        let config = identity.client_config(trust)?;
        let server_name = ServerName::try_from(host)
            .map_err(|_| NetError::Certificate(format!("host `{host}` is not a valid DNS name")))?;
        Ok(Self {
            addr,
            server_name,
            tls: Some(Arc::new(config)),
            stream: None,
            tls_session: None,
            next_request_id: AtomicU64::new(1),
        })
    }

    pub fn call(&mut self, mut request: RpcRequest) -> Result<RpcReply, NetError> {
        if request.request_id == 0 {
            request.request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        }
        let payload = encode_message(&request);
        match self.exchange(&payload) {
            Ok(raw) => decode_message(&raw).map_err(|err| NetError::Protocol(err.to_string())),
            Err(err) => {
                // Drop the session so the next call redials.
                self.stream = None;
                self.tls_session = None;
                Err(err)
            }
        }
    }

    fn exchange(&mut self, payload: &[u8]) -> Result<Vec<u8>, NetError> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(self.addr)?;
            stream.set_nodelay(true)?;
            if let Some(config) = &self.tls {
                self.tls_session = Some(ClientConnection::new(
                    config.clone(),
                    self.server_name.clone(),
                )?);
            }
            self.stream = Some(stream);
        }
        let stream = self.stream.as_mut().expect("stream just ensured");
        match self.tls_session.as_mut() {
            Some(session) => {
                let mut tls_stream = Stream::new(session, stream);
                write_frame(&mut tls_stream, payload)?;
                read_frame(&mut tls_stream)
            }
            None => {
                write_frame(stream, payload)?;
                read_frame(stream)
            }
        }
    }
}
