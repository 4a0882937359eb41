//! The listening side of the proxy.
//!
//! [`ProxyServer::bind`] prepares the certificate authority and the listener,
//! [`ProxyServer::run`] then accepts connections until the process is asked to
//! terminate. Each accepted socket gets the next connection id, counting from 0.
//!
//! ```no_run
//! use std::sync::Arc;
//! use micro_proxy::callbacks::PassthroughCallbacks;
//! use micro_proxy::config::ProxyConfig;
//! use micro_proxy::server::ProxyServer;
//!
//! # async fn serve() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProxyConfig::builder().address("127.0.0.1").port(3128).build()?;
//! let server = ProxyServer::bind(config, Arc::new(PassthroughCallbacks)).await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::callbacks::{ConnectionId, ProxyCallbacks};
use crate::cert::{CertError, CertificateAuthority, DomainCertificates};
use crate::config::ProxyConfig;
use crate::connection::{Connection, ConnectionContext, ConnectionManager};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("certificate authority error: {source}")]
    Cert {
        #[from]
        source: CertError,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct ProxyServer {
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    certificates: Arc<DomainCertificates>,
    manager: Arc<ConnectionManager>,
}

impl ProxyServer {
    /// Loads or generates the CA, then binds the listener.
    pub async fn bind<C: ProxyCallbacks>(config: ProxyConfig, callbacks: Arc<C>) -> Result<Self, ServerError> {
        let authority = CertificateAuthority::load_or_generate(
            config.ca_key_path(),
            config.ca_cert_path(),
            config.ca_common_name(),
            config.ca_organization(),
        )?;
        let certificates = Arc::new(DomainCertificates::new(authority));

        let listener = TcpListener::bind((config.address(), config.port())).await?;

        let context = Arc::new(ConnectionContext {
            callbacks,
            certificates: Arc::clone(&certificates),
            upstream_tls: Arc::clone(config.upstream_tls()),
            read_buffer_size: config.read_buffer_size(),
        });

        Ok(Self { listener, context, certificates, manager: Arc::new(ConnectionManager::new()) })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn certificates(&self) -> &Arc<DomainCertificates> {
        &self.certificates
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Serves until SIGINT, or SIGTERM on unix.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(shutdown_signal()).await
    }

    /// Serves until `shutdown` completes, then stops every connection and waits for them.
    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) -> Result<(), ServerError> {
        let address = self.listener.local_addr()?;
        info!(%address, "proxy listening");
        self.context.callbacks.on_ready(address.port());

        tokio::pin!(shutdown);
        let mut next_id: ConnectionId = 0;
        loop {
            select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let id = next_id;
                        next_id += 1;
                        debug!(connection_id = id, %remote, "accepted connection");
                        let connection = Connection::new(id, stream, Arc::clone(&self.context), CancellationToken::new());
                        self.manager.start(connection);
                    }
                    Err(e) => warn!(cause = %e, "failed to accept"),
                },
            }
        }

        info!(%address, "proxy shutting down");
        drop(self.listener);
        self.manager.stop_all();
        self.manager.wait().await;
        info!(connections = next_id, "proxy stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(cause = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(cause = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{
        ConnectParams, PassthroughCallbacks, RequestId, RequestPreBodyParams, ResponseBodyParams, ResponsePreBodyParams,
        write_200_response_with_length,
    };
    use crate::codec::{RequestPreBodyDecoder, ResponsePreBodyDecoder};
    use crate::protocol::{RequestPreBody, ResponsePreBody};
    use async_trait::async_trait;
    use bytes::{Bytes, BytesMut};
    use futures::StreamExt;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, RootCertStore};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::{mpsc, oneshot};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tokio_util::codec::{Decoder, FramedRead};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Ready,
        Connection(ConnectionId),
        ResponseFinished(ConnectionId, RequestId),
        ConnectionFinished(ConnectionId),
        /// `queued` is set when response bytes were still waiting to be written.
        ResponseBody { has_more: bool, body: Bytes, queued: bool },
    }

    #[derive(Default)]
    struct Recorder {
        bump: bool,
        reject_continue: bool,
        refuse_after_continue: bool,
        send_response_immediately: bool,
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn record(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProxyCallbacks for Recorder {
        fn on_ready(&self, _port: u16) {
            self.record(Event::Ready);
        }

        async fn on_connection(&self, connection_id: ConnectionId) {
            self.record(Event::Connection(connection_id));
        }

        async fn on_connect_method(&self, _params: &mut ConnectParams<'_>) -> bool {
            self.bump
        }

        async fn on_request_pre_body(&self, params: &mut RequestPreBodyParams<'_>) -> bool {
            if params.request.uri == "/def/" {
                write_200_response_with_length(params.request, params.response, "local", params.downstream);
            } else if self.reject_continue && params.request.expects_continue() {
                *params.expect_body_continue_from_downstream = false;
                params.downstream.push("HTTP/1.1 417 Expectation Failed\r\nContent-Length: 0\r\n\r\n");
            } else {
                *params.upstream = params.request.to_buffers();
            }
            false
        }

        async fn on_response_pre_body(&self, params: &mut ResponsePreBodyParams<'_>) -> bool {
            if self.refuse_after_continue && params.response.is_continue() {
                *params.expect_body_continue_from_downstream = false;
                return false;
            }
            *params.downstream = params.response.to_buffers();
            self.send_response_immediately
        }

        async fn on_response_body_some(&self, params: &mut ResponseBodyParams<'_>) {
            self.record(Event::ResponseBody {
                has_more: params.has_more,
                body: params.body.clone(),
                queued: !params.downstream.is_empty(),
            });
            PassthroughCallbacks.on_response_body_some(params).await;
        }

        async fn on_response_finished(&self, connection_id: ConnectionId, request_id: RequestId) {
            self.record(Event::ResponseFinished(connection_id, request_id));
        }

        fn on_connection_finished(&self, connection_id: ConnectionId) {
            self.record(Event::ConnectionFinished(connection_id));
        }
    }

    struct Proxy {
        address: SocketAddr,
        certificates: Arc<DomainCertificates>,
        shutdown: oneshot::Sender<()>,
        handle: JoinHandle<Result<(), ServerError>>,
        _ca_dir: TempDir,
    }

    impl Proxy {
        async fn start(callbacks: Arc<Recorder>, upstream_tls: Option<Arc<ClientConfig>>) -> Self {
            Self::start_with(callbacks, upstream_tls, 64).await
        }

        async fn start_with(
            callbacks: Arc<Recorder>,
            upstream_tls: Option<Arc<ClientConfig>>,
            read_buffer_size: usize,
        ) -> Self {
            let ca_dir = tempfile::tempdir().unwrap();
            let mut builder = ProxyConfig::builder()
                .address("127.0.0.1")
                .port(0)
                .ca_key_path(ca_dir.path().join("ca.key"))
                .ca_cert_path(ca_dir.path().join("ca.pem"))
                .read_buffer_size(read_buffer_size);
            if let Some(upstream_tls) = upstream_tls {
                builder = builder.upstream_tls(upstream_tls);
            }

            let server = ProxyServer::bind(builder.build().unwrap(), callbacks).await.unwrap();
            let address = server.local_addr().unwrap();
            let certificates = Arc::clone(server.certificates());
            let (shutdown, stopped) = oneshot::channel();
            let handle = tokio::spawn(server.run_until(async {
                let _ = stopped.await;
            }));

            Self { address, certificates, shutdown, handle, _ca_dir: ca_dir }
        }

        async fn stop(self) {
            self.shutdown.send(()).unwrap();
            self.handle.await.unwrap().unwrap();
        }
    }

    /// Reads a response whose body is framed by `Content-Length`.
    async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (ResponsePreBody, Bytes) {
        read_buffered_response(stream, &mut BytesMut::new()).await
    }

    /// Like [`read_response`], keeping what follows the response in `buffer`.
    async fn read_buffered_response<S: AsyncRead + Unpin>(
        stream: &mut S,
        buffer: &mut BytesMut,
    ) -> (ResponsePreBody, Bytes) {
        let mut decoder = ResponsePreBodyDecoder::new();
        let response = loop {
            if let Some(response) = decoder.decode(buffer).unwrap() {
                break response;
            }
            assert!(stream.read_buf(buffer).await.unwrap() > 0, "closed before the response");
        };

        let length: usize =
            response.headers.get("content-length").map_or(0, |value| std::str::from_utf8(value).unwrap().parse().unwrap());
        while buffer.len() < length {
            assert!(stream.read_buf(buffer).await.unwrap() > 0, "closed before the body");
        }
        (response, buffer.split_to(length).freeze())
    }

    /// An upstream answering every request with `hello`, reporting what it received.
    async fn hello_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<RequestPreBody>, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = mpsc::unbounded_channel();

        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let sender = sender.clone();
                tokio::spawn(async move {
                    let mut framed = FramedRead::new(stream, RequestPreBodyDecoder::new());
                    while let Some(Ok(request)) = framed.next().await {
                        sender.send(request).unwrap();
                        framed.get_mut().write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await.unwrap();
                    }
                });
            }
        });

        (address, receiver, accepted)
    }

    /// Reads from `stream` into `buffer` until it holds `needle`.
    async fn read_until<S: AsyncRead + Unpin>(stream: &mut S, buffer: &mut BytesMut, needle: &[u8]) {
        while !buffer.windows(needle.len()).any(|window| window == needle) {
            assert!(stream.read_buf(buffer).await.unwrap() > 0, "closed before {needle:?}");
        }
    }

    /// An upstream that answers the request head with `100 Continue`, then waits for
    /// the 5 byte body `hello` before answering `ok`. Reports everything it received.
    async fn continue_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<BytesMut>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let sender = sender.clone();
                tokio::spawn(async move {
                    let mut buffer = BytesMut::new();
                    read_until(&mut stream, &mut buffer, b"\r\n\r\n").await;
                    stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.unwrap();
                    read_until(&mut stream, &mut buffer, b"\r\n\r\nhello").await;
                    stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await.unwrap();
                    sender.send(buffer).unwrap();
                    let _ = stream.read(&mut [0; 1]).await;
                });
            }
        });

        (address, receiver)
    }

    /// An upstream answering the first request head with the raw `response`.
    async fn raw_upstream(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_until(&mut stream, &mut BytesMut::new(), b"\r\n\r\n").await;
            stream.write_all(response).await.unwrap();
            let _ = stream.read(&mut [0; 1]).await;
        });
        address
    }

    #[tokio::test]
    async fn test_keep_alive_forwarding() {
        let (upstream, mut requests, accepted) = hello_upstream().await;
        let callbacks = Arc::new(Recorder::default());
        let proxy = Proxy::start(Arc::clone(&callbacks), None).await;

        let mut client = TcpStream::connect(proxy.address).await.unwrap();
        for path in ["/a", "/b?q=1"] {
            let request = format!(
                "GET http://{upstream}{path} HTTP/1.1\r\nHost: {upstream}\r\nProxy-Connection: keep-alive\r\n\r\n"
            );
            client.write_all(request.as_bytes()).await.unwrap();

            let (response, body) = read_response(&mut client).await;
            assert_eq!(response.code, "200");
            assert_eq!(body, "hello");

            let forwarded = requests.recv().await.unwrap();
            assert_eq!(forwarded.uri, path);
            assert_eq!(forwarded.headers.get("connection").unwrap(), "keep-alive");
            assert!(!forwarded.headers.contains("proxy-connection"));
            let wire = forwarded.to_buffers().concat();
            let expected = format!("GET {path} HTTP/1.1\r\nHost: {upstream}\r\nConnection: keep-alive\r\n\r\n");
            assert_eq!(wire, expected.as_str());
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        drop(client);
        proxy.stop().await;

        let events = callbacks.events();
        assert_eq!(events[0], Event::Ready);
        assert!(events.contains(&Event::Connection(0)));
        assert!(events.contains(&Event::ResponseFinished(0, 0)));
        assert!(events.contains(&Event::ResponseFinished(0, 1)));
        assert_eq!(events.last(), Some(&Event::ConnectionFinished(0)));
    }

    #[tokio::test]
    async fn test_synthesized_response() {
        let callbacks = Arc::new(Recorder::default());
        let proxy = Proxy::start(Arc::clone(&callbacks), None).await;

        let mut client = TcpStream::connect(proxy.address).await.unwrap();
        client.write_all(b"GET http://127.0.0.1:1/def/ HTTP/1.1\r\n\r\n").await.unwrap();

        let (response, body) = read_response(&mut client).await;
        assert_eq!(response.version, "HTTP/1.1");
        assert_eq!(response.reason, "OK");
        assert_eq!(response.headers.get("content-length").unwrap(), "5");
        assert_eq!(body, "local");

        drop(client);
        proxy.stop().await;
        assert!(callbacks.events().contains(&Event::ResponseFinished(0, 0)));
    }

    #[tokio::test]
    async fn test_continue_rejected_by_callback() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_address = upstream.local_addr().unwrap();
        let callbacks = Arc::new(Recorder { reject_continue: true, ..Recorder::default() });
        let proxy = Proxy::start(Arc::clone(&callbacks), None).await;

        let mut client = TcpStream::connect(proxy.address).await.unwrap();
        let request = format!(
            "POST http://{upstream_address}/upload HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let (response, body) = read_response(&mut client).await;
        assert_eq!(response.code, "417");
        assert!(body.is_empty());

        // the connection stays usable
        client.write_all(b"GET http://127.0.0.1:1/def/ HTTP/1.1\r\n\r\n").await.unwrap();
        let (_, body) = read_response(&mut client).await;
        assert_eq!(body, "local");

        assert!(timeout(Duration::from_millis(100), upstream.accept()).await.is_err());

        drop(client);
        proxy.stop().await;
        let events = callbacks.events();
        assert!(events.contains(&Event::ResponseFinished(0, 0)));
        assert!(events.contains(&Event::ResponseFinished(0, 1)));
    }

    #[tokio::test]
    async fn test_response_without_framing_ends_with_upstream() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_address = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = upstream.accept().await.unwrap();
            let mut framed = FramedRead::new(stream, RequestPreBodyDecoder::new());
            framed.next().await.unwrap().unwrap();
            let mut stream = framed.into_inner();
            stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\npartial body").await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let callbacks = Arc::new(Recorder::default());
        let proxy = Proxy::start(Arc::clone(&callbacks), None).await;

        let mut client = TcpStream::connect(proxy.address).await.unwrap();
        client.write_all(format!("GET http://{upstream_address}/stream HTTP/1.1\r\n\r\n").as_bytes()).await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\npartial body");

        proxy.stop().await;
        let events = callbacks.events();
        let bodies: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Event::ResponseBody { has_more, body, .. } => Some((*has_more, body.clone())),
                _ => None,
            })
            .collect();
        let (last_has_more, _) = bodies.last().unwrap();
        assert!(!last_has_more);
        assert_eq!(bodies.iter().filter(|(has_more, _)| !has_more).count(), 1);
        let forwarded: Vec<u8> = bodies.iter().flat_map(|(_, body)| body.to_vec()).collect();
        assert_eq!(forwarded, b"partial body");
        assert!(events.contains(&Event::ResponseFinished(0, 0)));
    }

    #[tokio::test]
    async fn test_tunnel() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_address = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let (mut reader, mut writer) = stream.split();
            tokio::io::copy(&mut reader, &mut writer).await.unwrap();
        });

        let callbacks = Arc::new(Recorder::default());
        let proxy = Proxy::start(Arc::clone(&callbacks), None).await;

        let mut client = TcpStream::connect(proxy.address).await.unwrap();
        client.write_all(format!("CONNECT {upstream_address} HTTP/1.1\r\n\r\n").as_bytes()).await.unwrap();

        let established = b"HTTP/1.1 200 Connection established\r\n\r\n";
        let mut reply = vec![0; established.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, established);

        let sent = b"\x16\x03\x01 not http at all";
        client.write_all(sent).await.unwrap();
        let mut echoed = vec![0; sent.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, sent);

        drop(client);
        proxy.stop().await;

        let events = callbacks.events();
        assert!(!events.iter().any(|event| matches!(event, Event::ResponseFinished(..))));
        assert!(events.contains(&Event::ConnectionFinished(0)));
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let callbacks = Arc::new(Recorder::default());
        let proxy = Proxy::start(Arc::clone(&callbacks), None).await;

        for request in [
            &b"G\x01T http://127.0.0.1:1/ HTTP/1.1\r\n\r\n"[..],
            b"CONNECT example.com HTTP/1.1\r\n\r\n",
            b"CONNECT example.com:99999 HTTP/1.1\r\n\r\n",
            b"POST http://127.0.0.1:1/ HTTP/1.1\r\nContent-Length: 12ab\r\n\r\n",
        ] {
            let mut client = TcpStream::connect(proxy.address).await.unwrap();
            client.write_all(request).await.unwrap();

            let mut received = Vec::new();
            client.read_to_end(&mut received).await.unwrap();
            let received = String::from_utf8(received).unwrap();
            assert!(received.starts_with("HTTP/1.0 400 Bad Request\r\n"), "{received}");
            assert!(received.contains("Content-Type: text/html\r\n"));
        }

        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_bump() {
        // upstream speaking TLS for localhost, trusted by the proxy only
        let upstream_ca = CertificateAuthority::generate("Upstream CA", "upstream").unwrap();
        let acceptor = TlsAcceptor::from(upstream_ca.server_config("localhost").unwrap());
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = upstream.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(stream).await else { return };
                    let mut framed = FramedRead::new(tls, RequestPreBodyDecoder::new());
                    while let Some(Ok(request)) = framed.next().await {
                        let body = format!("secret {}", String::from_utf8_lossy(&request.uri));
                        let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len());
                        framed.get_mut().write_all(response.as_bytes()).await.unwrap();
                        framed.get_mut().flush().await.unwrap();
                    }
                });
            }
        });

        let mut upstream_roots = RootCertStore::empty();
        upstream_roots.add(upstream_ca.cert_der().clone()).unwrap();
        let upstream_tls = ClientConfig::builder().with_root_certificates(upstream_roots).with_no_client_auth();

        let callbacks = Arc::new(Recorder { bump: true, ..Recorder::default() });
        let proxy = Proxy::start(Arc::clone(&callbacks), Some(Arc::new(upstream_tls))).await;

        let mut client_roots = RootCertStore::empty();
        client_roots.add(proxy.certificates.authority().cert_der().clone()).unwrap();
        let connector = TlsConnector::from(Arc::new(
            ClientConfig::builder().with_root_certificates(client_roots).with_no_client_auth(),
        ));

        let mut idle = None;
        for round in 0..2 {
            let mut client = TcpStream::connect(proxy.address).await.unwrap();
            client.write_all(format!("CONNECT localhost:{upstream_port} HTTP/1.1\r\n\r\n").as_bytes()).await.unwrap();

            let established = b"HTTP/1.1 200 Connection established\r\n\r\n";
            let mut reply = vec![0; established.len()];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, established);

            let server_name = ServerName::try_from("localhost").unwrap();
            let mut tls = connector.connect(server_name, client).await.unwrap();
            tls.write_all(b"GET /inside HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
            tls.flush().await.unwrap();

            let (response, body) = read_response(&mut tls).await;
            assert_eq!(response.code, "200");
            assert_eq!(body, "secret /inside");

            assert_eq!(proxy.certificates.misses(), 1);
            assert_eq!(proxy.certificates.hits(), round);
            idle = Some(tls);
        }

        proxy.stop().await;
        // stopping the proxy still ends the bumped session with a close_notify
        let mut idle = idle.unwrap();
        assert_eq!(idle.read(&mut [0; 1]).await.unwrap(), 0);

        let events = callbacks.events();
        assert!(events.contains(&Event::ResponseFinished(0, 0)));
        assert!(events.contains(&Event::ResponseFinished(1, 0)));
    }

    #[tokio::test]
    async fn test_refused_body_sent_without_waiting() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_address = upstream.local_addr().unwrap();
        let callbacks = Arc::new(Recorder { reject_continue: true, ..Recorder::default() });
        let proxy = Proxy::start_with(Arc::clone(&callbacks), None, 4096).await;

        // the whole body arrived with the head, it is dropped and the next request follows
        let mut client = TcpStream::connect(proxy.address).await.unwrap();
        let requests = format!(
            "POST http://{upstream_address}/upload HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\nhello\
             GET http://127.0.0.1:1/def/ HTTP/1.1\r\n\r\n"
        );
        client.write_all(requests.as_bytes()).await.unwrap();

        let mut buffer = BytesMut::new();
        let (response, body) = read_buffered_response(&mut client, &mut buffer).await;
        assert_eq!(response.code, "417");
        assert!(body.is_empty());
        let (response, body) = read_buffered_response(&mut client, &mut buffer).await;
        assert_eq!(response.code, "200");
        assert_eq!(body, "local");
        drop(client);

        // only part of the body arrived, the connection closes after the refusal
        let mut client = TcpStream::connect(proxy.address).await.unwrap();
        let request = format!(
            "POST http://{upstream_address}/upload HTTP/1.1\r\nExpect: 100-continue\r\n\
             Transfer-Encoding: chunked\r\n\r\n5\r\nhel"
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut received = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut received)).await.unwrap().unwrap();
        assert_eq!(received, b"HTTP/1.1 417 Expectation Failed\r\nContent-Length: 0\r\n\r\n");

        assert!(timeout(Duration::from_millis(100), upstream.accept()).await.is_err());

        proxy.stop().await;
        let events = callbacks.events();
        assert!(events.contains(&Event::ResponseFinished(0, 0)));
        assert!(events.contains(&Event::ResponseFinished(0, 1)));
        assert!(events.contains(&Event::ResponseFinished(1, 0)));
    }

    #[tokio::test]
    async fn test_continue_relayed_before_body() {
        let (upstream, mut received) = continue_upstream().await;
        let callbacks = Arc::new(Recorder::default());
        let proxy = Proxy::start(Arc::clone(&callbacks), None).await;

        let mut client = TcpStream::connect(proxy.address).await.unwrap();
        let head = format!("POST http://{upstream}/upload HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n");
        client.write_all(head.as_bytes()).await.unwrap();

        let mut buffer = BytesMut::new();
        let (interim, body) = read_buffered_response(&mut client, &mut buffer).await;
        assert_eq!(interim.code, "100");
        assert_eq!(interim.reason, "Continue");
        assert!(body.is_empty());

        client.write_all(b"hello").await.unwrap();
        let (response, body) = read_buffered_response(&mut client, &mut buffer).await;
        assert_eq!(response.code, "200");
        assert_eq!(body, "ok");

        let forwarded = received.recv().await.unwrap();
        assert_eq!(forwarded, "POST /upload HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\nhello");

        // upstream agreed to the body, so the connection is kept
        client.write_all(b"GET http://127.0.0.1:1/def/ HTTP/1.1\r\n\r\n").await.unwrap();
        let (_, body) = read_buffered_response(&mut client, &mut buffer).await;
        assert_eq!(body, "local");

        drop(client);
        proxy.stop().await;
        let events = callbacks.events();
        assert!(events.contains(&Event::ResponseFinished(0, 0)));
        assert!(events.contains(&Event::ResponseFinished(0, 1)));
    }

    #[tokio::test]
    async fn test_final_response_after_continue() {
        let (upstream, mut received) = continue_upstream().await;
        let callbacks = Arc::new(Recorder::default());
        let proxy = Proxy::start_with(Arc::clone(&callbacks), None, 4096).await;

        // the body goes out with the head, so the request is complete before upstream's 100
        let mut client = TcpStream::connect(proxy.address).await.unwrap();
        let request =
            format!("POST http://{upstream}/upload HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\nhello");
        client.write_all(request.as_bytes()).await.unwrap();

        let mut buffer = BytesMut::new();
        let (interim, _) = read_buffered_response(&mut client, &mut buffer).await;
        assert_eq!(interim.code, "100");
        let (response, body) = read_buffered_response(&mut client, &mut buffer).await;
        assert_eq!(response.code, "200");
        assert_eq!(body, "ok");

        let forwarded = received.recv().await.unwrap();
        assert!(forwarded.ends_with(b"\r\n\r\nhello"));

        drop(client);
        proxy.stop().await;
        let events = callbacks.events();
        assert!(events.iter().any(|event| matches!(event, Event::ResponseBody { has_more: false, body, .. } if body == "ok")));
        assert!(events.contains(&Event::ResponseFinished(0, 0)));
    }

    #[tokio::test]
    async fn test_continue_refused_after_upstream_agreed() {
        let upstream = raw_upstream(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let callbacks = Arc::new(Recorder { refuse_after_continue: true, ..Recorder::default() });
        let proxy = Proxy::start(Arc::clone(&callbacks), None).await;

        let mut client = TcpStream::connect(proxy.address).await.unwrap();
        let head = format!("POST http://{upstream}/upload HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n");
        client.write_all(head.as_bytes()).await.unwrap();

        // the interim response is swallowed, and upstream now waits for a body that never comes
        let mut received = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut received)).await.unwrap().unwrap();
        assert_eq!(received, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");

        proxy.stop().await;
        let events = callbacks.events();
        assert!(events.contains(&Event::ResponseFinished(0, 0)));
        assert!(events.contains(&Event::ConnectionFinished(0)));
    }

    #[tokio::test]
    async fn test_response_pre_body_sent_immediately() {
        let (upstream, _requests, _) = hello_upstream().await;
        let callbacks = Arc::new(Recorder { send_response_immediately: true, ..Recorder::default() });
        let proxy = Proxy::start(Arc::clone(&callbacks), None).await;

        let mut client = TcpStream::connect(proxy.address).await.unwrap();
        client.write_all(format!("GET http://{upstream}/ HTTP/1.1\r\n\r\n").as_bytes()).await.unwrap();
        let (response, body) = read_response(&mut client).await;
        assert_eq!(response.code, "200");
        assert_eq!(body, "hello");

        drop(client);
        proxy.stop().await;
        let bodies: Vec<_> = callbacks
            .events()
            .into_iter()
            .filter_map(|event| match event {
                Event::ResponseBody { body, queued, .. } => Some((body, queued)),
                _ => None,
            })
            .collect();
        assert!(bodies.iter().any(|(body, _)| body == "hello"));
        // the head was written before any body was parsed
        assert!(bodies.iter().all(|(_, queued)| !queued));
    }

    #[tokio::test]
    async fn test_chunked_with_trailers() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_address = upstream.local_addr().unwrap();
        let (sender, received) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let mut buffer = BytesMut::new();
            read_until(&mut stream, &mut buffer, b"X-Sum: 5\r\n\r\n").await;
            sender.send(buffer).unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-Done: yes\r\n\r\n")
                .await
                .unwrap();
            let _ = stream.read(&mut [0; 1]).await;
        });

        let callbacks = Arc::new(Recorder::default());
        let proxy = Proxy::start(Arc::clone(&callbacks), None).await;

        let mut client = TcpStream::connect(proxy.address).await.unwrap();
        let request = format!(
            "POST http://{upstream_address}/sum HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
             5\r\nhello\r\n0\r\nX-Sum: 5\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let expected = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-Done: yes\r\n\r\n";
        let mut response = vec![0; expected.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, expected);

        let forwarded = received.await.unwrap();
        assert_eq!(forwarded, "POST /sum HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\nX-Sum: 5\r\n\r\n");

        drop(client);
        proxy.stop().await;
        let events = callbacks.events();
        let last_body = events.iter().rev().find(|event| matches!(event, Event::ResponseBody { .. }));
        assert!(matches!(last_body, Some(Event::ResponseBody { has_more: false, .. })));
        assert!(events.contains(&Event::ResponseFinished(0, 0)));
    }

    #[tokio::test]
    async fn test_bad_upstream_response() {
        let callbacks = Arc::new(Recorder::default());
        let proxy = Proxy::start(Arc::clone(&callbacks), None).await;

        for response in [&b"HTTP/1.1 2x0 OK\r\n\r\n"[..], b"HTTP/1.1 200 OK\r\nContent-Length: 1x\r\n\r\n"] {
            let upstream = raw_upstream(response).await;
            let mut client = TcpStream::connect(proxy.address).await.unwrap();
            client.write_all(format!("GET http://{upstream}/ HTTP/1.1\r\n\r\n").as_bytes()).await.unwrap();

            let mut received = Vec::new();
            client.read_to_end(&mut received).await.unwrap();
            let received = String::from_utf8(received).unwrap();
            assert!(received.starts_with("HTTP/1.0 502 Bad Gateway\r\n"), "{received}");
        }

        proxy.stop().await;
        let events = callbacks.events();
        assert!(events.contains(&Event::ResponseFinished(0, 0)));
        assert!(events.contains(&Event::ResponseFinished(1, 0)));
    }

    #[tokio::test]
    async fn test_upstream_change_tears_down() {
        let (first, _first_requests, _) = hello_upstream().await;
        let (second, _second_requests, second_accepted) = hello_upstream().await;
        let callbacks = Arc::new(Recorder::default());
        let proxy = Proxy::start(Arc::clone(&callbacks), None).await;

        let mut client = TcpStream::connect(proxy.address).await.unwrap();
        client.write_all(format!("GET http://{first}/ HTTP/1.1\r\n\r\n").as_bytes()).await.unwrap();
        let (_, body) = read_response(&mut client).await;
        assert_eq!(body, "hello");

        // same connection, other host:port
        client.write_all(format!("GET http://{second}/ HTTP/1.1\r\n\r\n").as_bytes()).await.unwrap();
        let mut received = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut received)).await.unwrap().unwrap();
        assert!(received.is_empty());
        assert_eq!(second_accepted.load(Ordering::SeqCst), 0);

        proxy.stop().await;
        let events = callbacks.events();
        assert!(events.contains(&Event::ResponseFinished(0, 0)));
        assert!(events.contains(&Event::ResponseFinished(0, 1)));
        assert_eq!(events.last(), Some(&Event::ConnectionFinished(0)));
    }
}
