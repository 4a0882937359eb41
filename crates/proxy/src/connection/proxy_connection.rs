use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::StatusCode;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::callbacks::{
    ConnectParams, ConnectionId, ProxyCallbacks, RequestBodyParams, RequestId, RequestPreBodyParams, ResponseBodyParams,
    ResponsePreBodyParams,
};
use crate::cert::DomainCertificates;
use crate::codec::{ChunkedBodyParser, FixedLengthBodyParser, PreBodyParser, RequestPreBodyParser, ResponsePreBodyParser};
use crate::connection::state::{BumpState, ConnectionState, MessageState};
use crate::connection::stream::until_shutdown;
use crate::connection::{ConnectionError, ProxyStream};
use crate::protocol::{
    BodyLength, OutgoingBuffers, RequestPreBody, ResponsePreBody, Trailer, detect_body_length, is_connection_close,
    request_has_body, response_has_body, should_response_have_body, stock_reply,
};
use crate::utils::extract_url_parts;

use MessageState::*;

const CONNECTION_ESTABLISHED: &[u8] = b" 200 Connection established\r\n\r\n";
const PROXY_CONNECTION: &str = "proxy-connection";
const CONNECTION: &str = "Connection";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// What every connection of a server shares.
pub(crate) struct ConnectionContext {
    pub(crate) callbacks: Arc<dyn ProxyCallbacks>,
    pub(crate) certificates: Arc<DomainCertificates>,
    pub(crate) upstream_tls: Arc<ClientConfig>,
    pub(crate) read_buffer_size: usize,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext").field("read_buffer_size", &self.read_buffer_size).finish_non_exhaustive()
    }
}

/// One step of the connection state machine; each step returns the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    ReadDownstream,
    ParseDownstream,
    RequestBody { send_immediately: bool },
    RequestBodyEnd,
    RequestAction,
    ConnectUpstream,
    WriteUpstream,
    ReadUpstream,
    ParseUpstream,
    ResponseBody { send_immediately: bool },
    ResponseBodyEnd,
    ResponseAction,
    WriteDownstream,
    BumpHandshake,
    Tunnel,
    FinishRequest,
    Reply(StatusCode),
    Stop,
}

/// A proxied downstream connection together with its upstream connection.
///
/// The connection reads one request at a time from downstream, hands it to the
/// [`ProxyCallbacks`] checkpoints and writes whatever they queue to upstream or
/// downstream. Requests on one connection are strictly sequential: request N's
/// response is finished before request N+1's pre-body is parsed.
///
/// # State Transitions
///
/// ```text
/// ReadDownstream -> ParseDownstream -> RequestBody/RequestBodyEnd -> RequestAction
///     RequestAction -> ConnectUpstream -> WriteUpstream -> ReadUpstream | ReadDownstream
///     RequestAction -> WriteDownstream (response synthesized by a callback)
/// ReadUpstream -> ParseUpstream -> ResponseBody/ResponseBodyEnd -> ResponseAction
///     ResponseAction -> WriteDownstream -> FinishRequest | ReadUpstream | ReadDownstream
/// FinishRequest -> ReadDownstream | Stop
/// ```
///
/// A CONNECT either goes `ConnectUpstream -> Tunnel` or, when bumped,
/// `WriteDownstream -> BumpHandshake -> ReadDownstream` on the decrypted stream.
pub(crate) struct Connection {
    id: ConnectionId,
    request_id: RequestId,
    context: Arc<ConnectionContext>,
    token: CancellationToken,

    downstream: Option<ProxyStream>,
    upstream: Option<ProxyStream>,
    downstream_buffer: BytesMut,
    upstream_buffer: BytesMut,
    downstream_out: OutgoingBuffers,
    upstream_out: OutgoingBuffers,

    state: ConnectionState,
    upstream_host: String,
    upstream_service: String,
    connected_upstream: Option<(String, String)>,

    request: RequestPreBody,
    response: ResponsePreBody,
    response_continue: ResponsePreBody,
    request_trailer: Trailer,
    response_trailer: Trailer,

    request_parser: RequestPreBodyParser,
    response_parser: ResponsePreBodyParser,
    request_chunked_parser: ChunkedBodyParser,
    request_fixed_parser: FixedLengthBodyParser,
    response_chunked_parser: ChunkedBodyParser,
    response_fixed_parser: FixedLengthBodyParser,
    request_body_length: BodyLength,
    response_body_length: BodyLength,

    connection_close: bool,
    expect_100_continue_from_upstream: bool,
    expect_body_continue_from_downstream: bool,
    /// Whether upstream sent `100 Continue`, unknown until it answered an expecting request.
    continue_sent_by_upstream: Option<bool>,
    wrote_something_to_upstream: bool,
    response_body_forbidden: bool,
    upstream_died: bool,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        downstream: TcpStream,
        context: Arc<ConnectionContext>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            request_id: 0,
            context,
            token,
            downstream: Some(ProxyStream::Plain(downstream)),
            upstream: None,
            downstream_buffer: BytesMut::new(),
            upstream_buffer: BytesMut::new(),
            downstream_out: OutgoingBuffers::new(),
            upstream_out: OutgoingBuffers::new(),
            state: ConnectionState::default(),
            upstream_host: String::new(),
            upstream_service: String::new(),
            connected_upstream: None,
            request: RequestPreBody::default(),
            response: ResponsePreBody::default(),
            response_continue: ResponsePreBody::default(),
            request_trailer: Trailer::default(),
            response_trailer: Trailer::default(),
            request_parser: RequestPreBodyParser::default(),
            response_parser: ResponsePreBodyParser::default(),
            request_chunked_parser: ChunkedBodyParser::new(),
            request_fixed_parser: FixedLengthBodyParser::default(),
            response_chunked_parser: ChunkedBodyParser::new(),
            response_fixed_parser: FixedLengthBodyParser::default(),
            request_body_length: BodyLength::NotSpecified,
            response_body_length: BodyLength::NotSpecified,
            connection_close: false,
            expect_100_continue_from_upstream: false,
            expect_body_continue_from_downstream: true,
            continue_sent_by_upstream: None,
            wrote_something_to_upstream: false,
            response_body_forbidden: false,
            upstream_died: false,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Serves requests until either side goes away, then tears the connection down.
    pub(crate) async fn run(mut self) {
        self.context.callbacks.on_connection(self.id).await;

        let mut step = Step::ReadDownstream;
        loop {
            trace!(connection_id = self.id, ?step, "connection step");
            step = match self.step(step).await {
                Ok(Step::Stop) => break,
                Ok(next) => next,
                Err(e) if e.is_cancelled() => {
                    debug!(connection_id = self.id, "connection stopped");
                    break;
                }
                Err(e @ (ConnectionError::Cert { .. } | ConnectionError::NotConnected)) => {
                    error!(connection_id = self.id, request_id = self.request_id, cause = %e, "connection failed");
                    break;
                }
                Err(e) => {
                    debug!(connection_id = self.id, request_id = self.request_id, cause = %e, "connection failed");
                    break;
                }
            };
        }

        self.stop().await;
    }

    async fn step(&mut self, step: Step) -> Result<Step, ConnectionError> {
        match step {
            Step::ReadDownstream => self.read_downstream().await,
            Step::ParseDownstream => self.parse_downstream().await,
            Step::RequestBody { send_immediately } => self.request_body(send_immediately).await,
            Step::RequestBodyEnd => self.request_body_end().await,
            Step::RequestAction => Ok(self.request_action()),
            Step::ConnectUpstream => self.connect_upstream().await,
            Step::WriteUpstream => self.write_upstream().await,
            Step::ReadUpstream => self.read_upstream().await,
            Step::ParseUpstream => self.parse_upstream().await,
            Step::ResponseBody { send_immediately } => self.response_body(send_immediately).await,
            Step::ResponseBodyEnd => self.response_body_end().await,
            Step::ResponseAction => Ok(self.response_action()),
            Step::WriteDownstream => self.write_downstream().await,
            Step::BumpHandshake => self.bump_handshake().await,
            Step::Tunnel => self.tunnel().await,
            Step::FinishRequest => Ok(self.finish_request().await),
            Step::Reply(status) => self.reply(status).await,
            Step::Stop => Ok(Step::Stop),
        }
    }

    /// Parses what is already buffered, or reads more first.
    async fn read_downstream(&mut self) -> Result<Step, ConnectionError> {
        if !self.downstream_buffer.is_empty() {
            return Ok(Step::ParseDownstream);
        }

        let stream = self.downstream.as_mut().ok_or(ConnectionError::NotConnected)?;
        self.downstream_buffer.reserve(self.context.read_buffer_size);
        let read = until_shutdown(&self.token, stream.read_buf(&mut self.downstream_buffer)).await?;
        if read == 0 {
            debug!(connection_id = self.id, "downstream closed");
            return Ok(Step::Stop);
        }

        trace!(connection_id = self.id, read, "read from downstream");
        Ok(Step::ParseDownstream)
    }

    async fn parse_downstream(&mut self) -> Result<Step, ConnectionError> {
        if self.state.request != PreBody {
            return Ok(Step::RequestBody { send_immediately: false });
        }

        let (result, consumed) = self.request_parser.parse(&mut self.request, &self.downstream_buffer);
        self.downstream_buffer.advance(consumed);

        match result {
            Poll::Pending => Ok(Step::ReadDownstream),
            Poll::Ready(Err(e)) => {
                warn!(connection_id = self.id, cause = %e, "invalid request");
                Ok(Step::Reply(StatusCode::BAD_REQUEST))
            }
            Poll::Ready(Ok(())) if self.request.is_connect() => self.connect_method().await,
            Poll::Ready(Ok(())) => self.request_pre_body().await,
        }
    }

    async fn connect_method(&mut self) -> Result<Step, ConnectionError> {
        let Some((host, service)) = split_connect_target(&self.request.uri) else {
            warn!(connection_id = self.id, uri = ?self.request.uri, "invalid CONNECT target");
            return Ok(Step::Reply(StatusCode::BAD_REQUEST));
        };
        if !self.downstream_buffer.is_empty() {
            warn!(connection_id = self.id, "data received before CONNECT was answered");
            return Ok(Step::Reply(StatusCode::BAD_REQUEST));
        }

        self.upstream_host = host;
        self.upstream_service = service;

        let callbacks = Arc::clone(&self.context.callbacks);
        let bump = callbacks
            .on_connect_method(&mut ConnectParams {
                connection_id: self.id,
                host: &mut self.upstream_host,
                service: &mut self.upstream_service,
                request: &mut self.request,
            })
            .await;

        debug!(
            connection_id = self.id,
            host = %self.upstream_host,
            service = %self.upstream_service,
            bump,
            "CONNECT decided"
        );

        if bump {
            self.state.bump = BumpState::Handshake;
            self.queue_connection_established();
            Ok(Step::WriteDownstream)
        } else {
            self.state.enter_tunnel();
            Ok(Step::ConnectUpstream)
        }
    }

    async fn request_pre_body(&mut self) -> Result<Step, ConnectionError> {
        self.state.request = Body;

        match detect_body_length(&self.request.headers) {
            Ok(body_length) => self.request_body_length = body_length,
            Err(e) => {
                warn!(connection_id = self.id, request_id = self.request_id, cause = %e, "invalid request body length");
                return Ok(Step::Reply(StatusCode::BAD_REQUEST));
            }
        }
        match self.request_body_length {
            BodyLength::ContentLength(length) if request_has_body(self.request_body_length) => {
                self.request_fixed_parser.reset(length);
            }
            BodyLength::Chunked => {}
            _ => self.state.request = Finished,
        }

        if self.state.bump == BumpState::NoBump && !self.fix_proxy_request() {
            warn!(connection_id = self.id, uri = ?self.request.uri, "no upstream host in request");
            return Ok(Step::Stop);
        }

        self.connection_close = is_connection_close(&self.request.version, &self.request.headers);
        self.expect_100_continue_from_upstream = self.request.expects_continue();

        debug!(
            connection_id = self.id,
            request_id = self.request_id,
            method = ?self.request.method,
            uri = ?self.request.uri,
            host = %self.upstream_host,
            body_length = ?self.request_body_length,
            "request pre body parsed"
        );

        let callbacks = Arc::clone(&self.context.callbacks);
        let send_immediately = callbacks
            .on_request_pre_body(&mut RequestPreBodyParams {
                connection_id: self.id,
                request_id: self.request_id,
                ssl: self.state.is_ssl(),
                host: &mut self.upstream_host,
                request: &mut self.request,
                response: &mut self.response,
                expect_body_continue_from_downstream: &mut self.expect_body_continue_from_downstream,
                expect_100_continue_from_upstream: &mut self.expect_100_continue_from_upstream,
                request_trailer: &mut self.request_trailer,
                response_trailer: &mut self.response_trailer,
                request_body_length: self.request_body_length,
                downstream: &mut self.downstream_out,
                upstream: &mut self.upstream_out,
            })
            .await;

        if self.state.request == Body && !self.expect_body_continue_from_downstream {
            debug!(connection_id = self.id, request_id = self.request_id, "request body refused");
            self.discard_refused_body();
            return Ok(Step::RequestAction);
        }

        if self.state.request == Finished {
            Ok(Step::RequestBodyEnd)
        } else {
            Ok(Step::RequestBody { send_immediately })
        }
    }

    /// Turns an absolute-form request into an origin-form one aimed at its authority.
    ///
    /// Also folds `Proxy-Connection` into `Connection`, which is what the client meant
    /// for the next hop.
    fn fix_proxy_request(&mut self) -> bool {
        let Some(parts) = std::str::from_utf8(&self.request.uri).ok().and_then(extract_url_parts) else {
            return false;
        };

        self.upstream_host = parts.host;
        self.upstream_service = parts.port;
        self.request.uri = Bytes::from(parts.path);

        let headers = &mut self.request.headers;
        if let Some(value) = headers.get(PROXY_CONNECTION).cloned() {
            if !headers.contains(CONNECTION) {
                headers.push_back(CONNECTION, value);
            }
            headers.erase_all(PROXY_CONNECTION);
        }
        true
    }

    async fn request_body(&mut self, send_immediately: bool) -> Result<Step, ConnectionError> {
        if send_immediately || self.state.request != Body || self.downstream_buffer.is_empty() {
            return Ok(Step::RequestAction);
        }

        let (complete, body) = if self.request_body_length == BodyLength::Chunked {
            let progress = self.request_chunked_parser.parse(&mut self.request_trailer, &self.downstream_buffer);
            let consumed = self.downstream_buffer.split_to(progress.consumed).freeze();
            match progress.result {
                Poll::Ready(Err(e)) => {
                    warn!(connection_id = self.id, request_id = self.request_id, cause = %e, "invalid chunked request body");
                    return Ok(Step::Stop);
                }
                result => (result.is_ready(), consumed.slice(..progress.forwardable)),
            }
        } else {
            let (result, consumed) = self.request_fixed_parser.parse(&self.downstream_buffer);
            (result.is_ready(), self.downstream_buffer.split_to(consumed).freeze())
        };

        if complete {
            self.state.request = Finished;
        }
        self.on_request_body_some(body, !complete).await;
        Ok(Step::RequestAction)
    }

    /// Ends a request whose body will not be forwarded.
    ///
    /// Body bytes the client sent without waiting for `100 Continue` never reach the
    /// callbacks. They are dropped when the whole body is buffered already; a body that
    /// is only partly buffered leaves the next request's start unknown, so the
    /// connection closes after the response.
    fn discard_refused_body(&mut self) {
        self.state.request = Finished;
        if self.downstream_buffer.is_empty() {
            return;
        }

        let complete = if self.request_body_length == BodyLength::Chunked {
            let progress = self.request_chunked_parser.parse(&mut Trailer::default(), &self.downstream_buffer);
            self.downstream_buffer.advance(progress.consumed);
            matches!(progress.result, Poll::Ready(Ok(())))
        } else {
            let (result, consumed) = self.request_fixed_parser.parse(&self.downstream_buffer);
            self.downstream_buffer.advance(consumed);
            result.is_ready()
        };

        if !complete {
            debug!(connection_id = self.id, request_id = self.request_id, "refused body partly received");
            self.connection_close = true;
            self.downstream_buffer.clear();
        }
    }

    async fn request_body_end(&mut self) -> Result<Step, ConnectionError> {
        self.on_request_body_some(Bytes::new(), false).await;
        Ok(Step::RequestAction)
    }

    async fn on_request_body_some(&mut self, body: Bytes, has_more: bool) {
        trace!(connection_id = self.id, request_id = self.request_id, len = body.len(), has_more, "request body");

        let callbacks = Arc::clone(&self.context.callbacks);
        callbacks
            .on_request_body_some(&mut RequestBodyParams {
                connection_id: self.id,
                request_id: self.request_id,
                ssl: self.state.is_ssl(),
                host: &self.upstream_host,
                request: &mut self.request,
                response: &mut self.response,
                expect_100_continue_from_upstream: &mut self.expect_100_continue_from_upstream,
                request_trailer: &mut self.request_trailer,
                response_trailer: &mut self.response_trailer,
                has_more,
                body,
                request_body_length: self.request_body_length,
                downstream: &mut self.downstream_out,
                upstream: &mut self.upstream_out,
            })
            .await;
    }

    /// Picks the next move from what the request callbacks queued.
    fn request_action(&mut self) -> Step {
        if !self.upstream_out.is_empty() {
            self.wrote_something_to_upstream = true;
            return Step::ConnectUpstream;
        }

        if !self.downstream_out.is_empty() {
            if !self.expect_body_continue_from_downstream {
                self.state.request = Finished;
            }
            return Step::WriteDownstream;
        }

        match (self.state.request, self.wrote_something_to_upstream) {
            (Finished, true) => Step::ReadUpstream,
            (Finished, false) => Step::FinishRequest,
            _ => Step::ReadDownstream,
        }
    }

    async fn connect_upstream(&mut self) -> Result<Step, ConnectionError> {
        if let Some((host, service)) = &self.connected_upstream {
            if *host != self.upstream_host || *service != self.upstream_service {
                return Err(ConnectionError::upstream_mismatch(
                    format!("{host}:{service}"),
                    format!("{}:{}", self.upstream_host, self.upstream_service),
                ));
            }
            return Ok(Step::WriteUpstream);
        }

        let tcp = self.resolve_and_connect().await?;
        self.connected_upstream = Some((self.upstream_host.clone(), self.upstream_service.clone()));

        if self.state.is_tunnel() {
            self.upstream = Some(ProxyStream::Plain(tcp));
            self.queue_connection_established();
            self.flush_downstream().await?;
            return Ok(Step::Tunnel);
        }

        if self.state.is_ssl() {
            let name = ServerName::try_from(self.upstream_host.clone()).map_err(ConnectionError::invalid_upstream)?;
            let connector = TlsConnector::from(Arc::clone(&self.context.upstream_tls));
            let tls = until_shutdown(&self.token, async { connector.connect(name, tcp).await.map_err(ConnectionError::tls) })
                .await?;
            self.upstream = Some(ProxyStream::ClientTls(Box::new(tls)));
        } else {
            self.upstream = Some(ProxyStream::Plain(tcp));
        }

        Ok(Step::WriteUpstream)
    }

    /// Tries every resolved address in turn.
    async fn resolve_and_connect(&mut self) -> Result<TcpStream, ConnectionError> {
        let port = self
            .upstream_service
            .parse::<u16>()
            .map_err(|e| ConnectionError::invalid_upstream(format!("port {}: {e}", self.upstream_service)))?;
        let addresses: Vec<SocketAddr> =
            until_shutdown(&self.token, lookup_host((self.upstream_host.as_str(), port))).await?.collect();

        let mut last_error = None;
        for address in addresses {
            match until_shutdown(&self.token, TcpStream::connect(address)).await {
                Ok(tcp) => {
                    tcp.set_nodelay(true)?;
                    debug!(connection_id = self.id, %address, host = %self.upstream_host, "connected to upstream");
                    return Ok(tcp);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    debug!(connection_id = self.id, %address, cause = %e, "upstream address failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ConnectionError::invalid_upstream(format!("{} resolved to no address", self.upstream_host))
        }))
    }

    async fn write_upstream(&mut self) -> Result<Step, ConnectionError> {
        let stream = self.upstream.as_mut().ok_or(ConnectionError::NotConnected)?;
        trace!(connection_id = self.id, len = self.upstream_out.total_len(), "writing to upstream");
        until_shutdown(&self.token, stream.write_buffers(&self.upstream_out)).await?;
        self.upstream_out.clear();

        if self.state.response != Tunnel {
            self.state.response = PreBody;
        }

        if self.state.request == Finished || self.expect_100_continue_from_upstream {
            Ok(Step::ReadUpstream)
        } else {
            Ok(Step::ReadDownstream)
        }
    }

    async fn read_upstream(&mut self) -> Result<Step, ConnectionError> {
        if !self.upstream_buffer.is_empty() {
            return Ok(Step::ParseUpstream);
        }

        let stream = self.upstream.as_mut().ok_or(ConnectionError::NotConnected)?;
        self.upstream_buffer.reserve(self.context.read_buffer_size);
        let read = match until_shutdown(&self.token, stream.read_buf(&mut self.upstream_buffer)).await {
            Ok(read) => read,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                debug!(connection_id = self.id, cause = %e, "upstream read failed");
                0
            }
        };

        if read > 0 {
            trace!(connection_id = self.id, read, "read from upstream");
            return Ok(Step::ParseUpstream);
        }

        if !matches!(self.state.response, PreBody | Body) {
            return Ok(Step::Stop);
        }

        // running out of upstream ends a response without framing
        debug!(connection_id = self.id, request_id = self.request_id, "upstream closed while responding");
        self.upstream_died = true;
        self.state.response = Finished;
        let rest = self.upstream_buffer.split().freeze();
        self.on_response_body_some(rest, false).await;
        Ok(Step::ResponseAction)
    }

    async fn parse_upstream(&mut self) -> Result<Step, ConnectionError> {
        if self.state.response != PreBody {
            return Ok(Step::ResponseBody { send_immediately: false });
        }

        let (result, consumed) = self.response_parser.parse(&mut self.response, &self.upstream_buffer);
        self.upstream_buffer.advance(consumed);

        match result {
            Poll::Pending => Ok(Step::ReadUpstream),
            Poll::Ready(Err(e)) => {
                warn!(connection_id = self.id, request_id = self.request_id, cause = %e, "invalid response");
                Ok(Step::Reply(StatusCode::BAD_GATEWAY))
            }
            Poll::Ready(Ok(())) if self.response.is_continue() => Ok(self.continue_pre_body().await),
            Poll::Ready(Ok(())) => self.response_pre_body().await,
        }
    }

    /// Hands an interim `100 Continue` to the callbacks, apart from the final response.
    async fn continue_pre_body(&mut self) -> Step {
        debug!(connection_id = self.id, request_id = self.request_id, "upstream sent 100 continue");

        self.expect_100_continue_from_upstream = false;
        self.continue_sent_by_upstream = Some(true);
        self.response_continue = mem::take(&mut self.response);
        self.response_parser.reset();

        let callbacks = Arc::clone(&self.context.callbacks);
        let send_immediately = callbacks
            .on_response_pre_body(&mut ResponsePreBodyParams {
                connection_id: self.id,
                request_id: self.request_id,
                ssl: self.state.is_ssl(),
                host: &self.upstream_host,
                request: &mut self.request,
                response: &mut self.response_continue,
                expect_body_continue_from_downstream: &mut self.expect_body_continue_from_downstream,
                body_forbidden: true,
                response_body_length: self.response_body_length,
                downstream: &mut self.downstream_out,
            })
            .await;

        // the final response is still owed, the response stays in its pre-body
        Step::ResponseBody { send_immediately }
    }

    async fn response_pre_body(&mut self) -> Result<Step, ConnectionError> {
        if self.expect_100_continue_from_upstream {
            // upstream answered without waiting for the body
            self.expect_body_continue_from_downstream = false;
            self.continue_sent_by_upstream = Some(false);
            self.expect_100_continue_from_upstream = false;
        }

        if is_connection_close(&self.response.version, &self.response.headers) {
            self.connection_close = true;
        }

        self.state.response = Body;
        if should_response_have_body(&self.request, &self.response) {
            match detect_body_length(&self.response.headers) {
                Ok(body_length) => self.response_body_length = body_length,
                Err(e) => {
                    warn!(connection_id = self.id, request_id = self.request_id, cause = %e, "invalid response body length");
                    return Ok(Step::Reply(StatusCode::BAD_GATEWAY));
                }
            }
            match self.response_body_length {
                _ if !response_has_body(self.response_body_length) => self.state.response = Finished,
                BodyLength::ContentLength(length) => self.response_fixed_parser.reset(length),
                // runs until upstream closes
                BodyLength::NotSpecified => self.response_fixed_parser.reset(u64::MAX),
                BodyLength::Chunked => {}
            }
        } else {
            self.response_body_forbidden = true;
            self.state.response = Finished;
        }

        debug!(
            connection_id = self.id,
            request_id = self.request_id,
            code = ?self.response.code,
            body_length = ?self.response_body_length,
            body_forbidden = self.response_body_forbidden,
            "response pre body parsed"
        );

        let callbacks = Arc::clone(&self.context.callbacks);
        let send_immediately = callbacks
            .on_response_pre_body(&mut ResponsePreBodyParams {
                connection_id: self.id,
                request_id: self.request_id,
                ssl: self.state.is_ssl(),
                host: &self.upstream_host,
                request: &mut self.request,
                response: &mut self.response,
                expect_body_continue_from_downstream: &mut self.expect_body_continue_from_downstream,
                body_forbidden: self.response_body_forbidden,
                response_body_length: self.response_body_length,
                downstream: &mut self.downstream_out,
            })
            .await;

        if self.state.response == Finished {
            Ok(Step::ResponseBodyEnd)
        } else {
            Ok(Step::ResponseBody { send_immediately })
        }
    }

    async fn response_body(&mut self, send_immediately: bool) -> Result<Step, ConnectionError> {
        if send_immediately || self.state.response != Body || self.upstream_buffer.is_empty() {
            return Ok(Step::ResponseAction);
        }

        let (complete, body) = if self.response_body_length == BodyLength::Chunked {
            let progress = self.response_chunked_parser.parse(&mut self.response_trailer, &self.upstream_buffer);
            let consumed = self.upstream_buffer.split_to(progress.consumed).freeze();
            match progress.result {
                Poll::Ready(Err(e)) => {
                    warn!(connection_id = self.id, request_id = self.request_id, cause = %e, "invalid chunked response body");
                    return Ok(Step::Stop);
                }
                result => (result.is_ready(), consumed.slice(..progress.forwardable)),
            }
        } else {
            let (result, consumed) = self.response_fixed_parser.parse(&self.upstream_buffer);
            (result.is_ready(), self.upstream_buffer.split_to(consumed).freeze())
        };

        if complete {
            self.state.response = Finished;
        }
        self.on_response_body_some(body, !complete).await;
        Ok(Step::ResponseAction)
    }

    async fn response_body_end(&mut self) -> Result<Step, ConnectionError> {
        self.on_response_body_some(Bytes::new(), false).await;
        Ok(Step::ResponseAction)
    }

    async fn on_response_body_some(&mut self, body: Bytes, has_more: bool) {
        trace!(connection_id = self.id, request_id = self.request_id, len = body.len(), has_more, "response body");

        let callbacks = Arc::clone(&self.context.callbacks);
        callbacks
            .on_response_body_some(&mut ResponseBodyParams {
                connection_id: self.id,
                request_id: self.request_id,
                ssl: self.state.is_ssl(),
                host: &self.upstream_host,
                request: &mut self.request,
                response: &mut self.response,
                response_trailer: &mut self.response_trailer,
                body_forbidden: self.response_body_forbidden,
                has_more,
                body,
                response_body_length: self.response_body_length,
                downstream: &mut self.downstream_out,
            })
            .await;
    }

    /// Picks the next move from what the response callbacks queued.
    fn response_action(&mut self) -> Step {
        if self.state.request == Body && !self.expect_body_continue_from_downstream {
            // the request body will never come
            self.discard_refused_body();
            self.wrote_something_to_upstream = true;
        }

        match (self.downstream_out.is_empty(), self.state.response) {
            (false, _) => Step::WriteDownstream,
            (true, Finished) => Step::FinishRequest,
            (true, _) => Step::ReadUpstream,
        }
    }

    async fn write_downstream(&mut self) -> Result<Step, ConnectionError> {
        self.flush_downstream().await?;

        if self.state.bump == BumpState::Handshake {
            return Ok(Step::BumpHandshake);
        }

        let request_done = self.state.request == Finished;
        if request_done && (!self.wrote_something_to_upstream || self.state.response == Finished) {
            Ok(Step::FinishRequest)
        } else if self.state.request == Body {
            Ok(Step::ReadDownstream)
        } else {
            Ok(Step::ReadUpstream)
        }
    }

    async fn flush_downstream(&mut self) -> Result<(), ConnectionError> {
        let stream = self.downstream.as_mut().ok_or(ConnectionError::NotConnected)?;
        trace!(connection_id = self.id, len = self.downstream_out.total_len(), "writing to downstream");
        until_shutdown(&self.token, stream.write_buffers(&self.downstream_out)).await?;
        self.downstream_out.clear();
        Ok(())
    }

    /// Terminates TLS on the downstream socket with a certificate for the CONNECT host.
    async fn bump_handshake(&mut self) -> Result<Step, ConnectionError> {
        let (config, status) = self.context.certificates.server_config(&self.upstream_host)?;
        debug!(connection_id = self.id, host = %self.upstream_host, ?status, "bumping connection");

        let Some(ProxyStream::Plain(tcp)) = self.downstream.take() else {
            return Err(ConnectionError::NotConnected);
        };
        let acceptor = TlsAcceptor::from(config);
        let tls = until_shutdown(&self.token, async { acceptor.accept(tcp).await.map_err(ConnectionError::tls) }).await?;

        self.downstream = Some(ProxyStream::ServerTls(Box::new(tls)));
        self.state.bump = BumpState::Established;
        self.request = RequestPreBody::default();
        self.request_parser.reset();
        Ok(Step::ReadDownstream)
    }

    /// Pumps raw bytes both ways until either side closes.
    async fn tunnel(&mut self) -> Result<Step, ConnectionError> {
        let (Some(downstream), Some(upstream)) = (self.downstream.as_mut(), self.upstream.as_mut()) else {
            return Err(ConnectionError::NotConnected);
        };

        let (to_upstream, to_downstream) = until_shutdown(&self.token, copy_bidirectional(downstream, upstream)).await?;
        debug!(connection_id = self.id, to_upstream, to_downstream, "tunnel closed");
        Ok(Step::Stop)
    }

    /// Ends the request cycle and either waits for the next request or stops.
    async fn finish_request(&mut self) -> Step {
        let continue_mismatch =
            self.continue_sent_by_upstream.is_some_and(|sent| sent != self.expect_body_continue_from_downstream);
        let close = self.upstream_died || self.connection_close || continue_mismatch;
        let request_id = self.request_id;

        self.reset();
        self.context.callbacks.on_response_finished(self.id, request_id).await;

        debug!(connection_id = self.id, request_id, close, "request finished");
        if close { Step::Stop } else { Step::ReadDownstream }
    }

    fn reset(&mut self) {
        self.connection_close = false;
        self.request = RequestPreBody::default();
        self.response = ResponsePreBody::default();
        self.response_continue = ResponsePreBody::default();
        self.request_trailer = Trailer::default();
        self.response_trailer = Trailer::default();
        self.expect_100_continue_from_upstream = false;
        self.expect_body_continue_from_downstream = true;
        self.continue_sent_by_upstream = None;
        self.request_parser.reset();
        self.request_chunked_parser.reset();
        self.response_parser.reset();
        self.response_chunked_parser.reset();
        self.state.request = PreBody;
        self.state.response = PreBody;
        self.wrote_something_to_upstream = false;
        self.response_body_forbidden = false;
        self.request_body_length = BodyLength::NotSpecified;
        self.response_body_length = BodyLength::NotSpecified;
        self.request_id += 1;
    }

    async fn reply(&mut self, status: StatusCode) -> Result<Step, ConnectionError> {
        self.downstream_out = stock_reply(status);
        self.flush_downstream().await?;
        Ok(Step::Stop)
    }

    fn queue_connection_established(&mut self) {
        self.downstream_out.push(self.request.version.clone());
        self.downstream_out.push_static(CONNECTION_ESTABLISHED);
    }

    /// Owes the callbacks their last notifications and closes both sockets.
    async fn stop(&mut self) {
        if self.state.has_open_request(self.wrote_something_to_upstream) {
            self.context.callbacks.on_response_finished(self.id, self.request_id).await;
        }

        // runs after cancellation too, bounded by SHUTDOWN_TIMEOUT
        for stream in [self.downstream.as_mut(), self.upstream.as_mut()].into_iter().flatten() {
            match timeout(SHUTDOWN_TIMEOUT, stream.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => trace!(connection_id = self.id, cause = %e, "shutdown failed"),
                Err(_) => trace!(connection_id = self.id, "shutdown timed out"),
            }
        }
        self.downstream = None;
        self.upstream = None;

        self.context.callbacks.on_connection_finished(self.id);
        debug!(connection_id = self.id, requests = self.request_id, "connection finished");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("request_id", &self.request_id)
            .field("state", &self.state)
            .field("upstream_host", &self.upstream_host)
            .field("upstream_service", &self.upstream_service)
            .finish_non_exhaustive()
    }
}

/// Splits a CONNECT target into host and port.
///
/// The port has one to five digits and lies in `1..=65535`. A second `:`, as in a
/// bracketed IPv6 literal, is rejected.
fn split_connect_target(uri: &[u8]) -> Option<(String, String)> {
    let uri = std::str::from_utf8(uri).ok()?;
    let mut parts = uri.split(':');
    let (host, port) = (parts.next()?, parts.next()?);
    if parts.next().is_some() || port.is_empty() || port.len() > 5 || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    match port.parse::<u32>() {
        Ok(1..=65535) => Some((host.to_owned(), port.to_owned())),
        _ => None,
    }
}
