//! The tagged state of a proxied connection.

/// How far the current request, or the current response, has been read off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    PreBody,
    Body,
    Finished,
    /// Opaque CONNECT tunnel, nothing is parsed any more.
    Tunnel,
}

/// Whether the downstream socket is plain or was bumped to TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpState {
    NoBump,
    /// `200 Connection established` is being written, the TLS handshake follows.
    Handshake,
    Established,
}

/// The request, response and bump states of a connection.
///
/// The three are orthogonal: request and response track parsing progress, the bump
/// state tracks what the downstream socket speaks. Request and response only enter
/// [`MessageState::Tunnel`] together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub request: MessageState,
    pub response: MessageState,
    pub bump: BumpState,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self { request: MessageState::PreBody, response: MessageState::PreBody, bump: BumpState::NoBump }
    }
}

impl ConnectionState {
    pub fn enter_tunnel(&mut self) {
        self.request = MessageState::Tunnel;
        self.response = MessageState::Tunnel;
    }

    pub fn is_tunnel(&self) -> bool {
        self.request == MessageState::Tunnel
    }

    /// True once downstream speaks TLS.
    pub fn is_ssl(&self) -> bool {
        self.bump == BumpState::Established
    }

    /// Whether a request cycle is still open when the connection goes down, so its
    /// `on_response_finished` notification is still owed.
    ///
    /// A request is open from its parsed pre-body until its response finished. When
    /// nothing was written upstream the request alone decides.
    pub fn has_open_request(&self, wrote_something_to_upstream: bool) -> bool {
        match self.request {
            MessageState::Tunnel | MessageState::PreBody => false,
            MessageState::Body => true,
            MessageState::Finished => wrote_something_to_upstream && self.response != MessageState::Finished,
        }
    }
}
