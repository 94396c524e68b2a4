//! Close codes used by the gateway.

/// WebSocket close codes the gateway emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Inbound message was not a valid envelope.
    InvalidPayload = 1007,
    /// A store failed while the handshake needed it.
    InternalError = 1011,
    /// The `presences` connect parameter was not a boolean.
    InvalidPresenceFlag = 4001,
    /// Unknown or absent session.
    InvalidAuthorization = 4002,
    /// Bad encoding, or a privileged message from an untrusted session.
    InvalidRequest = 4004,
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        code as u16
    }
}

/// A close code paired with the reason sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Close {
    pub code: CloseCode,
    pub reason: &'static str,
}

impl Close {
    #[must_use]
    pub const fn new(code: CloseCode, reason: &'static str) -> Self {
        Self { code, reason }
    }

    #[must_use]
    pub const fn invalid_encoding() -> Self {
        Self::new(CloseCode::InvalidRequest, "Invalid encoding")
    }

    #[must_use]
    pub const fn invalid_dispatch() -> Self {
        Self::new(CloseCode::InvalidRequest, "Invalid Dispatch Sent")
    }

    #[must_use]
    pub const fn invalid_authorization() -> Self {
        Self::new(CloseCode::InvalidAuthorization, "Invalid authorization")
    }

    #[must_use]
    pub const fn invalid_presence_flag() -> Self {
        Self::new(CloseCode::InvalidPresenceFlag, "Presence has to be a bool.")
    }

    #[must_use]
    pub const fn invalid_payload() -> Self {
        Self::new(CloseCode::InvalidPayload, "Invalid payload")
    }

    #[must_use]
    pub const fn internal_error() -> Self {
        Self::new(CloseCode::InternalError, "Internal error")
    }

    /// The numeric close code.
    #[must_use]
    pub fn code(&self) -> u16 {
        self.code.into()
    }
}

impl std::fmt::Display for Close {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code(), self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert_eq!(Close::invalid_encoding().code(), 4004);
        assert_eq!(Close::invalid_dispatch().code(), 4004);
        assert_eq!(Close::invalid_authorization().code(), 4002);
        assert_eq!(Close::invalid_presence_flag().code(), 4001);
        assert_eq!(Close::invalid_dispatch().to_string(), "4004 (Invalid Dispatch Sent)");
    }
}
