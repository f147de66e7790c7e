//! Control message types and wire constants

/// Type tag of an authentication message
pub const TYPE_AUTHENTICATION: u8 = 1;

/// Type tag of a join-channel message
pub const TYPE_JOIN_CHANNEL: u8 = 2;

/// Maximum data frame payload: the largest Opus packet (RFC 6716).
/// The relay never inspects payload bytes.
pub const MAX_PAYLOAD: usize = 1275;

/// Maximum UTF-8 byte length of a username or password
pub const MAX_CREDENTIAL_BYTES: usize = 255;

/// Server→client frame header: 4-byte sender ID + 2-byte payload length
pub const RELAY_HEADER: usize = 6;

/// Scratch buffer size for one fully framed relay message
pub const FRAME_BUF: usize = RELAY_HEADER + MAX_PAYLOAD;

/// Channel 0 is a quarantine: clients on it receive and send nothing
pub const QUARANTINE_CHANNEL: u32 = 0;

/// A control message, tagged by its first wire byte.
///
/// Unknown type tags decode to [`ControlMessage::Invalid`] rather than an
/// error, so the consumer can log and ignore them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Credentials plus the per-connection echo flag (type=1)
    Authentication {
        echo: bool,
        username: String,
        password: String,
    },
    /// Re-assign this client to a channel (type=2)
    JoinChannel { channel_id: u32 },
    /// Any other type tag; parsed and ignored
    Invalid { ty: u8 },
}

impl ControlMessage {
    /// Check if this is an authentication message
    pub fn is_authentication(&self) -> bool {
        matches!(self, ControlMessage::Authentication { .. })
    }
}
