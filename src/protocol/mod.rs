//! Wire protocol for the relay
//!
//! Two binary formats travel over a connection:
//!
//! - **Control messages** (client→server, control stream): a 1-byte type tag
//!   followed by a type-specific body. See [`messages::ControlMessage`].
//! - **Data frames** (data stream): client→server frames are a 2-byte
//!   little-endian length plus an opaque Opus payload; server→client frames
//!   prepend a 4-byte little-endian sender ID.
//!
//! All multi-byte integers are little-endian.

pub mod codec;
pub mod messages;

pub use codec::{
    encode_authentication, encode_data_frame, encode_join_channel, read_control, read_data_frame,
    read_relayed_frame, stamp_sender,
};
pub use messages::{
    ControlMessage, FRAME_BUF, MAX_CREDENTIAL_BYTES, MAX_PAYLOAD, QUARANTINE_CHANNEL, RELAY_HEADER,
};
