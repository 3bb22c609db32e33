use serde::{Deserialize, Serialize};

/// One row of a `channel_list` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub name: String,
    pub user_count: usize,
}

/// Messages sent from client to server over the TCP control channel.
///
/// The wire form is a compact JSON object whose `type` field selects
/// the variant, e.g. `{"type":"join_channel","channel":"General"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a persistent account. Allowed before or after login;
    /// a register on a live session does not touch that session.
    Register {
        username: String,
        /// SHA-256 of the UTF-8 password, 64 lowercase hex chars.
        password_hash: String,
    },

    /// Authenticate and announce the UDP endpoint voice will be sent
    /// from (and delivered to).
    Login {
        username: String,
        password_hash: String,
        udp_ip: String,
        udp_port: u16,
    },

    /// Join a channel, leaving the current one first. Unknown names
    /// create the channel.
    JoinChannel { channel: String },

    /// Leave the current channel.
    LeaveChannel,

    /// Request the channel list with member counts.
    GetChannels,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RegisterSuccess,

    /// Sent in the clear: the client cannot decrypt anything until it
    /// has the session key carried here.
    LoginSuccess {
        voice_port: u16,
        /// Hex of the 32-byte session token.
        session_id: String,
        /// Hex of the 32-byte envelope key for this session.
        session_key: String,
    },

    /// Sent inside the session envelope; carries the channel key used
    /// by clients to encrypt voice end-to-end.
    JoinSuccess {
        channel: String,
        /// Hex of the 32-byte channel key.
        channel_key: String,
    },

    LeaveSuccess,

    /// Membership snapshot pushed to a joining client.
    UserList {
        channel: String,
        users: Vec<String>,
    },

    /// Broadcast to the other members of a channel.
    UserJoined { username: String },

    /// Broadcast to the remaining members of a channel.
    UserLeft { username: String },

    ChannelList { channels: Vec<ChannelSummary> },

    Error { message: String },
}
