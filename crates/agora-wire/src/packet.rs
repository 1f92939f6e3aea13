//! Packets: the smallest unit exchanged on a link.
//!
//! A [`Packet`] is a [`PacketCode`] plus a body string. Handshake bodies are
//! themselves flat key-value strings; PROPAGATE bodies carry a serialized
//! [`Message`](agora_types::Message).

use crate::error::{WireError, WireResult};
use agora_types::FlatKv;
use std::fmt;

/// Every code a peer may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketCode {
    /// Outbound side introduces itself: `name`, `key`.
    Greetings = 1,
    /// Handshake complete: `name` of the accepting side.
    Accepted = 2,
    /// Inbound side demands credentials.
    CredentialsPlz = 3,
    /// `username`, `password`.
    Credentials = 4,
    /// Credentials were demanded but none are configured.
    NoCredentials = 5,
    BadCredentials = 6,
    /// Inbound side's public key: `key`. Both sides encrypt from here on.
    BeginSecure = 7,
    /// Compressor the sender uses from here on: `name`.
    SetCompression = 8,
    TooManyPeers = 9,
    NotAServer = 10,
    /// Generic refusal with a `reason`.
    No = 11,
    /// A serialized message.
    Propagate = 20,
    /// Latency probe: `id`.
    Poke = 21,
    PokeReply = 22,
    /// Remote discovery query: `id`, `destination`, `path`.
    RouteQuery = 23,
    /// Reply to a route query: `id`, optional `route`, optional `error`.
    RouteReply = 24,
    /// Undertaker forwarding: `names`, `visited`.
    Invalidate = 25,
}

impl PacketCode {
    pub const ALL: [PacketCode; 17] = [
        PacketCode::Greetings,
        PacketCode::Accepted,
        PacketCode::CredentialsPlz,
        PacketCode::Credentials,
        PacketCode::NoCredentials,
        PacketCode::BadCredentials,
        PacketCode::BeginSecure,
        PacketCode::SetCompression,
        PacketCode::TooManyPeers,
        PacketCode::NotAServer,
        PacketCode::No,
        PacketCode::Propagate,
        PacketCode::Poke,
        PacketCode::PokeReply,
        PacketCode::RouteQuery,
        PacketCode::RouteReply,
        PacketCode::Invalidate,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for PacketCode {
    type Error = WireError;

    fn try_from(value: u16) -> WireResult<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_u16() == value)
            .ok_or_else(|| WireError::StreamCorrupted(format!("unknown packet code {value}")))
    }
}

impl fmt::Display for PacketCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketCode::Greetings => "GREETINGS",
            PacketCode::Accepted => "ACCEPTED",
            PacketCode::CredentialsPlz => "CREDENTIALS_PLZ",
            PacketCode::Credentials => "CREDENTIALS",
            PacketCode::NoCredentials => "NO_CREDENTIALS",
            PacketCode::BadCredentials => "BAD_CREDENTIALS",
            PacketCode::BeginSecure => "BEGIN_SECURE",
            PacketCode::SetCompression => "SET_COMPRESSION",
            PacketCode::TooManyPeers => "TOO_MANY_PEERS",
            PacketCode::NotAServer => "NOT_A_SERVER",
            PacketCode::No => "NO",
            PacketCode::Propagate => "PROPAGATE",
            PacketCode::Poke => "POKE",
            PacketCode::PokeReply => "POKE_REPLY",
            PacketCode::RouteQuery => "ROUTE_QUERY",
            PacketCode::RouteReply => "ROUTE_REPLY",
            PacketCode::Invalidate => "INVALIDATE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub code: PacketCode,
    pub body: String,
}

impl Packet {
    pub fn new(code: PacketCode, body: impl Into<String>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }

    /// A packet with an empty body.
    pub fn bare(code: PacketCode) -> Self {
        Self::new(code, String::new())
    }

    /// A packet whose body is a flat key-value string.
    pub fn with_params(code: PacketCode, params: FlatKv) -> Self {
        Self::new(code, params.encode())
    }

    /// Decode the body as flat key-value parameters.
    pub fn params(&self) -> FlatKv {
        FlatKv::decode(&self.body)
    }

    /// Decode the body and fetch a required parameter.
    pub fn param(&self, key: &str) -> WireResult<String> {
        self.params()
            .require(key)
            .map(str::to_string)
            .map_err(|e| WireError::StreamCorrupted(format!("{} packet: {e}", self.code)))
    }

    /// The envelope form: `code=<number>&body=<escaped body>`.
    pub fn to_flat(&self) -> FlatKv {
        FlatKv::new()
            .with("code", self.code.as_u16().to_string())
            .with("body", self.body.as_str())
    }

    pub fn from_flat(kv: &FlatKv) -> WireResult<Self> {
        let raw = kv
            .require("code")
            .map_err(|e| WireError::StreamCorrupted(e.to_string()))?;
        let number: u16 = raw
            .parse()
            .map_err(|_| WireError::StreamCorrupted(format!("unparseable packet code {raw:?}")))?;
        let code = PacketCode::try_from(number)?;
        Ok(Self::new(code, kv.get("body").unwrap_or_default()))
    }
}
