//! Connection state machine.
//!
//! Each link runs through the handshake one packet at a time. A transition
//! is a pure function of the current [`State`], the incoming [`Packet`] and a
//! [`HandshakeEnv`]: it returns the side effects to perform, in order, and the
//! next state. The [`Connection`](crate::Connection) read loop executes the
//! effects before reading the next packet.
//!
//! ```text
//! outbound                                inbound
//! InitiateGreeting --GREETINGS{name,key}--> WaitForGreeting
//!                  <--SET_COMPRESSION-----
//!                  <--BEGIN_SECURE{key}---  (secure mode)
//!                  <--ACCEPTED{name}------  -> Authenticated   (no master credentials)
//!                  <--CREDENTIALS_PLZ-----  -> WaitingForCredentials
//! AwaitingAuth.    --CREDENTIALS--------->
//!                  <--ACCEPTED{name}------  -> Authenticated
//! ```

use crate::compression;
use crate::packet::{Packet, PacketCode};
use agora_types::{name, Credentials, FlatKv, Message};
use subtle::ConstantTimeEq;

/// Protocol phase of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Outbound side, initial.
    InitiateGreeting,
    /// Inbound side, initial.
    WaitForGreeting,
    /// Inbound side has demanded credentials.
    WaitingForCredentials,
    /// Outbound side has submitted credentials.
    AwaitingAuthentication,
    /// Steady state; user traffic flows.
    Authenticated,
    /// Inbound side at capacity; refuses and hangs up.
    TooManyPeers,
}

/// Node-level facts the handshake consults.
pub trait HandshakeEnv {
    fn local_name(&self) -> &str;
    /// Base64 public key of this connection.
    fn public_key(&self) -> String;
    /// Compressor announced to inbound peers.
    fn compression(&self) -> &str;
    /// Whether inbound handshakes negotiate encryption.
    fn secure(&self) -> bool;
    /// Credentials inbound peers must present.
    fn master_credentials(&self) -> Option<&Credentials>;
    /// Credentials to present when a peer demands them.
    fn request_credentials(&self) -> Option<Credentials>;
    /// Decide whether a claimed peer name is acceptable. `Err` carries the
    /// reason sent back in NO.
    fn admit_peer_name(&self, name: &str) -> Result<(), String>;
}

/// A side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Encode with the current pipeline and write.
    Send(Packet),
    /// Switch this side's compressor.
    AdoptCompression(String),
    /// Derive the shared key from the peer's public key and switch to it.
    BeginSecure { peer_key: String },
    /// Record the remote agent's name.
    PeerNamed(String),
    /// Hand a received message to the node.
    Deliver(Message),
    /// Post-handshake control traffic the connection services itself.
    Control(Packet),
}

/// What happens to the connection after the actions run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Stay,
    Goto(State),
    Disconnect(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub actions: Vec<Action>,
    pub next: Next,
}

impl Step {
    fn stay(actions: Vec<Action>) -> Self {
        Self {
            actions,
            next: Next::Stay,
        }
    }

    fn goto(actions: Vec<Action>, state: State) -> Self {
        Self {
            actions,
            next: Next::Goto(state),
        }
    }

    fn disconnect(actions: Vec<Action>, reason: impl Into<String>) -> Self {
        Self {
            actions,
            next: Next::Disconnect(reason.into()),
        }
    }

    fn unexpected(state: State, code: PacketCode) -> Self {
        Self::disconnect(vec![], format!("unexpected {code} in {state:?}"))
    }
}

impl State {
    /// Only the steady state carries user messages; handshake states
    /// suppress them.
    pub fn allows_user_traffic(self) -> bool {
        self == State::Authenticated
    }

    /// Effects to run as soon as the socket is usable.
    pub fn on_open(self, env: &dyn HandshakeEnv) -> Step {
        match self {
            State::InitiateGreeting => Step::stay(vec![Action::Send(Packet::with_params(
                PacketCode::Greetings,
                FlatKv::new()
                    .with("name", env.local_name())
                    .with("key", env.public_key()),
            ))]),
            State::TooManyPeers => too_many_peers(),
            _ => Step::stay(vec![]),
        }
    }

    /// Interpret one received packet.
    pub fn on_packet(self, packet: Packet, env: &dyn HandshakeEnv) -> Step {
        match self {
            State::InitiateGreeting => initiate_greeting(packet, env),
            State::WaitForGreeting => wait_for_greeting(packet, env),
            State::WaitingForCredentials => waiting_for_credentials(packet, env),
            State::AwaitingAuthentication => awaiting_authentication(packet),
            State::Authenticated => authenticated(packet),
            State::TooManyPeers => too_many_peers(),
        }
    }
}

fn too_many_peers() -> Step {
    Step::disconnect(
        vec![Action::Send(Packet::bare(PacketCode::TooManyPeers))],
        "too many peers",
    )
}

fn accepted(packet: &Packet) -> Step {
    match packet.param("name") {
        Ok(peer) if name::is_valid(&peer) => {
            Step::goto(vec![Action::PeerNamed(peer)], State::Authenticated)
        }
        _ => Step::disconnect(vec![], "ACCEPTED without a valid peer name"),
    }
}

fn initiate_greeting(packet: Packet, env: &dyn HandshakeEnv) -> Step {
    match packet.code {
        PacketCode::Accepted => accepted(&packet),
        PacketCode::CredentialsPlz => match env.request_credentials() {
            Some(creds) => Step::goto(
                vec![Action::Send(Packet::with_params(
                    PacketCode::Credentials,
                    FlatKv::new()
                        .with("username", creds.username)
                        .with("password", creds.password),
                ))],
                State::AwaitingAuthentication,
            ),
            None => Step::disconnect(
                vec![Action::Send(Packet::bare(PacketCode::NoCredentials))],
                "peer demanded credentials but none are configured",
            ),
        },
        PacketCode::BeginSecure => match packet.param("key") {
            Ok(peer_key) => Step::stay(vec![Action::BeginSecure { peer_key }]),
            Err(_) => Step::disconnect(vec![], "BEGIN_SECURE without a key"),
        },
        PacketCode::SetCompression => match packet.param("name") {
            Ok(name) if compression::by_name(&name).is_some() => {
                Step::stay(vec![Action::AdoptCompression(name)])
            }
            _ => Step::disconnect(vec![], "unsupported compression"),
        },
        PacketCode::TooManyPeers => Step::disconnect(vec![], "peer has too many connections"),
        PacketCode::NotAServer => Step::disconnect(vec![], "peer is not accepting connections"),
        PacketCode::No => Step::disconnect(
            vec![],
            format!(
                "peer refused: {}",
                packet.params().get("reason").unwrap_or("no reason given")
            ),
        ),
        code => Step::unexpected(State::InitiateGreeting, code),
    }
}

fn wait_for_greeting(packet: Packet, env: &dyn HandshakeEnv) -> Step {
    if packet.code != PacketCode::Greetings {
        return Step::unexpected(State::WaitForGreeting, packet.code);
    }
    let params = packet.params();
    let peer = params.get("name").unwrap_or_default();
    let refuse = |reason: String| {
        Step::disconnect(
            vec![Action::Send(Packet::with_params(
                PacketCode::No,
                FlatKv::new().with("reason", reason.as_str()),
            ))],
            reason,
        )
    };

    if let Err(reason) = env.admit_peer_name(peer) {
        return refuse(reason);
    }

    let mut actions = vec![
        Action::PeerNamed(peer.to_string()),
        Action::Send(Packet::with_params(
            PacketCode::SetCompression,
            FlatKv::new().with("name", env.compression()),
        )),
        Action::AdoptCompression(env.compression().to_string()),
    ];

    if env.secure() {
        let Some(peer_key) = params.get("key") else {
            return refuse("secure mode requires a public key".to_string());
        };
        actions.push(Action::Send(Packet::with_params(
            PacketCode::BeginSecure,
            FlatKv::new().with("key", env.public_key()),
        )));
        actions.push(Action::BeginSecure {
            peer_key: peer_key.to_string(),
        });
    }

    if env.master_credentials().is_none() {
        actions.push(Action::Send(accept_packet(env)));
        Step::goto(actions, State::Authenticated)
    } else {
        actions.push(Action::Send(Packet::bare(PacketCode::CredentialsPlz)));
        Step::goto(actions, State::WaitingForCredentials)
    }
}

fn waiting_for_credentials(packet: Packet, env: &dyn HandshakeEnv) -> Step {
    match packet.code {
        PacketCode::Credentials => {
            let params = packet.params();
            let offered = Credentials::new(
                params.get("username").unwrap_or_default(),
                params.get("password").unwrap_or_default(),
            );
            if credentials_match(env.master_credentials(), &offered) {
                Step::goto(
                    vec![Action::Send(accept_packet(env))],
                    State::Authenticated,
                )
            } else {
                Step::disconnect(
                    vec![Action::Send(Packet::bare(PacketCode::BadCredentials))],
                    "bad credentials",
                )
            }
        }
        PacketCode::NoCredentials => Step::disconnect(vec![], "peer has no credentials"),
        code => Step::unexpected(State::WaitingForCredentials, code),
    }
}

fn awaiting_authentication(packet: Packet) -> Step {
    match packet.code {
        PacketCode::Accepted => accepted(&packet),
        PacketCode::BadCredentials => Step::disconnect(vec![], "credentials rejected"),
        code => Step::unexpected(State::AwaitingAuthentication, code),
    }
}

fn authenticated(packet: Packet) -> Step {
    match packet.code {
        PacketCode::Propagate => match Message::deserialize(&packet.body) {
            Ok(message) => Step::stay(vec![Action::Deliver(message)]),
            Err(e) => Step::disconnect(vec![], format!("malformed message: {e}")),
        },
        PacketCode::Poke
        | PacketCode::PokeReply
        | PacketCode::RouteQuery
        | PacketCode::RouteReply
        | PacketCode::Invalidate => Step::stay(vec![Action::Control(packet)]),
        code => Step::unexpected(State::Authenticated, code),
    }
}

fn accept_packet(env: &dyn HandshakeEnv) -> Packet {
    Packet::with_params(
        PacketCode::Accepted,
        FlatKv::new().with("name", env.local_name()),
    )
}

/// Constant-time comparison against the configured master credentials.
fn credentials_match(master: Option<&Credentials>, offered: &Credentials) -> bool {
    let Some(master) = master else {
        return true;
    };
    let user_ok = master.username.as_bytes().ct_eq(offered.username.as_bytes());
    let pass_ok = master.password.as_bytes().ct_eq(offered.password.as_bytes());
    (user_ok & pass_ok).into()
}
