// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Server and client SSH2 asynchronous library, based on tokio/futures.
//!
//! The normal way to use this library, both for clients and for
//! servers, is by creating *handlers*, i.e. types that implement
//! `client::Handler` for clients and `server::Handler` for servers.
//!
//! The library implements the transport (binary packets, key exchange
//! over Diffie-Hellman group 14, rekeying, encryption and MAC), user
//! authentication by public key and password, and the channel
//! multiplexer with its flow control. Private keys live in
//! `crussh-keys`, either in key files or behind the authentication
//! agent, which can also be forwarded through `auth-agent@ssh.com`
//! channels.
//!
//! Here is an example client, authenticating with a key held by the
//! agent and running one command:
//!
//! ```ignore
//! let config = std::sync::Arc::new(crussh::client::Config::default());
//! let mut session = crussh::client::connect(config, "localhost:22", MyHandler).await?;
//! let mut agent = crussh_keys::agent::client::AgentClient::connect_env().await?;
//! let (agent, authenticated) = session.authenticate_agent("user", agent).await;
//! if authenticated? {
//!     let mut channel = session.channel_open_session().await?;
//!     channel.exec(true, "ls").await?;
//!     while let Some(msg) = channel.wait().await {
//!         println!("{:?}", msg)
//!     }
//! }
//! ```
//!
//! # Internal details of the event loop
//!
//! It might seem a little odd that the read/write methods for server
//! or client sessions often return neither `Result` nor
//! `Future`. This is because the data sent to the remote side is
//! buffered, because it needs to be encrypted first, and encryption
//! works on buffers, and for many algorithms, not in place.
//!
//! Hence, the event loop keeps waiting for incoming packets, reacts to
//! them by calling the provided `Handler`, which fills some buffers.
//! If the buffers are non-empty, the event loop then sends them to the
//! socket, flushes the socket, empties the buffers and starts again.
//! In the special case of the server, unsollicited messages sent
//! through a `server::Handle` are processed when there is no incoming
//! packet to read.
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
#[macro_use]
extern crate thiserror;

use std::fmt::{Display, Formatter};

pub use cryptovec::CryptoVec;
mod auth;
mod cipher;
mod compression;
mod kex;
mod key;
mod mac;
mod msg;
mod negotiation;
pub mod pattern;
mod ssh_read;
mod sshbuffer;

pub use negotiation::{Named, Preferred};
mod pty;
pub use pty::Pty;

macro_rules! push_packet {
    ( $buffer:expr, $x:expr ) => {{
        use byteorder::{BigEndian, ByteOrder};
        let i0 = $buffer.len();
        $buffer.extend(b"\0\0\0\0");
        let x = $x;
        let i1 = $buffer.len();
        use std::ops::DerefMut;
        let buf = $buffer.deref_mut();
        BigEndian::write_u32(&mut buf[i0..], (i1 - i0 - 4) as u32);
        x
    }};
}

type Sha256Hash =
    generic_array::GenericArray<u8, <sha2::Sha256 as digest::FixedOutputDirty>::OutputSize>;

mod session;

/// Server side of this library.
pub mod server;

/// Client side of this library.
pub mod client;

#[derive(Debug, Error)]
pub enum Error {
    /// The key file could not be parsed.
    #[error("Could not read key")]
    CouldNotReadKey,

    /// Unspecified problem with the beginning of key exchange.
    #[error("Key exchange init failed")]
    KexInit,

    /// No common key exchange algorithm.
    #[error("No common key exchange algorithm")]
    NoCommonKexAlgo,

    /// No common host key algorithm.
    #[error("No common key algorithm")]
    NoCommonKeyAlgo,

    /// No common cipher.
    #[error("No common key cipher")]
    NoCommonCipher,

    /// No common MAC algorithm (required by the negotiated cipher).
    #[error("No common MAC algorithm")]
    NoCommonMac,

    /// No common compression algorithm.
    #[error("No common compression algorithm")]
    NoCommonCompression,

    /// Invalid SSH version string.
    #[error("invalid SSH version string")]
    Version,

    /// The peer only speaks a protocol version we do not implement.
    #[error("protocol version not supported")]
    ProtocolVersionUnsupported,

    /// Error during key exchange.
    #[error("Key exchange failed")]
    Kex,

    /// Invalid packet authentication code.
    #[error("Wrong packet authentication code")]
    PacketAuth,

    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// The client is not yet authenticated.
    #[error("Not yet authenticated")]
    NotAuthenticated,

    /// Index out of bounds.
    #[error("Index out of bounds")]
    IndexOutOfBounds,

    /// Unknown server key.
    #[error("Unknown server key")]
    UnknownKey,

    /// The server provided a wrong signature.
    #[error("Wrong server signature")]
    WrongServerSig,

    /// Message received/sent on unopened channel.
    #[error("Channel not open")]
    WrongChannel,

    /// Disconnected
    #[error("Disconnected")]
    Disconnect,

    /// No home directory found when trying to learn new host key.
    #[error("No home directory when saving host key")]
    NoHomeDir,

    /// Remote key changed, this could mean a man-in-the-middle attack
    /// is being performed on the connection.
    #[error("Key changed, at {}", path)]
    KeyChanged { path: String },

    /// Connection closed by the remote side.
    #[error("Connection closed by the remote side")]
    HUP,

    /// Connection timeout.
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// Missing authentication method.
    #[error("No authentication method")]
    NoAuthMethod,

    #[error("Channel send error")]
    SendError,

    #[error("Pending buffer limit reached")]
    Pending,

    #[error("Failed to decrypt a packet")]
    DecryptionError,

    #[error(transparent)]
    Keys(#[from] crussh_keys::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    #[error(transparent)]
    Openssl(#[from] openssl::error::ErrorStack),

    #[cfg(feature = "flate2")]
    #[error(transparent)]
    Compress(#[from] flate2::CompressError),

    #[cfg(feature = "flate2")]
    #[error(transparent)]
    Decompress(#[from] flate2::DecompressError),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Elapsed(#[from] tokio::time::error::Elapsed),
}

#[derive(Debug, Error)]
#[error("Could not reach the event loop")]
pub struct SendError {}

/// Since handlers are large, their associated future types must implement this trait to provide reasonable default implementations (basically, rejecting all requests).
pub trait FromFinished<T>: futures::Future<Output = Result<T, Error>> {
    /// Turns type `T` into `Self`, a future yielding `T`.
    fn finished(t: T) -> Self;
}

impl<T> FromFinished<T> for futures::future::Ready<Result<T, Error>> {
    fn finished(t: T) -> Self {
        futures::future::ready(Ok(t))
    }
}

impl<T: 'static> FromFinished<T> for Box<dyn futures::Future<Output = Result<T, Error>> + Unpin> {
    fn finished(t: T) -> Self {
        Box::new(futures::future::ready(Ok(t)))
    }
}

/// The number of bytes read/written, and the number of seconds before a key re-exchange is requested.
#[derive(Debug, Clone)]
pub struct Limits {
    pub rekey_write_limit: usize,
    pub rekey_read_limit: usize,
    pub rekey_time_limit: std::time::Duration,
}

impl Limits {
    /// Create a new `Limits`, checking that the given bounds cannot lead to nonce reuse.
    pub fn new(write_limit: usize, read_limit: usize, time_limit: std::time::Duration) -> Limits {
        assert!(write_limit <= 1 << 30 && read_limit <= 1 << 30);
        Limits {
            rekey_write_limit: write_limit,
            rekey_read_limit: read_limit,
            rekey_time_limit: time_limit,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        // Following the recommendations of
        // https://tools.ietf.org/html/rfc4253#section-9
        Limits {
            rekey_write_limit: 1 << 30, // 1 Gb
            rekey_read_limit: 1 << 30,  // 1 Gb
            rekey_time_limit: std::time::Duration::from_secs(3600),
        }
    }
}

pub use auth::{AgentAuthError, MethodSet, Signer};

/// A reason for disconnection.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    #[doc(hidden)]
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

/// The type of signals that can be sent to a remote process. If you
/// plan to use custom signals, read [the
/// RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
/// understand the encoding.
#[allow(missing_docs)]
// This should be relatively self-explanatory.
#[derive(Debug, Clone)]
pub enum Sig {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    Custom(String),
}

impl Sig {
    fn name(&self) -> &str {
        match *self {
            Sig::ABRT => "ABRT",
            Sig::ALRM => "ALRM",
            Sig::FPE => "FPE",
            Sig::HUP => "HUP",
            Sig::ILL => "ILL",
            Sig::INT => "INT",
            Sig::KILL => "KILL",
            Sig::PIPE => "PIPE",
            Sig::QUIT => "QUIT",
            Sig::SEGV => "SEGV",
            Sig::TERM => "TERM",
            Sig::USR1 => "USR1",
            Sig::Custom(ref c) => c,
        }
    }
    fn from_name(name: &[u8]) -> Result<Sig, Error> {
        match name {
            b"ABRT" => Ok(Sig::ABRT),
            b"ALRM" => Ok(Sig::ALRM),
            b"FPE" => Ok(Sig::FPE),
            b"HUP" => Ok(Sig::HUP),
            b"ILL" => Ok(Sig::ILL),
            b"INT" => Ok(Sig::INT),
            b"KILL" => Ok(Sig::KILL),
            b"PIPE" => Ok(Sig::PIPE),
            b"QUIT" => Ok(Sig::QUIT),
            b"SEGV" => Ok(Sig::SEGV),
            b"TERM" => Ok(Sig::TERM),
            b"USR1" => Ok(Sig::USR1),
            x => Ok(Sig::Custom(std::str::from_utf8(x)?.to_string())),
        }
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

impl ChannelOpenFailure {
    fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The identifier of a channel.
pub struct ChannelId(u32);

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The parameters of a channel.
#[derive(Debug)]
pub(crate) struct Channel {
    recipient_channel: u32,
    sender_channel: ChannelId,
    recipient_window_size: u32,
    sender_window_size: u32,
    recipient_maximum_packet_size: u32,
    sender_maximum_packet_size: u32,
    /// Has the other side confirmed the channel?
    pub confirmed: bool,
    /// `want_reply` flags of the requests the peer sent us, in arrival
    /// order; replies consume from the front.
    pending_replies: std::collections::VecDeque<bool>,
    sent_eof: bool,
    sent_close: bool,
    received_close: bool,
    pending_data: std::collections::VecDeque<(CryptoVec, Option<u32>, usize)>,
}

#[derive(Debug)]
pub enum ChannelMsg {
    Data {
        data: CryptoVec,
    },
    ExtendedData {
        data: CryptoVec,
        ext: u32,
    },
    Eof,
    Close,
    XonXoff {
        client_can_do: bool,
    },
    ExitStatus {
        exit_status: u32,
    },
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    WindowAdjusted {
        new_size: u32,
    },
    Success,
    Failure,
}

#[cfg(test)]
mod test_session {
    use super::client::AuthResult;
    use super::server::{Auth, Server as _, Session};
    use super::*;
    use crussh_keys::key::KeyPair;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    async fn serve_once(config: Arc<server::Config>, mut sh: TestServer) -> std::net::SocketAddr {
        let socket = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = socket.accept().await.unwrap();
            let server = sh.new(socket.peer_addr().ok());
            let _ = server::run_stream(config, socket, server).await;
        });
        addr
    }

    fn server_config(keys: Vec<KeyPair>) -> server::Config {
        let mut config = server::Config::default();
        config.connection_timeout = Some(std::time::Duration::from_secs(30));
        config.auth_rejection_time = std::time::Duration::from_millis(10);
        config.keys = keys;
        config
    }

    #[tokio::test]
    async fn publickey_auth_echo_and_requests() {
        env_logger::try_init().unwrap_or(());

        let client_key = KeyPair::generate_dss(1024).unwrap();
        let config = Arc::new(server_config(vec![KeyPair::generate_dss(1024).unwrap()]));
        let sh = TestServer::new();
        let addr = serve_once(config, sh).await;

        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, addr, TestClient {}).await.unwrap();
        let authenticated = session
            .authenticate_publickey("pe", Arc::new(client_key))
            .await
            .unwrap();
        assert!(authenticated);
        let mut channel = session.channel_open_session().await.unwrap();

        let data = &b"Hello, world!"[..];
        channel.data(data).await.unwrap();
        match channel.wait().await.unwrap() {
            ChannelMsg::Data { data: msg_data } => assert_eq!(*data, *msg_data),
            msg => panic!("Unexpected message {:?}", msg),
        }

        // Two requests wanting replies; the replies must come back in
        // request order: env succeeds, subsystem fails.
        channel.set_env(true, "LANG", "C").await.unwrap();
        channel.request_subsystem(true, "no-such-subsystem").await.unwrap();
        match channel.wait().await.unwrap() {
            ChannelMsg::Success => {}
            msg => panic!("Unexpected message {:?}", msg),
        }
        match channel.wait().await.unwrap() {
            ChannelMsg::Failure => {}
            msg => panic!("Unexpected message {:?}", msg),
        }

        // The server announced its exit status when we executed a
        // command.
        channel.exec(false, "true").await.unwrap();
        loop {
            match channel.wait().await.unwrap() {
                ChannelMsg::ExitStatus { exit_status } => {
                    assert_eq!(exit_status, 0);
                    break;
                }
                msg => debug!("msg = {:?}", msg),
            }
        }
    }

    #[tokio::test]
    async fn password_guesses_exhaust() {
        env_logger::try_init().unwrap_or(());

        let mut config = server_config(vec![KeyPair::generate_dss(1024).unwrap()]);
        config.password_guesses = 3;
        let config = Arc::new(config);
        let sh = TestServer::new();
        let attempts = sh.password_attempts.clone();
        let addr = serve_once(config, sh).await;

        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, addr, TestClient {}).await.unwrap();
        for _ in 0..5 {
            match session.authenticate_password("pe", "not the password").await {
                Ok(AuthResult::Failure) => {}
                r => panic!("unexpected result {:?}", r),
            }
        }
        // Three guesses were allowed; the later attempts were turned
        // away without consulting the handler, the method withdrawn.
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn agent_held_key_auth() {
        env_logger::try_init().unwrap_or(());

        // An in-memory agent holding the only accepted key.
        let (client_side, server_side) = tokio::io::duplex(65536);
        let listener = futures::stream::iter(vec![tokio::io::Result::Ok(server_side)]);
        tokio::spawn(crussh_keys::agent::server::serve(listener, ()));
        let mut agent = crussh_keys::agent::client::AgentClient::connect(client_side);
        let key = KeyPair::generate_dss(1024).unwrap();
        agent.add_key(&key, "session key").await.unwrap();

        let config = Arc::new(server_config(vec![KeyPair::generate_dss(1024).unwrap()]));
        let sh = TestServer::new();
        let addr = serve_once(config, sh).await;

        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, addr, TestClient {}).await.unwrap();
        let (_agent, authenticated) = session.authenticate_agent("pe", agent).await;
        assert!(authenticated.unwrap());

        let mut channel = session.channel_open_session().await.unwrap();
        channel.data(&b"signed in through the agent"[..]).await.unwrap();
        match channel.wait().await.unwrap() {
            ChannelMsg::Data { data } => {
                assert_eq!(&data[..], &b"signed in through the agent"[..])
            }
            msg => panic!("Unexpected message {:?}", msg),
        }
    }

    #[tokio::test]
    async fn agent_candidate_fallback() {
        env_logger::try_init().unwrap_or(());

        // Two agent-held keys, only one authorized: the refused probe
        // must not stop the client from trying the other candidate.
        let (client_side, server_side) = tokio::io::duplex(65536);
        let listener = futures::stream::iter(vec![tokio::io::Result::Ok(server_side)]);
        tokio::spawn(crussh_keys::agent::server::serve(listener, ()));
        let mut agent = crussh_keys::agent::client::AgentClient::connect(client_side);
        let unauthorized = KeyPair::generate_dss(1024).unwrap();
        let authorized = KeyPair::generate_dss(1024).unwrap();
        agent.add_key(&unauthorized, "first").await.unwrap();
        agent.add_key(&authorized, "second").await.unwrap();

        let mut sh = TestServer::new();
        sh.accepted_key = Some(authorized.public_blob().unwrap());
        let config = Arc::new(server_config(vec![KeyPair::generate_dss(1024).unwrap()]));
        let addr = serve_once(config, sh).await;

        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, addr, TestClient {}).await.unwrap();
        let (_agent, authenticated) = session.authenticate_agent("pe", agent).await;
        assert!(authenticated.unwrap());
    }

    #[tokio::test]
    async fn small_window_transfer() {
        env_logger::try_init().unwrap_or(());

        let client_key = KeyPair::generate_dss(1024).unwrap();
        let mut config = server_config(vec![KeyPair::generate_dss(1024).unwrap()]);
        // A tiny receive window: the transfer must stop and wait for
        // credit after every 64 bytes.
        config.window_size = 64;
        let config = Arc::new(config);
        let sh = TestServer::new();
        let addr = serve_once(config, sh).await;

        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, addr, TestClient {}).await.unwrap();
        assert!(session
            .authenticate_publickey("pe", Arc::new(client_key))
            .await
            .unwrap());
        let mut channel = session.channel_open_session().await.unwrap();
        assert!(channel.writable_packet_size() <= 64);

        let payload: Vec<u8> = (0..200u8).collect();
        channel.data(&payload[..]).await.unwrap();
        let mut echoed: Vec<u8> = Vec::new();
        while echoed.len() < payload.len() {
            match channel.wait().await.unwrap() {
                ChannelMsg::Data { data } => echoed.extend(&data[..]),
                ChannelMsg::WindowAdjusted { .. } => {}
                msg => panic!("Unexpected message {:?}", msg),
            }
        }
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn compressed_session() {
        env_logger::try_init().unwrap_or(());

        let client_key = KeyPair::generate_dss(1024).unwrap();
        let mut config = server_config(vec![KeyPair::generate_dss(1024).unwrap()]);
        config.preferred = Preferred::COMPRESSED;
        let config = Arc::new(config);
        let sh = TestServer::new();
        let addr = serve_once(config, sh).await;

        let mut config = client::Config::default();
        config.preferred = Preferred::COMPRESSED;
        let config = Arc::new(config);
        let mut session = client::connect(config, addr, TestClient {}).await.unwrap();
        let authenticated = session
            .authenticate_publickey("pe", Arc::new(client_key))
            .await
            .unwrap();
        assert!(authenticated);
        let mut channel = session.channel_open_session().await.unwrap();
        let data = &b"Hello, compressed world!"[..];
        channel.data(data).await.unwrap();
        match channel.wait().await.unwrap() {
            ChannelMsg::Data { data: msg_data } => assert_eq!(*data, *msg_data),
            msg => panic!("Unexpected message {:?}", msg),
        }
    }

    #[derive(Clone)]
    struct TestServer {
        clients: Arc<Mutex<HashMap<(usize, ChannelId), server::Handle>>>,
        password_attempts: Arc<AtomicUsize>,
        id: usize,
        /// When nonzero, buffer incoming data and echo it back in one
        /// piece once this many bytes have arrived.
        echo_after: usize,
        echo_buffer: Arc<Mutex<Vec<u8>>>,
        /// When set, only this public key blob is authorized.
        accepted_key: Option<Vec<u8>>,
    }

    impl TestServer {
        fn new() -> Self {
            TestServer {
                clients: Arc::new(Mutex::new(HashMap::new())),
                password_attempts: Arc::new(AtomicUsize::new(0)),
                id: 0,
                echo_after: 0,
                echo_buffer: Arc::new(Mutex::new(Vec::new())),
                accepted_key: None,
            }
        }
    }

    impl server::Server for TestServer {
        type Handler = Self;
        fn new(&mut self, _: Option<std::net::SocketAddr>) -> Self {
            let s = self.clone();
            self.id += 1;
            s
        }
    }

    impl server::Handler for TestServer {
        type Error = super::Error;
        type FutureAuth = futures::future::Ready<Result<(Self, Auth), Self::Error>>;
        type FutureUnit = futures::future::Ready<Result<(Self, Session), Self::Error>>;
        type FutureBool = futures::future::Ready<Result<(Self, Session, bool), Self::Error>>;

        fn finished_auth(self, auth: Auth) -> Self::FutureAuth {
            futures::future::ready(Ok((self, auth)))
        }
        fn finished_bool(self, b: bool, s: Session) -> Self::FutureBool {
            futures::future::ready(Ok((self, s, b)))
        }
        fn finished(self, s: Session) -> Self::FutureUnit {
            futures::future::ready(Ok((self, s)))
        }
        fn channel_open_session(self, channel: ChannelId, session: Session) -> Self::FutureUnit {
            {
                let mut clients = self.clients.lock().unwrap();
                clients.insert((self.id, channel), session.handle());
            }
            self.finished(session)
        }
        fn auth_publickey(
            self,
            _: &str,
            public_key: &crussh_keys::key::PublicKey,
        ) -> Self::FutureAuth {
            if let Some(ref accepted) = self.accepted_key {
                if public_key.blob().unwrap() != *accepted {
                    return self.finished_auth(Auth::Reject);
                }
            }
            self.finished_auth(Auth::Accept {
                forced_command: None,
            })
        }
        fn auth_password(self, _: &str, _: &str) -> Self::FutureAuth {
            self.password_attempts.fetch_add(1, Ordering::Relaxed);
            self.finished_auth(Auth::Reject)
        }
        fn data(self, channel: ChannelId, data: &[u8], mut session: Session) -> Self::FutureUnit {
            if self.echo_after == 0 {
                session.data(channel, CryptoVec::from_slice(data));
            } else {
                let complete = {
                    let mut buffer = self.echo_buffer.lock().unwrap();
                    buffer.extend_from_slice(data);
                    if buffer.len() >= self.echo_after {
                        Some(std::mem::replace(&mut *buffer, Vec::new()))
                    } else {
                        None
                    }
                };
                if let Some(complete) = complete {
                    session.data(channel, CryptoVec::from_slice(&complete));
                }
            }
            self.finished(session)
        }
        fn env_request(
            self,
            channel: ChannelId,
            _: &str,
            _: &str,
            mut session: Session,
        ) -> Self::FutureUnit {
            session.channel_success(channel);
            self.finished(session)
        }
        fn subsystem_request(
            self,
            channel: ChannelId,
            _: &str,
            mut session: Session,
        ) -> Self::FutureUnit {
            session.channel_failure(channel);
            self.finished(session)
        }
        fn exec_request(
            self,
            channel: ChannelId,
            _: &[u8],
            mut session: Session,
        ) -> Self::FutureUnit {
            session.channel_success(channel);
            session.exit_status_request(channel, 0);
            self.finished(session)
        }
    }

    struct TestClient {}

    impl client::Handler for TestClient {
        type Error = super::Error;
        type FutureUnit = futures::future::Ready<Result<(Self, client::Session), Self::Error>>;
        type FutureBool = futures::future::Ready<Result<(Self, bool), Self::Error>>;

        fn finished_bool(self, b: bool) -> Self::FutureBool {
            futures::future::ready(Ok((self, b)))
        }
        fn finished(self, session: client::Session) -> Self::FutureUnit {
            futures::future::ready(Ok((self, session)))
        }
        fn check_server_key(
            self,
            _server_public_key: &crussh_keys::key::PublicKey,
        ) -> Self::FutureBool {
            self.finished_bool(true)
        }
    }
}
