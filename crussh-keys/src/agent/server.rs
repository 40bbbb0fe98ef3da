use crate::encoding::{Encoding, Position, Reader};
use crate::key;
use byteorder::{BigEndian, ByteOrder};
use cryptovec::CryptoVec;
use futures::future::Future;
use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::msg;
use super::ErrorKind;
use crate::Error;

#[derive(Clone)]
struct KeyStore(Arc<RwLock<HashMap<Vec<u8>, (Arc<key::KeyPair>, String)>>>);

#[allow(missing_docs)]
#[derive(Debug)]
pub enum ServerError<E> {
    E(E),
    Error(Error),
}

/// Policy hook consulted before every private-key operation. The
/// default accepts; an implementation may prompt or consult the
/// connection's forwarding path.
pub trait Agent: Clone + Send + 'static {
    fn confirm(
        self,
        _key: Arc<key::KeyPair>,
    ) -> Box<dyn Future<Output = (Self, bool)> + Unpin + Send> {
        Box::new(futures::future::ready((self, true)))
    }
}

impl Agent for () {}

/// Serve agent clients from the given stream of connections. The key
/// table lives here, in the accept loop; connections only reach it
/// through their own task's messages.
pub async fn serve<S, L, A>(mut listener: L, agent: A) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    L: Stream<Item = tokio::io::Result<S>> + Unpin,
    A: Agent + Send + Sync + 'static,
{
    let keys = KeyStore(Arc::new(RwLock::new(HashMap::new())));
    while let Some(Ok(stream)) = listener.next().await {
        tokio::spawn(
            (Connection {
                keys: keys.clone(),
                agent: Some(agent.clone()),
                s: stream,
                buf: CryptoVec::new(),
                forwarding_path: None,
            })
            .run(),
        );
    }
    Ok(())
}

/// Serve agent clients accepted on a Unix socket listener.
#[cfg(unix)]
pub async fn serve_unix<A>(listener: tokio::net::UnixListener, agent: A) -> Result<(), Error>
where
    A: Agent + Send + Sync + 'static,
{
    serve(
        tokio_stream::wrappers::UnixListenerStream::new(listener),
        agent,
    )
    .await
}

struct Connection<S: AsyncRead + AsyncWrite + Send + 'static, A: Agent> {
    keys: KeyStore,
    agent: Option<A>,
    s: S,
    buf: CryptoVec,
    /// Hosts this connection has been forwarded through, for audit.
    forwarding_path: Option<String>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static, A: Agent + Send + 'static>
    Connection<S, A>
{
    async fn run(mut self) -> Result<(), Error> {
        let mut writebuf = CryptoVec::new();
        loop {
            // Read the frame length.
            self.buf.clear();
            self.buf.resize(4);
            self.s.read_exact(&mut self.buf).await?;
            // Read the frame: a u32 type followed by the payload.
            let len = BigEndian::read_u32(&self.buf) as usize;
            if len < 4 {
                return Err(Error::AgentProtocolError);
            }
            self.buf.clear();
            self.buf.resize(len);
            self.s.read_exact(&mut self.buf).await?;

            writebuf.clear();
            self.respond(&mut writebuf).await?;
            if !writebuf.is_empty() {
                self.s.write_all(&writebuf).await?;
                self.s.flush().await?
            }
        }
    }

    async fn respond(&mut self, writebuf: &mut CryptoVec) -> Result<(), Error> {
        writebuf.extend(&[0, 0, 0, 0]);
        let mut r = self.buf.reader(0);
        match r.read_u32() {
            Ok(msg::REQUEST_VERSION) => {
                if self.forwarding_path.is_none() {
                    self.forwarding_path = Some("(local)".to_string());
                }
                if r.position == self.buf.len() {
                    writebuf.push_u32_be(msg::VERSION_RESPONSE);
                    writebuf.push_u32_be(msg::VERSION);
                } else {
                    failure(writebuf, ErrorKind::UnsupportedOp)
                }
            }
            Ok(msg::ADD_KEY) => {
                if let Ok(true) = self.add_key(r) {
                    writebuf.push_u32_be(msg::SUCCESS)
                } else {
                    failure(writebuf, ErrorKind::Failure)
                }
            }
            Ok(msg::DELETE_ALL_KEYS) => {
                if r.position == self.buf.len() {
                    if let Ok(mut keys) = self.keys.0.write() {
                        keys.clear();
                        writebuf.push_u32_be(msg::SUCCESS)
                    } else {
                        failure(writebuf, ErrorKind::Failure)
                    }
                } else {
                    failure(writebuf, ErrorKind::UnsupportedOp)
                }
            }
            Ok(msg::LIST_KEYS) => {
                if let Ok(keys) = self.keys.0.read() {
                    writebuf.push_u32_be(msg::KEY_LIST);
                    writebuf.push_u32_be(keys.len() as u32);
                    for (blob, &(_, ref description)) in keys.iter() {
                        writebuf.extend_ssh_string(blob);
                        writebuf.extend_ssh_string(description.as_bytes());
                    }
                } else {
                    failure(writebuf, ErrorKind::Failure)
                }
            }
            Ok(msg::PRIVATE_KEY_OP) => {
                let agent = self.agent.take().unwrap();
                let agent = self.private_key_op(agent, r, writebuf).await?;
                self.agent = Some(agent);
            }
            Ok(msg::FORWARDING_NOTICE) => {
                // Informational only; no response.
                writebuf.clear();
                match Self::read_forwarding_notice(r) {
                    Ok(host) => self.append_forwarding_host(host),
                    Err(e) => debug!("bad forwarding notice: {:?}", e),
                }
                return Ok(());
            }
            _ => failure(writebuf, ErrorKind::UnsupportedOp),
        }
        let len = writebuf.len() - 4;
        BigEndian::write_u32(&mut writebuf[0..], len as u32);
        Ok(())
    }

    fn add_key(&self, mut r: Position) -> Result<bool, Error> {
        let private_blob = r.read_string()?;
        let public_blob = r.read_string()?;
        let description = std::str::from_utf8(r.read_string()?)
            .map_err(|_| Error::AgentProtocolError)?;
        let mut w = self.keys.0.write().map_err(|_| Error::AgentFailure)?;
        // A key we already hold is a successful no-op.
        if w.contains_key(public_blob) {
            return Ok(true);
        }
        let key = key::KeyPair::parse_private_blob(private_blob)?;
        w.insert(
            public_blob.to_vec(),
            (Arc::new(key), description.to_string()),
        );
        Ok(true)
    }

    fn read_forwarding_notice(mut r: Position) -> Result<String, Error> {
        let host = std::str::from_utf8(r.read_string()?)
            .map_err(|_| Error::AgentProtocolError)?
            .to_string();
        let _display = r.read_string()?;
        let _port = r.read_u32()?;
        Ok(host)
    }

    fn append_forwarding_host(&mut self, host: String) {
        match self.forwarding_path {
            Some(ref mut path) => {
                path.push(',');
                path.push_str(&host);
            }
            None => self.forwarding_path = Some(host),
        }
    }

    async fn private_key_op<'a>(
        &self,
        agent: A,
        mut r: Position<'a>,
        writebuf: &mut CryptoVec,
    ) -> Result<A, Error> {
        let op_name = r.read_string()?;
        let public_blob = r.read_string()?;
        let key = {
            let k = self.keys.0.read().map_err(|_| Error::AgentFailure)?;
            match k.get(public_blob) {
                Some(&(ref key, _)) => key.clone(),
                None => {
                    debug!("private_key_op: key not found");
                    failure(writebuf, ErrorKind::KeyNotFound);
                    return Ok(agent);
                }
            }
        };
        let (agent, ok) = agent.confirm(key.clone()).await;
        if !ok {
            failure(writebuf, ErrorKind::Denied);
            return Ok(agent);
        }
        match op_name {
            // "sign" applies the private key to a digest the client
            // already computed; "hash-and-sign" hashes the submitted
            // data first.
            b"sign" => {
                let digest = r.read_string()?;
                if digest.len() != key::DIGEST_LEN {
                    failure(writebuf, ErrorKind::SizeError);
                    return Ok(agent);
                }
                match key.sign_digest(digest) {
                    Ok(signature) => {
                        writebuf.push_u32_be(msg::OPERATION_COMPLETE);
                        writebuf.extend_ssh_string(&signature);
                    }
                    Err(e) => {
                        debug!("private_key_op: sign failed: {:?}", e);
                        failure(writebuf, ErrorKind::Failure)
                    }
                }
            }
            b"hash-and-sign" => {
                let data = r.read_string()?;
                match key.sign_detached(data) {
                    Ok(signature) => {
                        writebuf.push_u32_be(msg::OPERATION_COMPLETE);
                        writebuf.extend_ssh_string(&signature);
                    }
                    Err(e) => {
                        debug!("private_key_op: hash-and-sign failed: {:?}", e);
                        failure(writebuf, ErrorKind::Failure)
                    }
                }
            }
            b"decrypt" => {
                let data = r.read_string()?;
                match key.as_ref() {
                    key::KeyPair::Rsa(rsa) => {
                        let mut plain = vec![0; rsa.size() as usize];
                        match rsa.private_decrypt(
                            data,
                            &mut plain,
                            openssl::rsa::Padding::PKCS1,
                        ) {
                            Ok(n) => {
                                writebuf.push_u32_be(msg::OPERATION_COMPLETE);
                                writebuf.extend_ssh_string(&plain[..n]);
                            }
                            Err(_) => failure(writebuf, ErrorKind::DecryptFailed),
                        }
                    }
                    key::KeyPair::Dss(_) => failure(writebuf, ErrorKind::KeyNotSuitable),
                }
            }
            b"ssh1-challenge-response" => {
                debug!("private_key_op: ssh1 challenge-response not implemented");
                failure(writebuf, ErrorKind::UnsupportedOp)
            }
            op => {
                debug!(
                    "private_key_op: unknown op {:?}",
                    std::str::from_utf8(op)
                );
                failure(writebuf, ErrorKind::UnsupportedOp)
            }
        }
        Ok(agent)
    }
}

fn failure(writebuf: &mut CryptoVec, kind: ErrorKind) {
    writebuf.resize(4);
    writebuf.push_u32_be(msg::FAILURE);
    writebuf.push_u32_be(kind as u32);
}

/// The agent's listening socket, removed (with its directory) on
/// cleanup.
#[cfg(unix)]
pub struct AgentSocket {
    pub path: std::path::PathBuf,
    dir: std::path::PathBuf,
}

#[cfg(unix)]
impl AgentSocket {
    /// Bind the agent socket at the conventional user-scoped location,
    /// `/tmp/ssh-<user>/ssh2-<pid>-agent`, with the directory
    /// restricted to the owner.
    pub fn bind() -> Result<(tokio::net::UnixListener, AgentSocket), Error> {
        let user = std::env::var("USER").unwrap_or_else(|_| {
            format!("uid{}", unsafe { libc::getuid() })
        });
        let dir = std::path::PathBuf::from(format!("/tmp/ssh-{}", user));
        std::fs::create_dir_all(&dir)?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        let path = dir.join(format!("ssh2-{}-agent", std::process::id()));
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok((listener, AgentSocket { path, dir }))
    }

    /// Remove the socket and its directory. Removing the directory may
    /// fail if it holds other sockets; that is fine.
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = std::fs::remove_dir(&self.dir);
    }
}

/// Periodically probe the parent process; when it is gone, remove the
/// socket and terminate at once. The probe is advisory: the socket
/// permissions are the security boundary, terminating immediately just
/// narrows the window in which a leaked connection could still reach
/// the keys.
#[cfg(unix)]
pub async fn watch_parent(socket: AgentSocket) {
    let parent = unsafe { libc::getppid() };
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
    loop {
        interval.tick().await;
        if unsafe { libc::kill(parent, 0) } < 0 {
            socket.cleanup();
            unsafe { libc::_exit(1) }
        }
    }
}
