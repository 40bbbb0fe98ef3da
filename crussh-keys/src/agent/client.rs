use super::msg;
use super::ErrorKind;
use crate::encoding::{Encoding, Reader};
use crate::key;
use crate::key::PublicKey;
use crate::Error;
use byteorder::{BigEndian, ByteOrder};
use cryptovec::CryptoVec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Authentication agent client.
pub struct AgentClient<S: AsyncRead + AsyncWrite> {
    stream: S,
    buf: CryptoVec,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AgentClient<S> {
    /// Wrap an existing stream (on Unix, usually a Unix-domain socket)
    /// into an agent client.
    pub fn connect(stream: S) -> Self {
        AgentClient {
            stream,
            buf: CryptoVec::new(),
        }
    }
}

#[cfg(unix)]
impl AgentClient<tokio::net::UnixStream> {
    /// Connect to an agent listening on the given socket path.
    pub async fn connect_uds<P: AsRef<std::path::Path>>(path: P) -> Result<Self, Error> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(AgentClient {
            stream,
            buf: CryptoVec::new(),
        })
    }

    /// Connect to the agent named by the `SSH2_AUTH_SOCK` environment
    /// variable.
    pub async fn connect_env() -> Result<Self, Error> {
        let var = if let Ok(var) = std::env::var(super::AUTH_SOCK_VAR) {
            var
        } else {
            return Err(Error::EnvVar(super::AUTH_SOCK_VAR));
        };
        match Self::connect_uds(var).await {
            Err(Error::IO(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::BadAuthSock)
            }
            owise => owise,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AgentClient<S> {
    fn begin(&mut self, typ: u32) {
        self.buf.clear();
        self.buf.resize(4);
        self.buf.push_u32_be(typ);
    }

    fn finish(&mut self) {
        let len = self.buf.len() - 4;
        BigEndian::write_u32(&mut self.buf[..], len as u32);
    }

    /// Send the request in `buf` and read the framed response back into
    /// `buf`, leaving the response type at the front.
    async fn transact(&mut self) -> Result<(), Error> {
        self.stream.write_all(&self.buf).await?;
        self.stream.flush().await?;

        self.buf.clear();
        self.buf.resize(4);
        self.stream.read_exact(&mut self.buf).await?;
        let len = BigEndian::read_u32(&self.buf) as usize;
        if len < 4 {
            return Err(Error::AgentProtocolError);
        }
        self.buf.clear();
        self.buf.resize(len);
        self.stream.read_exact(&mut self.buf).await?;
        Ok(())
    }

    fn response_type(&self) -> u32 {
        BigEndian::read_u32(&self.buf)
    }

    /// Map a FAILURE response to its error kind; any other unexpected
    /// response is a protocol error.
    fn unexpected(&self) -> Error {
        if self.response_type() == msg::FAILURE {
            let mut r = self.buf.reader(4);
            match r.read_u32() {
                Ok(kind) => Error::Agent(ErrorKind::from_u32(kind)),
                Err(_) => Error::AgentProtocolError,
            }
        } else {
            Error::AgentProtocolError
        }
    }

    /// Ask the agent for its protocol version.
    pub async fn request_version(&mut self) -> Result<u32, Error> {
        self.begin(msg::REQUEST_VERSION);
        self.finish();
        self.transact().await?;
        if self.response_type() == msg::VERSION_RESPONSE {
            let mut r = self.buf.reader(4);
            Ok(r.read_u32()?)
        } else {
            Err(self.unexpected())
        }
    }

    /// Send a key to the agent. Adding a key the agent already holds is
    /// a successful no-op.
    pub async fn add_key(
        &mut self,
        key: &key::KeyPair,
        description: &str,
    ) -> Result<(), Error> {
        let private = key.private_blob()?;
        let public = key.public_blob()?;
        self.begin(msg::ADD_KEY);
        self.buf.extend_ssh_string(&private);
        self.buf.extend_ssh_string(&public);
        self.buf.extend_ssh_string(description.as_bytes());
        self.finish();
        self.transact().await?;
        if self.response_type() == msg::SUCCESS {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    /// Ask the agent to forget every key it holds.
    pub async fn delete_all_keys(&mut self) -> Result<(), Error> {
        self.begin(msg::DELETE_ALL_KEYS);
        self.finish();
        self.transact().await?;
        if self.response_type() == msg::SUCCESS {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    /// List the public halves of the keys the agent holds, with their
    /// descriptions. The agent never releases private keys.
    pub async fn list_keys(&mut self) -> Result<Vec<(PublicKey, String)>, Error> {
        self.begin(msg::LIST_KEYS);
        self.finish();
        self.transact().await?;
        if self.response_type() != msg::KEY_LIST {
            return Err(self.unexpected());
        }
        let mut keys = Vec::new();
        let mut r = self.buf.reader(4);
        let n = r.read_u32()?;
        for _ in 0..n {
            let blob = r.read_string()?;
            let description = std::str::from_utf8(r.read_string()?)
                .map_err(|_| Error::AgentProtocolError)?
                .to_string();
            match key::parse_public_key(blob) {
                Ok(key) => keys.push((key, description)),
                Err(_) => info!("unsupported key in agent listing"),
            }
        }
        Ok(keys)
    }

    /// Tell the agent this connection was forwarded through `host`.
    /// The agent records it and sends no reply.
    pub async fn forwarding_notice(
        &mut self,
        host: &str,
        display: &str,
        port: u32,
    ) -> Result<(), Error> {
        self.begin(msg::FORWARDING_NOTICE);
        self.buf.extend_ssh_string(host.as_bytes());
        self.buf.extend_ssh_string(display.as_bytes());
        self.buf.push_u32_be(port);
        self.finish();
        self.stream.write_all(&self.buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Ask the agent to sign `data`, appending the resulting signature
    /// blob to it (the format used by public key authentication).
    pub fn sign_request(
        mut self,
        public: &key::PublicKey,
        mut data: CryptoVec,
    ) -> impl futures::Future<Output = (Self, Result<CryptoVec, Error>)> {
        let name = public.name();
        let blob = public.blob();
        async move {
            let blob = match blob {
                Ok(blob) => blob,
                Err(e) => return (self, Err(e)),
            };
            self.begin(msg::PRIVATE_KEY_OP);
            self.buf.extend_ssh_string(b"hash-and-sign");
            self.buf.extend_ssh_string(&blob);
            self.buf.extend_ssh_string(&data);
            self.finish();
            if let Err(e) = self.transact().await {
                return (self, Err(e));
            }
            if self.response_type() == msg::OPERATION_COMPLETE {
                let signature = {
                    let mut r = self.buf.reader(4);
                    match r.read_string() {
                        Ok(sig) => sig.to_vec(),
                        Err(e) => return (self, Err(e)),
                    }
                };
                data.push_u32_be((name.len() + signature.len() + 8) as u32);
                data.extend_ssh_string(name.as_bytes());
                data.extend_ssh_string(&signature);
                (self, Ok(data))
            } else {
                let e = self.unexpected();
                (self, Err(e))
            }
        }
    }

    /// Ask the agent to apply the private key directly to a
    /// precomputed digest (the "sign" operation; [`sign_request`]
    /// hashes the data first). Returns the raw signature bytes.
    ///
    /// [`sign_request`]: #method.sign_request
    pub async fn sign_digest(
        &mut self,
        public: &key::PublicKey,
        digest: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let blob = public.blob()?;
        self.begin(msg::PRIVATE_KEY_OP);
        self.buf.extend_ssh_string(b"sign");
        self.buf.extend_ssh_string(&blob);
        self.buf.extend_ssh_string(digest);
        self.finish();
        self.transact().await?;
        if self.response_type() == msg::OPERATION_COMPLETE {
            let mut r = self.buf.reader(4);
            Ok(r.read_string()?.to_vec())
        } else {
            Err(self.unexpected())
        }
    }

    /// Ask the agent to decrypt a piece of data with the private half
    /// of `public` (RSA keys only).
    pub async fn decrypt(
        &mut self,
        public: &key::PublicKey,
        ciphertext: &[u8],
    ) -> Result<CryptoVec, Error> {
        let blob = public.blob()?;
        self.begin(msg::PRIVATE_KEY_OP);
        self.buf.extend_ssh_string(b"decrypt");
        self.buf.extend_ssh_string(&blob);
        self.buf.extend_ssh_string(ciphertext);
        self.finish();
        self.transact().await?;
        if self.response_type() == msg::OPERATION_COMPLETE {
            let mut r = self.buf.reader(4);
            let mut plain = CryptoVec::new();
            plain.extend(r.read_string()?);
            Ok(plain)
        } else {
            Err(self.unexpected())
        }
    }
}
