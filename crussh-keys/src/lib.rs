#![deny(trivial_casts, unstable_features, unused_import_braces)]
//! This crate contains methods to deal with SSH2 keys, as defined in
//! crate Crussh. This includes in particular functions for reading and
//! writing the binary key-file containers (with their magic-code
//! headers), deciphering encrypted private keys, keeping per-host key
//! records, and talking to authentication agents.
//!
//! The agent speaks the framed `length || type || payload` protocol
//! over a user-scoped local socket, holds private keys in memory only,
//! and signs or decrypts on behalf of clients without ever releasing
//! a key.

#![recursion_limit = "128"]
#[macro_use]
extern crate thiserror;
#[macro_use]
extern crate log;

#[cfg(test)]
extern crate env_logger;

use std::io::Read;
use std::path::Path;

pub mod encoding;
pub mod key;

mod blob;
pub use blob::*;

pub mod hostkeys;

/// A module to write and speak to authentication agents.
pub mod agent;

#[derive(Debug, Error)]
pub enum Error {
    /// The key could not be read, for an unknown reason.
    #[error("Could not read key")]
    CouldNotReadKey,
    /// The type of the key is unsupported.
    #[error("Unsupported key type")]
    UnsupportedKeyType(Vec<u8>),
    /// The key is encrypted (should supply a passphrase?).
    #[error("The key is encrypted")]
    KeyIsEncrypted,
    /// Home directory could not be found.
    #[error("No home directory found")]
    NoHomeDir,
    /// The server key has changed.
    #[error("The server key changed, remove {} if this is expected", path)]
    KeyChanged { path: String },
    /// A signature had the wrong shape.
    #[error("Invalid signature")]
    InvalidSignature,
    /// A digest submitted for signing had the wrong length.
    #[error("Digest has the wrong length")]
    InvalidDigestLength,
    /// Index out of bounds.
    #[error("Index out of bounds")]
    IndexOutOfBounds,
    /// Agent protocol error.
    #[error("Agent protocol error")]
    AgentProtocolError,
    #[error("Agent failure")]
    AgentFailure,
    /// The agent refused the operation, with this error kind.
    #[error("Agent error: {0}")]
    Agent(agent::ErrorKind),
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Openssl(#[from] openssl::error::ErrorStack),

    #[error("Environment variable `{0}` not found")]
    EnvVar(&'static str),
    #[error("Unable to connect to the agent. The environment variable `SSH2_AUTH_SOCK` \
    was set, but it points to a nonexistent file or directory.")]
    BadAuthSock,
}

/// Load a public key from a file in the binary container format.
pub fn load_public_key<P: AsRef<Path>>(path: P) -> Result<key::PublicKey, Error> {
    let mut data = Vec::new();
    std::fs::File::open(path.as_ref())?.read_to_end(&mut data)?;
    let (blob, _) = decode_public_key(&data)?;
    key::parse_public_key(&blob)
}

/// Load a secret key, deciphering it with the supplied passphrase if
/// necessary.
pub fn load_secret_key<P: AsRef<Path>>(
    path: P,
    passphrase: Option<&str>,
) -> Result<key::KeyPair, Error> {
    let mut data = Vec::new();
    std::fs::File::open(path.as_ref())?.read_to_end(&mut data)?;
    let (key, _) = decode_secret_key(&data, passphrase)?;
    Ok(key)
}

/// Write a secret key to a file (mode 0600 on Unix), encrypting it when
/// a passphrase is supplied.
pub fn save_secret_key<P: AsRef<Path>>(
    key: &key::KeyPair,
    path: P,
    passphrase: Option<&str>,
    comment: &str,
) -> Result<(), Error> {
    let data = encode_secret_key(key, passphrase, comment)?;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    use std::io::Write;
    options.open(path.as_ref())?.write_all(&data)?;
    Ok(())
}

/// Write the public half of a key to a file, with a comment.
pub fn save_public_key<P: AsRef<Path>>(
    key: &key::PublicKey,
    path: P,
    comment: &str,
) -> Result<(), Error> {
    let data = encode_public_key(&key.blob()?, comment);
    std::fs::write(path.as_ref(), &data)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::agent;
    use futures::stream;

    /// Run an agent server over an in-memory pipe and hand the client
    /// half to the test body.
    fn agent_pair() -> (
        agent::client::AgentClient<tokio::io::DuplexStream>,
        tokio::task::JoinHandle<Result<(), Error>>,
    ) {
        let (client_side, server_side) = tokio::io::duplex(65536);
        let listener = stream::iter(vec![tokio::io::Result::Ok(server_side)]);
        let join = tokio::spawn(agent::server::serve(listener, ()));
        (agent::client::AgentClient::connect(client_side), join)
    }

    #[tokio::test]
    async fn agent_version() {
        env_logger::try_init().unwrap_or(());
        let (mut client, _join) = agent_pair();
        assert_eq!(client.request_version().await.unwrap(), agent::VERSION);
    }

    #[tokio::test]
    async fn agent_empty_list() {
        env_logger::try_init().unwrap_or(());
        let (mut client, _join) = agent_pair();
        // A freshly started agent answers with an empty list, not an
        // error.
        let keys = client.list_keys().await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn agent_add_list_sign_delete() {
        env_logger::try_init().unwrap_or(());
        let (mut client, _join) = agent_pair();

        let key = key::KeyPair::generate_dss(1024).unwrap();
        client.add_key(&key, "test key").await.unwrap();
        // Re-adding the same key is a successful no-op.
        client.add_key(&key, "test key").await.unwrap();

        let keys = client.list_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].1, "test key");
        assert_eq!(keys[0].0, key.clone_public_key());

        let public = key.clone_public_key();
        let data = cryptovec::CryptoVec::from_slice(b"Please sign this");
        let (mut client, sig) = client.sign_request(&public, data).await;
        let sig = sig.unwrap();
        // The signature blob is appended to the signed data.
        use crate::encoding::Reader;
        let mut r = sig.reader(b"Please sign this".len());
        let mut sig_r = r.read_string().unwrap().reader(0);
        assert_eq!(sig_r.read_string().unwrap(), b"ssh-dss");
        let raw = sig_r.read_string().unwrap();
        assert!(public.verify_detached(b"Please sign this", raw));

        client.delete_all_keys().await.unwrap();
        assert!(client.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn agent_sign_digest() {
        env_logger::try_init().unwrap_or(());
        let (mut client, _join) = agent_pair();

        let key = key::KeyPair::generate_dss(1024).unwrap();
        client.add_key(&key, "raw signing").await.unwrap();
        let public = key.clone_public_key();

        // The "sign" operation takes the digest as-is; the resulting
        // signature verifies under the ordinary scheme.
        let digest =
            openssl::hash::hash(openssl::hash::MessageDigest::sha1(), b"payload").unwrap();
        let raw = client.sign_digest(&public, &digest).await.unwrap();
        assert!(public.verify_detached(b"payload", &raw));

        // Anything that is not a SHA-1 digest is refused by size.
        match client.sign_digest(&public, b"payload").await {
            Err(Error::Agent(agent::ErrorKind::SizeError)) => {}
            r => panic!("unexpected result {:?}", r.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn agent_sign_unknown_key() {
        env_logger::try_init().unwrap_or(());
        let (client, _join) = agent_pair();
        let public = key::KeyPair::generate_dss(1024)
            .unwrap()
            .clone_public_key();
        let data = cryptovec::CryptoVec::from_slice(b"data");
        let (_client, sig) = client.sign_request(&public, data).await;
        match sig {
            Err(Error::Agent(agent::ErrorKind::KeyNotFound)) => {}
            r => panic!("unexpected result {:?}", r.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn agent_decrypt() {
        env_logger::try_init().unwrap_or(());
        let (mut client, _join) = agent_pair();
        let key = key::KeyPair::generate_rsa(2048).unwrap();
        client.add_key(&key, "rsa").await.unwrap();
        let public = key.clone_public_key();

        let ciphertext = {
            let rsa = match &public {
                key::PublicKey::Rsa(k) => k.0.rsa().unwrap(),
                _ => unreachable!(),
            };
            let mut out = vec![0; rsa.size() as usize];
            let n = rsa
                .public_encrypt(b"secret", &mut out, openssl::rsa::Padding::PKCS1)
                .unwrap();
            out.truncate(n);
            out
        };
        let plain = client.decrypt(&public, &ciphertext).await.unwrap();
        assert_eq!(&plain[..], b"secret");

        // A DSS key is not suitable for decryption.
        let dss = key::KeyPair::generate_dss(1024).unwrap();
        client.add_key(&dss, "dss").await.unwrap();
        match client.decrypt(&dss.clone_public_key(), b"x").await {
            Err(Error::Agent(agent::ErrorKind::KeyNotSuitable)) => {}
            r => panic!("unexpected result {:?}", r.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn agent_forwarding_notice_is_silent() {
        env_logger::try_init().unwrap_or(());
        let (mut client, _join) = agent_pair();
        client
            .forwarding_notice("gateway.example.com", "", 22)
            .await
            .unwrap();
        // The notice has no reply; the next request must still line up.
        assert_eq!(client.request_version().await.unwrap(), agent::VERSION);
    }
}
