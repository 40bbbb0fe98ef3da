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
use crate::encoding::{Encoding, Reader};
use crate::Error;
use cryptovec::CryptoVec;
use openssl::bn::{BigNum, BigNumContext};
use openssl::dsa::{Dsa, DsaSig};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
/// Name of a public key algorithm.
pub struct Name(pub &'static str);

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

/// The name of the DSS algorithm for SSH.
pub const DSS: Name = Name("ssh-dss");
/// The name of the RSA algorithm for SSH.
pub const SSH_RSA: Name = Name("ssh-rsa");

/// Length of a raw DSS signature: two 160-bit integers.
pub const DSS_SIGNATURE_LEN: usize = 40;

/// Length of the SHA-1 digests this suite's signature schemes operate
/// on.
pub const DIGEST_LEN: usize = 20;

impl Name {
    /// Base name of the private key file for a key name.
    pub fn identity_file(&self) -> &'static str {
        match *self {
            DSS => "id_dsa",
            SSH_RSA => "id_rsa",
            _ => unreachable!(),
        }
    }
}

#[doc(hidden)]
pub trait Verify {
    fn verify_client_auth(&self, buffer: &[u8], sig: &[u8]) -> bool;
    fn verify_server_auth(&self, buffer: &[u8], sig: &[u8]) -> bool;
}

/// A public key wrapped for structural equality.
#[derive(Clone)]
pub struct OpenSSLPKey(pub PKey<Public>);

impl PartialEq for OpenSSLPKey {
    fn eq(&self, b: &OpenSSLPKey) -> bool {
        self.0.public_eq(&b.0)
    }
}
impl Eq for OpenSSLPKey {}
impl std::fmt::Debug for OpenSSLPKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "OpenSSLPKey {{ (hidden) }}")
    }
}

/// Public key
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum PublicKey {
    #[doc(hidden)]
    Dss(OpenSSLPKey),
    #[doc(hidden)]
    Rsa(OpenSSLPKey),
}

impl PublicKey {
    /// Parse a public key in SSH format, given the negotiated algorithm
    /// name and the key blob.
    pub fn parse(algo: &[u8], pubkey: &[u8]) -> Result<Self, Error> {
        match algo {
            b"ssh-dss" => {
                let mut p = pubkey.reader(0);
                if p.read_string()? != b"ssh-dss" {
                    return Err(Error::CouldNotReadKey);
                }
                let key_p = BigNum::from_slice(p.read_mpint()?)?;
                let key_q = BigNum::from_slice(p.read_mpint()?)?;
                let key_g = BigNum::from_slice(p.read_mpint()?)?;
                let key_y = BigNum::from_slice(p.read_mpint()?)?;
                Ok(PublicKey::Dss(OpenSSLPKey(PKey::from_dsa(
                    Dsa::from_public_components(key_p, key_q, key_g, key_y)?,
                )?)))
            }
            b"ssh-rsa" => {
                let mut p = pubkey.reader(0);
                if p.read_string()? != b"ssh-rsa" {
                    return Err(Error::CouldNotReadKey);
                }
                let key_e = BigNum::from_slice(p.read_mpint()?)?;
                let key_n = BigNum::from_slice(p.read_mpint()?)?;
                Ok(PublicKey::Rsa(OpenSSLPKey(PKey::from_rsa(
                    Rsa::from_public_components(key_n, key_e)?,
                )?)))
            }
            _ => Err(Error::CouldNotReadKey),
        }
    }

    /// Algorithm name for that key.
    pub fn name(&self) -> &'static str {
        match *self {
            PublicKey::Dss(_) => DSS.0,
            PublicKey::Rsa(_) => SSH_RSA.0,
        }
    }

    /// Encode this key as an SSH public key blob.
    pub fn blob(&self) -> Result<Vec<u8>, Error> {
        let mut s = Vec::new();
        match *self {
            PublicKey::Dss(ref key) => {
                let dsa = key.0.dsa()?;
                s.extend_ssh_string(b"ssh-dss");
                s.extend_ssh_mpint(&dsa.p().to_vec());
                s.extend_ssh_mpint(&dsa.q().to_vec());
                s.extend_ssh_mpint(&dsa.g().to_vec());
                s.extend_ssh_mpint(&dsa.pub_key().to_vec());
            }
            PublicKey::Rsa(ref key) => {
                let rsa = key.0.rsa()?;
                s.extend_ssh_string(b"ssh-rsa");
                s.extend_ssh_mpint(&rsa.e().to_vec());
                s.extend_ssh_mpint(&rsa.n().to_vec());
            }
        }
        Ok(s)
    }

    /// Verify a raw signature over `buffer`.
    pub fn verify_detached(&self, buffer: &[u8], sig: &[u8]) -> bool {
        use openssl::sign::Verifier;
        match self {
            &PublicKey::Dss(ref key) => {
                let verify = || -> Result<bool, Error> {
                    let der = dss_signature_to_der(sig)?;
                    let mut verifier = Verifier::new(MessageDigest::sha1(), &key.0)?;
                    verifier.update(buffer)?;
                    Ok(verifier.verify(&der)?)
                };
                verify().unwrap_or(false)
            }
            &PublicKey::Rsa(ref key) => {
                let verify = || -> Result<bool, Error> {
                    let mut verifier = Verifier::new(MessageDigest::sha1(), &key.0)?;
                    verifier.update(buffer)?;
                    Ok(verifier.verify(sig)?)
                };
                verify().unwrap_or(false)
            }
        }
    }

    /// Compute the key fingerprint, hashed with sha2-256.
    pub fn fingerprint(&self) -> String {
        let key = self.blob().unwrap_or_else(|_| Vec::new());
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&key[..]);
        data_encoding::BASE64_NOPAD.encode(&hasher.finalize())
    }
}

impl Verify for PublicKey {
    fn verify_client_auth(&self, buffer: &[u8], sig: &[u8]) -> bool {
        self.verify_detached(buffer, sig)
    }
    fn verify_server_auth(&self, buffer: &[u8], sig: &[u8]) -> bool {
        self.verify_detached(buffer, sig)
    }
}

/// A key pair.
pub enum KeyPair {
    Dss(Dsa<Private>),
    Rsa(Rsa<Private>),
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            KeyPair::Dss(_) => write!(f, "Dss {{ (hidden) }}"),
            KeyPair::Rsa(_) => write!(f, "Rsa {{ (hidden) }}"),
        }
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        match self {
            KeyPair::Dss(k) => KeyPair::Dss(k.clone()),
            KeyPair::Rsa(k) => KeyPair::Rsa(k.clone()),
        }
    }
}

impl<'b> crate::encoding::Bytes for &'b KeyPair {
    fn bytes(&self) -> &[u8] {
        self.name().as_bytes()
    }
}

impl KeyPair {
    /// Copy the public key of this algorithm.
    pub fn clone_public_key(&self) -> PublicKey {
        let key = || -> Result<PublicKey, Error> {
            match self {
                &KeyPair::Dss(ref key) => {
                    let dsa = Dsa::from_public_components(
                        key.p().to_owned()?,
                        key.q().to_owned()?,
                        key.g().to_owned()?,
                        key.pub_key().to_owned()?,
                    )?;
                    Ok(PublicKey::Dss(OpenSSLPKey(PKey::from_dsa(dsa)?)))
                }
                &KeyPair::Rsa(ref key) => {
                    let rsa = Rsa::from_public_components(
                        key.n().to_owned()?,
                        key.e().to_owned()?,
                    )?;
                    Ok(PublicKey::Rsa(OpenSSLPKey(PKey::from_rsa(rsa)?)))
                }
            }
        };
        key().unwrap()
    }

    /// Name of this key algorithm.
    pub fn name(&self) -> &'static str {
        match *self {
            KeyPair::Dss(_) => DSS.0,
            KeyPair::Rsa(_) => SSH_RSA.0,
        }
    }

    /// Generate a DSS key pair.
    pub fn generate_dss(bits: usize) -> Option<Self> {
        let key = Dsa::generate(bits as u32).ok()?;
        Some(KeyPair::Dss(key))
    }

    /// Generate an RSA key pair.
    pub fn generate_rsa(bits: usize) -> Option<Self> {
        let key = Rsa::generate(bits as u32).ok()?;
        Some(KeyPair::Rsa(key))
    }

    /// Encode the public half as an SSH public key blob.
    pub fn public_blob(&self) -> Result<Vec<u8>, Error> {
        let mut s = Vec::new();
        match *self {
            KeyPair::Dss(ref key) => {
                s.extend_ssh_string(b"ssh-dss");
                s.extend_ssh_mpint(&key.p().to_vec());
                s.extend_ssh_mpint(&key.q().to_vec());
                s.extend_ssh_mpint(&key.g().to_vec());
                s.extend_ssh_mpint(&key.pub_key().to_vec());
            }
            KeyPair::Rsa(ref key) => {
                s.extend_ssh_string(b"ssh-rsa");
                s.extend_ssh_mpint(&key.e().to_vec());
                s.extend_ssh_mpint(&key.n().to_vec());
            }
        }
        Ok(s)
    }

    /// Encode the whole key pair as an SSH private key blob. The blob
    /// stays in a `CryptoVec` so that it is zeroed on drop.
    pub fn private_blob(&self) -> Result<CryptoVec, Error> {
        let mut s = CryptoVec::new();
        match *self {
            KeyPair::Dss(ref key) => {
                s.extend_ssh_string(b"ssh-dss");
                s.extend_ssh_mpint(&key.p().to_vec());
                s.extend_ssh_mpint(&key.q().to_vec());
                s.extend_ssh_mpint(&key.g().to_vec());
                s.extend_ssh_mpint(&key.pub_key().to_vec());
                s.extend_ssh_mpint(&key.priv_key().to_vec());
            }
            KeyPair::Rsa(ref key) => {
                s.extend_ssh_string(b"ssh-rsa");
                s.extend_ssh_mpint(&key.e().to_vec());
                s.extend_ssh_mpint(&key.n().to_vec());
                s.extend_ssh_mpint(&key.d().to_vec());
                let iqmp = key
                    .iqmp()
                    .ok_or(Error::CouldNotReadKey)?;
                s.extend_ssh_mpint(&iqmp.to_vec());
                s.extend_ssh_mpint(&key.p().ok_or(Error::CouldNotReadKey)?.to_vec());
                s.extend_ssh_mpint(&key.q().ok_or(Error::CouldNotReadKey)?.to_vec());
            }
        }
        Ok(s)
    }

    /// Decode a private key blob produced by [`private_blob`].
    ///
    /// [`private_blob`]: #method.private_blob
    pub fn parse_private_blob(blob: &[u8]) -> Result<KeyPair, Error> {
        let mut r = blob.reader(0);
        match r.read_string()? {
            b"ssh-dss" => {
                let p = BigNum::from_slice(r.read_mpint()?)?;
                let q = BigNum::from_slice(r.read_mpint()?)?;
                let g = BigNum::from_slice(r.read_mpint()?)?;
                let pub_key = BigNum::from_slice(r.read_mpint()?)?;
                let priv_key = BigNum::from_slice(r.read_mpint()?)?;
                Ok(KeyPair::Dss(Dsa::from_private_components(
                    p, q, g, priv_key, pub_key,
                )?))
            }
            b"ssh-rsa" => {
                let e = BigNum::from_slice(r.read_mpint()?)?;
                let n = BigNum::from_slice(r.read_mpint()?)?;
                let d = BigNum::from_slice(r.read_mpint()?)?;
                let iqmp = BigNum::from_slice(r.read_mpint()?)?;
                let p = BigNum::from_slice(r.read_mpint()?)?;
                let q = BigNum::from_slice(r.read_mpint()?)?;
                let (dp, dq) = {
                    let one = BigNum::from_u32(1)?;
                    let p1 = p.as_ref() - one.as_ref();
                    let q1 = q.as_ref() - one.as_ref();
                    let mut context = BigNumContext::new()?;
                    let mut dp = BigNum::new()?;
                    let mut dq = BigNum::new()?;
                    dp.checked_rem(&d, &p1, &mut context)?;
                    dq.checked_rem(&d, &q1, &mut context)?;
                    (dp, dq)
                };
                Ok(KeyPair::Rsa(Rsa::from_private_components(
                    n, e, d, p, q, dp, dq, iqmp,
                )?))
            }
            _ => Err(Error::CouldNotReadKey),
        }
    }

    /// Sign a slice using this algorithm, returning the raw signature
    /// bytes (for DSS, the two 160-bit integers concatenated). The
    /// data is hashed before the private-key operation.
    pub fn sign_detached(&self, to_sign: &[u8]) -> Result<Vec<u8>, Error> {
        use openssl::sign::Signer;
        match self {
            &KeyPair::Dss(ref key) => {
                let pkey = PKey::from_dsa(key.clone())?;
                let mut signer = Signer::new(MessageDigest::sha1(), &pkey)?;
                signer.update(to_sign)?;
                let der = signer.sign_to_vec()?;
                dss_signature_from_der(&der)
            }
            &KeyPair::Rsa(ref key) => {
                let pkey = PKey::from_rsa(key.clone())?;
                let mut signer = Signer::new(MessageDigest::sha1(), &pkey)?;
                signer.update(to_sign)?;
                Ok(signer.sign_to_vec()?)
            }
        }
    }

    /// Apply the private-key operation directly to a precomputed
    /// SHA-1 digest, with no further hashing. This is what the agent's
    /// "sign" operation does; [`sign_detached`] is its "hash-and-sign"
    /// counterpart, and both produce signatures under the same scheme.
    ///
    /// [`sign_detached`]: #method.sign_detached
    pub fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, Error> {
        use openssl::md::Md;
        use openssl::pkey_ctx::PkeyCtx;
        if digest.len() != DIGEST_LEN {
            return Err(Error::InvalidDigestLength);
        }
        match self {
            &KeyPair::Dss(ref key) => {
                let pkey = PKey::from_dsa(key.clone())?;
                let mut ctx = PkeyCtx::new(&pkey)?;
                ctx.sign_init()?;
                ctx.set_signature_md(Md::sha1())?;
                let mut der = Vec::new();
                ctx.sign_to_vec(digest, &mut der)?;
                dss_signature_from_der(&der)
            }
            &KeyPair::Rsa(ref key) => {
                let pkey = PKey::from_rsa(key.clone())?;
                let mut ctx = PkeyCtx::new(&pkey)?;
                ctx.sign_init()?;
                ctx.set_signature_md(Md::sha1())?;
                let mut sig = Vec::new();
                ctx.sign_to_vec(digest, &mut sig)?;
                Ok(sig)
            }
        }
    }

    #[doc(hidden)]
    /// This is used by the server to sign the exchange hash in the DH
    /// key exchange. Note: we are not signing the same kind of thing as
    /// in the function below, `add_self_signature`.
    pub fn add_signature<H: AsRef<[u8]>>(
        &self,
        buffer: &mut CryptoVec,
        to_sign: H,
    ) -> Result<(), Error> {
        let name = self.name().as_bytes();
        let signature = self.sign_detached(to_sign.as_ref())?;
        buffer.push_u32_be((name.len() + signature.len() + 8) as u32);
        buffer.extend_ssh_string(name);
        buffer.extend_ssh_string(&signature);
        Ok(())
    }

    #[doc(hidden)]
    /// This is used by the client for authentication. Note: we are not
    /// signing the same kind of thing as in the above function,
    /// `add_signature`.
    pub fn add_self_signature(&self, buffer: &mut CryptoVec) -> Result<(), Error> {
        let name = self.name().as_bytes();
        let signature = self.sign_detached(buffer)?;
        buffer.push_u32_be((name.len() + signature.len() + 8) as u32);
        buffer.extend_ssh_string(name);
        buffer.extend_ssh_string(&signature);
        Ok(())
    }
}

/// Convert a raw DSS signature (r || s, 20 bytes each) to DER for
/// openssl.
fn dss_signature_to_der(sig: &[u8]) -> Result<Vec<u8>, Error> {
    if sig.len() != DSS_SIGNATURE_LEN {
        return Err(Error::InvalidSignature);
    }
    let r = BigNum::from_slice(&sig[..DSS_SIGNATURE_LEN / 2])?;
    let s = BigNum::from_slice(&sig[DSS_SIGNATURE_LEN / 2..])?;
    Ok(DsaSig::from_private_components(r, s)?.to_der()?)
}

/// Convert a DER DSS signature to the raw SSH form, left-padding the
/// integers to 20 bytes each.
fn dss_signature_from_der(der: &[u8]) -> Result<Vec<u8>, Error> {
    let sig = DsaSig::from_der(der)?;
    let r = sig.r().to_vec();
    let s = sig.s().to_vec();
    if r.len() > DSS_SIGNATURE_LEN / 2 || s.len() > DSS_SIGNATURE_LEN / 2 {
        return Err(Error::InvalidSignature);
    }
    let mut raw = vec![0; DSS_SIGNATURE_LEN];
    raw[DSS_SIGNATURE_LEN / 2 - r.len()..DSS_SIGNATURE_LEN / 2].copy_from_slice(&r);
    raw[DSS_SIGNATURE_LEN - s.len()..].copy_from_slice(&s);
    Ok(raw)
}

/// Parse a public key blob, dispatching on the algorithm name it
/// starts with.
pub fn parse_public_key(p: &[u8]) -> Result<PublicKey, Error> {
    let mut pos = p.reader(0);
    match pos.read_string()? {
        b"ssh-dss" => PublicKey::parse(b"ssh-dss", p),
        b"ssh-rsa" => PublicKey::parse(b"ssh-rsa", p),
        _ => Err(Error::CouldNotReadKey),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dss_blob_roundtrip() {
        let key = KeyPair::generate_dss(1024).unwrap();
        let blob = key.public_blob().unwrap();
        let public = parse_public_key(&blob).unwrap();
        assert_eq!(public, key.clone_public_key());
        assert_eq!(public.blob().unwrap(), blob);
        assert_eq!(public.name(), "ssh-dss");
    }

    #[test]
    fn rsa_blob_roundtrip() {
        let key = KeyPair::generate_rsa(2048).unwrap();
        let blob = key.public_blob().unwrap();
        let public = parse_public_key(&blob).unwrap();
        assert_eq!(public, key.clone_public_key());
        assert_eq!(public.blob().unwrap(), blob);
    }

    #[test]
    fn dss_sign_verify() {
        let key = KeyPair::generate_dss(1024).unwrap();
        let sig = key.sign_detached(b"some signed data").unwrap();
        assert_eq!(sig.len(), DSS_SIGNATURE_LEN);
        let public = key.clone_public_key();
        assert!(public.verify_detached(b"some signed data", &sig));
        assert!(!public.verify_detached(b"some other data", &sig));
    }

    #[test]
    fn rsa_sign_verify() {
        let key = KeyPair::generate_rsa(2048).unwrap();
        let sig = key.sign_detached(b"some signed data").unwrap();
        let public = key.clone_public_key();
        assert!(public.verify_detached(b"some signed data", &sig));
        assert!(!public.verify_detached(b"some other data", &sig));
    }

    #[test]
    fn sign_digest_matches_the_hashing_scheme() {
        use openssl::hash::{hash, MessageDigest};
        // Signing a precomputed SHA-1 digest yields a signature that
        // verifies under the ordinary hash-and-sign scheme.
        for key in [
            KeyPair::generate_dss(1024).unwrap(),
            KeyPair::generate_rsa(2048).unwrap(),
        ]
        .iter()
        {
            let digest = hash(MessageDigest::sha1(), b"some signed data").unwrap();
            let sig = key.sign_digest(&digest).unwrap();
            let public = key.clone_public_key();
            assert!(public.verify_detached(b"some signed data", &sig));

            // The digest is signed as-is, not hashed again.
            let rehashed = key.sign_detached(&digest).unwrap();
            assert!(!public.verify_detached(b"some signed data", &rehashed));

            match key.sign_digest(b"not a digest") {
                Err(Error::InvalidDigestLength) => {}
                r => panic!("unexpected result {:?}", r.map(|_| ())),
            }
        }
    }

    #[test]
    fn private_blob_roundtrip() {
        let key = KeyPair::generate_dss(1024).unwrap();
        let blob = key.private_blob().unwrap();
        let restored = KeyPair::parse_private_blob(&blob).unwrap();
        assert_eq!(
            restored.public_blob().unwrap(),
            key.public_blob().unwrap()
        );
        let sig = restored.sign_detached(b"x").unwrap();
        assert!(key.clone_public_key().verify_detached(b"x", &sig));
    }
}
