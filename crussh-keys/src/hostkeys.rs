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

//! The per-host key store: one public key record per (host, port) pair,
//! kept in a `hostkeys` directory under the user directory. Records are
//! appended on first use; a record that no longer matches the key a
//! server presents is a fatal mismatch.

use crate::blob::{decode_public_key, encode_public_key};
use crate::key::PublicKey;
use crate::Error;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Return the user's host-key directory, `~/.ssh2/hostkeys`, creating
/// it (mode 0700) if needed.
pub fn hostkeys_dir() -> Result<PathBuf, Error> {
    let mut dir = dirs::home_dir().ok_or(Error::NoHomeDir)?;
    dir.push(".ssh2");
    dir.push("hostkeys");
    create_private_dir(&dir)?;
    Ok(dir)
}

fn create_private_dir(dir: &Path) -> Result<(), Error> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    Ok(())
}

/// Produce the record file name for a server, `key_<port>_<host>.pub`.
/// Alphabetic characters are lowercased; anything outside
/// `[a-z0-9.-]` is escaped as `_` followed by three octal digits.
pub fn host_key_filename(host: &str, port: u16) -> String {
    let mut name = format!("key_{}_", port);
    for &b in host.as_bytes() {
        if b.is_ascii_alphabetic() {
            name.push(b.to_ascii_lowercase() as char);
        } else if b.is_ascii_digit() || b == b'.' || b == b'-' {
            name.push(b as char);
        } else {
            name.push('_');
            name.push((b'0' + (b >> 6)) as char);
            name.push((b'0' + ((b >> 3) & 7)) as char);
            name.push((b'0' + (b & 7)) as char);
        }
    }
    name.push_str(".pub");
    name
}

/// Check a server key against the store in `dir`. Returns `Ok(true)` if
/// the stored record matches, `Ok(false)` if the host has no record
/// yet, and `Err(KeyChanged)` if a record exists but holds a different
/// key.
pub fn check_host_key(
    host: &str,
    port: u16,
    key: &PublicKey,
    dir: &Path,
) -> Result<bool, Error> {
    let path = dir.join(host_key_filename(host, port));
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let (blob, _) = decode_public_key(&data)?;
    if blob == key.blob()? {
        Ok(true)
    } else {
        Err(Error::KeyChanged {
            path: path.to_string_lossy().into_owned(),
        })
    }
}

/// Record a server key in the store in `dir` (accept on first use).
/// Concurrent writers may race; the last record wins, which is harmless
/// since both saw the same key.
pub fn learn_host_key(
    host: &str,
    port: u16,
    key: &PublicKey,
    dir: &Path,
) -> Result<(), Error> {
    create_private_dir(dir)?;
    let path = dir.join(host_key_filename(host, port));
    let comment = format!("host key for {}, accepted on port {}", host, port);
    let record = encode_public_key(&key.blob()?, &comment);
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&path)?;
    file.write_all(&record)?;
    Ok(())
}

/// Check a server key against the store, learning it on first use.
/// Returns `Ok(true)` when the key is acceptable.
pub fn check_or_learn_host_key(
    host: &str,
    port: u16,
    key: &PublicKey,
    dir: &Path,
) -> Result<bool, Error> {
    match check_host_key(host, port, key, dir) {
        Ok(true) => Ok(true),
        Ok(false) => {
            log::warn!("accepting key for {} without checking", host);
            learn_host_key(host, port, key, dir)?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyPair;

    #[test]
    fn filename_escaping() {
        assert_eq!(
            host_key_filename("Gateway.Example.com", 22),
            "key_22_gateway.example.com.pub"
        );
        // '_' is 0137, ':' is 072.
        assert_eq!(host_key_filename("a_b", 2222), "key_2222_a_137b.pub");
        assert_eq!(host_key_filename("fe80::1", 22), "key_22_fe80_072_0721.pub");
    }

    #[test]
    fn first_use_then_match_then_mismatch() {
        let tmp = tempdir::TempDir::new("hostkeys").unwrap();
        let dir = tmp.path();
        let key = KeyPair::generate_dss(1024).unwrap().clone_public_key();

        assert_eq!(check_host_key("host", 22, &key, dir).unwrap(), false);
        assert!(check_or_learn_host_key("host", 22, &key, dir).unwrap());
        assert_eq!(check_host_key("host", 22, &key, dir).unwrap(), true);

        // Same host, different port: a separate record.
        assert_eq!(check_host_key("host", 2222, &key, dir).unwrap(), false);

        let other = KeyPair::generate_dss(1024).unwrap().clone_public_key();
        match check_host_key("host", 22, &other, dir) {
            Err(Error::KeyChanged { .. }) => {}
            r => panic!("unexpected result {:?}", r),
        }
    }
}
