//! Persistent RSA identity used to authenticate with the debug daemon.
//!
//! The key pair is generated once and stored as two files under the key
//! directory: the private half as PKCS#8 DER and the public half as SPKI DER.
//! It is never rotated automatically; replacing it would orphan the
//! authorization the user already granted on the device.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// RSA modulus size in bits.
pub const KEY_BITS: usize = 2048;

/// Size of the encoded public key struct for a [`KEY_BITS`] key.
pub const PUBLIC_KEY_STRUCT_LEN: usize = 4 + 4 + KEY_BITS / 8 + KEY_BITS / 8 + 4;

/// File name of the persisted private key.
pub const PRIVATE_KEY_FILE: &str = "adbkey.der";

/// File name of the persisted public key.
pub const PUBLIC_KEY_FILE: &str = "adbkey.pub.der";

/// ASN.1 DigestInfo prefix for SHA-1. The daemon sends a 20-byte token and
/// expects it signed as if it were a SHA-1 digest.
const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];

/// An RSA key pair in the form the daemon authenticates against.
#[derive(Debug, Clone)]
pub struct AdbKey {
    /// The private key; the public half is derived from it.
    private: RsaPrivateKey,
}

impl AdbKey {
    /// Generates a fresh [`KEY_BITS`]-bit key pair.
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS)?;
        Ok(Self { private })
    }

    /// Wraps an existing private key.
    pub const fn from_private(private: RsaPrivateKey) -> Self {
        Self { private }
    }

    /// The public half of the key pair.
    pub fn public(&self) -> RsaPublicKey {
        self.private.to_public_key()
    }

    /// Signs a daemon-provided token.
    ///
    /// The token is prefixed with the SHA-1 DigestInfo and signed with
    /// PKCS#1 v1.5 padding, without hashing it again.
    pub fn sign(&self, token: &[u8]) -> Result<Vec<u8>> {
        let mut digest_info = Vec::with_capacity(SHA1_DIGEST_INFO.len() + token.len());
        digest_info.extend_from_slice(&SHA1_DIGEST_INFO);
        digest_info.extend_from_slice(token);
        Ok(self
            .private
            .sign(Pkcs1v15Sign::new_unprefixed(), &digest_info)?)
    }

    /// Encodes the public key in the daemon's native struct layout:
    ///
    /// ```text
    /// u32 len     modulus size in 32-bit words
    /// u32 n0inv   -1 / n[0] mod 2^32
    /// u8  n[..]   modulus, little-endian
    /// u8  rr[..]  R^2 mod n with R = 2^(key bits), little-endian
    /// u32 e       public exponent
    /// ```
    pub fn public_key_struct(&self) -> Result<Vec<u8>> {
        let public = self.public();
        let modulus_len = public.size();
        let words = u32::try_from(modulus_len / 4)
            .map_err(|_| Error::KeyEncoding("modulus too large".into()))?;

        let n = public.n();
        let n_le = n.to_bytes_le();
        let n0 = u32::from_le_bytes(le_word(&n_le));

        let rr = (BigUint::from(1u8) << (modulus_len * 8 * 2)) % n;
        let e = u32::from_le_bytes(le_word(&public.e().to_bytes_le()));

        let mut out = Vec::with_capacity(4 + 4 + 2 * modulus_len + 4);
        out.extend_from_slice(&words.to_le_bytes());
        out.extend_from_slice(&n0inv(n0).to_le_bytes());
        out.extend_from_slice(&fixed_le(&n_le, modulus_len));
        out.extend_from_slice(&fixed_le(&rr.to_bytes_le(), modulus_len));
        out.extend_from_slice(&e.to_le_bytes());
        Ok(out)
    }

    /// The `AUTH(RSAPUBLICKEY)` payload: base64 struct, identity, NUL.
    pub fn public_key_payload(&self, identity: &str) -> Result<Vec<u8>> {
        let mut payload = STANDARD.encode(self.public_key_struct()?).into_bytes();
        payload.push(b' ');
        payload.extend_from_slice(identity.as_bytes());
        payload.push(0);
        Ok(payload)
    }
}

/// First four little-endian bytes, zero-padded.
fn le_word(bytes: &[u8]) -> [u8; 4] {
    let mut word = [0u8; 4];
    let n = bytes.len().min(4);
    word[..n].copy_from_slice(&bytes[..n]);
    word
}

/// Little-endian bytes truncated or zero-padded to `len`.
fn fixed_le(bytes: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let n = bytes.len().min(len);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Montgomery constant `-(n0^-1) mod 2^32` for an odd `n0`.
fn n0inv(n0: u32) -> u32 {
    // Newton iteration doubles the number of correct low bits each round.
    let mut inv: u32 = 1;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(n0.wrapping_mul(inv)));
    }
    inv.wrapping_neg()
}

/// Loads the persisted key on first use, generating it if absent.
#[derive(Debug)]
pub struct KeyStore {
    /// Directory holding the two key files.
    dir: PathBuf,
    /// Cached key once loaded.
    key: Option<AdbKey>,
}

impl KeyStore {
    /// Creates a store rooted at `dir`. Nothing is read until [`key`](Self::key).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            key: None,
        }
    }

    /// Path of the private key file.
    pub fn private_path(&self) -> PathBuf {
        self.dir.join(PRIVATE_KEY_FILE)
    }

    /// Path of the public key file.
    pub fn public_path(&self) -> PathBuf {
        self.dir.join(PUBLIC_KEY_FILE)
    }

    /// Returns the key, loading or generating it on first call.
    pub fn key(&mut self) -> Result<&AdbKey> {
        if self.key.is_none() {
            let key = self.load_or_generate()?;
            self.key = Some(key);
        }
        self.key
            .as_ref()
            .ok_or_else(|| Error::KeyEncoding("key store empty after load".into()))
    }

    /// Reads the persisted key pair, or generates and persists a new one.
    fn load_or_generate(&self) -> Result<AdbKey> {
        let private_path = self.private_path();
        if private_path.exists() {
            let der = fs::read(&private_path)?;
            let private = RsaPrivateKey::from_pkcs8_der(&der)
                .map_err(|e| Error::KeyEncoding(format!("{}: {e}", private_path.display())))?;
            let key = AdbKey::from_private(private);
            if !self.public_matches(&key) {
                warn!(path = %self.public_path().display(), "public key missing or stale; rewriting");
                self.write_public(&key)?;
            }
            return Ok(key);
        }

        info!(dir = %self.dir.display(), "generating {KEY_BITS}-bit RSA key");
        let key = AdbKey::generate()?;
        fs::create_dir_all(&self.dir)?;
        let der = key
            .private
            .to_pkcs8_der()
            .map_err(|e| Error::KeyEncoding(e.to_string()))?;
        write_private_file(&private_path, der.as_bytes())?;
        self.write_public(&key)?;
        Ok(key)
    }

    /// Whether the persisted public key exists and matches `key`.
    fn public_matches(&self, key: &AdbKey) -> bool {
        fs::read(self.public_path())
            .ok()
            .and_then(|der| RsaPublicKey::from_public_key_der(&der).ok())
            .is_some_and(|public| public == key.public())
    }

    /// Persists the public half of `key`.
    fn write_public(&self, key: &AdbKey) -> Result<()> {
        let der = key
            .public()
            .to_public_key_der()
            .map_err(|e| Error::KeyEncoding(e.to_string()))?;
        write_atomic(&self.public_path(), der.as_bytes(), 0o644)?;
        Ok(())
    }
}

/// Writes the private key readable by the owner only.
fn write_private_file(path: &Path, data: &[u8]) -> io::Result<()> {
    write_atomic(path, data, 0o600)
}

/// Writes `data` to a sibling temp file, then renames it over `path`.
fn write_atomic(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = opts.open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}
