//! Algorithm preferences for both legs of the relay.

use std::borrow::Cow;

use russh::Preferred;
use russh::keys::{Algorithm, HashAlg};

/// Modern defaults; the inbound listener always runs with these.
pub fn default_preferred() -> Preferred {
    Preferred::DEFAULT.clone()
}

/// Relaxed suite for backends that only speak SHA-1 kex, CBC ciphers or DSA host keys.
pub fn legacy_preferred() -> Preferred {
    Preferred {
        kex: Cow::Owned(vec![
            russh::kex::CURVE25519,
            russh::kex::DH_G14_SHA1,
            russh::kex::DH_G1_SHA1,
        ]),
        key: Cow::Owned(vec![
            Algorithm::Ed25519,
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha512),
            },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha256),
            },
            Algorithm::Rsa { hash: None },
            Algorithm::Dsa,
        ]),
        cipher: Cow::Owned(vec![
            russh::cipher::CHACHA20_POLY1305,
            russh::cipher::AES_128_CTR,
            russh::cipher::AES_128_CBC,
        ]),
        mac: Cow::Owned(vec![
            russh::mac::HMAC_SHA512,
            russh::mac::HMAC_SHA256,
            russh::mac::HMAC_SHA1,
        ]),
        compression: Preferred::DEFAULT.compression,
    }
}

/// Pick the backend suite.
pub fn backend_preferred(legacy: bool) -> Preferred {
    if legacy { legacy_preferred() } else { default_preferred() }
}
