//! Unit tests for host key parsing.

use russh::keys::ssh_key::{LineEnding, rand_core::OsRng};
use russh::keys::{Algorithm, PrivateKey};

use super::*;

fn encrypted_pem(cipher: &str) -> String {
    format!(
        "{RSA_PEM_BEGIN}\nProc-Type: 4,ENCRYPTED\nDEK-Info: {cipher},0011223344556677\n\nAAAA\nBBBB\n{RSA_PEM_END}\n"
    )
}

#[test]
fn parses_openssh_keys() {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let pem = key.to_openssh(LineEnding::LF).unwrap();

    let parsed = parse_private_key(&pem, None).unwrap();
    assert_eq!(parsed.public_key(), key.public_key());
}

#[test]
fn rejects_garbage() {
    let err = parse_private_key("definitely not a key", None).unwrap_err();
    assert!(matches!(err, BastionError::HostKeyParse(_)), "unexpected error: {err}");
}

#[test]
fn missing_file_reports_path() {
    let err = load_host_key(Path::new("/nonexistent/bastion/id_rsa"), None).unwrap_err();
    match err {
        BastionError::HostKeyRead { path, .. } => assert!(path.ends_with("id_rsa")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn legacy_pem_headers_are_split_from_body() {
    let pem = LegacyPem::parse(&encrypted_pem("DES-EDE3-CBC")).unwrap();
    assert!(pem.is_encrypted());
    assert_eq!(pem.headers.get("DEK-Info").map(String::as_str), Some("DES-EDE3-CBC,0011223344556677"));
    assert_eq!(pem.body, "AAAABBBB");
}

#[test]
fn plain_legacy_pem_has_no_headers() {
    let pem = LegacyPem::parse(&format!("{RSA_PEM_BEGIN}\nAAAA\nBBBB\n{RSA_PEM_END}\n")).unwrap();
    assert!(!pem.is_encrypted());
    assert!(pem.headers.is_empty());
    assert_eq!(pem.body, "AAAABBBB");
}

#[test]
fn encrypted_legacy_pem_requires_passphrase() {
    let err = parse_private_key(&encrypted_pem("DES-EDE3-CBC"), None).unwrap_err();
    assert!(err.to_string().contains("passphrase"), "unexpected error: {err}");
}

#[test]
fn unsupported_legacy_cipher_is_named() {
    let err = parse_private_key(&encrypted_pem("AES-128-CBC"), Some("secret")).unwrap_err();
    assert!(err.to_string().contains("AES-128-CBC"), "unexpected error: {err}");
}

#[test]
fn evp_bytes_to_key_chains_md5_blocks() {
    let salt = [1u8, 2, 3, 4, 5, 6, 7, 8];
    let key = evp_bytes_to_key(b"password", &salt, 24);
    assert_eq!(key.len(), 24);

    let mut first = b"password".to_vec();
    first.extend_from_slice(&salt);
    let d1 = md5::compute(&first).0;
    assert_eq!(&key[..16], &d1[..]);

    let mut second = d1.to_vec();
    second.extend_from_slice(b"password");
    second.extend_from_slice(&salt);
    let d2 = md5::compute(&second).0;
    assert_eq!(&key[16..], &d2[..8]);
}
