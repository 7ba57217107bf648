//! Inbound authentication policies.
//!
//! The relay core never looks at credentials itself; the inbound handler asks the
//! configured [`AuthPolicy`] and maps its answer onto `Auth::Accept`/`Auth::reject()`.

use std::sync::Arc;

use russh::keys::PublicKey;
use russh::{MethodKind, MethodSet};
use secrecy::ExposeSecret;

use crate::config::{InboundAuth, SecretBoxedString};

pub trait AuthPolicy: Send + Sync {
    fn allow_none(&self, user: &str) -> bool;
    fn allow_password(&self, user: &str, password: &str) -> bool;
    fn allow_publickey(&self, user: &str, key: &PublicKey) -> bool;

    /// Methods advertised to clients.
    fn methods(&self) -> MethodSet;
}

/// Lets every client in with any credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl AuthPolicy for AcceptAll {
    fn allow_none(&self, _user: &str) -> bool {
        true
    }

    fn allow_password(&self, _user: &str, _password: &str) -> bool {
        true
    }

    fn allow_publickey(&self, _user: &str, _key: &PublicKey) -> bool {
        true
    }

    fn methods(&self) -> MethodSet {
        let mut methods = MethodSet::empty();
        methods.push(MethodKind::None);
        methods.push(MethodKind::Password);
        methods.push(MethodKind::PublicKey);
        methods
    }
}

/// A single username/password pair.
pub struct StaticPassword {
    username: String,
    password: SecretBoxedString,
}

impl StaticPassword {
    pub fn new(username: impl Into<String>, password: SecretBoxedString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

impl AuthPolicy for StaticPassword {
    fn allow_none(&self, _user: &str) -> bool {
        false
    }

    fn allow_password(&self, user: &str, password: &str) -> bool {
        let expected = self.password.expose_secret();
        // Constant-time over the password bytes.
        let matches = expected.len() == password.len()
            && expected
                .bytes()
                .zip(password.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0;
        user == self.username && matches
    }

    fn allow_publickey(&self, _user: &str, _key: &PublicKey) -> bool {
        false
    }

    fn methods(&self) -> MethodSet {
        let mut methods = MethodSet::empty();
        methods.push(MethodKind::Password);
        methods
    }
}

/// Build the policy selected on the command line.
pub fn policy_for(auth: &InboundAuth) -> Arc<dyn AuthPolicy> {
    match auth {
        InboundAuth::AcceptAll => Arc::new(AcceptAll),
        InboundAuth::Password { username, password } => Arc::new(StaticPassword::new(
            username.clone(),
            SecretBoxedString::new(Box::new(password.expose_secret().clone())),
        )),
    }
}

#[cfg(test)]
mod tests {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::{Algorithm, PrivateKey};

    use super::*;

    fn some_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    #[test]
    fn accept_all_lets_everyone_in() {
        let policy = AcceptAll;
        assert!(policy.allow_none("anyone"));
        assert!(policy.allow_password("anyone", "whatever"));
        assert!(policy.allow_publickey("anyone", &some_key()));
    }

    #[test]
    fn static_password_checks_both_fields() {
        let policy = StaticPassword::new("alice", SecretBoxedString::new(Box::new("s3cret".into())));
        assert!(policy.allow_password("alice", "s3cret"));
        assert!(!policy.allow_password("alice", "s3cre"));
        assert!(!policy.allow_password("alice", "s3cret!"));
        assert!(!policy.allow_password("bob", "s3cret"));
        assert!(!policy.allow_none("alice"));
        assert!(!policy.allow_publickey("alice", &some_key()));
    }

    #[test]
    fn policy_follows_config() {
        let policy = policy_for(&InboundAuth::Password {
            username: "ops".into(),
            password: SecretBoxedString::new(Box::new("pw".into())),
        });
        assert!(policy.allow_password("ops", "pw"));
        assert!(!policy.allow_none("ops"));

        let open = policy_for(&InboundAuth::AcceptAll);
        assert!(open.allow_none("ops"));
    }
}
