//! Self-assigned user identity.
//!
//! The identity is an opaque string naming the remote partition a device syncs with.
//! It is generated once per device and may be replaced by the user at any time.
//! Nothing here authenticates anyone.

use std::fmt;
use std::sync::{Arc, LazyLock, Mutex};

use rand::Rng;

use crate::app::SyncApp;
use crate::logger::Logger;
use crate::storage::KeyValueStore;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@saved-sync/identity"));

const GENERATED_PREFIX: &str = "user_";
const GENERATED_SUFFIX_LEN: usize = 13;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Characters replaced with `_` so an identity fits in one remote path segment.
const UNSAFE_IDENTITY_CHARS: [char; 6] = ['.', '#', '$', '[', ']', '/'];

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Builds an identity from raw input, sanitizing it. Returns `None` when nothing
    /// remains after trimming.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Identity(sanitize_identity(trimmed)))
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Replaces characters that are illegal in a remote path segment with `_`.
pub fn sanitize_identity(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if UNSAFE_IDENTITY_CHARS.contains(&ch) || ch.is_control() {
                '_'
            } else {
                ch
            }
        })
        .collect()
}

fn generate_identity() -> Identity {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..GENERATED_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    Identity(format!("{GENERATED_PREFIX}{suffix}"))
}

/// Resolves and persists the identity under one local key.
///
/// When the local store fails, the identity is kept in memory for the rest of the
/// session so that every call within the session agrees.
#[derive(Clone)]
pub struct IdentityProvider {
    store: Arc<dyn KeyValueStore>,
    key: String,
    session: Arc<Mutex<Option<Identity>>>,
}

impl fmt::Debug for IdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityProvider")
            .field("key", &self.key)
            .field("session", &self.session.lock().unwrap())
            .finish()
    }
}

impl IdentityProvider {
    pub fn new(app: &SyncApp) -> Self {
        Self::with_store(app.store(), app.options().identity_key())
    }

    pub fn with_store(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns the stored identity, creating and persisting one on first use.
    pub fn resolve_identity(&self) -> Identity {
        match self.store.get(&self.key) {
            Ok(Some(raw)) => {
                if let Some(identity) = Identity::parse(&raw) {
                    *self.session.lock().unwrap() = Some(identity.clone());
                    return identity;
                }
            }
            Ok(None) => {}
            Err(err) => {
                LOGGER.warn(format!("Failed to read identity, using session identity: {err}"));
                if let Some(identity) = self.session.lock().unwrap().clone() {
                    return identity;
                }
            }
        }

        if let Some(identity) = self.session.lock().unwrap().clone() {
            // The stored copy went missing mid-session; restore it.
            self.persist(&identity);
            return identity;
        }

        let identity = generate_identity();
        LOGGER.debug(format!("Generated identity {identity}"));
        self.persist(&identity);
        *self.session.lock().unwrap() = Some(identity.clone());
        identity
    }

    /// Sanitizes and stores `candidate`, returning what was stored. Blank input falls
    /// back to [`IdentityProvider::resolve_identity`].
    pub fn set_identity(&self, candidate: &str) -> Identity {
        let Some(identity) = Identity::parse(candidate) else {
            return self.resolve_identity();
        };
        self.persist(&identity);
        *self.session.lock().unwrap() = Some(identity.clone());
        identity
    }

    fn persist(&self, identity: &Identity) {
        if let Err(err) = self.store.set(&self.key, identity.as_str()) {
            LOGGER.warn(format!(
                "Failed to persist identity, keeping it for this session only: {err}"
            ));
        }
    }
}
