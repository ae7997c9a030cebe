//! Process-wide setup state.
//!
//! `Runtime` owns at most one `SessionFactory`:
//!
//! ```text
//! uninitialized --setup--> ready --shutdown--> uninitialized
//! ```
//!
//! It is an ordinary value; callers that want a global put one in a `static`
//! (`Runtime::new` is `const`). The lock guards only the transitions and the
//! hand-off of the factory handle, never an encrypt or decrypt.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::Config;
use crate::error::KeystrataError;
use crate::session::SessionFactory;

pub struct Runtime {
    factory: Mutex<Option<Arc<SessionFactory>>>,
}

impl Runtime {
    pub const fn new() -> Self {
        Self {
            factory: parking_lot::const_mutex(None),
        }
    }

    /// Build a factory from `config` and become ready.
    pub fn setup(&self, config: Config) -> Result<(), KeystrataError> {
        let mut slot = self.factory.lock();
        if slot.is_some() {
            return Err(KeystrataError::AlreadyInitialized);
        }
        *slot = Some(Arc::new(SessionFactory::from_config(config)?));
        info!("runtime ready");
        Ok(())
    }

    pub fn setup_json(&self, json: &str) -> Result<(), KeystrataError> {
        self.setup(Config::from_json(json)?)
    }

    /// Become ready with a factory the caller assembled.
    pub fn setup_with(&self, factory: SessionFactory) -> Result<(), KeystrataError> {
        let mut slot = self.factory.lock();
        if slot.is_some() {
            return Err(KeystrataError::AlreadyInitialized);
        }
        *slot = Some(Arc::new(factory));
        info!("runtime ready");
        Ok(())
    }

    /// Close every session and return to uninitialized. A no-op when not
    /// initialized.
    pub fn shutdown(&self) -> Result<(), KeystrataError> {
        let factory = self.factory.lock().take();
        if let Some(factory) = factory {
            factory.close();
            info!("runtime shut down");
        }
        Ok(())
    }

    pub fn get_setup_status(&self) -> bool {
        self.factory.lock().is_some()
    }

    /// The current factory, for callers that manage sessions themselves.
    pub fn factory(&self) -> Result<Arc<SessionFactory>, KeystrataError> {
        self.factory
            .lock()
            .as_ref()
            .map(Arc::clone)
            .ok_or(KeystrataError::NotInitialized)
    }

    /// Encrypt `data` for `partition_id`; returns the canonical envelope.
    pub fn encrypt_bytes(&self, partition_id: &str, data: &[u8]) -> Result<String, KeystrataError> {
        let session = self.factory()?.get_session(partition_id)?;
        session.seal(data)
    }

    pub fn encrypt_string(&self, partition_id: &str, text: &str) -> Result<String, KeystrataError> {
        self.encrypt_bytes(partition_id, text.as_bytes())
    }

    pub fn decrypt_bytes(
        &self,
        partition_id: &str,
        envelope: impl AsRef<[u8]>,
    ) -> Result<Vec<u8>, KeystrataError> {
        let session = self.factory()?.get_session(partition_id)?;
        session.open(envelope)
    }

    pub fn decrypt_string(
        &self,
        partition_id: &str,
        envelope: impl AsRef<[u8]>,
    ) -> Result<String, KeystrataError> {
        String::from_utf8(self.decrypt_bytes(partition_id, envelope)?)
            .map_err(|_| KeystrataError::InvalidUtf8)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("ready", &self.get_setup_status())
            .finish()
    }
}
