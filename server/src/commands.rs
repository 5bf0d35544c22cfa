use std::{collections::HashMap, io::Write};

use memguarded_common::{
    error::{MemguardedError, Result},
    protocol::{write_bytes, Delimiter, GET_SECRET, SET_SECRET, SOCKET_PASSWORD, TERMINATOR},
    store::{read_secret_until, SecretStore},
};

use crate::session::Session;

/// Command handlers get the session and the store explicitly, never captured
/// server state
pub type Handler = fn(&mut Session, &SecretStore, Delimiter) -> Result<()>;

/// Immutable mapping from command token to handler
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        let handlers: HashMap<&'static str, Handler> = HashMap::from([
            (SOCKET_PASSWORD, socket_password as Handler),
            (SET_SECRET, set_secret as Handler),
            (GET_SECRET, get_secret as Handler),
        ]);
        Self { handlers }
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

fn require_payload(command: &str, delimiter: Delimiter) -> Result<()> {
    if delimiter.has_payload() {
        Ok(())
    } else {
        Err(MemguardedError::MalformedCommand(format!("`{command}` requires a payload")))
    }
}

fn socket_password(
    session: &mut Session,
    _store: &SecretStore,
    delimiter: Delimiter,
) -> Result<()> {
    require_payload(SOCKET_PASSWORD, delimiter)?;
    let (candidate, _) = read_secret_until(&mut session.stream(), TERMINATOR)?;
    session.present_password(&candidate)
}

fn set_secret(session: &mut Session, store: &SecretStore, delimiter: Delimiter) -> Result<()> {
    session.ensure_gate_open()?;
    require_payload(SET_SECRET, delimiter)?;

    store.set_from_stream(&mut session.stream(), TERMINATOR)?;
    tracing::info!("✓ Secret replaced");
    Ok(())
}

fn get_secret(session: &mut Session, store: &SecretStore, delimiter: Delimiter) -> Result<()> {
    session.ensure_gate_open()?;
    if delimiter.has_payload() {
        return Err(MemguardedError::MalformedCommand(format!(
            "`{GET_SECRET}` takes no payload"
        )));
    }

    let mut stream = session.stream();
    store.write(&mut stream)?;
    write_bytes(&mut stream, &[TERMINATOR])
        .and_then(|_| stream.flush())
        .map_err(|e| MemguardedError::io("writing reply", e))?;

    tracing::debug!("Secret sent to client");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_holds_the_three_commands() {
        let registry = CommandRegistry::new();
        for name in [SOCKET_PASSWORD, SET_SECRET, GET_SECRET] {
            assert!(registry.contains(name), "{name} missing");
        }
        assert!(registry.get("bogus").is_none());
        assert!(registry.get("get_password").is_none());
    }
}
