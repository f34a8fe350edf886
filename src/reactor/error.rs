use std::io;

/// Why a handle could not be registered (or re-registered) with the reactor.
#[derive(Debug)]
pub enum RegisterError {
    /// The handle's socket is not in non-blocking mode. Registering it would
    /// let a single connection stall the whole dispatch loop.
    Blocking,
    /// The socket is already registered with this reactor.
    AlreadyRegistered,
    /// Interest update on a socket that is not registered.
    NotRegistered,
    /// The reactor has been closed; no new registrations are accepted.
    Closed,
    Io(io::Error),
}

impl From<io::Error> for RegisterError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}
