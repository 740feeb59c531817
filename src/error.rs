use thiserror::Error;

/// Errors surfaced by the name registry and lobby pool.
///
/// `Capacity` and `NotFound` are turned into `C45WRONG` replies by the
/// session state machine; they never propagate to `main`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("name registry is full")]
    Capacity,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LobbyError {
    #[error("lobby index out of range")]
    BadIndex,
    #[error("lobby is full")]
    Full,
}
