pub mod config;
pub mod conn;
pub mod deck;
pub mod error;
pub mod lobby;
pub mod logger;
pub mod match_sm;
pub mod protocol;
pub mod registry;
pub mod session;

use std::sync::Arc;

use lobby::LobbyPool;
use logger::Logger;
use registry::{ConnectionRegistry, NameRegistry};

/// Process-wide shared state handed to every session and match task.
///
/// Grounded on `examples/original_source/server/src/server.c`'s module
/// globals (`g_lobbies`, `g_active_names`, `g_active_fds`) — gathered here
/// into one struct behind one `Arc` instead of several file-scope statics.
pub struct App {
    pub lobbies: LobbyPool,
    pub names: NameRegistry,
    pub conns: ConnectionRegistry,
    pub log: Logger,
}

impl App {
    pub fn new(lobby_count: usize, verbosity: u8) -> Arc<Self> {
        Arc::new(Self {
            lobbies: LobbyPool::new(lobby_count),
            names: NameRegistry::new(lobby_count * 2),
            conns: ConnectionRegistry::new(),
            log: Logger::new(verbosity),
        })
    }
}
