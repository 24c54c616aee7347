use crate::db::DbPool;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Active WebSocket connections per user
    pub connections: ConnectionRegistry,
    /// Origins allowed by the CORS layer
    pub allowed_origins: Vec<String>,
}
