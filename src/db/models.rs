/// Database row types for all tables.
/// These correspond 1:1 to the SQLite schema defined in migrations.rs.

/// User record in the users table. The id is the subject claim of the
/// credential that first synchronized the user and never changes.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Chat session between two users. Immutable after creation.
#[derive(Debug, Clone)]
pub struct Chat {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub created_at: String,
}
