/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// The seeded account that owns jobs started without an acting user.
pub const SYSTEM_USER_ID: DbId = 1;
