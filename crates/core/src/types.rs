/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Parse a caller-supplied identifier.
///
/// Returns `None` for anything that is not a positive integer, so lookups can
/// treat a malformed id exactly like an absent record.
pub fn parse_db_id(raw: &str) -> Option<DbId> {
    raw.trim().parse::<DbId>().ok().filter(|id| *id > 0)
}
