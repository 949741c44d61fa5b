//! Server-side scripts backing the conditional lease operations.
//!
//! Each script runs atomically on the Redis server, so "only if I am still
//! the owner" is decided and applied in a single round trip.

/// Re-arm a lease's expiry if it is still held by the caller.
///
/// KEYS[1] = lease key, ARGV[1] = expected owner, ARGV[2] = TTL in milliseconds.
/// Returns 1 if the expiry was extended, 0 otherwise.
pub const COMPARE_AND_EXTEND: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Delete a lease if it is still held by the caller.
///
/// KEYS[1] = lease key, ARGV[1] = expected owner.
/// Returns 1 if the key was deleted, 0 otherwise.
pub const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;
