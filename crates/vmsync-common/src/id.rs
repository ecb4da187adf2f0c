use std::sync::{Mutex, OnceLock};

use snowflake::SnowflakeIdBucket;

static BUCKET: OnceLock<Mutex<SnowflakeIdBucket>> = OnceLock::new();

/// Bind the generator to this deployment's coordinates (each 0-31).
///
/// Call once at startup, before the first `next_id`. Later calls are
/// ignored; code that never calls it (tests, tools) gets the (1, 1)
/// generator.
pub fn init(machine_id: i32, node_id: i32) {
    let _ = BUCKET.set(Mutex::new(SnowflakeIdBucket::new(machine_id, node_id)));
}

/// A fresh snowflake ID as a string, used for primary key columns.
pub fn next_id() -> String {
    BUCKET
        .get_or_init(|| Mutex::new(SnowflakeIdBucket::new(1, 1)))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get_id()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_numeric() {
        init(1, 1);
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = next_id();
            assert!(id.parse::<i64>().is_ok(), "not an i64: {id}");
            assert!(seen.insert(id), "duplicate ID generated");
        }
    }

    #[test]
    fn late_init_does_not_replace_the_generator() {
        let before = next_id();
        init(7, 7);
        let after = next_id();
        assert_ne!(before, after);
    }
}
