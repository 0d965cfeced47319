use chrono::{DateTime, SubsecRound, Utc};
use tikv_client::Key;

/// Exclusive upper bound of every key starting with `key`.
pub(crate) fn next_key(key: &Key) -> Key {
    let mut next_key = Into::<Vec<u8>>::into(key.clone());
    for i in (0..next_key.len()).rev() {
        if next_key[i] < 0xff {
            next_key[i] += 1;
            return Key::from(next_key);
        }
    }
    Key::from(next_key)
}

/// Smallest key sorting after `key`, used to resume a paged scan.
pub(crate) fn key_after(key: &Key) -> Key {
    let mut after = Into::<Vec<u8>>::into(key.clone());
    after.push(0);
    Key::from(after)
}

pub(crate) fn document_path(database: &str, collection: &str, key: &str) -> String {
    format!("document/{}/{}/{}", database, collection, key)
}

pub(crate) fn collection_prefix(database: &str, collection: &str) -> String {
    format!("document/{}/{}/", database, collection)
}

pub(crate) fn index_path(database: &str, collection: &str, name: &str) -> String {
    format!("index/{}/{}/{}", database, collection, name)
}

pub(crate) fn index_prefix(database: &str, collection: &str) -> String {
    format!("index/{}/{}/", database, collection)
}

/// Keys under this prefix map one unique index value to its document.
pub(crate) fn unique_prefix(database: &str, collection: &str, name: &str) -> String {
    format!("unique/{}/{}/{}/", database, collection, name)
}

/// A fresh random document key.
pub(crate) fn generate_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn is_generated_key(key: &str) -> bool {
    uuid::Uuid::parse_str(key).is_ok()
}

/// Current time at the millisecond precision stored documents carry.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_key_bumps_last_byte() {
        let key = Key::from("document/app/users/".to_string());
        assert_eq!(next_key(&key), Key::from("document/app/users0".to_string()));
    }

    #[test]
    fn key_after_keeps_longer_siblings_in_range() {
        let key = Key::from("users/k1".to_string());
        let after = key_after(&key);
        assert!(after > key);
        assert!(Key::from("users/k10".to_string()) > after);
    }

    #[test]
    fn generated_keys_are_recognised() {
        assert!(is_generated_key(&generate_key()));
        assert!(!is_generated_key("booth-1"));
    }

    #[test]
    fn now_has_millisecond_precision() {
        assert_eq!(now().timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
