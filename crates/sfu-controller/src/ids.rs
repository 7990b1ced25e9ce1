//! Identifier generation for rooms and signaling connections.
//!
//! Transport, producer and consumer ids are assigned by the media engine.

use uuid::Uuid;

/// New process-unique room id (32 lowercase hex characters).
#[must_use]
pub fn new_room_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// New connection id. A connection's peer in its room shares this id.
#[must_use]
pub fn new_connection_id() -> String {
    format!("conn-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_room_ids_are_unique_and_url_safe() {
        let ids: HashSet<String> = (0..1000).map(|_| new_room_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids
            .iter()
            .all(|id| id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit())));
    }

    #[test]
    fn test_connection_id_prefix() {
        assert!(new_connection_id().starts_with("conn-"));
        assert_ne!(new_connection_id(), new_connection_id());
    }
}
