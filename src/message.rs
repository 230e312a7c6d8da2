//! Administrator Messages
//!
//! Alert rows surfaced to management clients: version mismatches at join,
//! emergency transitions, background job failures.

use chrono::Utc;
use uuid::Uuid;

use crate::db::models::{Class, MessageRecord, Ref};
use crate::db::Database;

/// Priorities follow the usual severity ladder; lower is more urgent
pub mod priority {
    pub const CRITICAL: i64 = 1;
    pub const WARNING: i64 = 3;
    pub const INFO: i64 = 5;
}

/// Post a message against an object, returning its reference
pub fn post(
    db: &Database,
    name: &str,
    priority: i64,
    cls: Class,
    obj_uuid: Uuid,
    body: &str,
) -> Option<Ref> {
    let record = MessageRecord {
        reference: Ref::generate(),
        uuid: Uuid::new_v4(),
        name: name.to_string(),
        priority,
        cls,
        obj_uuid,
        timestamp: Utc::now(),
        body: body.to_string(),
    };
    let reference = record.reference.clone();
    match db.messages.insert(record) {
        Ok(()) => Some(reference),
        Err(e) => {
            log::warn!("posting message {}: {}", name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::sync::Arc;

    #[test]
    fn test_post() {
        let db = Database::new(Arc::new(EventBus::default()));
        let host_uuid = Uuid::new_v4();
        let reference = post(
            &db,
            "HA_STATE_INCONSISTENT",
            priority::WARNING,
            Class::Host,
            host_uuid,
            "pool has HA enabled but this host is not armed",
        )
        .unwrap();
        let message = db.messages.get(&reference).unwrap();
        assert_eq!(message.name, "HA_STATE_INCONSISTENT");
        assert_eq!(message.cls, Class::Host);
        assert_eq!(message.obj_uuid, host_uuid);
    }
}
