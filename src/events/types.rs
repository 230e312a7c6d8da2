//! Event Types

use serde::{Deserialize, Serialize};

use crate::db::models::{Class, Ref};

/// Monotone event token, equal to the row generation stamped at write time
pub type Token = u64;

/// What happened to the row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOp {
    Add,
    Mod,
    Del,
}

/// A single change notification carrying the post-image of the row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbEvent {
    /// Token assigned at emission, strictly increasing
    pub id: Token,
    pub class: Class,
    pub operation: EventOp,
    pub reference: Ref,
    /// Row snapshot after the write; absent for deletions
    pub snapshot: Option<serde_json::Value>,
}

/// One element of a subscription filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassFilter {
    /// Every class
    All,
    /// Every object of one class, e.g. "VM"
    Class(Class),
    /// A single object, e.g. "VM/OpaqueRef:..."
    Object(Class, Ref),
}

impl ClassFilter {
    /// Parse the wire form: "*", "VM" or "VM/<ref>"
    pub fn parse(s: &str) -> Option<ClassFilter> {
        if s == "*" {
            return Some(ClassFilter::All);
        }
        match s.split_once('/') {
            None => Class::from_wire_name(s).map(ClassFilter::Class),
            Some((class, reference)) => Class::from_wire_name(class)
                .map(|c| ClassFilter::Object(c, Ref::from_string(reference))),
        }
    }

    pub fn matches(&self, event: &DbEvent) -> bool {
        match self {
            ClassFilter::All => true,
            ClassFilter::Class(c) => *c == event.class,
            ClassFilter::Object(c, r) => *c == event.class && *r == event.reference,
        }
    }
}

/// A set of class filters; an event is delivered if any element matches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub classes: Vec<ClassFilter>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self {
            classes: vec![ClassFilter::All],
        }
    }

    pub fn class(class: Class) -> Self {
        Self {
            classes: vec![ClassFilter::Class(class)],
        }
    }

    pub fn object(class: Class, reference: Ref) -> Self {
        Self {
            classes: vec![ClassFilter::Object(class, reference)],
        }
    }

    /// Parse a list of wire-form filter strings, ignoring unknown classes
    pub fn parse(filters: &[&str]) -> Self {
        Self {
            classes: filters.iter().filter_map(|s| ClassFilter::parse(s)).collect(),
        }
    }

    pub fn push(&mut self, filter: ClassFilter) {
        self.classes.push(filter);
    }

    pub fn matches(&self, event: &DbEvent) -> bool {
        self.classes.iter().any(|c| c.matches(event))
    }
}

/// A batch of events with the token to resume from
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub events: Vec<DbEvent>,
    pub token: String,
}

/// Event bus failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// The subscriber fell behind the retained history window
    #[error("events lost: token {0} is older than the retained history")]
    EventsLost(Token),

    #[error("malformed event token: {0}")]
    BadToken(String),

    #[error("unknown subscription: {0}")]
    UnknownSubscription(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_parse() {
        assert_eq!(ClassFilter::parse("*"), Some(ClassFilter::All));
        assert_eq!(ClassFilter::parse("VM"), Some(ClassFilter::Class(Class::Vm)));
        assert_eq!(
            ClassFilter::parse("host/OpaqueRef:abc"),
            Some(ClassFilter::Object(
                Class::Host,
                Ref::from_string("OpaqueRef:abc")
            ))
        );
        assert_eq!(ClassFilter::parse("bogus"), None);
    }

    #[test]
    fn test_filter_matches() {
        let vm_ref = Ref::generate();
        let event = DbEvent {
            id: 7,
            class: Class::Vm,
            operation: EventOp::Mod,
            reference: vm_ref.clone(),
            snapshot: None,
        };
        assert!(EventFilter::all().matches(&event));
        assert!(EventFilter::class(Class::Vm).matches(&event));
        assert!(!EventFilter::class(Class::Sr).matches(&event));
        assert!(EventFilter::object(Class::Vm, vm_ref).matches(&event));
        assert!(!EventFilter::object(Class::Vm, Ref::generate()).matches(&event));
    }
}
