//! Conflict detection.

use crate::registry::EntityAdapter;
use chrono::{DateTime, Utc};
use storesync_storage::LocalRecord;

/// How an incoming snapshot relates to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Write the incoming snapshot locally.
    CleanApply,
    /// Local state already matches; succeed without writing.
    NoOp,
    /// Both sides changed; hand over to the resolver.
    Conflict,
}

/// A remote snapshot offered for application.
#[derive(Debug, Clone, Copy)]
pub struct Incoming<'a> {
    /// Serialized state, `None` for a tombstone.
    pub data: Option<&'a [u8]>,
    /// Remote modification time.
    pub timestamp: DateTime<Utc>,
    /// Last local state the remote side had seen.
    pub base_timestamp: Option<DateTime<Utc>>,
}

impl<'a> Incoming<'a> {
    /// Creates an incoming snapshot without a base timestamp.
    pub fn new(data: Option<&'a [u8]>, timestamp: DateTime<Utc>) -> Self {
        Self {
            data,
            timestamp,
            base_timestamp: None,
        }
    }

    /// Sets the base timestamp.
    pub fn with_base(mut self, base: Option<DateTime<Utc>>) -> Self {
        self.base_timestamp = base;
        self
    }
}

/// Classifies `incoming` against the local record.
///
/// Rules, first match wins:
///
/// 1. no local record: clean apply
/// 2. states equivalent under `adapter`: no-op
/// 3. local modified after the incoming base (defaulting to the incoming
///    timestamp), or an unsynced local change is queued: conflict
/// 4. incoming strictly newer: clean apply
/// 5. otherwise: conflict
///
/// The result depends only on the arguments.
pub fn classify(
    local: Option<&LocalRecord>,
    incoming: &Incoming<'_>,
    has_open_change: bool,
    adapter: &dyn EntityAdapter,
) -> Classification {
    let Some(local) = local else {
        return Classification::CleanApply;
    };

    let identical = match (local.data.as_deref(), incoming.data) {
        (None, None) => true,
        (Some(a), Some(b)) => adapter.equivalent(a, b),
        _ => false,
    };
    if identical {
        return Classification::NoOp;
    }

    let base = incoming.base_timestamp.unwrap_or(incoming.timestamp);
    if local.last_modified > base || has_open_change {
        return Classification::Conflict;
    }

    if incoming.timestamp > local.last_modified {
        Classification::CleanApply
    } else {
        Classification::Conflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JsonAdapter;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use storesync_protocol::EntityKey;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn local(data: &[u8], modified: i64) -> LocalRecord {
        LocalRecord::new(EntityKey::new("product", "p-1"), data.to_vec(), ts(modified))
    }

    #[test]
    fn missing_local_is_clean_apply() {
        let incoming = Incoming::new(Some(br#"{"n":1}"#), ts(10));
        assert_eq!(
            classify(None, &incoming, true, &JsonAdapter),
            Classification::CleanApply
        );
    }

    #[test]
    fn equivalent_state_is_noop() {
        let local = local(br#"{"a":1,"b":2}"#, 500);
        let incoming = Incoming::new(Some(br#"{"b":2,"a":1}"#), ts(10));
        assert_eq!(
            classify(Some(&local), &incoming, true, &JsonAdapter),
            Classification::NoOp
        );
    }

    #[test]
    fn local_newer_than_remote_conflicts() {
        let local = local(br#"{"price":120}"#, 100);
        let incoming = Incoming::new(Some(br#"{"price":99}"#), ts(90));
        assert_eq!(
            classify(Some(&local), &incoming, false, &JsonAdapter),
            Classification::Conflict
        );
    }

    #[test]
    fn remote_newer_applies_cleanly() {
        let local = local(br#"{"price":120}"#, 100);
        let incoming = Incoming::new(Some(br#"{"price":99}"#), ts(110));
        assert_eq!(
            classify(Some(&local), &incoming, false, &JsonAdapter),
            Classification::CleanApply
        );
    }

    #[test]
    fn queued_local_change_conflicts() {
        let local = local(br#"{"price":120}"#, 100);
        let incoming = Incoming::new(Some(br#"{"price":99}"#), ts(110));
        assert_eq!(
            classify(Some(&local), &incoming, true, &JsonAdapter),
            Classification::Conflict
        );
    }

    #[test]
    fn local_change_after_base_conflicts() {
        let local = local(br#"{"price":120}"#, 100);
        let incoming = Incoming::new(Some(br#"{"price":99}"#), ts(110)).with_base(Some(ts(50)));
        assert_eq!(
            classify(Some(&local), &incoming, false, &JsonAdapter),
            Classification::Conflict
        );
    }

    #[test]
    fn equal_timestamps_with_different_state_conflict() {
        let local = local(br#"{"price":120}"#, 100);
        let incoming = Incoming::new(Some(br#"{"price":99}"#), ts(100));
        assert_eq!(
            classify(Some(&local), &incoming, false, &JsonAdapter),
            Classification::Conflict
        );
    }

    #[test]
    fn tombstones() {
        let deleted = LocalRecord::tombstone(EntityKey::new("product", "p-1"), ts(100));
        assert_eq!(
            classify(Some(&deleted), &Incoming::new(None, ts(200)), false, &JsonAdapter),
            Classification::NoOp
        );
        assert_eq!(
            classify(Some(&deleted), &Incoming::new(Some(b"{}"), ts(200)), false, &JsonAdapter),
            Classification::CleanApply
        );
    }

    proptest! {
        #[test]
        fn classification_is_deterministic(
            local_value in 0u8..4,
            remote_value in 0u8..4,
            local_ts in 0i64..50,
            remote_ts in 0i64..50,
            base in proptest::option::of(0i64..50),
            open in any::<bool>(),
        ) {
            let local_data = format!("{{\"v\":{local_value}}}");
            let remote_data = format!("{{\"v\":{remote_value}}}");
            let record = local(local_data.as_bytes(), local_ts);
            let incoming = Incoming::new(Some(remote_data.as_bytes()), ts(remote_ts))
                .with_base(base.map(ts));

            let first = classify(Some(&record), &incoming, open, &JsonAdapter);
            let second = classify(Some(&record), &incoming, open, &JsonAdapter);
            prop_assert_eq!(first, second);
            if local_value == remote_value {
                prop_assert_eq!(first, Classification::NoOp);
            }
        }
    }
}
