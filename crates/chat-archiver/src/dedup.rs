//! Store/skip/update decisions for every write to a history-versioned table.

use chrono::{DateTime, Duration, Utc};

/// How repeated observations of one entity are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Each meaningful change is a new row; nothing is overwritten.
    Versioned,
    /// A single row that tracks the latest observation.
    CurrentState,
    /// Versioned, but the deleted and edited flags are updated on the latest row.
    VersionedWithMutableFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip,
    Store,
    UpdateInPlace,
}

/// The most recent stored row for an object.
#[derive(Debug, Clone, PartialEq)]
pub struct LastSeen {
    pub archive_datetime: DateTime<Utc>,
    pub scheme_layer: i32,
    pub str_repr: String,
    pub deleted: bool,
    pub edit_datetime: Option<String>,
}

/// A fresh sighting of an object.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub str_repr: &'a str,
    pub scheme_layer: i32,
    pub deleted: bool,
    pub edit_datetime: Option<&'a str>,
    pub observed_at: DateTime<Utc>,
}

/// Decides whether an observation is worth a row.
///
/// Identical renderings under the same schema layer are skipped until the
/// latest stored row is older than the re-check window, measured from the
/// observation time to that row's `archive_datetime`. A window of `None`
/// never re-stores identical content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupEngine {
    recheck_window: Option<Duration>,
}

impl DedupEngine {
    pub fn new(recheck_window: Option<Duration>) -> Self {
        Self { recheck_window }
    }

    /// Window of `overlap_days`; zero disables age-based re-storing.
    pub fn from_overlap_days(overlap_days: u32) -> Self {
        match overlap_days {
            0 => Self::new(None),
            days => Self::new(Some(Duration::days(days as i64))),
        }
    }

    pub fn recheck_window(&self) -> Option<Duration> {
        self.recheck_window
    }

    pub fn should_store(&self, policy: WritePolicy, obs: &Observation<'_>, last: Option<&LastSeen>) -> Decision {
        let last = match last {
            Some(last) => last,
            None => return Decision::Store,
        };

        match policy {
            WritePolicy::CurrentState => {
                if last.str_repr != obs.str_repr || last.scheme_layer != obs.scheme_layer {
                    Decision::UpdateInPlace
                } else {
                    Decision::Skip
                }
            }
            WritePolicy::VersionedWithMutableFlags
                if last.deleted != obs.deleted || last.edit_datetime.as_deref() != obs.edit_datetime =>
            {
                Decision::UpdateInPlace
            }
            WritePolicy::Versioned | WritePolicy::VersionedWithMutableFlags => {
                if last.scheme_layer != obs.scheme_layer || last.str_repr != obs.str_repr {
                    return Decision::Store;
                }
                match self.recheck_window {
                    Some(window) if obs.observed_at - last.archive_datetime >= window => Decision::Store,
                    _ => Decision::Skip,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn last(repr: &str, layer: i32, when: DateTime<Utc>) -> LastSeen {
        LastSeen {
            archive_datetime: when,
            scheme_layer: layer,
            str_repr: repr.to_string(),
            deleted: false,
            edit_datetime: None,
        }
    }

    fn obs(repr: &str, layer: i32, when: DateTime<Utc>) -> Observation<'_> {
        Observation { str_repr: repr, scheme_layer: layer, deleted: false, edit_datetime: None, observed_at: when }
    }

    // ===== Versioned =====

    #[test]
    fn test_first_sighting_is_stored() {
        let engine = DedupEngine::from_overlap_days(2);
        assert_eq!(engine.should_store(WritePolicy::Versioned, &obs("a", 1, at(0)), None), Decision::Store);
    }

    #[test]
    fn test_identical_inside_window_is_skipped() {
        let engine = DedupEngine::from_overlap_days(2);
        let prior = last("a", 1, at(0));
        let decision = engine.should_store(WritePolicy::Versioned, &obs("a", 1, at(3600)), Some(&prior));
        assert_eq!(decision, Decision::Skip);
    }

    #[test]
    fn test_identical_outside_window_is_stored() {
        let engine = DedupEngine::from_overlap_days(2);
        let prior = last("a", 1, at(0));
        let decision = engine.should_store(WritePolicy::Versioned, &obs("a", 1, at(2 * 86_400)), Some(&prior));
        assert_eq!(decision, Decision::Store);
    }

    #[test]
    fn test_zero_window_never_restores_identical() {
        let engine = DedupEngine::from_overlap_days(0);
        let prior = last("a", 1, at(0));
        let decision = engine.should_store(WritePolicy::Versioned, &obs("a", 1, at(400 * 86_400)), Some(&prior));
        assert_eq!(decision, Decision::Skip);
    }

    #[test]
    fn test_changed_rendering_or_layer_is_stored() {
        let engine = DedupEngine::from_overlap_days(2);
        let prior = last("a", 1, at(0));
        assert_eq!(engine.should_store(WritePolicy::Versioned, &obs("b", 1, at(1)), Some(&prior)), Decision::Store);
        assert_eq!(engine.should_store(WritePolicy::Versioned, &obs("a", 2, at(1)), Some(&prior)), Decision::Store);
    }

    // ===== Mutable flags and current state =====

    #[test]
    fn test_delete_and_edit_update_in_place() {
        let engine = DedupEngine::from_overlap_days(2);
        let prior = last("a", 1, at(0));
        let deleted = Observation { deleted: true, ..obs("a", 1, at(1)) };
        assert_eq!(
            engine.should_store(WritePolicy::VersionedWithMutableFlags, &deleted, Some(&prior)),
            Decision::UpdateInPlace
        );
        let edited = Observation { edit_datetime: Some("2024-01-01T00:00:00.000000Z"), ..obs("a2", 1, at(1)) };
        assert_eq!(
            engine.should_store(WritePolicy::VersionedWithMutableFlags, &edited, Some(&prior)),
            Decision::UpdateInPlace
        );
    }

    #[test]
    fn test_current_state_updates_only_on_change() {
        let engine = DedupEngine::from_overlap_days(2);
        let prior = last("a", 1, at(0));
        assert_eq!(engine.should_store(WritePolicy::CurrentState, &obs("a", 1, at(999_999)), Some(&prior)), Decision::Skip);
        assert_eq!(
            engine.should_store(WritePolicy::CurrentState, &obs("b", 1, at(1)), Some(&prior)),
            Decision::UpdateInPlace
        );
    }

    proptest! {
        #[test]
        fn prop_versioned_never_updates_in_place(
            same_repr in any::<bool>(),
            layer_delta in 0i32..2,
            age_secs in 0i64..(10 * 86_400),
            days in 0u32..5,
        ) {
            let engine = DedupEngine::from_overlap_days(days);
            let prior = last("repr", 100, at(0));
            let repr = if same_repr { "repr" } else { "other" };
            let decision = engine.should_store(WritePolicy::Versioned, &obs(repr, 100 + layer_delta, at(age_secs)), Some(&prior));
            prop_assert_ne!(decision, Decision::UpdateInPlace);
            let expect_skip = same_repr
                && layer_delta == 0
                && (days == 0 || age_secs < days as i64 * 86_400);
            prop_assert_eq!(decision == Decision::Skip, expect_skip);
        }
    }
}
