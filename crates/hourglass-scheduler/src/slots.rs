//! Due-slot computation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::WorkflowDefinition;

/// Lazy, finite sequence of slots owed a run at some instant.
///
/// Cloning restarts the sequence from the same position.
#[derive(Debug, Clone)]
pub struct DueSlots {
    workflow: WorkflowDefinition,
    next: i64,
    last: i64,
    exclude: HashSet<DateTime<Utc>>,
}

impl DueSlots {
    /// Slots of `workflow` due at `now`, skipping those in `exclude`.
    ///
    /// `exclude` holds slots whose run has already left Pending. With
    /// catchup every due slot is produced in ascending order; without it
    /// only the newest due slot is considered, and earlier ones are skipped
    /// for good.
    pub fn new(
        workflow: &WorkflowDefinition,
        now: DateTime<Utc>,
        exclude: HashSet<DateTime<Utc>>,
    ) -> Self {
        let (next, last) = match workflow.slot_index_at(now) {
            Some(last) if workflow.catchup => (0, last),
            Some(last) => (last, last),
            None => (0, -1),
        };

        Self {
            workflow: workflow.clone(),
            next,
            last,
            exclude,
        }
    }

    /// Number of slots left, ignoring exclusions.
    pub fn upper_bound(&self) -> u64 {
        (self.last - self.next + 1).max(0) as u64
    }
}

impl Iterator for DueSlots {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next <= self.last {
            let index = self.next;
            self.next += 1;

            let slot = self.workflow.slot_at(index)?;
            if !self.exclude.contains(&slot) {
                return Some(slot);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use proptest::prelude::*;

    fn day0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 14, 0, 0, 0).unwrap()
    }

    fn hourly(catchup: bool) -> WorkflowDefinition {
        WorkflowDefinition::new("extract", "okx", day0(), TimeDelta::hours(1)).with_catchup(catchup)
    }

    #[test]
    fn nothing_due_before_start() {
        let now = day0() - TimeDelta::minutes(1);
        assert_eq!(DueSlots::new(&hourly(true), now, HashSet::new()).count(), 0);
        assert_eq!(DueSlots::new(&hourly(false), now, HashSet::new()).count(), 0);
    }

    #[test]
    fn start_boundary_itself_is_due() {
        let slots: Vec<_> = DueSlots::new(&hourly(true), day0(), HashSet::new()).collect();
        assert_eq!(slots, vec![day0()]);
    }

    #[test]
    fn catchup_yields_every_slot_in_order() {
        let now = day0() + TimeDelta::hours(5);
        let slots: Vec<_> = DueSlots::new(&hourly(true), now, HashSet::new()).collect();
        let expected: Vec<_> = (0..=5).map(|h| day0() + TimeDelta::hours(h)).collect();
        assert_eq!(slots, expected);
    }

    #[test]
    fn catchup_skips_slots_already_run() {
        let now = day0() + TimeDelta::hours(3);
        let exclude: HashSet<_> = [day0(), day0() + TimeDelta::hours(2)].into();
        let slots: Vec<_> = DueSlots::new(&hourly(true), now, exclude).collect();
        assert_eq!(
            slots,
            vec![day0() + TimeDelta::hours(1), day0() + TimeDelta::hours(3)]
        );
    }

    #[test]
    fn without_catchup_only_newest_slot() {
        let now = day0() + TimeDelta::hours(5) + TimeDelta::minutes(10);
        let slots: Vec<_> = DueSlots::new(&hourly(false), now, HashSet::new()).collect();
        assert_eq!(slots, vec![day0() + TimeDelta::hours(5)]);
    }

    #[test]
    fn without_catchup_earlier_slots_are_not_revisited() {
        let now = day0() + TimeDelta::hours(5);
        let exclude: HashSet<_> = [day0() + TimeDelta::hours(5)].into();
        assert_eq!(DueSlots::new(&hourly(false), now, exclude).count(), 0);
    }

    #[test]
    fn sequence_is_restartable() {
        let now = day0() + TimeDelta::hours(4);
        let mut slots = DueSlots::new(&hourly(true), now, HashSet::new());
        slots.next();
        let snapshot = slots.clone();
        assert_eq!(slots.collect::<Vec<_>>(), snapshot.collect::<Vec<_>>());
    }

    #[test]
    fn sub_second_intervals_are_exact() {
        let wf = WorkflowDefinition::new("fast", "okx", day0(), TimeDelta::milliseconds(250));
        let now = day0() + TimeDelta::seconds(1);
        let slots: Vec<_> = DueSlots::new(&wf, now, HashSet::new()).collect();
        assert_eq!(slots.len(), 5);
        assert_eq!(slots[1], day0() + TimeDelta::milliseconds(250));
    }

    proptest! {
        #[test]
        fn catchup_covers_every_due_slot(
            interval_secs in 1i64..7_200,
            elapsed_secs in 0i64..200_000,
        ) {
            let wf = WorkflowDefinition::new("x", "okx", day0(), TimeDelta::seconds(interval_secs));
            let now = day0() + TimeDelta::seconds(elapsed_secs);
            let slots: Vec<_> = DueSlots::new(&wf, now, HashSet::new()).collect();

            prop_assert_eq!(slots.len() as i64, elapsed_secs / interval_secs + 1);
            prop_assert!(slots.windows(2).all(|w| w[1] - w[0] == wf.interval));
            prop_assert!(slots.iter().all(|s| *s >= wf.start && *s <= now));
            prop_assert!(now - *slots.last().unwrap() < wf.interval);
        }
    }
}
