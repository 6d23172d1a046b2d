//! Queue ordering policies.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::sequence::SequenceGroup;

/// Policy selector carried in the scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingPolicy {
    /// First-come, first-served (default)
    #[default]
    Fcfs,
}

/// Priority order over sequence groups at a fixed timestamp.
pub trait Policy {
    /// Priority key of a group; larger sorts earlier.
    fn priority(&self, now: Instant, seq_group: &SequenceGroup) -> Duration;

    /// Stable sort of a queue, highest priority at the front.
    fn sort_by_priority(&self, now: Instant, queue: &mut VecDeque<Arc<SequenceGroup>>) {
        queue
            .make_contiguous()
            .sort_by(|a, b| self.priority(now, b).cmp(&self.priority(now, a)));
    }
}

/// First-come, first-served: priority is the time spent in the system.
pub struct Fcfs;

impl Policy for Fcfs {
    fn priority(&self, now: Instant, seq_group: &SequenceGroup) -> Duration {
        now.duration_since(seq_group.arrival_time())
    }
}

/// Build the policy implementation selected by the configuration.
pub fn make_policy(policy: SchedulingPolicy) -> Box<dyn Policy> {
    match policy {
        SchedulingPolicy::Fcfs => Box::new(Fcfs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{SamplingParams, SeqHandle, Sequence};

    fn group_at(request_id: &str, arrival_time: Instant) -> Arc<SequenceGroup> {
        let seq = SeqHandle::new(Sequence::new(0, vec![1]));
        Arc::new(SequenceGroup::new(
            request_id.to_string(),
            vec![seq],
            SamplingParams::default(),
            arrival_time,
            None,
        ))
    }

    #[test]
    fn fcfs_orders_by_arrival() {
        let t0 = Instant::now();
        let early = group_at("early", t0);
        let late = group_at("late", t0 + Duration::from_millis(5));

        let mut queue = VecDeque::from([Arc::clone(&late), Arc::clone(&early)]);
        Fcfs.sort_by_priority(t0 + Duration::from_millis(10), &mut queue);

        let ids: Vec<_> = queue.iter().map(|g| g.request_id().clone()).collect();
        assert_eq!(ids, ["early", "late"]);
    }

    #[test]
    fn fcfs_sort_is_stable_for_equal_arrivals() {
        let t0 = Instant::now();
        let a = group_at("a", t0);
        let b = group_at("b", t0);
        let c = group_at("c", t0);

        let mut queue = VecDeque::from([a, b, c]);
        Fcfs.sort_by_priority(t0 + Duration::from_millis(1), &mut queue);

        let ids: Vec<_> = queue.iter().map(|g| g.request_id().clone()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }
}
