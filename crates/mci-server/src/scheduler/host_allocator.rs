//! Duration-based host-need estimation.
//!
//! Queued work is turned into a host count by dividing the summed
//! expected durations by the target turnaround window. The count of hosts
//! already up (statuses: starting, provisioning, provision failed,
//! running) is subtracted, and the distro's hard cap is respected.

use std::time::Duration;

use mci_core::queue::TaskQueueItem;

/// Fallback estimate for tasks with no duration history.
pub const DEFAULT_TASK_DURATION: Duration = Duration::from_secs(10 * 60);

/// Number of new hosts to request for one distro.
#[must_use]
pub fn desired_new_hosts(
    queue: &[TaskQueueItem],
    up_hosts: usize,
    max_hosts: usize,
    turnaround: Duration,
) -> usize {
    if queue.is_empty() || turnaround.is_zero() {
        return 0;
    }

    let total_secs: u64 = queue
        .iter()
        .map(|item| item.expected_duration.unwrap_or(DEFAULT_TASK_DURATION))
        .map(|d| d.as_secs())
        .sum();
    let needed = (total_secs).div_ceil(turnaround.as_secs().max(1)) as usize;

    let headroom = max_hosts.saturating_sub(up_hosts);
    needed.saturating_sub(up_hosts).min(headroom)
}

#[cfg(test)]
mod tests {
    use mci_core::model::Task;

    use super::*;

    fn items(durations_mins: &[u64]) -> Vec<TaskQueueItem> {
        durations_mins
            .iter()
            .enumerate()
            .map(|(i, mins)| {
                TaskQueueItem::from_task(
                    &Task::new(format!("t{i}"), "proj", "linux-64"),
                    Some(Duration::from_secs(mins * 60)),
                )
            })
            .collect()
    }

    #[test]
    fn test_empty_queue_requests_nothing() {
        assert_eq!(
            desired_new_hosts(&[], 0, 10, Duration::from_secs(1800)),
            0
        );
    }

    #[test]
    fn test_need_scales_with_queued_duration() {
        // 90 minutes of work / 30 minute window = 3 hosts
        let queue = items(&[30, 30, 30]);
        assert_eq!(
            desired_new_hosts(&queue, 0, 10, Duration::from_secs(1800)),
            3
        );
        // one already up
        assert_eq!(
            desired_new_hosts(&queue, 1, 10, Duration::from_secs(1800)),
            2
        );
    }

    #[test]
    fn test_capped_by_distro_maximum() {
        let queue = items(&[30; 20]);
        assert_eq!(
            desired_new_hosts(&queue, 2, 5, Duration::from_secs(1800)),
            3
        );
    }

    #[test]
    fn test_unknown_durations_use_default() {
        let queue = vec![TaskQueueItem::from_task(
            &Task::new("t0", "proj", "linux-64"),
            None,
        )];
        // 10 minutes of work in a 5 minute window needs 2 hosts
        assert_eq!(
            desired_new_hosts(&queue, 0, 10, Duration::from_secs(300)),
            2
        );
    }
}
