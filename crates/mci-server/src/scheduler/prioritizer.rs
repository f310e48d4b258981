//! Task prioritization.
//!
//! A chain of comparators, applied in fixed order by one stable sort, so
//! the output is deterministic given identical inputs:
//!
//! 1. higher explicit priority first
//! 2. commit order (interleaves patch tasks with repo tasks)
//! 3. tasks whose previous completion failed sort earlier
//! 4. task-group members adjacent, highest group first
//! 5. lexicographic tie-break on display name

use std::cmp::Ordering;

use mci_core::model::{Task, TaskStatus};

/// Sort tasks into dispatch order.
#[must_use]
pub fn prioritize(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(compare_tasks);
    tasks
}

fn compare_tasks(a: &Task, b: &Task) -> Ordering {
    by_priority(a, b)
        .then_with(|| by_commit_order(a, b))
        .then_with(|| by_previous_failure(a, b))
        .then_with(|| by_task_group(a, b))
        .then_with(|| a.display_name.cmp(&b.display_name))
}

fn by_priority(a: &Task, b: &Task) -> Ordering {
    b.priority.cmp(&a.priority)
}

fn by_commit_order(a: &Task, b: &Task) -> Ordering {
    a.revision_order_number.cmp(&b.revision_order_number)
}

fn by_previous_failure(a: &Task, b: &Task) -> Ordering {
    // a regression candidate reveals its status soonest at the front
    let a_failed = a.previous_status == Some(TaskStatus::Failed);
    let b_failed = b.previous_status == Some(TaskStatus::Failed);
    b_failed.cmp(&a_failed)
}

fn by_task_group(a: &Task, b: &Task) -> Ordering {
    group_key(b).cmp(&group_key(a))
}

/// Grouped tasks key on (variant, group) so members of one group compare
/// equal and stay adjacent; ungrouped tasks sort after all groups.
fn group_key(task: &Task) -> String {
    if task.task_group.is_empty() {
        String::new()
    } else {
        format!("{}/{}", task.build_variant, task.task_group)
    }
}

#[cfg(test)]
mod tests {
    use mci_core::model::Requester;

    use super::*;

    fn task(id: &str) -> Task {
        let mut t = Task::new(id, "proj", "linux-64");
        t.display_name = id.to_string();
        t
    }

    #[test]
    fn test_priority_dominates() {
        let mut low = task("low");
        low.priority = 0;
        let mut high = task("high");
        high.priority = 100;
        high.revision_order_number = 50;

        let order = prioritize(vec![low, high]);
        assert_eq!(order[0].id, "high");
    }

    #[test]
    fn test_commit_order_interleaves_patches() {
        let mut early_patch = task("patch");
        early_patch.requester = Requester::Patch;
        early_patch.revision_order_number = 3;

        let mut mid_commit = task("commit-5");
        mid_commit.revision_order_number = 5;

        let mut late_commit = task("commit-9");
        late_commit.revision_order_number = 9;

        let order = prioritize(vec![late_commit, mid_commit, early_patch]);
        let ids: Vec<&str> = order.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["patch", "commit-5", "commit-9"]);
    }

    #[test]
    fn test_previous_failure_sorts_earlier() {
        let clean = task("clean");
        let mut regressed = task("regressed");
        regressed.previous_status = Some(TaskStatus::Failed);

        let order = prioritize(vec![clean, regressed]);
        assert_eq!(order[0].id, "regressed");
    }

    #[test]
    fn test_task_groups_stay_adjacent() {
        let mut a1 = task("a1");
        a1.task_group = "alpha".to_string();
        let mut b1 = task("b1");
        b1.task_group = "beta".to_string();
        let mut a2 = task("a2");
        a2.task_group = "alpha".to_string();
        let loner = task("loner");

        let order = prioritize(vec![a1, b1, loner, a2]);
        let ids: Vec<&str> = order.iter().map(|t| t.id.as_str()).collect();
        // beta > alpha lexicographically, highest group first; ungrouped last
        assert_eq!(ids, ["b1", "a1", "a2", "loner"]);
    }

    #[test]
    fn test_deterministic_given_identical_inputs() {
        let tasks = vec![task("c"), task("a"), task("b")];
        let first = prioritize(tasks.clone());
        let second = prioritize(tasks);
        let first_ids: Vec<&str> = first.iter().map(|t| t.id.as_str()).collect();
        let second_ids: Vec<&str> = second.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
        assert_eq!(first_ids, ["a", "b", "c"]);
    }
}
