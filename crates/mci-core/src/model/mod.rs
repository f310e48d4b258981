//! Data model for the control plane.
//!
//! Tasks, hosts and distros are the three persisted entities the dispatch
//! core coordinates. The task <-> host binding lives in both
//! `host.running_task` and `task.host_id` and is only ever mutated through
//! the storage layer's compare-and-swap operations.

mod distro;
mod host;
mod project;
mod task;

pub use distro::{Distro, SshOptions};
pub use host::{Host, HostStatus, PROVIDER_STATIC, UP_HOST_STATUSES};
pub use project::{CommandDescriptor, ProjectConfig, TaskDef};
pub use task::{
    Dependency, Requester, Task, TaskStatus, MAX_TASK_EXECUTION, PATCH_REQUESTER, REPO_REQUESTER,
};

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of generated task and host secrets.
const SECRET_LEN: usize = 32;

/// Generate a fresh opaque secret token.
///
/// Secrets rotate on every dispatch so that a stale agent instance can be
/// fenced off with a 409 on its next request.
#[must_use]
pub fn new_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_secret_length_and_uniqueness() {
        let a = new_secret();
        let b = new_secret();
        assert_eq!(a.len(), SECRET_LEN);
        assert_ne!(a, b);
    }
}
