//! Retry of failed writes and reset of unsent changes

use crate::coordinator::CacheCoordinator;
use odata_trait::{ODataError, ODataResult, ResourcePath};
use tracing::{debug, info};

impl CacheCoordinator {
    /// Re-queues failed PATCHes and POSTs of the group; runs right before the
    /// group is submitted
    pub(crate) fn retry_failed(&self, group_id: &str) {
        self.with_state(|state| {
            if state.disposed {
                return;
            }
            self.retry_patches(state, group_id);
            let failed: Vec<String> = state
                .creates
                .iter()
                .filter(|(_, create)| create.group_id() == group_id)
                .map(|(uid, _)| uid.clone())
                .collect();
            for uid in failed {
                self.requeue_post(state, &uid);
            }
        });
    }

    /// Restores unsent edits at or below `path`, discards unsent transient
    /// rows and cancels unsent DELETEs. Their futures fail with `Canceled`.
    /// Requests already on the wire are not affected.
    pub fn reset_changes(&self, path: &str) -> ODataResult<()> {
        let path = ResourcePath::parse(path)?;
        self.with_state(|state| {
            Self::ensure_alive(state)?;
            let path = state.canonical_path(&path);
            self.reset_patches(state, &path);

            let unsent: Vec<String> = state
                .creates
                .iter()
                .filter(|(_, create)| create.path().starts_with(&path))
                .map(|(uid, _)| uid.clone())
                .collect();
            let mut discarded = 0;
            for uid in unsent {
                if self.cancel_create(state, &uid, "changes were reset") {
                    discarded += 1;
                } else {
                    debug!("POST of {} is in flight; not reset", uid);
                }
            }
            self.cancel_deletes(state, &path);
            info!("↩️ Reset changes below {} ({} transient rows discarded)", path, discarded);
            Ok::<(), ODataError>(())
        })
    }
}
