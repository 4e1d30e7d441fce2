use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, TapflowResult};

pub const ROUTER__BEFORE_CHECKPOINT_COMMIT: &str = "router.before_checkpoint_commit";
pub const RUN__BEFORE_ROUTER: &str = "run.before_router";
pub const FASTSYNC__BEFORE_MERGE_COMMIT: &str = "fastsync.before_merge_commit";

/// Returns an error when the fail point `name` is configured with `return`.
///
/// The optional parameter selects the error kind: `checkpoint_io` or `injected` (default).
pub fn tapflow_fail_point(name: &str) -> TapflowResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("checkpoint_io") => ErrorKind::CheckpointIoError,
            _ => ErrorKind::InjectedFault,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
