use log::{debug, warn};
use rustix::process::{getrlimit, setrlimit, Resource, Rlimit};

/// Raise the file-descriptor limit to the hard limit. Every connected
/// client costs a descriptor, and the soft default of 1024 is far below
/// what a busy relay sees.
pub fn increase_rlimits() {
    let limit = getrlimit(Resource::Nofile);
    debug!("RLIMIT_NOFILE: {:?}", limit);
    if limit.current == limit.maximum {
        debug!("soft limit is already at the hard limit");
        return;
    }
    let raised = Rlimit {
        current: limit.maximum,
        maximum: limit.maximum,
    };
    match setrlimit(Resource::Nofile, raised) {
        Ok(()) => debug!("RLIMIT_NOFILE raised to {:?}", limit.maximum),
        Err(e) => warn!("unable to raise RLIMIT_NOFILE: {}", e),
    }
}
