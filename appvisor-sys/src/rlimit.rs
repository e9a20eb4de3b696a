use nix::sys::resource::{Resource, setrlimit};

use appvisor_core::config::ProcLimits;

/// Hard ceiling on the file descriptor limit, enforced regardless of config.
pub const MAX_FILE_DESCRIPTORS: u64 = 1024;

/// The rlimit values that will actually be applied for a process. The NOFILE
/// cap is clamped here; a stack value of 0 means "leave the OS default" and
/// is skipped at apply time.
pub fn effective(limits: &ProcLimits) -> [(Resource, u64); 8] {
    let nofile = if limits.max_file_descriptors > MAX_FILE_DESCRIPTORS {
        tracing::error!(
            "file descriptor limit {} exceeds the maximum, clamping to {MAX_FILE_DESCRIPTORS}",
            limits.max_file_descriptors
        );
        MAX_FILE_DESCRIPTORS
    } else {
        limits.max_file_descriptors
    };

    [
        (Resource::RLIMIT_CORE, limits.max_core_dump_bytes),
        (Resource::RLIMIT_FSIZE, limits.max_file_bytes),
        (Resource::RLIMIT_MEMLOCK, limits.max_locked_memory_bytes),
        (Resource::RLIMIT_NOFILE, nofile),
        (Resource::RLIMIT_STACK, limits.max_stack_bytes),
        (Resource::RLIMIT_MSGQUEUE, limits.max_mqueue_bytes),
        (Resource::RLIMIT_NPROC, limits.max_threads),
        (Resource::RLIMIT_SIGPENDING, limits.max_queued_signals),
    ]
}

/// Applies the limits to the calling process. Runs between fork and exec;
/// soft and hard limits are set equal.
pub fn apply(limits: &ProcLimits) -> std::io::Result<()> {
    for (resource, value) in effective(limits) {
        if resource == Resource::RLIMIT_STACK && value == 0 {
            continue;
        }
        setrlimit(resource, value, value).map_err(std::io::Error::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_map_to_expected_resources() {
        let limits = ProcLimits::default();
        let effective = effective(&limits);

        assert!(effective.contains(&(Resource::RLIMIT_CORE, 8192)));
        assert!(effective.contains(&(Resource::RLIMIT_FSIZE, 92160)));
        assert!(effective.contains(&(Resource::RLIMIT_MEMLOCK, 8192)));
        assert!(effective.contains(&(Resource::RLIMIT_NOFILE, 256)));
        assert!(effective.contains(&(Resource::RLIMIT_STACK, 0)));
        assert!(effective.contains(&(Resource::RLIMIT_MSGQUEUE, 512)));
        assert!(effective.contains(&(Resource::RLIMIT_NPROC, 20)));
        assert!(effective.contains(&(Resource::RLIMIT_SIGPENDING, 100)));
    }

    #[test]
    fn test_nofile_is_clamped() {
        let limits = ProcLimits { max_file_descriptors: 4096, ..Default::default() };
        let effective = effective(&limits);
        assert!(effective.contains(&(Resource::RLIMIT_NOFILE, MAX_FILE_DESCRIPTORS)));
    }

    #[test]
    fn test_nofile_below_cap_is_kept() {
        let limits = ProcLimits { max_file_descriptors: 512, ..Default::default() };
        let effective = effective(&limits);
        assert!(effective.contains(&(Resource::RLIMIT_NOFILE, 512)));
    }
}
