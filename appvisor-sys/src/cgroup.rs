use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use appvisor_core::{Error, Result};

/// The three cgroup v1 controllers this supervisor owns, one hierarchy each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Cpu,
    Memory,
    Freezer,
}

impl Subsystem {
    pub const ALL: [Subsystem; 3] = [Subsystem::Cpu, Subsystem::Memory, Subsystem::Freezer];

    pub fn name(self) -> &'static str {
        match self {
            Subsystem::Cpu => "cpu",
            Subsystem::Memory => "memory",
            Subsystem::Freezer => "freezer",
        }
    }
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeState {
    Frozen,
    Thawed,
}

const TASKS_FILE: &str = "tasks";
const PROCS_FILE: &str = "cgroup.procs";
const CPU_SHARES_FILE: &str = "cpu.shares";
const MEM_LIMIT_FILE: &str = "memory.limit_in_bytes";
const FREEZE_STATE_FILE: &str = "freezer.state";

/// Owns the per-subsystem cgroup v1 hierarchies under a tmpfs root and the
/// per-app groups inside them.
#[derive(Debug, Clone)]
pub struct CgroupDriver {
    root: PathBuf,
}

impl CgroupDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn subsys_dir(&self, subsys: Subsystem) -> PathBuf {
        self.root.join(subsys.name())
    }

    fn group_dir(&self, subsys: Subsystem, name: &str) -> PathBuf {
        self.subsys_dir(subsys).join(name)
    }

    fn group_file(&self, subsys: Subsystem, name: &str, file: &str) -> PathBuf {
        self.group_dir(subsys, name).join(file)
    }

    /// Mounts and claims the hierarchies, then points the freezer
    /// release-agent at the bundled notifier helper.
    ///
    /// A root that is mounted but missing subsystems is unrecoverable partial
    /// state: everything is detached and remounted from scratch.
    pub fn init(&self, release_agent: &Path) -> Result<()> {
        let mounts = fs::read_to_string("/proc/self/mounts")?;

        if !mount_table_has(&mounts, &self.root) {
            self.mount_all()?;
        } else if !Subsystem::ALL
            .iter()
            .all(|s| mount_table_has(&mounts, &self.subsys_dir(*s)))
        {
            warn!(root = %self.root.display(), "cgroup root has partial subsystem mounts, remounting");
            umount2(&self.root, MntFlags::MNT_DETACH)
                .map_err(|e| Error::Cgroup(format!("could not detach cgroup root: {e}")))?;
            self.mount_all()?;
        }

        fs::write(
            self.subsys_dir(Subsystem::Freezer).join("release_agent"),
            release_agent.as_os_str().as_encoded_bytes(),
        )
        .map_err(|e| Error::Cgroup(format!("could not set release agent: {e}")))?;

        Ok(())
    }

    fn mount_all(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        mount(
            Some("appvisor"),
            &self.root,
            Some("tmpfs"),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| Error::Cgroup(format!("could not mount cgroup root: {e}")))?;

        for subsys in Subsystem::ALL {
            let dir = self.subsys_dir(subsys);
            fs::create_dir_all(&dir)?;
            mount(
                Some(subsys.name()),
                &dir,
                Some("cgroup"),
                MsFlags::empty(),
                Some(subsys.name()),
            )
            .map_err(|e| Error::Cgroup(format!("could not mount {subsys} hierarchy: {e}")))?;
            info!("mounted cgroup hierarchy for subsystem '{subsys}'");
        }

        Ok(())
    }

    /// Creates a per-app group. Freezer groups get `notify_on_release` so
    /// the kernel runs the release agent when the last task leaves.
    pub fn create(&self, subsys: Subsystem, name: &str) -> Result<Created> {
        let dir = self.group_dir(subsys, name);
        let created = match fs::create_dir(&dir) {
            Ok(()) => Created::Created,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(app = name, "cgroup {} already exists", dir.display());
                Created::AlreadyExists
            }
            Err(e) => {
                return Err(Error::Cgroup(format!(
                    "could not create cgroup {}: {e}",
                    dir.display()
                )));
            }
        };

        if subsys == Subsystem::Freezer {
            fs::write(dir.join("notify_on_release"), b"1")
                .map_err(|e| Error::Cgroup(format!("could not enable notify_on_release: {e}")))?;
        }

        Ok(created)
    }

    /// Deletes a per-app group. The kernel refuses while tasks remain.
    pub fn remove(&self, subsys: Subsystem, name: &str) -> Result<()> {
        let dir = self.group_dir(subsys, name);
        match fs::remove_dir(&dir) {
            Ok(()) => {
                debug!("deleted cgroup {}", dir.display());
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                Err(Error::CgroupBusy(format!("{subsys}/{name}")))
            }
            Err(e) => Err(Error::Cgroup(format!(
                "could not remove cgroup {}: {e}",
                dir.display()
            ))),
        }
    }

    /// Moves a process into an app's group.
    pub fn add_proc(&self, subsys: Subsystem, name: &str, pid: i32) -> Result<()> {
        let path = self.group_file(subsys, name, PROCS_FILE);
        match fs::write(&path, pid.to_string()) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                Err(Error::ProcessNotFound(pid.to_string()))
            }
            Err(e) => Err(Error::Cgroup(format!(
                "could not add pid {pid} to {subsys}/{name}: {e}"
            ))),
        }
    }

    /// Sets the relative cpu weight for the app. The kernel computes the
    /// actual share as this value over the sum of all contending shares.
    pub fn set_cpu_share(&self, name: &str, share: u64) -> Result<()> {
        fs::write(
            self.group_file(Subsystem::Cpu, name, CPU_SHARES_FILE),
            share.to_string(),
        )
        .map_err(|e| Error::Cgroup(format!("could not set cpu share for {name}: {e}")))
    }

    /// Sets the memory limit in bytes, reading it back to report kernel
    /// rounding.
    pub fn set_mem_limit(&self, name: &str, bytes: u64) -> Result<()> {
        let path = self.group_file(Subsystem::Memory, name, MEM_LIMIT_FILE);
        fs::write(&path, bytes.to_string())
            .map_err(|e| Error::Cgroup(format!("could not set memory limit for {name}: {e}")))?;

        let actual = fs::read_to_string(&path)
            .map_err(|e| Error::Cgroup(format!("could not read back memory limit: {e}")))?;
        if actual.trim() != bytes.to_string() {
            warn!(
                app = name,
                "memory limit set to {} instead of {bytes} (page rounding or availability)",
                actual.trim()
            );
        }
        Ok(())
    }

    /// Asynchronous: the group may still be freezing when this returns.
    pub fn freeze(&self, name: &str) -> Result<()> {
        self.write_freeze_state(name, "FROZEN")
    }

    /// Asynchronous: the group may still be thawing when this returns.
    pub fn thaw(&self, name: &str) -> Result<()> {
        self.write_freeze_state(name, "THAWED")
    }

    fn write_freeze_state(&self, name: &str, state: &str) -> Result<()> {
        fs::write(self.group_file(Subsystem::Freezer, name, FREEZE_STATE_FILE), state)
            .map_err(|e| Error::Cgroup(format!("could not set freeze state for {name}: {e}")))
    }

    pub fn freeze_state(&self, name: &str) -> Result<FreezeState> {
        let raw =
            fs::read_to_string(self.group_file(Subsystem::Freezer, name, FREEZE_STATE_FILE))
                .map_err(|e| Error::Cgroup(format!("could not read freeze state for {name}: {e}")))?;
        match raw.trim() {
            "FROZEN" => Ok(FreezeState::Frozen),
            // A group still in transition schedules like a thawed one.
            "THAWED" | "FREEZING" => Ok(FreezeState::Thawed),
            other => Err(Error::Cgroup(format!("unrecognized freeze state '{other}'"))),
        }
    }

    /// True iff no task remains in the group.
    pub fn is_empty(&self, subsys: Subsystem, name: &str) -> Result<bool> {
        let raw = fs::read_to_string(self.group_file(subsys, name, TASKS_FILE))
            .map_err(|e| Error::Cgroup(format!("could not read tasks of {subsys}/{name}: {e}")))?;
        Ok(parse_pid_list(&raw).is_empty())
    }

    /// PIDs of all processes in the group.
    pub fn procs(&self, subsys: Subsystem, name: &str) -> Result<Vec<i32>> {
        let raw = fs::read_to_string(self.group_file(subsys, name, PROCS_FILE))
            .map_err(|e| Error::Cgroup(format!("could not read procs of {subsys}/{name}: {e}")))?;
        Ok(parse_pid_list(&raw))
    }

    /// TIDs of all threads in the group.
    pub fn threads(&self, subsys: Subsystem, name: &str) -> Result<Vec<i32>> {
        let raw = fs::read_to_string(self.group_file(subsys, name, TASKS_FILE))
            .map_err(|e| Error::Cgroup(format!("could not read tasks of {subsys}/{name}: {e}")))?;
        Ok(parse_pid_list(&raw))
    }

    /// Sends `sig` to every process in the group and returns the pids hit.
    ///
    /// `prev_pass` is the pid list from the previous kill pass over the same
    /// group. A process seen in both passes that sits in uninterruptible
    /// sleep will never die; killing apps is this supervisor's job, so that
    /// is an unworkable system and the error escalates to a reboot.
    pub fn send_signal(
        &self,
        subsys: Subsystem,
        name: &str,
        sig: Signal,
        prev_pass: &[i32],
    ) -> Result<Vec<i32>> {
        let pids = self.procs(subsys, name)?;

        for &pid in &pids {
            let state = proc_state(pid);
            if prev_pass.contains(&pid) && state == Some('D') {
                return Err(Error::Unkillable(pid));
            }

            debug!(app = name, pid, ?state, "sending {sig} to app process");
            // The process may be gone already; that is the outcome we want.
            let _ = kill(Pid::from_raw(pid), sig);
        }

        Ok(pids)
    }
}

/// Process state letter from /proc/<pid>/status, None if the process is
/// already gone.
pub fn proc_state(pid: i32) -> Option<char> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_proc_state(&status)
}

fn parse_proc_state(status: &str) -> Option<char> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("State:"))
        .and_then(|rest| rest.trim_start().chars().next())
}

fn parse_pid_list(raw: &str) -> Vec<i32> {
    raw.lines().filter_map(|line| line.trim().parse().ok()).collect()
}

/// Checks whether `target` appears as a mount point in a
/// /proc/self/mounts-format table.
fn mount_table_has(mounts: &str, target: &Path) -> bool {
    let target = target.to_string_lossy();
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mountpoint| mountpoint == target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid_list() {
        assert_eq!(parse_pid_list("1\n23\n456\n"), vec![1, 23, 456]);
        assert_eq!(parse_pid_list(""), Vec::<i32>::new());
        assert_eq!(parse_pid_list("12\nnonsense\n34\n"), vec![12, 34]);
    }

    #[test]
    fn test_parse_proc_state() {
        let status = "Name:\tsleep\nUmask:\t0022\nState:\tS (sleeping)\nTgid:\t123\n";
        assert_eq!(parse_proc_state(status), Some('S'));

        let status = "Name:\tstuck\nState:\tD (disk sleep)\n";
        assert_eq!(parse_proc_state(status), Some('D'));

        assert_eq!(parse_proc_state("Name:\tweird\n"), None);
    }

    #[test]
    fn test_mount_table_lookup() {
        let mounts = "tmpfs /sys/fs/cgroup tmpfs rw 0 0\n\
                      cpu /sys/fs/cgroup/cpu cgroup rw,cpu 0 0\n";
        assert!(mount_table_has(mounts, Path::new("/sys/fs/cgroup")));
        assert!(mount_table_has(mounts, Path::new("/sys/fs/cgroup/cpu")));
        assert!(!mount_table_has(mounts, Path::new("/sys/fs/cgroup/memory")));
    }

    // The group-file operations only need a directory tree, so they are
    // exercised against a scratch root.

    fn scratch_driver() -> (tempfile::TempDir, CgroupDriver) {
        let dir = tempfile::tempdir().unwrap();
        let driver = CgroupDriver::new(dir.path());
        for subsys in Subsystem::ALL {
            fs::create_dir_all(dir.path().join(subsys.name())).unwrap();
        }
        (dir, driver)
    }

    #[test]
    fn test_create_is_idempotent_but_reported() {
        let (_dir, driver) = scratch_driver();
        assert_eq!(driver.create(Subsystem::Cpu, "app").unwrap(), Created::Created);
        assert_eq!(
            driver.create(Subsystem::Cpu, "app").unwrap(),
            Created::AlreadyExists
        );
    }

    #[test]
    fn test_freezer_group_gets_notify_on_release() {
        let (dir, driver) = scratch_driver();
        driver.create(Subsystem::Freezer, "app").unwrap();
        let flag = fs::read_to_string(dir.path().join("freezer/app/notify_on_release")).unwrap();
        assert_eq!(flag, "1");
    }

    #[test]
    fn test_emptiness_and_pid_listing() {
        let (dir, driver) = scratch_driver();
        driver.create(Subsystem::Freezer, "app").unwrap();

        let group = dir.path().join("freezer/app");
        fs::write(group.join("tasks"), "").unwrap();
        fs::write(group.join("cgroup.procs"), "").unwrap();
        assert!(driver.is_empty(Subsystem::Freezer, "app").unwrap());
        assert!(driver.procs(Subsystem::Freezer, "app").unwrap().is_empty());

        fs::write(group.join("tasks"), "101\n102\n").unwrap();
        fs::write(group.join("cgroup.procs"), "101\n").unwrap();
        assert!(!driver.is_empty(Subsystem::Freezer, "app").unwrap());
        assert_eq!(driver.procs(Subsystem::Freezer, "app").unwrap(), vec![101]);
        assert_eq!(driver.threads(Subsystem::Freezer, "app").unwrap(), vec![101, 102]);
    }

    #[test]
    fn test_limits_are_written_to_group_files() {
        let (dir, driver) = scratch_driver();
        driver.create(Subsystem::Cpu, "app").unwrap();
        driver.create(Subsystem::Memory, "app").unwrap();

        driver.set_cpu_share("app", 512).unwrap();
        driver.set_mem_limit("app", 40_960_000).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("cpu/app/cpu.shares")).unwrap(), "512");
        assert_eq!(
            fs::read_to_string(dir.path().join("memory/app/memory.limit_in_bytes")).unwrap(),
            "40960000"
        );
    }

    #[test]
    fn test_signal_sweep_on_empty_group() {
        let (dir, driver) = scratch_driver();
        driver.create(Subsystem::Freezer, "app").unwrap();
        fs::write(dir.path().join("freezer/app/cgroup.procs"), "").unwrap();

        let hit = driver
            .send_signal(Subsystem::Freezer, "app", Signal::SIGTERM, &[])
            .unwrap();
        assert!(hit.is_empty());
    }

    #[test]
    fn test_freeze_state_transitions() {
        let (dir, driver) = scratch_driver();
        driver.create(Subsystem::Freezer, "app").unwrap();

        driver.freeze("app").unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("freezer/app/freezer.state")).unwrap(),
            "FROZEN"
        );
        assert_eq!(driver.freeze_state("app").unwrap(), FreezeState::Frozen);

        driver.thaw("app").unwrap();
        assert_eq!(driver.freeze_state("app").unwrap(), FreezeState::Thawed);

        // A group still freezing schedules like a thawed one.
        fs::write(dir.path().join("freezer/app/freezer.state"), "FREEZING\n").unwrap();
        assert_eq!(driver.freeze_state("app").unwrap(), FreezeState::Thawed);
    }

    #[test]
    fn test_remove_deletes_group_dir() {
        let (dir, driver) = scratch_driver();
        driver.create(Subsystem::Memory, "app").unwrap();
        driver.remove(Subsystem::Memory, "app").unwrap();
        assert!(!dir.path().join("memory/app").exists());
    }
}
