use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Process {0} not found")]
    ProcessNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("App {0} is not installed")]
    NotInstalled(String),

    #[error("App {0} is already referenced by a client")]
    AlreadyReferenced(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Cgroup {0} is not empty")]
    CgroupBusy(String),

    #[error("Process {0} is in uninterruptible sleep and cannot be killed")]
    Unkillable(i32),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Unix error: {0}")]
    Unix(#[from] nix::errno::Errno),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
