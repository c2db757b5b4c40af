//! The machine pool.
//!
//! Hosts are interchangeable machine slots for direct dispatch. The pool
//! only ever migrates hosts between "available" and "assigned"; nothing is
//! added or removed mid-run.

use std::fmt;
use std::fs::File;
use std::path::Path;

use serde::Deserialize;

use crate::error::StampedeError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Host {
    pub hostname: String,
}

impl Host {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    /// Whether this host is the machine we are running on. Remote launch
    /// must distinguish "this host" from "a genuinely remote host" by
    /// identity, which is why loopback aliases are banned from the pool.
    pub fn is_local(&self) -> bool {
        match local_hostname() {
            Some(local) => self.hostname == local,
            None => false,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.hostname)
    }
}

/// The local machine's hostname, as the pool would name it.
pub fn local_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
}

/// Reads and parses the hosts file: a YAML list of hostnames.
pub fn get_hosts(hosts_file: impl AsRef<Path>) -> Result<Vec<Host>, StampedeError> {
    let hosts_file = hosts_file.as_ref();
    let hosts_fd = File::open(hosts_file).map_err(|source| StampedeError::FileRead {
        path: hosts_file.to_path_buf(),
        source,
    })?;
    let hosts: Vec<Host> =
        serde_yaml::from_reader(hosts_fd).map_err(|e| StampedeError::Parse {
            path: hosts_file.to_path_buf(),
            message: e.to_string(),
        })?;

    if hosts.is_empty() {
        return Err(StampedeError::Config(format!(
            "{} contains no machines",
            hosts_file.display()
        )));
    }
    // A loopback alias would defeat the local-vs-remote identity check.
    for host in &hosts {
        if host.hostname == "localhost" || host.hostname.starts_with("127.") {
            return Err(StampedeError::Config(format!(
                "Machine pool must not contain the loopback alias '{}'; use the machine name",
                host.hostname
            )));
        }
    }
    Ok(hosts)
}

/// Tracks which machines are free for assignment.
#[derive(Debug)]
pub struct MachinePool {
    available: Vec<Host>,
    total: usize,
}

impl MachinePool {
    pub fn new(hosts: Vec<Host>) -> Self {
        let total = hosts.len();
        Self {
            available: hosts,
            total,
        }
    }

    /// Number of machines currently free.
    pub fn available(&self) -> usize {
        self.available.len()
    }

    /// Size of the full pool, assigned machines included.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Takes the first `n` available machines, or `None` if fewer than `n`
    /// are free. Order is otherwise insignificant; machines are
    /// interchangeable.
    pub fn take(&mut self, n: usize) -> Option<Vec<Host>> {
        if n == 0 || n > self.available.len() {
            return None;
        }
        Some(self.available.drain(..n).collect())
    }

    /// Returns machines to the pool once their job reached a terminal state.
    pub fn release(&mut self, machines: Vec<Host>) {
        self.available.extend(machines);
    }
}
