/// Kills the whole process group of a spawned child when told to and again
/// when dropped, so grandchildren never outlive a run.
#[derive(Debug)]
pub(crate) struct ProcessGroup {
    #[cfg(unix)]
    pgid: Option<nix::unistd::Pid>,
}

#[cfg(unix)]
impl ProcessGroup {
    /// `pid` must belong to a child spawned with `process_group(0)`.
    pub(crate) fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.map(|pid| nix::unistd::Pid::from_raw(pid as i32)),
        }
    }

    pub(crate) fn kill(&self) {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};

        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pgid = %pgid, error = %e, "failed to kill process group"),
        }
    }
}

#[cfg(not(unix))]
impl ProcessGroup {
    pub(crate) fn new(_pid: Option<u32>) -> Self {
        Self {}
    }

    pub(crate) fn kill(&self) {}
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}
