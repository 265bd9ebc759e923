//! Lifetime of the external tools nemostage spawns (ncks, ncrename, sbatch).
//!
//! Every tool runs in its own process group with a parent-death signal, and
//! its PID is tracked in a global registry. When the launcher is interrupted
//! (SIGINT/SIGTERM/SIGHUP) or the [`ProcessGuard`] in `main` is dropped, the
//! tracked groups get SIGTERM, then SIGKILL after a grace period. A
//! half-written bathymetry file is preferable to a tool that keeps running
//! after its run directory has been abandoned.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// PIDs (and process-group IDs, they are equal) of running tools
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: BTreeSet<u32>,
    terminated: bool,
}

impl ChildRegistry {
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Tracking tool process {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("Tool process {} finished", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// SIGTERM every tracked group, wait up to `grace`, then SIGKILL survivors.
    ///
    /// Runs at most once per registry.
    pub fn terminate_all(&mut self, grace: Duration) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        let pids: Vec<u32> = std::mem::take(&mut self.pids).into_iter().collect();
        if pids.is_empty() {
            return;
        }
        info!("Stopping {} running tool process(es)", pids.len());

        for &pid in &pids {
            signal_group_or_pid(pid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                debug!("All tool processes exited after SIGTERM");
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in pids.iter().filter(|&&pid| is_process_alive(pid)) {
            warn!("Tool process {} ignored SIGTERM, killing it", pid);
            signal_group_or_pid(pid, Signal::SIGKILL);
        }
    }
}

/// Signal the whole group (negative PID), falling back to the process alone
fn signal_group_or_pid(pid: u32, sig: Signal) {
    let group = Pid::from_raw(-(pid as i32));
    if let Err(e) = signal::kill(group, sig) {
        debug!("{} to group {} failed ({}), signalling the process", sig, pid, e);
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
            warn!("Could not send {} to {}: {}", sig, pid, e);
        }
    }
}

/// Alive means signalable and not a zombie
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // third field is the state letter
        Ok(stat) => !matches!(stat.split_whitespace().nth(2), Some("Z" | "X")),
        Err(_) => true,
    }
}

/// Terminates every tracked tool when dropped. Held by `main` for the whole run.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(Duration::from_secs(5));
        }
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handlers that stop running tools and exit
/// with `128 + signal`. Call once, early in `main`.
pub fn init_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            warn!("Interrupted by signal {}, stopping tools", sig);
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Run a [`std::process::Command`] as leader of a new process group that dies with us
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls (setpgid, prctl) run between fork and exec
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}
