//! Real-time posture: scheduling class, memory locking, and IRQ threads.
//!
//! Provides the startup-only platform setup for a low-jitter measurement loop:
//! - SCHED_FIFO/SCHED_RR for the calling thread
//! - Memory locking (mlockall) and stack pre-faulting
//! - CPU affinity
//! - Elevation of threaded interrupt handlers (`irq/<n>-<name>`) found by a
//!   `/proc` scan
//!
//! Every step is best-effort. Failures come back as
//! [`RttError::SchedulingDegradation`] and the caller decides whether to
//! continue.

#![allow(unsafe_code)] // sched_* syscalls

use rtt_common::{CpuAffinity, RealtimeConfig, RttError, RttResult, SchedPolicy};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Scheduling and memory posture applied at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RtPosture {
    /// Scheduler policy.
    pub policy: SchedPolicy,
    /// Static priority (ignored for `Other`).
    pub priority: u8,
    /// Lock current and future pages.
    pub lock_memory: bool,
}

impl RtPosture {
    /// Posture described by the `[realtime]` section.
    #[must_use]
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            policy: config.policy,
            priority: config.priority,
            lock_memory: config.lock_memory,
        }
    }

    /// Priority the kernel will report once the policy is applied.
    #[must_use]
    pub fn effective_priority(&self) -> u8 {
        if self.policy.is_realtime() {
            self.priority.clamp(1, 99)
        } else {
            0
        }
    }
}

/// Scheduler access, per thread id (0 is the calling thread).
pub trait SchedOps {
    /// Current policy and priority of `tid`.
    ///
    /// # Errors
    ///
    /// `SchedulingDegradation` if the thread cannot be queried.
    fn get(&self, tid: i32) -> RttResult<(SchedPolicy, u8)>;

    /// Apply a policy and priority to `tid`.
    ///
    /// # Errors
    ///
    /// `SchedulingDegradation` if the kernel refuses.
    fn set(&self, tid: i32, policy: SchedPolicy, priority: u8) -> RttResult<()>;
}

/// Kernel scheduler via `sched_getscheduler`/`sched_setscheduler`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxSched;

#[cfg(target_os = "linux")]
impl SchedOps for LinuxSched {
    fn get(&self, tid: i32) -> RttResult<(SchedPolicy, u8)> {
        // SAFETY: plain syscall on a pid value.
        let policy = unsafe { libc::sched_getscheduler(tid) };
        if policy == -1 {
            let err = std::io::Error::last_os_error();
            return Err(RttError::SchedulingDegradation(format!(
                "sched_getscheduler({tid}): {err}"
            )));
        }

        let mut param = libc::sched_param { sched_priority: 0 };
        // SAFETY: `param` is a valid out-pointer for the duration of the call.
        if unsafe { libc::sched_getparam(tid, &mut param) } == -1 {
            let err = std::io::Error::last_os_error();
            return Err(RttError::SchedulingDegradation(format!(
                "sched_getparam({tid}): {err}"
            )));
        }

        let policy = match policy {
            libc::SCHED_FIFO => SchedPolicy::Fifo,
            libc::SCHED_RR => SchedPolicy::Rr,
            _ => SchedPolicy::Other,
        };
        let priority = u8::try_from(param.sched_priority).unwrap_or(0);
        Ok((policy, priority))
    }

    fn set(&self, tid: i32, policy: SchedPolicy, priority: u8) -> RttResult<()> {
        let linux_policy = match policy {
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::Rr => libc::SCHED_RR,
            SchedPolicy::Other => libc::SCHED_OTHER,
        };
        let param = libc::sched_param {
            sched_priority: i32::from(priority),
        };

        // SAFETY: `param` outlives the call and the policy is a valid constant.
        if unsafe { libc::sched_setscheduler(tid, linux_policy, &param) } == -1 {
            let err = std::io::Error::last_os_error();
            let hint = if err.raw_os_error() == Some(libc::EPERM) {
                " (needs CAP_SYS_NICE or RLIMIT_RTPRIO)"
            } else {
                ""
            };
            return Err(RttError::SchedulingDegradation(format!(
                "sched_setscheduler({tid}, {policy:?}, {priority}): {err}{hint}"
            )));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl SchedOps for LinuxSched {
    fn get(&self, _tid: i32) -> RttResult<(SchedPolicy, u8)> {
        Ok((SchedPolicy::Other, 0))
    }

    fn set(&self, _tid: i32, policy: SchedPolicy, _priority: u8) -> RttResult<()> {
        Err(RttError::SchedulingDegradation(format!(
            "{policy:?} scheduling not available on this platform"
        )))
    }
}

/// Whether a scheduling change was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedChange {
    /// The thread was moved to the target posture.
    Applied,
    /// The thread was already at the target posture.
    Unchanged,
}

/// Apply the posture's scheduling to one thread unless it is already there.
///
/// # Errors
///
/// `SchedulingDegradation` if the query or the change fails.
pub fn apply_scheduling(ops: &dyn SchedOps, tid: i32, posture: &RtPosture) -> RttResult<SchedChange> {
    let target = (posture.policy, posture.effective_priority());
    if ops.get(tid)? == target {
        return Ok(SchedChange::Unchanged);
    }
    ops.set(tid, target.0, target.1)?;
    Ok(SchedChange::Applied)
}

/// Outcome of [`elevate_self`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostureStatus {
    /// Scheduling result for the calling thread.
    pub scheduling: SchedChange,
    /// Whether mlockall succeeded.
    pub memory_locked: bool,
}

/// Apply the posture to the calling thread and lock memory if requested.
///
/// Both steps are attempted even if the first fails.
///
/// # Errors
///
/// `SchedulingDegradation` naming every step that failed.
pub fn elevate_self(ops: &dyn SchedOps, posture: &RtPosture) -> RttResult<PostureStatus> {
    let mut failures = Vec::new();

    let scheduling = match apply_scheduling(ops, 0, posture) {
        Ok(change) => {
            info!(policy = ?posture.policy, priority = posture.effective_priority(), ?change, "scheduler posture");
            change
        }
        Err(e) => {
            failures.push(e.to_string());
            SchedChange::Unchanged
        }
    };

    let memory_locked = if posture.lock_memory {
        match lock_memory() {
            Ok(()) => true,
            Err(e) => {
                failures.push(e.to_string());
                false
            }
        }
    } else {
        false
    };

    if failures.is_empty() {
        Ok(PostureStatus {
            scheduling,
            memory_locked,
        })
    } else {
        Err(RttError::SchedulingDegradation(failures.join("; ")))
    }
}

/// Lock all current and future pages.
///
/// # Errors
///
/// `SchedulingDegradation` if mlockall fails.
#[cfg(target_os = "linux")]
pub fn lock_memory() -> RttResult<()> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    debug!("Locking memory pages with mlockall");
    mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE).map_err(|e| {
        let hint = if e == nix::errno::Errno::EPERM {
            " (needs CAP_IPC_LOCK or RLIMIT_MEMLOCK)"
        } else {
            ""
        };
        RttError::SchedulingDegradation(format!("mlockall: {e}{hint}"))
    })
}

/// Lock all current and future pages.
///
/// # Errors
///
/// Always `SchedulingDegradation` on this platform.
#[cfg(not(target_os = "linux"))]
pub fn lock_memory() -> RttResult<()> {
    Err(RttError::SchedulingDegradation(
        "mlockall not available on this platform".into(),
    ))
}

/// One task found under `/proc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Owning process id.
    pub pid: i32,
    /// Thread id.
    pub tid: i32,
    /// Command name from `comm`.
    pub comm: String,
}

/// Enumerates processes and their threads under a procfs root.
#[derive(Debug, Clone)]
pub struct ThreadTable {
    root: PathBuf,
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new("/proc")
    }
}

fn numeric_entries(dir: &Path) -> std::io::Result<Vec<i32>> {
    let mut ids: Vec<i32> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect();
    ids.sort_unstable();
    Ok(ids)
}

fn read_comm(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim_end_matches('\n').to_string())
}

impl ThreadTable {
    /// Table rooted at `root` (normally `/proc`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Every live task, deduplicated by thread id.
    ///
    /// Tasks that exit during the scan are skipped.
    ///
    /// # Errors
    ///
    /// `Io` if the root itself cannot be listed.
    pub fn scan(&self) -> RttResult<Vec<TaskInfo>> {
        let pids = numeric_entries(&self.root)
            .map_err(|e| RttError::Io(format!("{}: {e}", self.root.display())))?;

        let mut tasks = BTreeMap::new();
        for pid in pids {
            let proc_dir = self.root.join(pid.to_string());
            if let Some(comm) = read_comm(&proc_dir.join("comm")) {
                tasks.insert(pid, TaskInfo { pid, tid: pid, comm });
            }
            let Ok(tids) = numeric_entries(&proc_dir.join("task")) else {
                continue;
            };
            for tid in tids {
                if let Some(comm) = read_comm(&proc_dir.join("task").join(tid.to_string()).join("comm")) {
                    tasks.entry(tid).or_insert(TaskInfo { pid, tid, comm });
                }
            }
        }
        Ok(tasks.into_values().collect())
    }

    /// Thread ids of the threaded handlers for `irq`.
    ///
    /// # Errors
    ///
    /// Same as [`ThreadTable::scan`].
    pub fn irq_threads(&self, irq: u32) -> RttResult<Vec<TaskInfo>> {
        let prefix = format!("irq/{irq}-");
        Ok(self
            .scan()?
            .into_iter()
            .filter(|t| t.comm.starts_with(&prefix))
            .collect())
    }
}

/// Outcome of [`elevate_irq_thread`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IrqElevation {
    /// IRQ number.
    pub irq: u32,
    /// Threads moved to the posture.
    pub applied: Vec<i32>,
    /// Threads already at the posture.
    pub unchanged: Vec<i32>,
}

/// Apply the posture's scheduling to every `irq/<irq>-` thread.
///
/// Zero matches is not an error.
///
/// # Errors
///
/// `Io` if `/proc` cannot be listed, `SchedulingDegradation` if any matching
/// thread could not be changed (the others are still changed).
pub fn elevate_irq_thread(
    table: &ThreadTable,
    ops: &dyn SchedOps,
    irq: u32,
    posture: &RtPosture,
) -> RttResult<IrqElevation> {
    let threads = table.irq_threads(irq)?;
    let mut outcome = IrqElevation {
        irq,
        ..IrqElevation::default()
    };

    if threads.is_empty() {
        info!(irq, "no threaded handler found for IRQ");
        return Ok(outcome);
    }

    let mut failures = Vec::new();
    for task in threads {
        match apply_scheduling(ops, task.tid, posture) {
            Ok(SchedChange::Applied) => {
                info!(irq, tid = task.tid, comm = %task.comm, priority = posture.effective_priority(), "IRQ thread elevated");
                outcome.applied.push(task.tid);
            }
            Ok(SchedChange::Unchanged) => {
                debug!(irq, tid = task.tid, comm = %task.comm, "IRQ thread already at target posture");
                outcome.unchanged.push(task.tid);
            }
            Err(e) => failures.push(format!("{} ({}): {e}", task.comm, task.tid)),
        }
    }

    if failures.is_empty() {
        Ok(outcome)
    } else {
        Err(RttError::SchedulingDegradation(failures.join("; ")))
    }
}

/// Pin the calling thread to the configured CPUs.
///
/// # Errors
///
/// `SchedulingDegradation` if the set is invalid or refused.
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(affinity: &CpuAffinity) -> RttResult<Option<Vec<usize>>> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpus = match affinity {
        CpuAffinity::None => return Ok(None),
        CpuAffinity::Single(cpu) => vec![*cpu],
        CpuAffinity::Set(cpus) if cpus.is_empty() => return Ok(None),
        CpuAffinity::Set(cpus) => cpus.clone(),
    };

    let mut cpu_set = CpuSet::new();
    for &cpu in &cpus {
        cpu_set
            .set(cpu)
            .map_err(|e| RttError::SchedulingDegradation(format!("invalid CPU index {cpu}: {e}")))?;
    }
    sched_setaffinity(Pid::from_raw(0), &cpu_set)
        .map_err(|e| RttError::SchedulingDegradation(format!("sched_setaffinity {cpus:?}: {e}")))?;
    info!(?cpus, "CPU affinity set");
    Ok(Some(cpus))
}

/// Pin the calling thread to the configured CPUs.
///
/// # Errors
///
/// `SchedulingDegradation` for any affinity request on this platform.
#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(affinity: &CpuAffinity) -> RttResult<Option<Vec<usize>>> {
    match affinity {
        CpuAffinity::None => Ok(None),
        _ => Err(RttError::SchedulingDegradation(
            "CPU affinity not available on this platform".into(),
        )),
    }
}

/// Touch `size` bytes of stack so later frames do not page-fault.
pub fn prefault_stack(size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    let faulted = prefault_frames(size, 0);
    debug!(faulted, "stack pre-faulted");
    faulted
}

#[inline(never)]
fn prefault_frames(remaining: usize, depth: usize) -> usize {
    const FRAME_SIZE: usize = 4096;
    const MAX_DEPTH: usize = 1024;

    if remaining < FRAME_SIZE || depth >= MAX_DEPTH {
        return 0;
    }
    let mut frame = [0u8; FRAME_SIZE];
    frame[0] = 0xAA;
    frame[FRAME_SIZE - 1] = 0x55;
    std::hint::black_box(&mut frame);
    FRAME_SIZE + prefault_frames(remaining - FRAME_SIZE, depth + 1)
}

/// Process privileges relevant to the posture.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RtCapabilities {
    /// Effective uid is 0.
    pub is_root: bool,
    /// Soft RLIMIT_RTPRIO.
    pub rtprio_limit: Option<u64>,
    /// Soft RLIMIT_MEMLOCK.
    pub memlock_limit: Option<u64>,
    /// `/proc/version` mentions PREEMPT_RT.
    pub preempt_rt: bool,
}

impl RtCapabilities {
    /// Whether a real-time policy is likely to be accepted.
    #[must_use]
    pub fn can_use_rt_scheduling(&self) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l > 0)
    }

    /// Whether mlockall is likely to succeed.
    #[must_use]
    pub fn can_lock_memory(&self) -> bool {
        self.is_root || self.memlock_limit == Some(u64::MAX)
    }
}

/// Probe the current process.
#[cfg(target_os = "linux")]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    use nix::sys::resource::{getrlimit, Resource};

    let limit = |r| {
        getrlimit(r)
            .ok()
            .map(|(soft, _)| if soft == libc::RLIM_INFINITY { u64::MAX } else { soft })
    };

    RtCapabilities {
        is_root: nix::unistd::geteuid().is_root(),
        rtprio_limit: limit(Resource::RLIMIT_RTPRIO),
        memlock_limit: limit(Resource::RLIMIT_MEMLOCK),
        preempt_rt: fs::read_to_string("/proc/version")
            .map(|v| v.contains("PREEMPT_RT") || v.contains("PREEMPT RT"))
            .unwrap_or(false),
    }
}

/// Probe the current process.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}

/// Refuse to start when the configured posture cannot be obtained.
///
/// # Errors
///
/// `SchedulingDegradation` listing every missing privilege.
pub fn validate_rt_capabilities(config: &RealtimeConfig, caps: &RtCapabilities) -> RttResult<()> {
    if !config.enabled {
        return Ok(());
    }

    if !caps.preempt_rt {
        warn!("PREEMPT_RT kernel not detected; latency tails will be longer");
    }

    let mut issues = Vec::new();
    if config.policy.is_realtime() && !caps.can_use_rt_scheduling() {
        issues.push(format!(
            "cannot use {:?} scheduling: RLIMIT_RTPRIO={:?}, root={}",
            config.policy, caps.rtprio_limit, caps.is_root
        ));
    }
    if config.lock_memory && !caps.can_lock_memory() {
        issues.push(format!(
            "cannot lock memory: RLIMIT_MEMLOCK={:?}, root={}",
            caps.memlock_limit, caps.is_root
        ));
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(RttError::SchedulingDegradation(issues.join("; ")))
    }
}

/// Everything [`init_realtime`] did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RealtimeReport {
    /// Calling-thread posture, if it was applied cleanly.
    pub posture: Option<PostureStatus>,
    /// CPUs the thread is pinned to.
    pub cpu_affinity: Option<Vec<usize>>,
    /// Stack bytes pre-faulted.
    pub stack_prefaulted: usize,
    /// Per-IRQ results.
    pub irq_threads: Vec<IrqElevation>,
    /// Degradations that were logged and absorbed.
    pub degradations: Vec<String>,
}

/// Apply the `[realtime]` section to the calling thread and IRQ threads.
///
/// # Errors
///
/// With `fail_fast`, the capability probe or the first failed step.
/// Without it every failure is logged and recorded in the report.
pub fn init_realtime(
    config: &RealtimeConfig,
    ops: &dyn SchedOps,
    table: &ThreadTable,
) -> RttResult<RealtimeReport> {
    let mut report = RealtimeReport::default();
    if !config.enabled {
        info!("Real-time posture disabled in configuration");
        return Ok(report);
    }

    if config.fail_fast {
        validate_rt_capabilities(config, &check_rt_capabilities())?;
    }

    let absorb = |report: &mut RealtimeReport, e: RttError| -> RttResult<()> {
        if config.fail_fast {
            error!(error = %e, "real-time posture failed (fail_fast)");
            return Err(e);
        }
        warn!(error = %e, "continuing with degraded real-time posture");
        report.degradations.push(e.to_string());
        Ok(())
    };

    match set_cpu_affinity(&config.cpu_affinity) {
        Ok(cpus) => report.cpu_affinity = cpus,
        Err(e) => absorb(&mut report, e)?,
    }

    report.stack_prefaulted = prefault_stack(config.prefault_stack_size);

    let posture = RtPosture::from_config(config);
    match elevate_self(ops, &posture) {
        Ok(status) => report.posture = Some(status),
        Err(e) => absorb(&mut report, e)?,
    }

    for &irq in &config.irq_threads {
        match elevate_irq_thread(table, ops, irq, &posture) {
            Ok(outcome) => report.irq_threads.push(outcome),
            Err(e) => absorb(&mut report, e)?,
        }
    }

    info!(
        degraded = report.degradations.len(),
        irqs = report.irq_threads.len(),
        "Real-time initialization complete"
    );
    Ok(report)
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// In-memory scheduler that records every change.
    #[derive(Debug, Default)]
    pub struct FakeSched {
        pub state: RefCell<HashMap<i32, (SchedPolicy, u8)>>,
        pub sets: RefCell<Vec<(i32, SchedPolicy, u8)>>,
        pub refuse: Vec<i32>,
    }

    impl SchedOps for FakeSched {
        fn get(&self, tid: i32) -> RttResult<(SchedPolicy, u8)> {
            Ok(self
                .state
                .borrow()
                .get(&tid)
                .copied()
                .unwrap_or((SchedPolicy::Other, 0)))
        }

        fn set(&self, tid: i32, policy: SchedPolicy, priority: u8) -> RttResult<()> {
            if self.refuse.contains(&tid) {
                return Err(RttError::SchedulingDegradation(format!("EPERM for {tid}")));
            }
            self.sets.borrow_mut().push((tid, policy, priority));
            self.state.borrow_mut().insert(tid, (policy, priority));
            Ok(())
        }
    }
}
