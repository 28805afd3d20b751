//! Starting and stopping the set of per-core runtimes.

use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use crate::runtime::{CoreId, PumpFn, Runtime, Shared};
use crate::work::WorkItem;

pub struct RuntimeOptions {
    /// Number of runtimes to start.
    pub ncores: usize,
    /// Worker pool cap per runtime.
    pub nworkers_max: u32,
    /// CPU indices to pin runtimes to, one per runtime. `None` leaves
    /// placement to the OS.
    pub affinity: Option<Vec<usize>>,
    /// Event pump for the primary runtime's dealer. Secondary dealers park
    /// on their condvar instead.
    pub primary_pump: Option<PumpFn>,
    /// Wakeup hook for the primary runtime (the event-loop waker).
    pub primary_notify: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            ncores: 1,
            nworkers_max: 256,
            affinity: None,
            primary_pump: None,
            primary_notify: None,
        }
    }
}

/// A started set of runtimes. Dropping the group stops and joins them.
pub struct RuntimeGroup {
    shareds: Vec<Arc<Shared>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl RuntimeGroup {
    pub fn start(options: RuntimeOptions) -> std::io::Result<Self> {
        assert!(options.ncores > 0, "at least one runtime required");
        let RuntimeOptions {
            ncores,
            nworkers_max,
            affinity,
            mut primary_pump,
            primary_notify,
        } = options;

        let shareds: Vec<Arc<Shared>> = (0..ncores).map(Shared::new).collect();
        if let Some(hook) = primary_notify {
            shareds[0].set_notify_hook(hook);
        }

        info!(ncores, nworkers_max, "starting runtimes");

        let mut threads = Vec::with_capacity(ncores);
        for core in 0..ncores {
            let shared = Arc::clone(&shareds[core]);
            let peers = shareds.clone();
            let pump = if core == 0 { primary_pump.take() } else { None };
            let cpu = affinity.as_ref().map(|set| set[core % set.len()]);

            let handle = thread::Builder::new()
                .name(format!("core {core}"))
                .spawn(move || {
                    if let Some(cpu) = cpu {
                        pin_cpu(cpu);
                    }
                    let rt = Runtime::new(shared, peers, nworkers_max, pump);
                    rt.enter();
                    rt.run();
                    rt.leave();
                })?;
            threads.push(handle);
        }

        Ok(Self { shareds, threads })
    }

    pub fn ncores(&self) -> usize {
        self.shareds.len()
    }

    pub fn shared(&self, core: CoreId) -> &Arc<Shared> {
        &self.shareds[core]
    }

    /// Post a work item to a runtime from outside the runtime set.
    pub fn post(&self, core: CoreId, work: WorkItem) {
        self.shareds[core].post(work);
    }

    /// Request every runtime to stop and join the threads.
    pub fn stop(&mut self) {
        for shared in &self.shareds {
            shared.request_stop();
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("runtime thread panicked");
            }
        }
    }
}

impl Drop for RuntimeGroup {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pin the calling thread to one CPU.
#[cfg(target_os = "linux")]
fn pin_cpu(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu % libc::CPU_SETSIZE as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!(cpu, "failed to pin runtime thread");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_cpu(_cpu: usize) {}
