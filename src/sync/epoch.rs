/*
 * Created on Sun Jul 26 2026
*/

//! The epoch reclaimer: a singly-linked chain of epoch
//! descriptors, oldest to newest. A background task periodically
//! appends a new "current" epoch and reclaims every older epoch that
//! has drained. `retire` always targets the current epoch at call
//! time, which is always >= the epoch a live `Guard` joined, so no
//! reader of a retired object can have already left.

use {
    super::stack::Stack,
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, AtomicI64, Ordering},
            Arc,
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// Large enough that no plausible number of concurrent joiners could
/// push a sealed counter back above zero before the seal is observed.
const SEAL_SENTINEL: i64 = -(1i64 << 31);

struct EpochDescriptor {
    // every join/leave on every thread touches this counter; cache-line
    // isolation keeps that traffic from bouncing the `garbage` stack's
    // head pointer out of other cores' caches.
    active: crate::mem::CachePadded<AtomicI64>,
    garbage: Stack<Box<dyn FnOnce() + Send>>,
}

impl EpochDescriptor {
    fn new() -> Self {
        Self {
            active: crate::mem::CachePadded::new(AtomicI64::new(0)),
            garbage: Stack::new(),
        }
    }

    /// Attempts to seal this epoch: succeeds only if the counter is
    /// currently exactly zero, transitioning it atomically to a large
    /// negative sentinel so any racing `join` is forced to retry.
    fn try_seal(&self) -> bool {
        self.active
            .compare_exchange(0, SEAL_SENTINEL, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn drain(&self) {
        let g = unsafe {
            // the owning chain has already unlinked this descriptor and
            // sealed it, so nothing else can be pushing garbage here
            crossbeam_epoch::unprotected()
        };
        while let Some(f) = self.garbage.pop(g) {
            f();
        }
    }
}

/// A handle proving the holder's thread has joined some epoch. Dropping
/// it leaves that epoch (not necessarily the current one).
pub struct Guard {
    epoch: Arc<EpochDescriptor>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.epoch.active.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Chain {
    descriptors: VecDeque<Arc<EpochDescriptor>>,
}

/// The epoch chain plus its background rollover task. One instance is
/// owned by each tree/list root.
pub(crate) struct EpochReclaimer {
    chain: Arc<Mutex<Chain>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl EpochReclaimer {
    pub(crate) fn new(interval: Duration) -> Self {
        let chain = Arc::new(Mutex::new(Chain {
            descriptors: VecDeque::from([Arc::new(EpochDescriptor::new())]),
        }));
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = {
            let chain = chain.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("epoch-reclaimer".into())
                .spawn(move || {
                    log::debug!("epoch reclaimer started, interval={:?}", interval);
                    while !shutdown.load(Ordering::Acquire) {
                        thread::sleep(interval);
                        Self::rollover_and_gc(&chain);
                    }
                    log::debug!("epoch reclaimer shutting down");
                })
                .expect("failed to spawn epoch-reclaimer thread")
        };
        Self {
            chain,
            shutdown,
            worker: Some(worker),
        }
    }

    fn rollover_and_gc(chain: &Mutex<Chain>) {
        let mut c = chain.lock();
        c.descriptors.push_back(Arc::new(EpochDescriptor::new()));
        log::trace!("epoch rollover, depth={}", c.descriptors.len());
        while c.descriptors.len() > 1 {
            let oldest = c.descriptors.front().unwrap().clone();
            if oldest.try_seal() {
                oldest.drain();
                c.descriptors.pop_front();
            } else {
                break;
            }
        }
    }

    /// Join the current epoch. Retries if a concurrent rollover sealed
    /// the epoch this thread observed between reading and joining it.
    pub(crate) fn join(&self) -> Guard {
        loop {
            let current = self.chain.lock().descriptors.back().unwrap().clone();
            let observed = current.active.fetch_add(1, Ordering::AcqRel) + 1;
            if observed > 0 {
                return Guard { epoch: current };
            }
            // raced a seal; undo and retry against a fresh current
            current.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Defers `f` (typically a closure that frees a retired record or
    /// recycles a NodeID) until the current epoch has fully drained.
    pub(crate) fn retire<F: FnOnce() + Send + 'static>(&self, f: F) {
        let current = self.chain.lock().descriptors.back().unwrap().clone();
        let g = unsafe { crossbeam_epoch::unprotected() };
        current.garbage.push(Box::new(f), g);
    }

    /// Manual GC trigger for a worker under memory pressure, without
    /// waiting for the background task's next wakeup.
    pub(crate) fn perform_gc(&self) {
        Self::rollover_and_gc(&self.chain);
    }

    pub(crate) fn need_gc(&self) -> bool {
        self.chain.lock().descriptors.len() > 2
    }
}

impl Drop for EpochReclaimer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(h) = self.worker.take() {
            // wake a thread possibly mid-sleep by just waiting it out;
            // there's no cross-thread wake primitive here, so shutdown
            // latency is bounded by the configured interval
            if let Err(e) = h.join() {
                log::error!("epoch reclaimer thread panicked: {:?}", e);
            }
        }
        // drain whatever remains unconditionally; at this point no
        // other thread can hold a Guard because the tree is being
        // dropped, so this is safe even for epochs that never sealed
        let mut c = self.chain.lock();
        while let Some(d) = c.descriptors.pop_front() {
            d.drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_leave() {
        let r = EpochReclaimer::new(Duration::from_millis(5));
        let g1 = r.join();
        let g2 = r.join();
        drop(g1);
        drop(g2);
    }

    #[test]
    fn retire_runs_eventually() {
        use std::sync::atomic::AtomicBool as AB;
        let r = EpochReclaimer::new(Duration::from_millis(2));
        let ran = Arc::new(AB::new(false));
        {
            let g = r.join();
            let ran2 = ran.clone();
            r.retire(move || ran2.store(true, Ordering::SeqCst));
            drop(g);
        }
        // give the background rollover several chances to seal+drain
        for _ in 0..50 {
            if ran.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(ran.load(Ordering::SeqCst));
    }
}
