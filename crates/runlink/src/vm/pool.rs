//! Size-partitioned pool of call frames
//!
//! Small fixed-arity calls draw from one partition, large or variadic calls
//! from the other. Each acquired [`Frame`] is exclusively owned by one call
//! and goes back to its partition, reset, when dropped.

use super::{Backend, CallVm};
use runlink_config::Config;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Frame bytes reserved per argument
pub const ARG_SLOT_BYTES: usize = 8;

struct Partition {
    capacity: usize,
    max_idle: usize,
    idle: Mutex<Vec<Box<dyn CallVm>>>,
}

impl Partition {
    fn new(capacity: usize, max_idle: usize) -> Self {
        Self {
            capacity,
            max_idle,
            idle: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Box<dyn CallVm>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct FramePool {
    backend: Arc<dyn Backend>,
    small: Partition,
    large: Partition,
}

impl FramePool {
    pub fn new(
        backend: Arc<dyn Backend>,
        small_bytes: usize,
        large_bytes: usize,
        max_idle: usize,
    ) -> Self {
        Self {
            backend,
            small: Partition::new(small_bytes, max_idle),
            large: Partition::new(large_bytes.max(small_bytes), max_idle),
        }
    }

    pub fn from_config(backend: Arc<dyn Backend>, config: &Config) -> Self {
        Self::new(
            backend,
            config.small_frame_bytes(),
            config.large_frame_bytes(),
            config.max_idle_frames(),
        )
    }

    /// Bytes needed to push `args` arguments
    pub fn frame_bytes(args: usize) -> usize {
        args * ARG_SLOT_BYTES
    }

    /// Take a frame able to hold `arg_bytes` bytes of arguments
    ///
    /// Requests larger than the large partition get a one-off frame that is
    /// dropped instead of pooled.
    pub fn acquire(&self, arg_bytes: usize, variadic: bool) -> Frame<'_> {
        let home = if !variadic && arg_bytes <= self.small.capacity {
            Some(&self.small)
        } else if arg_bytes <= self.large.capacity {
            Some(&self.large)
        } else {
            None
        };

        let vm = match home {
            Some(partition) => partition
                .lock()
                .pop()
                .unwrap_or_else(|| self.backend.new_vm(partition.capacity)),
            None => {
                trace!(arg_bytes, "allocating oversize call frame");
                self.backend.new_vm(arg_bytes)
            }
        };

        Frame {
            vm: Some(vm),
            home,
        }
    }

    pub fn idle_small(&self) -> usize {
        self.small.lock().len()
    }

    pub fn idle_large(&self) -> usize {
        self.large.lock().len()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("small_bytes", &self.small.capacity)
            .field("large_bytes", &self.large.capacity)
            .field("max_idle", &self.small.max_idle)
            .finish()
    }
}

/// A call frame borrowed from a [`FramePool`]
pub struct Frame<'p> {
    vm: Option<Box<dyn CallVm>>,
    home: Option<&'p Partition>,
}

impl Deref for Frame<'_> {
    type Target = dyn CallVm;

    fn deref(&self) -> &Self::Target {
        match &self.vm {
            Some(vm) => vm.as_ref(),
            None => crate::contract_violation("call frame used after release"),
        }
    }
}

impl DerefMut for Frame<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.vm {
            Some(vm) => vm.as_mut(),
            None => crate::contract_violation("call frame used after release"),
        }
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        let (Some(mut vm), Some(home)) = (self.vm.take(), self.home) else {
            return;
        };
        vm.reset();
        let mut idle = home.lock();
        if idle.len() < home.max_idle {
            idle.push(vm);
        }
    }
}
