//! Static configuration mechanism for the kernel
use core::marker::PhantomData;

use crate::{Kernel, Port};

/// The number of cores the kernel schedules.
pub const NUM_CORES: usize = 2;

/// The capacity of each core's task table.
pub const MAX_TASKS_PER_CORE: usize = 32;

/// The capacity of each core's event table.
pub const MAX_EVENTS_PER_CORE: usize = 8;

/// The capacity of each core's control channel, which carries the requests
/// other cores make on the core's kernel objects.
pub const CONTROL_CHANNEL_LEN: usize = 4 * MAX_TASKS_PER_CORE;

/// The default interval between two calls to [`Kernel::tick`], in
/// microseconds.
pub const DEFAULT_TICK_PERIOD_US: u64 = 10_000;

/// The number of task priority levels. Valid priorities are
/// `0..NUM_PRIORITY_LEVELS`.
pub const NUM_PRIORITY_LEVELS: usize = 32;

/// Task priority. A larger value means a higher priority.
pub type Priority = u8;

/// Kernel configuration produced by [`KernelBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelCfg {
    tick_period_us: u64,
}

impl KernelCfg {
    pub const DEFAULT: Self = Self {
        tick_period_us: DEFAULT_TICK_PERIOD_US,
    };

    /// Get the interval at which the port is expected to call
    /// [`Kernel::tick`].
    pub const fn tick_period_us(&self) -> u64 {
        self.tick_period_us
    }
}

impl Default for KernelCfg {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The builder type for [`Kernel`]. Created by [`Kernel::build`].
#[must_use = "must call `finish()` to complete the construction"]
pub struct KernelBuilder<P> {
    cfg: KernelCfg,
    _phantom: PhantomData<fn() -> P>,
}

impl<P: Port> KernelBuilder<P> {
    pub(crate) const fn new() -> Self {
        Self {
            cfg: KernelCfg::DEFAULT,
            _phantom: PhantomData,
        }
    }

    /// Specify the tick period. Defaults to [`DEFAULT_TICK_PERIOD_US`].
    pub fn tick_period_us(self, tick_period_us: u64) -> Self {
        assert!(tick_period_us > 0, "tick period must be non-zero");
        Self {
            cfg: KernelCfg { tick_period_us },
            _phantom: PhantomData,
        }
    }

    /// Complete the construction of a kernel driven by `port`.
    pub fn finish(self, port: P) -> Kernel<P> {
        Kernel::with_cfg(port, self.cfg)
    }
}
