use crate::page_table::PAGE_SIZE;

/// Tunables for a [`Vm`](crate::Vm) instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of physical frames in the user pool.
    pub user_pool_frames: usize,
    /// Number of page-sized slots on the swap device.
    pub swap_slots: usize,
    /// Maximum size of a user stack in bytes.
    pub stack_limit: usize,
    /// How far below the saved stack pointer an access may fault and still grow the stack.
    pub stack_slack: usize,
}

impl VmConfig {
    /// Size in bytes the swap device must have.
    pub fn swap_bytes(&self) -> usize {
        self.swap_slots * PAGE_SIZE
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_pool_frames: 64,
            swap_slots: 256,
            stack_limit: 1 << 20,
            stack_slack: 8,
        }
    }
}
