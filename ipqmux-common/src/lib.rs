mod queue;
pub use queue::{MessageQueue, OverflowPolicy, QueueLimit};

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u32 = 1024;
    pub const MiB: u32 = 1024 * KiB;
}
