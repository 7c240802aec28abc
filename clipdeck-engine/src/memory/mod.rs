//! Buffer accounting, pooling and tiered cleanup

pub mod manager;
pub mod pool;

pub use manager::{
    AllocationId, BufferAllocation, CleanupReport, CleanupStrategy, DeallocateOptions,
    EvictedAllocation, MemoryManager, MemoryPressure, MemoryStats,
};
pub use pool::BufferPool;
