mod heap;
mod system;

pub use heap::{
    AllocError, CollectionStats, Heap, HeapCounters, HeapSettings,
};
pub use system::{OS_PAGE_SIZE, map_memory, unmap_memory};
