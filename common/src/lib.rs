pub mod dma;

/// Page size assumed for DMA-capable allocations. Device-facing buffers are
/// padded to this granularity so partial cache lines never straddle an
/// allocation boundary.
pub const PAGE_SIZE: usize = 4096;
