//! Content-addressed storage constants.

/// Maximum size of a stored block.
pub const BLOCK_SIZE: usize = 64 << 20;

/// Locator of the empty block.
pub const EMPTY_BLOCK_LOCATOR: &str = "d41d8cd98f00b204e9800998ecf8427e+0";

/// Default replication requested for new blocks.
pub const DEFAULT_REPLICAS: u32 = 2;
