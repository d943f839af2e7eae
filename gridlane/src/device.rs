/// Byte order of device memory, kernel argument blobs are written in it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Immutable description of one accelerator.
///
/// Created once when the backend enumerates its devices and shared read only
/// by every stream and scheduler of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Index of the device within its backend
    pub index: usize,
    /// Ordinal of the device in the native driver, differs from `index` when devices are filtered
    pub ordinal: u32,
    pub name: String,
    pub byte_order: ByteOrder,
    /// Maximum number of threads in one block
    pub max_threads_per_block: u32,
    /// Maximum block extent per dimension
    pub max_block_extents: [u32; 3],
    /// Maximum grid extent per dimension
    pub max_grid_extents: [u32; 3],
    /// Total device memory in bytes
    pub total_memory: u64,
}

impl Device {
    /// Number of bytes of one pointer sized kernel argument slot
    pub const ARG_SLOT_BYTES: usize = 8;
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("[{}] {}", self.index, self.name))
    }
}
