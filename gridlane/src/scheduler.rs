//! Kernel launch geometry.
//!
//! Splits N dimensional global work into blocks and a grid that respect the
//! thread limits of the device and of the kernel, preferring block sizes that
//! divide the global work evenly.

use crate::{
    context::{LaunchDescriptor, LaunchDimensions},
    device::Device,
    error::RuntimeError,
};

#[derive(Debug, Clone)]
pub struct Scheduler {
    device_name: String,
    max_threads_per_block: u32,
    max_block_extents: [u32; 3],
    max_grid_extents: [u32; 3],
}

/// Largest block size not above `max_block_size` that divides `global_work`.
///
/// If the limit equals the global work it is quartered first, so small kernels
/// still get more than one block.
pub fn calculate_block_size(max_block_size: u32, global_work: u64) -> u32 {
    let mut max = u64::from(max_block_size);
    if max == global_work {
        max /= 4;
    }
    let mut candidate = max.min(global_work);
    if candidate == 0 {
        return 1;
    }
    while global_work % candidate != 0 {
        candidate -= 1;
    }
    // candidate <= max_block_size
    candidate as u32
}

fn scheduling_failure(kernel: &str, reason: String) -> RuntimeError {
    log::warn!("Failed to schedule {kernel}: {reason}, using the default dimensions [1, 1, 1]");
    RuntimeError::scheduling(format!("{kernel}: {reason}"))
}

impl Scheduler {
    pub fn new(device: &Device) -> Scheduler {
        Scheduler {
            device_name: device.name.clone(),
            max_threads_per_block: device.max_threads_per_block,
            max_block_extents: device.max_block_extents,
            max_grid_extents: device.max_grid_extents,
        }
    }

    /// Per dimension thread limit, the floor of the `dimensions`th root of `max_threads`
    pub fn effective_max_block_size(max_threads: u32, dimensions: usize) -> u32 {
        (f64::from(max_threads).powf(1.0 / dimensions as f64)).floor() as u32
    }

    pub fn calculate_block_dimension(
        &self,
        global_work: &[u64],
        max_threads: u32,
        dimensions: usize,
        kernel: &str,
    ) -> Result<[u32; 3], RuntimeError> {
        if dimensions == 0 || dimensions > 3 {
            return Err(scheduling_failure(kernel, format!("unsupported dimension count {dimensions}")));
        }
        if global_work.len() < dimensions {
            return Err(scheduling_failure(
                kernel,
                format!("{dimensions} dimensions but only {} global work entries", global_work.len()),
            ));
        }
        if max_threads == 0 {
            return Err(scheduling_failure(kernel, "zero max threads".into()));
        }
        let effective_max = Self::effective_max_block_size(max_threads, dimensions);
        let mut block = [1; 3];
        for i in 0..dimensions {
            block[i] = calculate_block_size(effective_max.min(self.max_block_extents[i]), global_work[i]);
        }
        Ok(block)
    }

    pub fn calculate_grid_dimension(
        &self,
        kernel: &str,
        dimensions: usize,
        global_work: &[u64],
        block: [u32; 3],
    ) -> Result<[u32; 3], RuntimeError> {
        if dimensions == 0 || dimensions > 3 {
            return Err(scheduling_failure(kernel, format!("unsupported dimension count {dimensions}")));
        }
        if global_work.len() < dimensions {
            return Err(scheduling_failure(
                kernel,
                format!("{dimensions} dimensions but only {} global work entries", global_work.len()),
            ));
        }
        let mut grid = [1; 3];
        for i in 0..dimensions {
            if block[i] == 0 {
                return Err(scheduling_failure(kernel, format!("zero block extent in {block:?}")));
            }
            let blocks = global_work[i].div_ceil(u64::from(block[i]));
            grid[i] = blocks.clamp(1, u64::from(self.max_grid_extents[i])) as u32;
        }
        Ok(grid)
    }

    /// Checks a user defined local size against device and kernel limits
    pub fn check_local_work(&self, local_work: &[u64], global_work: &[u64], dimensions: usize, max_threads: u32) -> bool {
        if dimensions == 0 || dimensions > 3 || local_work.len() < dimensions || global_work.len() < dimensions {
            return false;
        }
        let mut threads: u64 = 1;
        for i in 0..dimensions {
            let local = local_work[i];
            if local == 0 || local > u64::from(self.max_block_extents[i]) {
                return false;
            }
            if global_work[i].div_ceil(local) > u64::from(self.max_grid_extents[i]) {
                return false;
            }
            threads *= local;
        }
        threads <= u64::from(max_threads)
    }

    /// Block and grid for one launch.
    ///
    /// `kernel_max_threads` is the occupancy limit of the kernel, it is capped by
    /// the device limit.
    pub fn launch_dimensions(
        &self,
        descriptor: &LaunchDescriptor,
        kernel_max_threads: u32,
    ) -> Result<LaunchDimensions, RuntimeError> {
        if !descriptor.parallel {
            return Ok(LaunchDimensions { block: [1; 3], grid: [1; 3] });
        }
        let kernel = descriptor.kernel_name.as_str();
        let dimensions = descriptor.dimensions;
        let max_threads = kernel_max_threads.min(self.max_threads_per_block);
        let global_work: Vec<u64> = if descriptor.batch_threads > 0 {
            vec![descriptor.batch_threads; dimensions.max(descriptor.global_work.len())]
        } else {
            descriptor.global_work.clone()
        };

        let (block, local_honored) = match &descriptor.local_work {
            Some(local) if self.check_local_work(local, &global_work, dimensions, max_threads) => {
                let mut block = [1; 3];
                for (b, &l) in block.iter_mut().zip(&local[..dimensions]) {
                    // Bounded by max_block_extents in check_local_work
                    *b = l as u32;
                }
                (block, true)
            }
            Some(_) => {
                let block = self.calculate_block_dimension(&global_work, max_threads, dimensions, kernel)?;
                log::warn!(
                    "{kernel} on {}: changed the user-defined local size to the following: [{}, {}, {}].",
                    self.device_name,
                    block[0],
                    block[1],
                    block[2]
                );
                (block, false)
            }
            None => (self.calculate_block_dimension(&global_work, max_threads, dimensions, kernel)?, false),
        };

        // A grid override only makes sense for the block size it was chosen with
        let grid = match descriptor.grid_override {
            Some(grid)
                if local_honored
                    && grid.iter().zip(&self.max_grid_extents).all(|(&g, &max)| g > 0 && g <= max) =>
            {
                grid
            }
            _ => self.calculate_grid_dimension(kernel, dimensions, &global_work, block)?,
        };
        Ok(LaunchDimensions { block, grid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::ByteOrder, error::BailoutKind};
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn scheduler() -> Scheduler {
        Scheduler::new(&Device {
            index: 0,
            ordinal: 0,
            name: "test".into(),
            byte_order: ByteOrder::LittleEndian,
            max_threads_per_block: 1024,
            max_block_extents: [1024, 1024, 64],
            max_grid_extents: [i32::MAX as u32, 65535, 65535],
            total_memory: 1 << 30,
        })
    }

    fn descriptor(global_work: Vec<u64>) -> LaunchDescriptor {
        LaunchDescriptor {
            kernel_name: "k".into(),
            dimensions: global_work.len(),
            global_work,
            parallel: true,
            ..Default::default()
        }
    }

    #[test]
    fn block_size_divides_global_work() {
        assert_eq!(calculate_block_size(256, 1024), 256);
        assert_eq!(calculate_block_size(256, 100), 100);
        // Equal limit and work is quartered
        assert_eq!(calculate_block_size(256, 256), 64);
        assert_eq!(calculate_block_size(256, 97), 97);
        assert_eq!(calculate_block_size(64, 97), 1);
        assert_eq!(calculate_block_size(1, 1), 1);
        assert_eq!(calculate_block_size(0, 10), 1);
    }

    #[test]
    fn one_dimension_1024_with_256_threads() {
        let scheduler = scheduler();
        let block = scheduler.calculate_block_dimension(&[1024], 256, 1, "k").unwrap();
        assert_eq!(block, [256, 1, 1]);
        let grid = scheduler.calculate_grid_dimension("k", 1, &[1024], block).unwrap();
        assert_eq!(grid, [4, 1, 1]);
    }

    #[test]
    fn one_dimension_100_with_256_threads() {
        let scheduler = scheduler();
        let block = scheduler.calculate_block_dimension(&[100], 256, 1, "k").unwrap();
        assert_eq!(block, [100, 1, 1]);
        assert_eq!(scheduler.calculate_grid_dimension("k", 1, &[100], block).unwrap(), [1, 1, 1]);
    }

    #[test]
    fn two_dimensions_use_square_root() {
        let scheduler = scheduler();
        let block = scheduler.calculate_block_dimension(&[512, 96], 1024, 2, "k").unwrap();
        assert_eq!(block, [32, 32, 1]);
        assert_eq!(scheduler.calculate_grid_dimension("k", 2, &[512, 96], block).unwrap(), [16, 3, 1]);
    }

    #[test]
    fn invalid_inputs_are_scheduling_bailouts() {
        let scheduler = scheduler();
        for err in [
            scheduler.calculate_block_dimension(&[16], 256, 0, "k").unwrap_err(),
            scheduler.calculate_block_dimension(&[16; 4], 256, 4, "k").unwrap_err(),
            scheduler.calculate_block_dimension(&[16], 256, 2, "k").unwrap_err(),
            scheduler.calculate_block_dimension(&[16], 0, 1, "k").unwrap_err(),
            scheduler.calculate_grid_dimension("k", 1, &[16], [0, 1, 1]).unwrap_err(),
        ] {
            assert_eq!(err.bailout_kind(), Some(BailoutKind::Scheduling));
        }
    }

    #[test]
    fn serial_task_runs_one_thread() {
        let scheduler = scheduler();
        let descriptor = LaunchDescriptor { parallel: false, ..descriptor(vec![4096]) };
        let dims = scheduler.launch_dimensions(&descriptor, 1024).unwrap();
        assert_eq!(dims, LaunchDimensions { block: [1; 3], grid: [1; 3] });
    }

    #[test]
    fn valid_local_work_is_kept() {
        let scheduler = scheduler();
        let descriptor = LaunchDescriptor { local_work: Some(vec![16, 8]), ..descriptor(vec![64, 64]) };
        let dims = scheduler.launch_dimensions(&descriptor, 1024).unwrap();
        assert_eq!(dims.block, [16, 8, 1]);
        assert_eq!(dims.grid, [4, 8, 1]);
    }

    #[test]
    fn oversized_local_work_is_recomputed() {
        let scheduler = scheduler();
        let descriptor = LaunchDescriptor { local_work: Some(vec![512, 512]), ..descriptor(vec![1024, 1024]) };
        let dims = scheduler.launch_dimensions(&descriptor, 1024).unwrap();
        assert_eq!(dims.block, [32, 32, 1]);
        assert_eq!(dims.grid, [32, 32, 1]);
    }

    #[test]
    fn grid_override_with_local_work() {
        let scheduler = scheduler();
        let descriptor = LaunchDescriptor {
            local_work: Some(vec![64]),
            grid_override: Some([7, 1, 1]),
            ..descriptor(vec![1024])
        };
        let dims = scheduler.launch_dimensions(&descriptor, 256).unwrap();
        assert_eq!(dims, LaunchDimensions { block: [64, 1, 1], grid: [7, 1, 1] });
    }

    #[test]
    fn grid_override_is_dropped_with_rejected_local_work() {
        let scheduler = scheduler();
        let descriptor = LaunchDescriptor {
            local_work: Some(vec![2048]),
            grid_override: Some([1, 1, 1]),
            ..descriptor(vec![1024])
        };
        let dims = scheduler.launch_dimensions(&descriptor, 256).unwrap();
        assert_eq!(dims, LaunchDimensions { block: [256, 1, 1], grid: [4, 1, 1] });
        assert!(u64::from(dims.grid[0]) * u64::from(dims.block[0]) >= 1024);
    }

    #[test]
    fn grid_override_without_local_work_is_ignored() {
        let scheduler = scheduler();
        let descriptor = LaunchDescriptor { grid_override: Some([1, 1, 1]), ..descriptor(vec![1024]) };
        let dims = scheduler.launch_dimensions(&descriptor, 256).unwrap();
        assert_eq!(dims.grid, [4, 1, 1]);
    }

    #[test]
    fn batch_threads_replace_global_work() {
        let scheduler = scheduler();
        let descriptor = LaunchDescriptor { batch_threads: 2048, ..descriptor(vec![10]) };
        let dims = scheduler.launch_dimensions(&descriptor, 128).unwrap();
        assert_eq!(dims.block, [128, 1, 1]);
        assert_eq!(dims.grid, [16, 1, 1]);
    }

    #[test]
    fn kernel_limit_is_capped_by_device() {
        let scheduler = scheduler();
        let dims = scheduler.launch_dimensions(&descriptor(vec![1 << 20]), 4096).unwrap();
        assert_eq!(dims.block, [1024, 1, 1]);
        assert_eq!(dims.grid, [1024, 1, 1]);
    }

    #[test]
    fn block_size_property() {
        let mut rng = SmallRng::seed_from_u64(0xb10c);
        for _ in 0..5000 {
            let max = rng.gen_range(1..=1024u32);
            let global = rng.gen_range(1..=1_000_000u64);
            let block = calculate_block_size(max, global);
            assert!(block >= 1 && u64::from(block) <= global, "{block} for {max} {global}");
            assert_eq!(global % u64::from(block), 0);
            assert!(block <= max);
        }
    }

    #[test]
    fn grid_covers_global_work_property() {
        let scheduler = scheduler();
        let mut rng = SmallRng::seed_from_u64(0x9e1d);
        for _ in 0..2000 {
            let dimensions = rng.gen_range(1..=3usize);
            let global: Vec<u64> = (0..dimensions).map(|_| rng.gen_range(1..=65535u64)).collect();
            let max_threads = rng.gen_range(1..=1024u32);
            let block = scheduler.calculate_block_dimension(&global, max_threads, dimensions, "k").unwrap();
            let grid = scheduler.calculate_grid_dimension("k", dimensions, &global, block).unwrap();
            assert!(block.iter().map(|&b| u64::from(b)).product::<u64>() <= u64::from(max_threads));
            for i in 0..3 {
                let work = global.get(i).copied().unwrap_or(1);
                assert!(u64::from(grid[i]) * u64::from(block[i]) >= work);
                assert!(grid[i] <= scheduler.max_grid_extents[i]);
            }
        }
    }
}
