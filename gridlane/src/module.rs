use std::sync::{
    atomic::{AtomicBool, Ordering},
    OnceLock,
};

use crate::{
    backend::{Driver, JitOption, NativeHandle},
    error::{BackendError, RuntimeError},
};

/// Loaded kernel binary and the entry point function inside it
#[derive(Debug)]
pub struct Module {
    kernel_name: String,
    entry_point: String,
    module: NativeHandle,
    function: NativeHandle,
    // Filled by the first occupancy query
    max_block_size: OnceLock<u32>,
    invalidated: AtomicBool,
}

impl Module {
    pub(crate) fn load(
        driver: &Driver,
        kernel_name: &str,
        entry_point: &str,
        binary: &[u8],
        options: &[(JitOption, i64)],
    ) -> Result<Module, RuntimeError> {
        if binary.is_empty() {
            return Err(RuntimeError::compilation(format!("Empty binary for kernel {kernel_name}")));
        }
        let module = driver
            .load_module(binary, options)
            .map_err(|e| RuntimeError::compilation(format!("JIT compilation of {kernel_name} failed: {e}")))?;
        if module.is_null() {
            return Err(RuntimeError::compilation(format!("JIT compilation of {kernel_name} returned no module")));
        }
        let function = match driver.module_function(module, entry_point) {
            Ok(function) if !function.is_null() => function,
            other => {
                let _ = driver.unload_module(module);
                let reason = other.err().map_or_else(|| "null function".to_string(), |e| e.to_string());
                return Err(RuntimeError::compilation(format!(
                    "Entry point {entry_point} of {kernel_name} could not be resolved: {reason}"
                )));
            }
        };
        Ok(Module {
            kernel_name: kernel_name.into(),
            entry_point: entry_point.into(),
            module,
            function,
            max_block_size: OnceLock::new(),
            invalidated: AtomicBool::new(false),
        })
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub(crate) fn function(&self) -> NativeHandle {
        self.function
    }

    /// Block size that gives this kernel maximum occupancy on its device
    pub fn potential_block_size_max_occupancy(&self, driver: &Driver) -> Result<u32, BackendError> {
        if let Some(&size) = self.max_block_size.get() {
            return Ok(size);
        }
        let size = driver.max_potential_block_size(self.function)?;
        Ok(*self.max_block_size.get_or_init(|| size))
    }

    /// Occupancy block size if it was already queried
    pub fn cached_block_size(&self) -> Option<u32> {
        self.max_block_size.get().copied()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Unloads the native module, later launches are a contract violation
    pub(crate) fn invalidate(&self, driver: &Driver) -> Result<(), BackendError> {
        if self.invalidated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        driver.unload_module(self.module)
    }
}
