//! Compiled kernels of one execution plan.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    backend::{Driver, JitOption},
    error::RuntimeError,
    module::Module,
    ExecutionPlanId,
};

/// Parses whitespace separated `<flag name> <integer>` pairs into JIT options
pub fn parse_jit_flags(flags: &str) -> Result<Vec<(JitOption, i64)>, RuntimeError> {
    let tokens: Vec<&str> = flags.split_whitespace().collect();
    if tokens.len() % 2 != 0 {
        return Err(RuntimeError::configuration(format!(
            "JIT flags must come in name value pairs, got {} tokens in \"{flags}\"",
            tokens.len()
        )));
    }
    tokens
        .chunks_exact(2)
        .map(|pair| {
            let option = JitOption::from_name(pair[0])
                .ok_or_else(|| RuntimeError::configuration(format!("Unsupported JIT flag {}", pair[0])))?;
            let value = pair[1].parse::<i64>().map_err(|e| {
                RuntimeError::configuration(format!("Invalid value {} for JIT flag {}: {e}", pair[1], pair[0]))
            })?;
            Ok((option, value))
        })
        .collect()
}

#[derive(Debug)]
pub struct CodeCache {
    plan: ExecutionPlanId,
    driver: Arc<Driver>,
    entries: Mutex<BTreeMap<String, Arc<Module>>>,
    debug_asm: bool,
}

impl CodeCache {
    pub fn new(plan: ExecutionPlanId, driver: Arc<Driver>, debug_asm: bool) -> CodeCache {
        CodeCache { plan, driver, entries: Mutex::new(BTreeMap::new()), debug_asm }
    }

    pub fn plan(&self) -> ExecutionPlanId {
        self.plan
    }

    /// Loads `binary` and caches it under `kernel_name`.
    ///
    /// If the kernel is already cached the cached module is returned and nothing
    /// is loaded. The lock is held while loading, concurrent installs of the same
    /// kernel load it once.
    pub fn install_source(
        &self,
        kernel_name: &str,
        binary: &[u8],
        entry_point: &str,
        flags: &str,
        debug_dump: bool,
    ) -> Result<Arc<Module>, RuntimeError> {
        let mut entries = self.entries.lock();
        if let Some(module) = entries.get(kernel_name) {
            return Ok(module.clone());
        }
        let options = parse_jit_flags(flags)?;
        if debug_dump || self.debug_asm {
            log::info!(
                "Installing {kernel_name} ({entry_point}) for plan {} with {options:?}\n{}",
                self.plan,
                String::from_utf8_lossy(binary)
            );
        }
        let module = Arc::new(Module::load(&self.driver, kernel_name, entry_point, binary, &options)?);
        entries.insert(kernel_name.into(), module.clone());
        Ok(module)
    }

    pub fn cached_code(&self, kernel_name: &str) -> Option<Arc<Module>> {
        self.entries.lock().get(kernel_name).cloned()
    }

    pub fn is_cached(&self, kernel_name: &str) -> bool {
        self.entries.lock().contains_key(kernel_name)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unloads every module and empties the cache, outstanding `Arc<Module>`s become invalid
    pub fn reset(&self) -> Result<(), RuntimeError> {
        let modules = std::mem::take(&mut *self.entries.lock());
        let mut result = Ok(());
        for module in modules.values() {
            if let Err(err) = module.invalidate(&self.driver) {
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::DummyDriver,
        error::{BailoutKind, RuntimeError},
    };

    const VECADD: &[u8] = b".visible .entry vecaddEntry(.param .u64 ctx) { ret; }";

    fn cache() -> CodeCache {
        CodeCache::new(ExecutionPlanId(1), Arc::new(Driver::Dummy(DummyDriver::new(128))), false)
    }

    #[test]
    fn flags_parse_in_pairs() {
        let options = parse_jit_flags("CU_JIT_OPTIMIZATION_LEVEL 3  CU_JIT_MAX_REGISTERS\t64").unwrap();
        assert_eq!(
            options,
            [(JitOption::CU_JIT_OPTIMIZATION_LEVEL, 3), (JitOption::CU_JIT_MAX_REGISTERS, 64)]
        );
        assert!(parse_jit_flags("").unwrap().is_empty());
        assert!(parse_jit_flags("   ").unwrap().is_empty());
    }

    #[test]
    fn bad_flags_are_configuration_bailouts() {
        let odd = parse_jit_flags("CU_JIT_OPTIMIZATION_LEVEL").unwrap_err();
        assert_eq!(odd.bailout_kind(), Some(BailoutKind::Configuration));
        let unknown = parse_jit_flags("BADFLAG 3").unwrap_err();
        assert_eq!(unknown.bailout_kind(), Some(BailoutKind::Configuration));
        assert!(unknown.to_string().contains("BADFLAG"));
        let value = parse_jit_flags("CU_JIT_TARGET sm_80").unwrap_err();
        assert!(value.is_recoverable());
        assert!(value.to_string().contains("sm_80"));
    }

    #[test]
    fn second_install_is_cached() {
        let cache = cache();
        let first = cache.install_source("vecadd", VECADD, "vecaddEntry", "CU_JIT_OPTIMIZATION_LEVEL 3", false).unwrap();
        let second = cache.install_source("vecadd", VECADD, "vecaddEntry", "CU_JIT_OPTIMIZATION_LEVEL 3", false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let dummy = cache.driver.as_dummy().unwrap();
        assert_eq!(dummy.module_loads(), 1);
        assert_eq!(dummy.jit_options(), [vec![(JitOption::CU_JIT_OPTIMIZATION_LEVEL, 3)]]);
    }

    #[test]
    fn failed_install_is_not_cached() {
        let cache = cache();
        let err = cache.install_source("empty", b"", "main", "", false).unwrap_err();
        assert!(matches!(err, RuntimeError::Bailout(_)));
        let err = cache.install_source("vecadd", VECADD, "missingEntry", "", false).unwrap_err();
        assert_eq!(err.bailout_kind(), Some(BailoutKind::Compilation));
        assert!(cache.is_empty());
        assert_eq!(cache.driver.as_dummy().unwrap().live_modules(), 0);
    }

    #[test]
    fn reset_invalidates_modules() {
        let cache = cache();
        let module = cache.install_source("vecadd", VECADD, "vecaddEntry", "", true).unwrap();
        assert!(cache.is_cached("vecadd"));
        cache.reset().unwrap();
        assert!(module.is_invalidated());
        assert!(cache.cached_code("vecadd").is_none());
        assert_eq!(cache.driver.as_dummy().unwrap().live_modules(), 0);
        let again = cache.install_source("vecadd", VECADD, "vecaddEntry", "", false).unwrap();
        assert!(!Arc::ptr_eq(&module, &again));
        assert_eq!(cache.len(), 1);
    }
}
