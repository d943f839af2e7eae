use std::sync::Arc;

use gridlane::{
    initialize_devices, BailoutKind, CUDAConfig, DeviceContext, DummyConfig, ExecutionPlanId, JitOption, Module,
    RuntimeConfig, RuntimeError,
};

const VECADD: &[u8] = b"//\n.version 7.0\n.target sm_70\n.visible .entry vecaddEntry(.param .u64 a) { ret; }";

fn context(jit_flags: Option<&str>) -> Result<Arc<DeviceContext>, RuntimeError> {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = RuntimeConfig {
        jit_flags: jit_flags.map(String::from),
        dummy: Some(DummyConfig { enabled: true, ..Default::default() }),
        cuda: Some(CUDAConfig { device_ids: Some(Vec::new()) }),
        ..Default::default()
    };
    Ok(initialize_devices(&config)?.remove(0))
}

#[test]
fn install_twice_loads_once() -> Result<(), RuntimeError> {
    let ctx = context(None)?;
    let plan = ExecutionPlanId(1);
    let flags = Some("CU_JIT_OPTIMIZATION_LEVEL 3");
    let first = ctx.install_code(plan, "vecadd", VECADD, "vecaddEntry", flags, false)?;
    let second = ctx.install_code(plan, "vecadd", VECADD, "vecaddEntry", flags, false)?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.kernel_name(), "vecadd");
    assert_eq!(first.entry_point(), "vecaddEntry");
    let dummy = ctx.driver().as_dummy().unwrap();
    assert_eq!(dummy.module_loads(), 1);
    assert_eq!(dummy.jit_options(), [vec![(JitOption::CU_JIT_OPTIMIZATION_LEVEL, 3)]]);
    assert!(ctx.is_cached(plan, "vecadd"));
    assert!(ctx.installed_code(plan, "vecadd").is_some_and(|m| Arc::ptr_eq(&m, &first)));
    assert_eq!(ctx.code_cache(plan).len(), 1);
    Ok(())
}

#[test]
fn unsupported_flag_is_named() -> Result<(), RuntimeError> {
    let ctx = context(None)?;
    let plan = ExecutionPlanId(1);
    let err = ctx.install_code(plan, "vecadd", VECADD, "vecaddEntry", Some("BADFLAG 3"), false).unwrap_err();
    assert_eq!(err.bailout_kind(), Some(BailoutKind::Configuration));
    assert!(err.is_recoverable());
    assert!(err.to_string().contains("BADFLAG"));
    assert!(!ctx.is_cached(plan, "vecadd"));
    assert_eq!(ctx.driver().as_dummy().unwrap().module_loads(), 0);
    Ok(())
}

#[test]
fn config_flags_are_the_default() -> Result<(), RuntimeError> {
    let ctx = context(Some("CU_JIT_MAX_REGISTERS 32 CU_JIT_GENERATE_LINE_INFO 1"))?;
    ctx.install_code(ExecutionPlanId(1), "vecadd", VECADD, "vecaddEntry", None, true)?;
    ctx.install_code(ExecutionPlanId(1), "other", VECADD, "vecaddEntry", Some(""), false)?;
    assert_eq!(
        ctx.driver().as_dummy().unwrap().jit_options(),
        [vec![(JitOption::CU_JIT_MAX_REGISTERS, 32), (JitOption::CU_JIT_GENERATE_LINE_INFO, 1)], vec![]]
    );
    Ok(())
}

#[test]
fn failed_load_is_a_compilation_bailout() -> Result<(), RuntimeError> {
    let ctx = context(None)?;
    let plan = ExecutionPlanId(2);
    let err = ctx.install_code(plan, "vecadd", b"  \n", "vecaddEntry", None, false).unwrap_err();
    assert_eq!(err.bailout_kind(), Some(BailoutKind::Compilation));
    let err = ctx.install_code(plan, "vecadd", VECADD, "saxpyEntry", None, false).unwrap_err();
    assert_eq!(err.bailout_kind(), Some(BailoutKind::Compilation));
    assert!(err.to_string().contains("saxpyEntry"));
    assert!(ctx.installed_code(plan, "vecadd").is_none());
    assert_eq!(ctx.driver().as_dummy().unwrap().live_modules(), 0);
    Ok(())
}

#[test]
fn plans_do_not_share_code() -> Result<(), RuntimeError> {
    let ctx = context(None)?;
    let a = ctx.install_code(ExecutionPlanId(1), "vecadd", VECADD, "vecaddEntry", None, false)?;
    let b = ctx.install_code(ExecutionPlanId(2), "vecadd", VECADD, "vecaddEntry", None, false)?;
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(ctx.driver().as_dummy().unwrap().module_loads(), 2);
    assert!(!ctx.is_cached(ExecutionPlanId(3), "vecadd"));
    Ok(())
}

#[test]
fn concurrent_installs_load_once() -> Result<(), RuntimeError> {
    let ctx = context(None)?;
    let plan = ExecutionPlanId(4);
    let modules: Vec<Arc<Module>> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| s.spawn(|| ctx.install_code(plan, "vecadd", VECADD, "vecaddEntry", None, false)))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect::<Result<_, _>>()
    })?;
    assert!(modules.iter().all(|m| Arc::ptr_eq(m, &modules[0])));
    assert_eq!(ctx.driver().as_dummy().unwrap().module_loads(), 1);
    Ok(())
}

#[test]
fn occupancy_is_queried_once() -> Result<(), RuntimeError> {
    let ctx = context(None)?;
    let module = ctx.install_code(ExecutionPlanId(5), "vecadd", VECADD, "vecaddEntry", None, false)?;
    assert_eq!(module.cached_block_size(), None);
    assert_eq!(module.potential_block_size_max_occupancy(ctx.driver())?, 1024);
    assert_eq!(module.cached_block_size(), Some(1024));
    Ok(())
}
