#![allow(non_snake_case)]

use std::{
    ffi::{c_int, c_uint},
    ptr,
};

use libloading::Library;

use crate::{
    error::{BackendError, ErrorStatus},
    profiler::PowerMetric,
};

/// Samples board power draw of one device through NVML
#[derive(Debug)]
pub struct NvmlPowerMetric {
    #[allow(unused)]
    nvml: Library,
    device: nvmlDevice_t,
    nvmlDeviceGetPowerUsage: unsafe extern "C" fn(nvmlDevice_t, *mut c_uint) -> c_int,
    nvmlShutdown: unsafe extern "C" fn() -> c_int,
}

unsafe impl Send for NvmlPowerMetric {}
unsafe impl Sync for NvmlPowerMetric {}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct nvmlDevice_st {
    _unused: [u8; 0],
}
#[allow(non_camel_case_types)]
type nvmlDevice_t = *mut nvmlDevice_st;

const NVML_SUCCESS: c_int = 0;

fn check(status: c_int, error: ErrorStatus) -> Result<(), BackendError> {
    if status == NVML_SUCCESS {
        Ok(())
    } else {
        Err(BackendError { status: error, context: format!("NVML error {status}").into() })
    }
}

impl NvmlPowerMetric {
    /// Power reader of the board with CUDA ordinal `ordinal`
    pub fn new(ordinal: u32) -> Result<NvmlPowerMetric, BackendError> {
        let nvml_paths = ["/lib/x86_64-linux-gnu/libnvidia-ml.so.1", "/lib64/libnvidia-ml.so.1", "libnvidia-ml.so.1"];
        let Some(nvml) = nvml_paths.iter().find_map(|path| unsafe { Library::new(path) }.ok()) else {
            return Err(BackendError { status: ErrorStatus::DyLibNotFound, context: "NVML not found.".into() });
        };
        let load = |name: &[u8]| BackendError {
            status: ErrorStatus::DyLibNotFound,
            context: format!("NVML symbol {} missing", String::from_utf8_lossy(name)).into(),
        };
        let nvmlInit: unsafe extern "C" fn() -> c_int =
            *unsafe { nvml.get(b"nvmlInit_v2\0") }.map_err(|_| load(b"nvmlInit_v2"))?;
        let nvmlDeviceGetHandleByIndex: unsafe extern "C" fn(c_uint, *mut nvmlDevice_t) -> c_int =
            *unsafe { nvml.get(b"nvmlDeviceGetHandleByIndex_v2\0") }
                .map_err(|_| load(b"nvmlDeviceGetHandleByIndex_v2"))?;
        let nvmlDeviceGetPowerUsage: unsafe extern "C" fn(nvmlDevice_t, *mut c_uint) -> c_int =
            *unsafe { nvml.get(b"nvmlDeviceGetPowerUsage\0") }.map_err(|_| load(b"nvmlDeviceGetPowerUsage"))?;
        let nvmlShutdown: unsafe extern "C" fn() -> c_int =
            *unsafe { nvml.get(b"nvmlShutdown\0") }.map_err(|_| load(b"nvmlShutdown"))?;

        check(unsafe { nvmlInit() }, ErrorStatus::Initialization)?;
        let mut device: nvmlDevice_t = ptr::null_mut();
        if let Err(err) = check(unsafe { nvmlDeviceGetHandleByIndex(ordinal, &mut device) }, ErrorStatus::DeviceQuery) {
            unsafe { nvmlShutdown() };
            return Err(err);
        }
        Ok(NvmlPowerMetric { nvml, device, nvmlDeviceGetPowerUsage, nvmlShutdown })
    }
}

impl PowerMetric for NvmlPowerMetric {
    fn power_usage_mw(&self) -> Option<u64> {
        let mut milliwatts: c_uint = 0;
        check(unsafe { (self.nvmlDeviceGetPowerUsage)(self.device, &mut milliwatts) }, ErrorStatus::DeviceQuery)
            .ok()
            .map(|()| u64::from(milliwatts))
    }
}

impl Drop for NvmlPowerMetric {
    fn drop(&mut self) {
        unsafe { (self.nvmlShutdown)() };
    }
}
