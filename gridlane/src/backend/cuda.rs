//! CUDA driver API backend.
//!
//! libcuda is opened at runtime, nothing is linked at build time.

#![allow(non_snake_case)]

use std::{
    ffi::{c_char, c_int, c_uint, c_void},
    ptr,
    sync::Arc,
};

use libloading::Library;
use nanoserde::DeJson;

use super::{Driver, JitOption, NativeHandle};
use crate::{
    device::{ByteOrder, Device},
    error::{BackendError, ErrorStatus},
};

/// CUDA configuration
#[derive(Debug, Default, Clone, DeJson)]
pub struct CUDAConfig {
    /// Restrict the runtime to these device ordinals
    pub device_ids: Option<Vec<i32>>,
}

/// Function table and primary context of one CUDA device
#[derive(Debug)]
pub struct CUDADriver {
    // Just to keep the library loaded
    #[allow(unused)]
    cuda: Arc<Library>,
    context: CUcontext,
    device: CUdevice,
    cuDevicePrimaryCtxRelease: unsafe extern "C" fn(CUdevice) -> CUDAStatus,
    cuCtxSetCurrent: unsafe extern "C" fn(CUcontext) -> CUDAStatus,
    cuCtxGetStreamPriorityRange: unsafe extern "C" fn(*mut c_int, *mut c_int) -> CUDAStatus,
    cuStreamCreateWithPriority: unsafe extern "C" fn(*mut CUstream, c_uint, c_int) -> CUDAStatus,
    cuStreamDestroy: unsafe extern "C" fn(CUstream) -> CUDAStatus,
    cuStreamSynchronize: unsafe extern "C" fn(CUstream) -> CUDAStatus,
    cuStreamWaitEvent: unsafe extern "C" fn(CUstream, CUevent, c_uint) -> CUDAStatus,
    cuEventCreate: unsafe extern "C" fn(*mut CUevent, c_uint) -> CUDAStatus,
    cuEventRecord: unsafe extern "C" fn(CUevent, CUstream) -> CUDAStatus,
    cuEventQuery: unsafe extern "C" fn(CUevent) -> CUDAStatus,
    cuEventSynchronize: unsafe extern "C" fn(CUevent) -> CUDAStatus,
    cuEventElapsedTime: unsafe extern "C" fn(*mut f32, CUevent, CUevent) -> CUDAStatus,
    cuEventDestroy: unsafe extern "C" fn(CUevent) -> CUDAStatus,
    cuMemAlloc: unsafe extern "C" fn(*mut CUdeviceptr, usize) -> CUDAStatus,
    cuMemFree: unsafe extern "C" fn(CUdeviceptr) -> CUDAStatus,
    cuMemcpyHtoDAsync: unsafe extern "C" fn(CUdeviceptr, *const c_void, usize, CUstream) -> CUDAStatus,
    cuMemcpyDtoHAsync: unsafe extern "C" fn(*mut c_void, CUdeviceptr, usize, CUstream) -> CUDAStatus,
    cuModuleLoadDataEx: unsafe extern "C" fn(
        *mut CUmodule,
        *const c_void,
        c_uint,
        *mut JitOption,
        *mut *mut c_void,
    ) -> CUDAStatus,
    cuModuleGetFunction: unsafe extern "C" fn(*mut CUfunction, CUmodule, *const c_char) -> CUDAStatus,
    cuModuleUnload: unsafe extern "C" fn(CUmodule) -> CUDAStatus,
    cuOccupancyMaxPotentialBlockSize: unsafe extern "C" fn(
        *mut c_int,
        *mut c_int,
        CUfunction,
        Option<unsafe extern "C" fn(c_int) -> usize>,
        usize,
        c_int,
    ) -> CUDAStatus,
    cuLaunchKernel: unsafe extern "C" fn(
        CUfunction,
        c_uint,
        c_uint,
        c_uint,
        c_uint,
        c_uint,
        c_uint,
        c_uint,
        CUstream,
        *mut *mut c_void,
        *mut *mut c_void,
    ) -> CUDAStatus,
}

// The primary context is usable from any thread once made current
unsafe impl Send for CUDADriver {}
unsafe impl Sync for CUDADriver {}

const CU_STREAM_NON_BLOCKING: c_uint = 1;
const CU_EVENT_DEFAULT: c_uint = 0;
const CU_LAUNCH_PARAM_END: usize = 0;
const CU_LAUNCH_PARAM_BUFFER_POINTER: usize = 1;
const CU_LAUNCH_PARAM_BUFFER_SIZE: usize = 2;

fn symbol<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, BackendError> {
    unsafe { lib.get::<T>(name) }.map(|s| *s).map_err(|e| BackendError {
        status: ErrorStatus::DyLibNotFound,
        context: format!("{}: {e}", String::from_utf8_lossy(&name[..name.len() - 1])).into(),
    })
}

pub(super) fn initialize_device(
    config: &CUDAConfig,
    debug_dev: bool,
) -> Result<Vec<(Device, Arc<Driver>)>, BackendError> {
    if config.device_ids.as_ref().is_some_and(Vec::is_empty) {
        return Err(BackendError { status: ErrorStatus::Initialization, context: "CUDA configured out.".into() });
    }
    let cuda_paths = [
        "/lib/x86_64-linux-gnu/libcuda.so",
        "/lib64/libcuda.so",
        "/usr/lib/x86_64-linux-gnu/libcuda.so.1",
        "/usr/lib/wsl/lib/libcuda.so",
        "libcuda.so.1",
    ];
    let cuda = cuda_paths.iter().find_map(|path| unsafe { Library::new(path) }.ok());
    let Some(cuda) = cuda else {
        return Err(BackendError { status: ErrorStatus::DyLibNotFound, context: "CUDA runtime not found.".into() });
    };

    let cuInit: unsafe extern "C" fn(c_uint) -> CUDAStatus = symbol(&cuda, b"cuInit\0")?;
    let cuDriverGetVersion: unsafe extern "C" fn(*mut c_int) -> CUDAStatus =
        symbol(&cuda, b"cuDriverGetVersion\0")?;
    let cuDeviceGetCount: unsafe extern "C" fn(*mut c_int) -> CUDAStatus = symbol(&cuda, b"cuDeviceGetCount\0")?;
    let cuDeviceGet: unsafe extern "C" fn(*mut CUdevice, c_int) -> CUDAStatus = symbol(&cuda, b"cuDeviceGet\0")?;
    let cuDeviceGetName: unsafe extern "C" fn(*mut c_char, c_int, CUdevice) -> CUDAStatus =
        symbol(&cuda, b"cuDeviceGetName\0")?;
    let cuDeviceGetAttribute: unsafe extern "C" fn(*mut c_int, CUdevice_attribute, CUdevice) -> CUDAStatus =
        symbol(&cuda, b"cuDeviceGetAttribute\0")?;
    let cuDeviceTotalMem: unsafe extern "C" fn(*mut usize, CUdevice) -> CUDAStatus =
        symbol(&cuda, b"cuDeviceTotalMem_v2\0")?;
    let cuDevicePrimaryCtxRetain: unsafe extern "C" fn(*mut CUcontext, CUdevice) -> CUDAStatus =
        symbol(&cuda, b"cuDevicePrimaryCtxRetain\0")?;

    unsafe { cuInit(0) }.check(ErrorStatus::Initialization)?;
    let mut driver_version = 0;
    unsafe { cuDriverGetVersion(&mut driver_version) }.check(ErrorStatus::Initialization)?;
    let mut num_devices = 0;
    unsafe { cuDeviceGetCount(&mut num_devices) }.check(ErrorStatus::DeviceEnumeration)?;
    if num_devices == 0 {
        return Err(BackendError { status: ErrorStatus::DeviceEnumeration, context: "CUDA no devices found.".into() });
    }
    let device_ids: Vec<_> =
        (0..num_devices).filter(|id| config.device_ids.as_ref().map_or(true, |ids| ids.contains(id))).collect();
    if device_ids.is_empty() {
        return Err(BackendError {
            status: ErrorStatus::DeviceEnumeration,
            context: "CUDA all available devices configured out.".into(),
        });
    }
    if debug_dev {
        log::info!(
            "Using CUDA driver, driver version: {}.{} on devices:",
            driver_version / 1000,
            (driver_version - (driver_version / 1000 * 1000)) / 10
        );
    }

    let cuda = Arc::new(cuda);
    let mut devices = Vec::new();
    for (index, dev_id) in device_ids.into_iter().enumerate() {
        let mut device = 0;
        unsafe { cuDeviceGet(&mut device, dev_id) }.check(ErrorStatus::DeviceEnumeration)?;
        let mut device_name = [0; 100];
        let Ok(()) = unsafe { cuDeviceGetName(device_name.as_mut_ptr(), 100, device) }.check(ErrorStatus::DeviceQuery)
        else {
            continue;
        };
        let name = unsafe { std::ffi::CStr::from_ptr(device_name.as_ptr()) }.to_string_lossy().into_owned();
        let attribute = |attribute: CUdevice_attribute| -> Result<u32, BackendError> {
            let mut value = 0;
            unsafe { cuDeviceGetAttribute(&mut value, attribute, device) }.check(ErrorStatus::DeviceQuery)?;
            Ok(u32::try_from(value).unwrap_or(0))
        };
        let Ok(limits) = (|| -> Result<_, BackendError> {
            use CUdevice_attribute as A;
            Ok((
                attribute(A::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?,
                [
                    attribute(A::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X)?,
                    attribute(A::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y)?,
                    attribute(A::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Z)?,
                ],
                [
                    attribute(A::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X)?,
                    attribute(A::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y)?,
                    attribute(A::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Z)?,
                ],
            ))
        })() else {
            continue;
        };
        let mut total_memory = 0;
        let Ok(()) = unsafe { cuDeviceTotalMem(&mut total_memory, device) }.check(ErrorStatus::DeviceQuery) else {
            continue;
        };
        if debug_dev {
            log::info!("{name}, {} MiB", total_memory / (1024 * 1024));
        }
        let mut context: CUcontext = ptr::null_mut();
        if let Err(err) = unsafe { cuDevicePrimaryCtxRetain(&mut context, device) }.check(ErrorStatus::Initialization)
        {
            if debug_dev {
                log::info!("Device with id {dev_id} requested, but CUDA context initialization failed. {err}");
            }
            continue;
        }
        let driver = CUDADriver {
            cuda: cuda.clone(),
            context,
            device,
            cuDevicePrimaryCtxRelease: symbol(&cuda, b"cuDevicePrimaryCtxRelease_v2\0")?,
            cuCtxSetCurrent: symbol(&cuda, b"cuCtxSetCurrent\0")?,
            cuCtxGetStreamPriorityRange: symbol(&cuda, b"cuCtxGetStreamPriorityRange\0")?,
            cuStreamCreateWithPriority: symbol(&cuda, b"cuStreamCreateWithPriority\0")?,
            cuStreamDestroy: symbol(&cuda, b"cuStreamDestroy_v2\0")?,
            cuStreamSynchronize: symbol(&cuda, b"cuStreamSynchronize\0")?,
            cuStreamWaitEvent: symbol(&cuda, b"cuStreamWaitEvent\0")?,
            cuEventCreate: symbol(&cuda, b"cuEventCreate\0")?,
            cuEventRecord: symbol(&cuda, b"cuEventRecord\0")?,
            cuEventQuery: symbol(&cuda, b"cuEventQuery\0")?,
            cuEventSynchronize: symbol(&cuda, b"cuEventSynchronize\0")?,
            cuEventElapsedTime: symbol(&cuda, b"cuEventElapsedTime\0")?,
            cuEventDestroy: symbol(&cuda, b"cuEventDestroy_v2\0")?,
            cuMemAlloc: symbol(&cuda, b"cuMemAlloc_v2\0")?,
            cuMemFree: symbol(&cuda, b"cuMemFree_v2\0")?,
            cuMemcpyHtoDAsync: symbol(&cuda, b"cuMemcpyHtoDAsync_v2\0")?,
            cuMemcpyDtoHAsync: symbol(&cuda, b"cuMemcpyDtoHAsync_v2\0")?,
            cuModuleLoadDataEx: symbol(&cuda, b"cuModuleLoadDataEx\0")?,
            cuModuleGetFunction: symbol(&cuda, b"cuModuleGetFunction\0")?,
            cuModuleUnload: symbol(&cuda, b"cuModuleUnload\0")?,
            cuOccupancyMaxPotentialBlockSize: symbol(&cuda, b"cuOccupancyMaxPotentialBlockSize\0")?,
            cuLaunchKernel: symbol(&cuda, b"cuLaunchKernel\0")?,
        };
        let (max_threads_per_block, max_block_extents, max_grid_extents) = limits;
        let info = Device {
            index,
            ordinal: dev_id as u32,
            name,
            byte_order: ByteOrder::LittleEndian,
            max_threads_per_block,
            max_block_extents,
            max_grid_extents,
            total_memory: total_memory as u64,
        };
        devices.push((info, Arc::new(Driver::CUDA(driver))));
    }
    Ok(devices)
}

impl CUDADriver {
    fn make_current(&self) -> Result<(), BackendError> {
        unsafe { (self.cuCtxSetCurrent)(self.context) }.check(ErrorStatus::Initialization)
    }

    pub(super) fn create_stream(&self) -> Result<NativeHandle, BackendError> {
        self.make_current()?;
        let mut least = 0;
        let mut greatest = 0;
        unsafe { (self.cuCtxGetStreamPriorityRange)(&mut least, &mut greatest) }
            .check(ErrorStatus::StreamCreation)?;
        let mut stream: CUstream = ptr::null_mut();
        unsafe { (self.cuStreamCreateWithPriority)(&mut stream, CU_STREAM_NON_BLOCKING, greatest) }
            .check(ErrorStatus::StreamCreation)?;
        Ok(NativeHandle::from_ptr(stream))
    }

    pub(super) fn destroy_stream(&self, stream: NativeHandle) -> Result<(), BackendError> {
        self.make_current()?;
        unsafe { (self.cuStreamDestroy)(stream.as_ptr()) }.check(ErrorStatus::StreamDestruction)
    }

    pub(super) fn synchronize_stream(&self, stream: NativeHandle) -> Result<(), BackendError> {
        self.make_current()?;
        unsafe { (self.cuStreamSynchronize)(stream.as_ptr()) }.check(ErrorStatus::StreamSync)
    }

    pub(super) fn stream_wait_event(&self, stream: NativeHandle, event: NativeHandle) -> Result<(), BackendError> {
        self.make_current()?;
        unsafe { (self.cuStreamWaitEvent)(stream.as_ptr(), event.as_ptr(), 0) }.check(ErrorStatus::StreamSync)
    }

    pub(super) fn record_event(&self, stream: NativeHandle) -> Result<NativeHandle, BackendError> {
        self.make_current()?;
        let mut event: CUevent = ptr::null_mut();
        unsafe { (self.cuEventCreate)(&mut event, CU_EVENT_DEFAULT) }.check(ErrorStatus::EventCreation)?;
        if let Err(err) = unsafe { (self.cuEventRecord)(event, stream.as_ptr()) }.check(ErrorStatus::EventRecord) {
            let _ = unsafe { (self.cuEventDestroy)(event) };
            return Err(err);
        }
        Ok(NativeHandle::from_ptr(event))
    }

    pub(super) fn query_event(&self, event: NativeHandle) -> Result<bool, BackendError> {
        self.make_current()?;
        let status = unsafe { (self.cuEventQuery)(event.as_ptr()) };
        if status == CUDAStatus::CUDA_ERROR_NOT_READY {
            return Ok(false);
        }
        status.check(ErrorStatus::EventQuery)?;
        Ok(true)
    }

    pub(super) fn synchronize_event(&self, event: NativeHandle) -> Result<(), BackendError> {
        self.make_current()?;
        unsafe { (self.cuEventSynchronize)(event.as_ptr()) }.check(ErrorStatus::EventSync)
    }

    pub(super) fn elapsed_time(&self, before: NativeHandle, after: NativeHandle) -> Result<u64, BackendError> {
        self.make_current()?;
        let mut millis = 0f32;
        unsafe { (self.cuEventElapsedTime)(&mut millis, before.as_ptr(), after.as_ptr()) }
            .check(ErrorStatus::EventQuery)?;
        Ok((f64::from(millis) * 1_000_000.0) as u64)
    }

    pub(super) fn destroy_event(&self, event: NativeHandle) -> Result<(), BackendError> {
        self.make_current()?;
        unsafe { (self.cuEventDestroy)(event.as_ptr()) }.check(ErrorStatus::EventDestruction)
    }

    pub(super) fn allocate(&self, bytes: usize) -> Result<u64, BackendError> {
        self.make_current()?;
        let mut address: CUdeviceptr = 0;
        unsafe { (self.cuMemAlloc)(&mut address, bytes) }.check(ErrorStatus::MemoryAllocation)?;
        Ok(address)
    }

    pub(super) fn deallocate(&self, address: u64) -> Result<(), BackendError> {
        self.make_current()?;
        unsafe { (self.cuMemFree)(address) }.check(ErrorStatus::MemoryDeallocation)
    }

    pub(super) unsafe fn copy_host_to_device(
        &self,
        dst: u64,
        src: *const u8,
        bytes: usize,
        stream: NativeHandle,
    ) -> Result<(), BackendError> {
        self.make_current()?;
        unsafe { (self.cuMemcpyHtoDAsync)(dst, src.cast(), bytes, stream.as_ptr()) }.check(ErrorStatus::MemoryCopyH2D)
    }

    pub(super) unsafe fn copy_device_to_host(
        &self,
        dst: *mut u8,
        src: u64,
        bytes: usize,
        stream: NativeHandle,
    ) -> Result<(), BackendError> {
        self.make_current()?;
        unsafe { (self.cuMemcpyDtoHAsync)(dst.cast(), src, bytes, stream.as_ptr()) }.check(ErrorStatus::MemoryCopyD2H)
    }

    pub(super) fn load_module(&self, binary: &[u8], options: &[(JitOption, i64)]) -> Result<NativeHandle, BackendError> {
        self.make_current()?;
        // PTX text must be nul terminated
        let mut image = binary.to_vec();
        if image.last() != Some(&0) {
            image.push(0);
        }
        let mut keys: Vec<JitOption> = options.iter().map(|(option, _)| *option).collect();
        let mut values: Vec<*mut c_void> = options.iter().map(|(_, value)| *value as usize as *mut c_void).collect();
        let mut module: CUmodule = ptr::null_mut();
        unsafe {
            (self.cuModuleLoadDataEx)(
                &mut module,
                image.as_ptr().cast(),
                keys.len() as c_uint,
                keys.as_mut_ptr(),
                values.as_mut_ptr(),
            )
        }
        .check(ErrorStatus::ModuleLoad)?;
        Ok(NativeHandle::from_ptr(module))
    }

    pub(super) fn module_function(&self, module: NativeHandle, name: &str) -> Result<NativeHandle, BackendError> {
        self.make_current()?;
        let name = std::ffi::CString::new(name)
            .map_err(|e| BackendError { status: ErrorStatus::ModuleLoad, context: format!("{e}").into() })?;
        let mut function: CUfunction = ptr::null_mut();
        unsafe { (self.cuModuleGetFunction)(&mut function, module.as_ptr(), name.as_ptr()) }
            .check(ErrorStatus::ModuleLoad)?;
        Ok(NativeHandle::from_ptr(function))
    }

    pub(super) fn unload_module(&self, module: NativeHandle) -> Result<(), BackendError> {
        self.make_current()?;
        unsafe { (self.cuModuleUnload)(module.as_ptr()) }.check(ErrorStatus::ModuleUnload)
    }

    pub(super) fn max_potential_block_size(&self, function: NativeHandle) -> Result<u32, BackendError> {
        self.make_current()?;
        let mut min_grid_size = 0;
        let mut block_size = 0;
        unsafe {
            (self.cuOccupancyMaxPotentialBlockSize)(&mut min_grid_size, &mut block_size, function.as_ptr(), None, 0, 0)
        }
        .check(ErrorStatus::OccupancyQuery)?;
        Ok(u32::try_from(block_size).unwrap_or(0))
    }

    pub(super) fn launch_kernel(
        &self,
        function: NativeHandle,
        grid: [u32; 3],
        block: [u32; 3],
        stream: NativeHandle,
        args: &[u8],
    ) -> Result<(), BackendError> {
        self.make_current()?;
        let mut args_size = args.len();
        let mut extra: [*mut c_void; 5] = [
            CU_LAUNCH_PARAM_BUFFER_POINTER as *mut c_void,
            args.as_ptr().cast_mut().cast(),
            CU_LAUNCH_PARAM_BUFFER_SIZE as *mut c_void,
            (&mut args_size as *mut usize).cast(),
            CU_LAUNCH_PARAM_END as *mut c_void,
        ];
        unsafe {
            (self.cuLaunchKernel)(
                function.as_ptr(),
                grid[0],
                grid[1],
                grid[2],
                block[0],
                block[1],
                block[2],
                0,
                stream.as_ptr(),
                ptr::null_mut(),
                extra.as_mut_ptr(),
            )
        }
        .check(ErrorStatus::KernelLaunch)
    }
}

impl Drop for CUDADriver {
    fn drop(&mut self) {
        let _ = unsafe { (self.cuDevicePrimaryCtxRelease)(self.device) };
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct CUctx_st {
    _unused: [u8; 0],
}
type CUcontext = *mut CUctx_st;
type CUdevice = c_int;
type CUdeviceptr = u64;
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct CUmod_st {
    _unused: [u8; 0],
}
type CUmodule = *mut CUmod_st;
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct CUfunc_st {
    _unused: [u8; 0],
}
type CUfunction = *mut CUfunc_st;
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct CUstream_st {
    _unused: [u8; 0],
}
type CUstream = *mut CUstream_st;
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct CUevent_st {
    _unused: [u8; 0],
}
type CUevent = *mut CUevent_st;

#[allow(unused, non_camel_case_types)]
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CUdevice_attribute {
    CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK = 1,
    CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X = 2,
    CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y = 3,
    CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Z = 4,
    CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X = 5,
    CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y = 6,
    CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Z = 7,
}

/// CUresult, kept as a raw code since the driver may return values newer than this list
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
struct CUDAStatus(c_uint);

impl CUDAStatus {
    const CUDA_SUCCESS: CUDAStatus = CUDAStatus(0);
    const CUDA_ERROR_NOT_READY: CUDAStatus = CUDAStatus(600);

    fn name(self) -> &'static str {
        match self.0 {
            0 => "CUDA_SUCCESS",
            1 => "CUDA_ERROR_INVALID_VALUE",
            2 => "CUDA_ERROR_OUT_OF_MEMORY",
            3 => "CUDA_ERROR_NOT_INITIALIZED",
            4 => "CUDA_ERROR_DEINITIALIZED",
            100 => "CUDA_ERROR_NO_DEVICE",
            101 => "CUDA_ERROR_INVALID_DEVICE",
            200 => "CUDA_ERROR_INVALID_IMAGE",
            201 => "CUDA_ERROR_INVALID_CONTEXT",
            209 => "CUDA_ERROR_NO_BINARY_FOR_GPU",
            218 => "CUDA_ERROR_INVALID_PTX",
            221 => "CUDA_ERROR_JIT_COMPILER_NOT_FOUND",
            300 => "CUDA_ERROR_INVALID_SOURCE",
            400 => "CUDA_ERROR_INVALID_HANDLE",
            500 => "CUDA_ERROR_NOT_FOUND",
            600 => "CUDA_ERROR_NOT_READY",
            700 => "CUDA_ERROR_ILLEGAL_ADDRESS",
            701 => "CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES",
            702 => "CUDA_ERROR_LAUNCH_TIMEOUT",
            719 => "CUDA_ERROR_LAUNCH_FAILED",
            999 => "CUDA_ERROR_UNKNOWN",
            _ => "CUDA_ERROR",
        }
    }

    fn check(self, status: ErrorStatus) -> Result<(), BackendError> {
        if self == Self::CUDA_SUCCESS {
            Ok(())
        } else {
            Err(BackendError { status, context: format!("{self:?}").into() })
        }
    }
}

impl std::fmt::Debug for CUDAStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}({})", self.name(), self.0))
    }
}
