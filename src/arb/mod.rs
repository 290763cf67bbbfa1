//! Accelerator Runtime Binding (ARB).
//!
//! A thin, safe wrapper around the OpenCL 1.2 C ABI declared in [`sys`]:
//! platform/device enumeration, context and in-order queue creation,
//! program compilation, buffer allocation (device-local and host-mappable
//! "pinned" buffers), and enqueue of transfers and kernel launches.
//!
//! Every owned handle is released on `Drop`, the same discipline
//! `crate::xsk::SocketFd` and `crate::xsk::XskRingProd`/`XskRingCons` use
//! for their file descriptors and mmaps.
pub mod sys;

#[cfg(test)]
pub mod mock;

use crate::error::ClError;
use std::ffi::CString;
use std::os::raw::c_void;
use std::ptr;

fn check(code: sys::cl_int) -> Result<(), ClError> {
    if code == sys::CL_SUCCESS {
        Ok(())
    } else {
        Err(ClError(code))
    }
}

/// Requested access mode for a device or pinned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl BufferMode {
    fn cl_flags(self) -> sys::cl_mem_flags {
        match self {
            BufferMode::ReadOnly => sys::CL_MEM_READ_ONLY,
            BufferMode::WriteOnly => sys::CL_MEM_WRITE_ONLY,
            BufferMode::ReadWrite => sys::CL_MEM_READ_WRITE,
        }
    }

    fn map_flags(self) -> sys::cl_map_flags {
        match self {
            BufferMode::ReadOnly => sys::CL_MAP_WRITE,
            BufferMode::WriteOnly => sys::CL_MAP_READ,
            BufferMode::ReadWrite => sys::CL_MAP_READ | sys::CL_MAP_WRITE,
        }
    }
}

/// The operations [`crate::pipeline::Pipeline`] and [`crate::engine::Engine`]
/// need from an accelerator, abstracted so the scheduling logic in those
/// modules can be unit-tested against [`mock::MockOps`] without a physical
/// device. [`Arb`] is the production implementation.
pub trait DeviceOps {
    type Buffer;
    type Kernel;
    type HostBuffer: AsRef<[u8]> + AsMut<[u8]>;

    fn alloc_device(&self, mode: BufferMode, size: usize) -> Result<Self::Buffer, ClError>;
    fn alloc_pinned(&self, mode: BufferMode, size: usize) -> Result<Self::HostBuffer, ClError>;
    fn make_kernel(&self, name: &str) -> Result<Self::Kernel, ClError>;
    fn set_arg_mem(&self, kernel: &Self::Kernel, index: u32, buf: &Self::Buffer) -> Result<(), ClError>;
    fn set_arg_local(&self, kernel: &Self::Kernel, index: u32, size: usize) -> Result<(), ClError>;
    fn set_arg_u32(&self, kernel: &Self::Kernel, index: u32, val: u32) -> Result<(), ClError>;
    fn enqueue_write(&self, buf: &Self::Buffer, host: &[u8], blocking: bool) -> Result<(), ClError>;
    fn enqueue_read(&self, buf: &Self::Buffer, host: &mut [u8], blocking: bool) -> Result<(), ClError>;
    fn enqueue_launch(&self, kernel: &Self::Kernel, total_threads: usize, local_size: usize) -> Result<(), ClError>;
    /// Blocks until the queue drains (matches `spec.md`'s `flush`, which
    /// is `clFinish` in OpenCL terms, not the non-blocking `clFlush`).
    fn flush(&self) -> Result<(), ClError>;
    fn preferred_workgroup_size(&self, kernel: &Self::Kernel) -> Result<usize, ClError>;
    /// Stand up a fresh device binding, compiling `source` for device
    /// `device_id`. Used by `crate::engine::Engine::configure` so it can
    /// remain generic over [`Arb`] (production) and `mock::MockOps` (tests).
    fn open(device_id: usize, source: &str) -> Result<Self, crate::error::EngineError>
    where
        Self: Sized;
}

/// An enumerated device: its index (stable only for the lifetime of the
/// enumeration call) and display name.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
}

/// List all devices on the first platform, in enumeration order.
pub fn list_devices() -> Result<Vec<DeviceInfo>, ClError> {
    let ids = enumerate_device_ids()?;
    ids.iter()
        .enumerate()
        .map(|(index, &id)| Ok(DeviceInfo { index, name: device_name(id)? }))
        .collect()
}

fn first_platform() -> Result<sys::cl_platform_id, ClError> {
    let mut platform: sys::cl_platform_id = ptr::null_mut();
    let code = unsafe { sys::clGetPlatformIDs(1, &mut platform, ptr::null_mut()) };
    check(code)?;
    Ok(platform)
}

fn enumerate_device_ids() -> Result<Vec<sys::cl_device_id>, ClError> {
    let platform = first_platform()?;
    let mut count: sys::cl_uint = 0;
    let code = unsafe {
        sys::clGetDeviceIDs(platform, sys::CL_DEVICE_TYPE_ALL, 0, ptr::null_mut(), &mut count)
    };
    check(code)?;

    let mut ids = vec![ptr::null_mut(); count as usize];
    let code = unsafe {
        sys::clGetDeviceIDs(
            platform,
            sys::CL_DEVICE_TYPE_ALL,
            count,
            ids.as_mut_ptr(),
            ptr::null_mut(),
        )
    };
    check(code)?;
    Ok(ids)
}

fn device_name(id: sys::cl_device_id) -> Result<String, ClError> {
    let mut len: usize = 0;
    let code = unsafe {
        sys::clGetDeviceInfo(id, sys::CL_DEVICE_NAME, 0, ptr::null_mut(), &mut len)
    };
    check(code)?;

    let mut buf = vec![0u8; len];
    let code = unsafe {
        sys::clGetDeviceInfo(
            id,
            sys::CL_DEVICE_NAME,
            buf.len(),
            buf.as_mut_ptr() as *mut c_void,
            ptr::null_mut(),
        )
    };
    check(code)?;

    // Trim the trailing NUL the driver includes in the reported length.
    while buf.last() == Some(&0) {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// The compiled program and in-order queue shared by both pipelines of an
/// [`crate::engine::Engine`]. Owns the OpenCL context, queue, and program;
/// released in that order on `Drop`.
pub struct Arb {
    context: sys::cl_context,
    queue: sys::cl_command_queue,
    program: sys::cl_program,
    device: sys::cl_device_id,
}

impl Arb {
    /// Select device `index` (by enumeration order, as with `list_devices`),
    /// create a context and a single in-order command queue, and compile
    /// `source`.
    pub fn new(index: usize, source: &str) -> Result<Self, EngineSetupError> {
        let ids = enumerate_device_ids().map_err(EngineSetupError::Enumerate)?;
        let device = *ids
            .get(index)
            .ok_or(EngineSetupError::NoSuchDevice(index))?;

        let mut errcode: sys::cl_int = 0;
        let context = unsafe {
            sys::clCreateContext(ptr::null(), 1, &device, None, ptr::null_mut(), &mut errcode)
        };
        check(errcode).map_err(EngineSetupError::Context)?;

        // No properties requested: the default in-order queue.
        let queue = unsafe { sys::clCreateCommandQueue(context, device, 0, &mut errcode) };
        if errcode != sys::CL_SUCCESS {
            unsafe { sys::clReleaseContext(context) };
            return Err(EngineSetupError::Context(ClError(errcode)));
        }

        let program = match Self::build(context, device, source) {
            Ok(program) => program,
            Err(err) => {
                unsafe {
                    sys::clReleaseCommandQueue(queue);
                    sys::clReleaseContext(context);
                }
                return Err(err);
            }
        };

        Ok(Arb { context, queue, program, device })
    }

    fn build(
        context: sys::cl_context,
        device: sys::cl_device_id,
        source: &str,
    ) -> Result<sys::cl_program, EngineSetupError> {
        let c_source = CString::new(source).expect("kernel source must not contain NUL bytes");
        let ptrs = [c_source.as_ptr()];
        let lens = [source.len()];

        let mut errcode: sys::cl_int = 0;
        let program = unsafe {
            sys::clCreateProgramWithSource(
                context,
                1,
                ptrs.as_ptr(),
                lens.as_ptr(),
                &mut errcode,
            )
        };
        check(errcode).map_err(EngineSetupError::Context)?;

        let build_code =
            unsafe { sys::clBuildProgram(program, 1, &device, ptr::null(), None, ptr::null_mut()) };
        if build_code != sys::CL_SUCCESS {
            let log = Self::build_log(program, device).unwrap_or_default();
            unsafe { sys::clReleaseProgram(program) };
            return Err(EngineSetupError::Compile(log));
        }

        Ok(program)
    }

    fn build_log(program: sys::cl_program, device: sys::cl_device_id) -> Result<String, ClError> {
        let mut len: usize = 0;
        let code = unsafe {
            sys::clGetProgramBuildInfo(
                program,
                device,
                sys::CL_PROGRAM_BUILD_LOG,
                0,
                ptr::null_mut(),
                &mut len,
            )
        };
        check(code)?;

        let mut buf = vec![0u8; len];
        let code = unsafe {
            sys::clGetProgramBuildInfo(
                program,
                device,
                sys::CL_PROGRAM_BUILD_LOG,
                buf.len(),
                buf.as_mut_ptr() as *mut c_void,
                ptr::null_mut(),
            )
        };
        check(code)?;
        while buf.last() == Some(&0) {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl Drop for Arb {
    fn drop(&mut self) {
        unsafe {
            sys::clReleaseProgram(self.program);
            sys::clReleaseCommandQueue(self.queue);
            sys::clReleaseContext(self.context);
        }
    }
}

/// Errors that can occur while standing up a fresh [`Arb`]; all are fatal
/// to the process per the protocol design's configuration error class.
#[derive(Debug, thiserror::Error)]
pub enum EngineSetupError {
    #[error("failed to enumerate devices: {0}")]
    Enumerate(ClError),
    #[error("no device at index {0}")]
    NoSuchDevice(usize),
    #[error("failed to create context or queue: {0}")]
    Context(ClError),
    #[error("kernel program failed to build:\n{0}")]
    Compile(String),
}

/// A device-resident buffer. Released on `Drop`.
pub struct Buffer {
    raw: sys::cl_mem,
    size: usize,
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { sys::clReleaseMemObject(self.raw) };
    }
}

/// An OpenCL kernel instance with its arguments bound by `Pipeline::new`.
pub struct KernelHandle {
    raw: sys::cl_kernel,
}

impl Drop for KernelHandle {
    fn drop(&mut self) {
        unsafe { sys::clReleaseKernel(self.raw) };
    }
}

/// A host-mappable ("pinned") buffer: a `CL_MEM_ALLOC_HOST_PTR` buffer kept
/// mapped for the lifetime of this handle, exposed as an ordinary byte
/// slice. Unmapped and released on `Drop`, mirroring how
/// `crate::xsk::ring::XskRing::map`'s mmap is torn down by
/// `Drop for XskRingProd`/`XskRingCons`.
pub struct MappedHost {
    queue: sys::cl_command_queue,
    mem: sys::cl_mem,
    ptr: ptr::NonNull<u8>,
    len: usize,
}

// Safety: `ptr` addresses memory owned exclusively by this handle for its
// lifetime; the OpenCL driver does not touch it concurrently unless a
// transfer referencing `mem` is in flight, which callers must avoid (see
// the pipeline latch discipline).
unsafe impl Send for MappedHost {}

impl AsRef<[u8]> for MappedHost {
    fn as_ref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl AsMut<[u8]> for MappedHost {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedHost {
    fn drop(&mut self) {
        unsafe {
            sys::clEnqueueUnmapMemObject(
                self.queue,
                self.mem,
                self.ptr.as_ptr() as *mut c_void,
                0,
                ptr::null(),
                ptr::null_mut(),
            );
            sys::clFinish(self.queue);
            sys::clReleaseMemObject(self.mem);
        }
    }
}

impl DeviceOps for Arb {
    type Buffer = Buffer;
    type Kernel = KernelHandle;
    type HostBuffer = MappedHost;

    fn alloc_device(&self, mode: BufferMode, size: usize) -> Result<Self::Buffer, ClError> {
        let mut errcode: sys::cl_int = 0;
        let raw = unsafe {
            sys::clCreateBuffer(self.context, mode.cl_flags(), size, ptr::null_mut(), &mut errcode)
        };
        check(errcode)?;
        Ok(Buffer { raw, size })
    }

    fn alloc_pinned(&self, mode: BufferMode, size: usize) -> Result<Self::HostBuffer, ClError> {
        let mut errcode: sys::cl_int = 0;
        let mem = unsafe {
            sys::clCreateBuffer(
                self.context,
                mode.cl_flags() | sys::CL_MEM_ALLOC_HOST_PTR,
                size,
                ptr::null_mut(),
                &mut errcode,
            )
        };
        check(errcode)?;

        let mut map_errcode: sys::cl_int = 0;
        let ptr = unsafe {
            sys::clEnqueueMapBuffer(
                self.queue,
                mem,
                sys::CL_TRUE,
                mode.map_flags(),
                0,
                size,
                0,
                ptr::null(),
                ptr::null_mut(),
                &mut map_errcode,
            )
        };
        if map_errcode != sys::CL_SUCCESS {
            unsafe { sys::clReleaseMemObject(mem) };
            return Err(ClError(map_errcode));
        }

        let ptr = ptr::NonNull::new(ptr as *mut u8).expect("mapped pointer must not be null on success");
        Ok(MappedHost { queue: self.queue, mem, ptr, len: size })
    }

    fn make_kernel(&self, name: &str) -> Result<Self::Kernel, ClError> {
        let c_name = CString::new(name).expect("kernel name must not contain NUL bytes");
        let mut errcode: sys::cl_int = 0;
        let raw = unsafe { sys::clCreateKernel(self.program, c_name.as_ptr(), &mut errcode) };
        check(errcode)?;
        Ok(KernelHandle { raw })
    }

    fn set_arg_mem(&self, kernel: &Self::Kernel, index: u32, buf: &Self::Buffer) -> Result<(), ClError> {
        let code = unsafe {
            sys::clSetKernelArg(
                kernel.raw,
                index,
                std::mem::size_of::<sys::cl_mem>(),
                &buf.raw as *const _ as *const c_void,
            )
        };
        check(code)
    }

    fn set_arg_local(&self, kernel: &Self::Kernel, index: u32, size: usize) -> Result<(), ClError> {
        let code = unsafe { sys::clSetKernelArg(kernel.raw, index, size, ptr::null()) };
        check(code)
    }

    fn set_arg_u32(&self, kernel: &Self::Kernel, index: u32, val: u32) -> Result<(), ClError> {
        let code = unsafe {
            sys::clSetKernelArg(
                kernel.raw,
                index,
                std::mem::size_of::<u32>(),
                &val as *const _ as *const c_void,
            )
        };
        check(code)
    }

    fn enqueue_write(&self, buf: &Self::Buffer, host: &[u8], blocking: bool) -> Result<(), ClError> {
        debug_assert!(host.len() <= buf.size);
        let code = unsafe {
            sys::clEnqueueWriteBuffer(
                self.queue,
                buf.raw,
                if blocking { sys::CL_TRUE } else { sys::CL_FALSE },
                0,
                host.len(),
                host.as_ptr() as *const c_void,
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        check(code)
    }

    fn enqueue_read(&self, buf: &Self::Buffer, host: &mut [u8], blocking: bool) -> Result<(), ClError> {
        debug_assert!(host.len() <= buf.size);
        let code = unsafe {
            sys::clEnqueueReadBuffer(
                self.queue,
                buf.raw,
                if blocking { sys::CL_TRUE } else { sys::CL_FALSE },
                0,
                host.len(),
                host.as_mut_ptr() as *mut c_void,
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        check(code)
    }

    fn enqueue_launch(&self, kernel: &Self::Kernel, total_threads: usize, local_size: usize) -> Result<(), ClError> {
        let global = [total_threads];
        let local = [local_size];
        let code = unsafe {
            sys::clEnqueueNDRangeKernel(
                self.queue,
                kernel.raw,
                1,
                ptr::null(),
                global.as_ptr(),
                local.as_ptr(),
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        check(code)
    }

    fn flush(&self) -> Result<(), ClError> {
        check(unsafe { sys::clFinish(self.queue) })
    }

    fn preferred_workgroup_size(&self, kernel: &Self::Kernel) -> Result<usize, ClError> {
        let mut size: usize = 0;
        let code = unsafe {
            sys::clGetKernelWorkGroupInfo(
                kernel.raw,
                self.device,
                sys::CL_KERNEL_WORK_GROUP_SIZE,
                std::mem::size_of::<usize>(),
                &mut size as *mut _ as *mut c_void,
                ptr::null_mut(),
            )
        };
        check(code)?;
        Ok(size)
    }

    fn open(device_id: usize, source: &str) -> Result<Self, crate::error::EngineError> {
        Arb::new(device_id, source).map_err(Into::into)
    }
}

impl From<EngineSetupError> for crate::error::EngineError {
    fn from(err: EngineSetupError) -> Self {
        use crate::error::EngineError;
        match err {
            EngineSetupError::Enumerate(e) => EngineError::DeviceEnumeration(e),
            EngineSetupError::NoSuchDevice(i) => EngineError::NoSuchDevice(i),
            EngineSetupError::Context(e) => EngineError::ContextCreate(e),
            EngineSetupError::Compile(log) => EngineError::CompileFailure(log),
        }
    }
}
