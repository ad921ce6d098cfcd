//! The seam between the wrapper layer and the OpenCL C ABI.
//!
//! Wrappers never touch the C entry points directly. Every call goes through
//! the process-wide [`Runtime`] installed with [`install`]; with the `opencl`
//! feature enabled the default is [`ClRuntime`](crate::cl_runtime::ClRuntime).
//! Failures are reported as the raw status code, which the wrappers turn into
//! [`Error`](crate::Error)s.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{host_err, Result};
use crate::raw::*;

/// Raw outcome of a runtime call.
pub type RtResult<T> = std::result::Result<T, cl_int>;

/// Invoked once when an event reaches the status it was registered for.
pub type EventCallback = Box<dyn FnOnce(NativeHandle, cl_int) + Send>;
/// Invoked once when an asynchronous build, compile or link finishes.
pub type ProgramCallback = Box<dyn FnOnce(NativeHandle) + Send>;

/// Which `clGet*Info` family a query belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoQuery {
    Platform,
    Device,
    Context,
    Queue,
    Mem,
    Image,
    Sampler,
    Program,
    /// Secondary handle is the device.
    ProgramBuild,
    Kernel,
    /// Secondary handle is the device.
    KernelWorkGroup,
    /// Secondary handle carries the argument index.
    KernelArg,
    /// Secondary handle is the device, input is the local work size.
    KernelSubGroup,
    Event,
    EventProfiling,
}

/// Version-agnostic image description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageDesc {
    pub image_type: cl_mem_object_type,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub array_size: usize,
    pub row_pitch: usize,
    pub slice_pitch: usize,
    /// Backing buffer of 1D buffer images.
    pub buffer: NativeHandle,
}

/// Rectangular region of a rect transfer.
///
/// For reads the buffer is the source and host memory the destination; for
/// writes host memory is the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub src_origin: [usize; 3],
    pub dst_origin: [usize; 3],
    pub region: [usize; 3],
    pub src_row_pitch: usize,
    pub src_slice_pitch: usize,
    pub dst_row_pitch: usize,
    pub dst_slice_pitch: usize,
}

/// Entry points of an OpenCL implementation.
///
/// Methods taking raw host pointers are `unsafe`: the pointer must stay
/// valid for the whole transfer, which for non-blocking calls lasts until
/// the returned event completes.
pub trait Runtime: Send + Sync {
    fn platform_ids(&self) -> RtResult<Vec<NativeHandle>>;
    /// Empty when the platform has no device of the requested type.
    fn device_ids(&self, platform: NativeHandle, ty: cl_device_type) -> RtResult<Vec<NativeHandle>>;

    /// One half of the two-call info protocol. With `out == None` only the
    /// size of the value is returned; otherwise the value is written into
    /// `out`, which must be at least that large.
    fn info(
        &self,
        query: InfoQuery,
        handle: NativeHandle,
        secondary: NativeHandle,
        param: cl_uint,
        input: &[u8],
        out: Option<&mut [u8]>,
    ) -> RtResult<usize>;

    fn retain(&self, class: Class, handle: NativeHandle) -> RtResult<()>;
    fn release(&self, class: Class, handle: NativeHandle) -> RtResult<()>;

    fn create_sub_devices(
        &self,
        device: NativeHandle,
        props: &[cl_device_partition_property],
    ) -> RtResult<Vec<NativeHandle>>;

    /// `props` is zero terminated.
    fn create_context(
        &self,
        props: &[cl_context_properties],
        devices: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    fn supported_image_formats(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        image_type: cl_mem_object_type,
    ) -> RtResult<Vec<ImageFormat>>;

    fn create_command_queue(
        &self,
        context: NativeHandle,
        device: NativeHandle,
        props: cl_command_queue_properties,
    ) -> RtResult<NativeHandle>;
    /// `props` is zero terminated.
    fn create_command_queue_with_properties(
        &self,
        context: NativeHandle,
        device: NativeHandle,
        props: &[cl_queue_properties],
    ) -> RtResult<NativeHandle>;
    fn flush(&self, queue: NativeHandle) -> RtResult<()>;
    fn finish(&self, queue: NativeHandle) -> RtResult<()>;
    fn enqueue_marker(&self, queue: NativeHandle, wait: &[NativeHandle]) -> RtResult<NativeHandle>;
    fn enqueue_barrier(&self, queue: NativeHandle, wait: &[NativeHandle]) -> RtResult<NativeHandle>;

    unsafe fn create_buffer(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        size: usize,
        host_ptr: *mut c_void,
    ) -> RtResult<NativeHandle>;
    fn create_sub_buffer(
        &self,
        buffer: NativeHandle,
        flags: cl_mem_flags,
        origin: usize,
        size: usize,
    ) -> RtResult<NativeHandle>;
    unsafe fn create_image(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        format: &ImageFormat,
        desc: &ImageDesc,
        host_ptr: *mut c_void,
    ) -> RtResult<NativeHandle>;
    unsafe fn create_image_2d(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        format: &ImageFormat,
        desc: &ImageDesc,
        host_ptr: *mut c_void,
    ) -> RtResult<NativeHandle>;
    unsafe fn create_image_3d(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        format: &ImageFormat,
        desc: &ImageDesc,
        host_ptr: *mut c_void,
    ) -> RtResult<NativeHandle>;

    unsafe fn enqueue_read_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        blocking: bool,
        offset: usize,
        size: usize,
        ptr: *mut c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    unsafe fn enqueue_write_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        blocking: bool,
        offset: usize,
        size: usize,
        ptr: *const c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    fn enqueue_copy_buffer(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    unsafe fn enqueue_map_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        blocking: bool,
        flags: cl_map_flags,
        offset: usize,
        size: usize,
        wait: &[NativeHandle],
    ) -> RtResult<(*mut c_void, NativeHandle)>;
    unsafe fn enqueue_unmap(
        &self,
        queue: NativeHandle,
        mem: NativeHandle,
        mapped: *mut c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    fn enqueue_fill_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        pattern: &[u8],
        offset: usize,
        size: usize,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    unsafe fn enqueue_read_buffer_rect(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        blocking: bool,
        rect: &Rect,
        ptr: *mut c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    unsafe fn enqueue_write_buffer_rect(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        blocking: bool,
        rect: &Rect,
        ptr: *const c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    fn enqueue_copy_buffer_rect(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        rect: &Rect,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    fn enqueue_copy_buffer_to_image(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        src_offset: usize,
        dst_origin: [usize; 3],
        region: [usize; 3],
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    fn enqueue_copy_image_to_buffer(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        src_origin: [usize; 3],
        region: [usize; 3],
        dst_offset: usize,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    #[allow(clippy::too_many_arguments)]
    fn enqueue_copy_image(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        src_origin: [usize; 3],
        dst_origin: [usize; 3],
        region: [usize; 3],
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    /// `color` holds four floats, signed or unsigned integers, matching the
    /// channel data type of the image.
    fn enqueue_fill_image(
        &self,
        queue: NativeHandle,
        image: NativeHandle,
        color: &[u8; 16],
        origin: [usize; 3],
        region: [usize; 3],
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    /// Returns the mapped pointer, its row and slice pitch, and the event.
    #[allow(clippy::too_many_arguments)]
    unsafe fn enqueue_map_image(
        &self,
        queue: NativeHandle,
        image: NativeHandle,
        blocking: bool,
        flags: cl_map_flags,
        origin: [usize; 3],
        region: [usize; 3],
        wait: &[NativeHandle],
    ) -> RtResult<(*mut c_void, usize, usize, NativeHandle)>;
    #[allow(clippy::too_many_arguments)]
    unsafe fn enqueue_read_image(
        &self,
        queue: NativeHandle,
        image: NativeHandle,
        blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        row_pitch: usize,
        slice_pitch: usize,
        ptr: *mut c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;
    #[allow(clippy::too_many_arguments)]
    unsafe fn enqueue_write_image(
        &self,
        queue: NativeHandle,
        image: NativeHandle,
        blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        row_pitch: usize,
        slice_pitch: usize,
        ptr: *const c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;

    fn create_sampler(
        &self,
        context: NativeHandle,
        normalized_coords: bool,
        addressing: cl_addressing_mode,
        filter: cl_filter_mode,
    ) -> RtResult<NativeHandle>;
    /// `props` is zero terminated.
    fn create_sampler_with_properties(
        &self,
        context: NativeHandle,
        props: &[cl_sampler_properties],
    ) -> RtResult<NativeHandle>;

    fn create_program_with_source(&self, context: NativeHandle, sources: &[&str]) -> RtResult<NativeHandle>;
    /// Returns the program and the per-device load status. The status is
    /// reported on failure too; it is meaningless when the call rejected its
    /// arguments before looking at the binaries.
    fn create_program_with_binary(
        &self,
        context: NativeHandle,
        devices: &[NativeHandle],
        binaries: &[&[u8]],
    ) -> (RtResult<NativeHandle>, Vec<cl_int>);
    fn create_program_with_built_in_kernels(
        &self,
        context: NativeHandle,
        devices: &[NativeHandle],
        names: &str,
    ) -> RtResult<NativeHandle>;
    fn build_program(
        &self,
        program: NativeHandle,
        devices: &[NativeHandle],
        options: &str,
        notify: Option<ProgramCallback>,
    ) -> RtResult<()>;
    fn compile_program(
        &self,
        program: NativeHandle,
        devices: &[NativeHandle],
        options: &str,
        headers: &[(NativeHandle, &str)],
        notify: Option<ProgramCallback>,
    ) -> RtResult<()>;
    /// Returns the link status and the linked program. A failed link can
    /// still produce a program, which holds the link log; the handle is
    /// `NULL` when no program was created.
    fn link_program(
        &self,
        context: NativeHandle,
        devices: &[NativeHandle],
        options: &str,
        inputs: &[NativeHandle],
        notify: Option<ProgramCallback>,
    ) -> (RtResult<()>, NativeHandle);
    /// Fetches `CL_PROGRAM_BINARIES`; `sizes` comes from
    /// `CL_PROGRAM_BINARY_SIZES`, in program device order.
    fn program_binaries(&self, program: NativeHandle, sizes: &[usize]) -> RtResult<Vec<Vec<u8>>>;

    fn create_kernel(&self, program: NativeHandle, name: &str) -> RtResult<NativeHandle>;
    /// `value == None` passes a null pointer (local memory arguments).
    fn set_kernel_arg(
        &self,
        kernel: NativeHandle,
        index: cl_uint,
        size: usize,
        value: Option<&[u8]>,
    ) -> RtResult<()>;
    fn enqueue_ndrange_kernel(
        &self,
        queue: NativeHandle,
        kernel: NativeHandle,
        offset: Option<&[usize]>,
        global: &[usize],
        local: Option<&[usize]>,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle>;

    fn wait_for_events(&self, events: &[NativeHandle]) -> RtResult<()>;
    fn set_event_callback(
        &self,
        event: NativeHandle,
        exec_type: cl_int,
        callback: EventCallback,
    ) -> RtResult<()>;
    fn create_user_event(&self, context: NativeHandle) -> RtResult<NativeHandle>;
    fn set_user_event_status(&self, event: NativeHandle, status: cl_int) -> RtResult<()>;
}

static RUNTIME: Lazy<RwLock<Option<Arc<dyn Runtime>>>> = Lazy::new(|| RwLock::new(default_runtime()));

#[cfg(feature = "opencl")]
fn default_runtime() -> Option<Arc<dyn Runtime>> {
    Some(Arc::new(crate::cl_runtime::ClRuntime))
}

#[cfg(not(feature = "opencl"))]
fn default_runtime() -> Option<Arc<dyn Runtime>> {
    None
}

/// Makes `rt` the runtime used by every wrapper created afterwards. Existing
/// wrappers keep the runtime they were created with.
pub fn install(rt: Arc<dyn Runtime>) {
    *RUNTIME.write() = Some(rt);
}

/// The currently installed runtime.
pub fn current() -> Result<Arc<dyn Runtime>> {
    match RUNTIME.read().as_ref() {
        Some(rt) => Ok(rt.clone()),
        None => Err(host_err!(
            Other,
            "no OpenCL runtime installed (enable the `opencl` feature or call runtime::install)"
        )),
    }
}
