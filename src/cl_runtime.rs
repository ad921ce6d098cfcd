//! [`Runtime`] over the system OpenCL ICD loader, through `cl-sys`.

use core::ptr::{null, null_mut};

use cl_sys::{
    self, clBuildProgram, clCompileProgram, clCreateBuffer, clCreateCommandQueue,
    clCreateCommandQueueWithProperties, clCreateContext, clCreateImage, clCreateImage2D,
    clCreateImage3D, clCreateKernel, clCreateProgramWithBinary, clCreateProgramWithBuiltInKernels,
    clCreateProgramWithSource, clCreateSampler, clCreateSamplerWithProperties, clCreateSubBuffer,
    clCreateSubDevices, clCreateUserEvent, clEnqueueBarrierWithWaitList, clEnqueueCopyBuffer,
    clEnqueueCopyBufferRect, clEnqueueCopyBufferToImage, clEnqueueCopyImage, clEnqueueCopyImageToBuffer,
    clEnqueueFillBuffer, clEnqueueFillImage, clEnqueueMapBuffer, clEnqueueMapImage, clEnqueueMarkerWithWaitList, clEnqueueNDRangeKernel,
    clEnqueueReadBuffer, clEnqueueReadBufferRect, clEnqueueReadImage, clEnqueueUnmapMemObject,
    clEnqueueWriteBuffer, clEnqueueWriteBufferRect, clEnqueueWriteImage, clFinish, clFlush,
    clGetCommandQueueInfo, clGetContextInfo, clGetDeviceIDs, clGetDeviceInfo, clGetEventInfo,
    clGetEventProfilingInfo, clGetImageInfo, clGetKernelArgInfo, clGetKernelInfo,
    clGetKernelSubGroupInfo, clGetKernelWorkGroupInfo, clGetMemObjectInfo, clGetPlatformIDs,
    clGetPlatformInfo, clGetProgramBuildInfo, clGetProgramInfo, clGetSamplerInfo,
    clGetSupportedImageFormats, clLinkProgram, clReleaseCommandQueue, clReleaseContext,
    clReleaseDevice, clReleaseEvent, clReleaseKernel, clReleaseMemObject, clReleaseProgram,
    clReleaseSampler, clRetainCommandQueue, clRetainContext, clRetainDevice, clRetainEvent,
    clRetainKernel, clRetainMemObject, clRetainProgram, clRetainSampler, clSetEventCallback,
    clSetKernelArg, clSetUserEventStatus, clWaitForEvents, cl_buffer_region, cl_event,
    cl_image_desc, cl_image_format, cl_program,
};

use crate::raw::*;
use crate::runtime::{
    EventCallback, ImageDesc, InfoQuery, ProgramCallback, Rect, RtResult, Runtime,
};

/// The system OpenCL implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClRuntime;

fn check(ret_code: cl_int) -> RtResult<()> {
    match ret_code {
        cl_sys::CL_SUCCESS => Ok(()),
        err => Err(err),
    }
}

fn raw_list(handles: &[NativeHandle]) -> Vec<*mut c_void> {
    handles.iter().map(|h| h.as_ptr()).collect()
}

/// Count and pointer of a wait list as the C ABI wants them.
fn wait_args(wait: &[*mut c_void]) -> (cl_uint, *const cl_event) {
    if wait.is_empty() {
        (0, null())
    } else {
        (wait.len() as cl_uint, wait.as_ptr())
    }
}

fn nul_terminated(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    bytes
}

fn native_format(format: &ImageFormat) -> cl_image_format {
    cl_image_format {
        image_channel_order: format.image_channel_order,
        image_channel_data_type: format.image_channel_data_type,
    }
}

extern "C" fn event_invoker(event: cl_event, status: cl_int, user_data: *mut c_void) {
    let callback = unsafe { Box::from_raw(user_data.cast::<EventCallback>()) };
    callback(NativeHandle::from_ptr(event), status);
}

extern "C" fn program_invoker(program: cl_program, user_data: *mut c_void) {
    let callback = unsafe { Box::from_raw(user_data.cast::<ProgramCallback>()) };
    callback(NativeHandle::from_ptr(program));
}

type ProgramNotify = Option<extern "C" fn(cl_program, *mut c_void)>;

fn program_notify(notify: Option<ProgramCallback>) -> (ProgramNotify, *mut c_void) {
    match notify {
        Some(cb) => (Some(program_invoker), Box::into_raw(Box::new(cb)).cast()),
        None => (None, null_mut()),
    }
}

/// Takes back the callback of a build, compile or link call that failed.
/// Only argument errors (`CL_INVALID_*`) guarantee the runtime never called
/// it; after any other failure it may already have run and freed itself.
unsafe fn reclaim_program_notify(ret_code: cl_int, user_data: *mut c_void) {
    if !user_data.is_null() && ret_code <= cl_sys::CL_INVALID_VALUE {
        drop(Box::from_raw(user_data.cast::<ProgramCallback>()));
    }
}

impl Runtime for ClRuntime {
    fn platform_ids(&self) -> RtResult<Vec<NativeHandle>> { unsafe {
        let mut count = 0;
        let ret_code = clGetPlatformIDs(0, null_mut(), &mut count);
        match ret_code {
            cl_sys::CL_SUCCESS => (),
            cl_sys::CL_PLATFORM_NOT_FOUND_KHR => return Ok(Vec::new()),
            err => return Err(err),
        }
        let mut ids = vec![null_mut(); count as usize];
        check(clGetPlatformIDs(count, ids.as_mut_ptr(), null_mut()))?;
        Ok(ids.into_iter().map(NativeHandle::from_ptr).collect())
    } }

    fn device_ids(&self, platform: NativeHandle, ty: cl_device_type) -> RtResult<Vec<NativeHandle>> { unsafe {
        let mut count = 0;
        let ret_code = clGetDeviceIDs(platform.as_ptr(), ty, 0, null_mut(), &mut count);
        match ret_code {
            cl_sys::CL_SUCCESS => (),
            cl_sys::CL_DEVICE_NOT_FOUND => return Ok(Vec::new()),
            err => return Err(err),
        }
        let mut ids = vec![null_mut(); count as usize];
        check(clGetDeviceIDs(platform.as_ptr(), ty, count, ids.as_mut_ptr(), null_mut()))?;
        Ok(ids.into_iter().map(NativeHandle::from_ptr).collect())
    } }

    fn info(
        &self,
        query: InfoQuery,
        handle: NativeHandle,
        secondary: NativeHandle,
        param: cl_uint,
        input: &[u8],
        out: Option<&mut [u8]>,
    ) -> RtResult<usize> { unsafe {
        let (size, value) = match out {
            Some(buf) => (buf.len(), buf.as_mut_ptr().cast::<c_void>()),
            None => (0, null_mut()),
        };
        let h = handle.as_ptr::<c_void>();
        let sec = secondary.as_ptr::<c_void>();
        let mut size_ret = 0;
        let ret_code = match query {
            InfoQuery::Platform => clGetPlatformInfo(h, param, size, value, &mut size_ret),
            InfoQuery::Device => clGetDeviceInfo(h, param, size, value, &mut size_ret),
            InfoQuery::Context => clGetContextInfo(h, param, size, value, &mut size_ret),
            InfoQuery::Queue => clGetCommandQueueInfo(h, param, size, value, &mut size_ret),
            InfoQuery::Mem => clGetMemObjectInfo(h, param, size, value, &mut size_ret),
            InfoQuery::Image => clGetImageInfo(h, param, size, value, &mut size_ret),
            InfoQuery::Sampler => clGetSamplerInfo(h, param, size, value, &mut size_ret),
            InfoQuery::Program => clGetProgramInfo(h, param, size, value, &mut size_ret),
            InfoQuery::ProgramBuild => {
                clGetProgramBuildInfo(h, sec, param, size, value, &mut size_ret)
            }
            InfoQuery::Kernel => clGetKernelInfo(h, param, size, value, &mut size_ret),
            InfoQuery::KernelWorkGroup => {
                clGetKernelWorkGroupInfo(h, sec, param, size, value, &mut size_ret)
            }
            InfoQuery::KernelArg => clGetKernelArgInfo(
                h,
                secondary.to_raw() as cl_uint,
                param,
                size,
                value,
                &mut size_ret,
            ),
            InfoQuery::KernelSubGroup => clGetKernelSubGroupInfo(
                h,
                sec,
                param,
                input.len(),
                input.as_ptr().cast(),
                size,
                value,
                &mut size_ret,
            ),
            InfoQuery::Event => clGetEventInfo(h, param, size, value, &mut size_ret),
            InfoQuery::EventProfiling => {
                clGetEventProfilingInfo(h, param, size, value, &mut size_ret)
            }
        };
        check(ret_code)?;
        Ok(size_ret)
    } }

    fn retain(&self, class: Class, handle: NativeHandle) -> RtResult<()> { unsafe {
        let h = handle.as_ptr::<c_void>();
        let ret_code = match class {
            // Platforms are not reference counted.
            Class::Platform => cl_sys::CL_SUCCESS,
            Class::Device => clRetainDevice(h),
            Class::Context => clRetainContext(h),
            Class::Queue => clRetainCommandQueue(h),
            Class::Buffer | Class::Image => clRetainMemObject(h),
            Class::Sampler => clRetainSampler(h),
            Class::Program => clRetainProgram(h),
            Class::Kernel => clRetainKernel(h),
            Class::Event => clRetainEvent(h),
        };
        check(ret_code)
    } }

    fn release(&self, class: Class, handle: NativeHandle) -> RtResult<()> { unsafe {
        let h = handle.as_ptr::<c_void>();
        let ret_code = match class {
            Class::Platform => cl_sys::CL_SUCCESS,
            Class::Device => clReleaseDevice(h),
            Class::Context => clReleaseContext(h),
            Class::Queue => clReleaseCommandQueue(h),
            Class::Buffer | Class::Image => clReleaseMemObject(h),
            Class::Sampler => clReleaseSampler(h),
            Class::Program => clReleaseProgram(h),
            Class::Kernel => clReleaseKernel(h),
            Class::Event => clReleaseEvent(h),
        };
        check(ret_code)
    } }

    fn create_sub_devices(
        &self,
        device: NativeHandle,
        props: &[cl_device_partition_property],
    ) -> RtResult<Vec<NativeHandle>> { unsafe {
        let mut count = 0;
        check(clCreateSubDevices(device.as_ptr(), props.as_ptr(), 0, null_mut(), &mut count))?;
        let mut ids = vec![null_mut(); count as usize];
        check(clCreateSubDevices(
            device.as_ptr(),
            props.as_ptr(),
            count,
            ids.as_mut_ptr(),
            null_mut(),
        ))?;
        Ok(ids.into_iter().map(NativeHandle::from_ptr).collect())
    } }

    fn create_context(
        &self,
        props: &[cl_context_properties],
        devices: &[NativeHandle],
    ) -> RtResult<NativeHandle> { unsafe {
        let devs = raw_list(devices);
        let props_ptr = if props.is_empty() { null() } else { props.as_ptr() };
        let mut ret_code = cl_sys::CL_SUCCESS;
        let ctx = clCreateContext(
            props_ptr,
            devs.len() as cl_uint,
            devs.as_ptr(),
            None,
            null_mut(),
            &mut ret_code,
        );
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(ctx))
    } }

    fn supported_image_formats(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        image_type: cl_mem_object_type,
    ) -> RtResult<Vec<ImageFormat>> { unsafe {
        let mut count = 0;
        check(clGetSupportedImageFormats(
            context.as_ptr(),
            flags,
            image_type,
            0,
            null_mut(),
            &mut count,
        ))?;
        let mut formats = Vec::with_capacity(count as usize);
        for _ in 0..count {
            formats.push(cl_image_format { image_channel_order: 0, image_channel_data_type: 0 });
        }
        check(clGetSupportedImageFormats(
            context.as_ptr(),
            flags,
            image_type,
            count,
            formats.as_mut_ptr(),
            null_mut(),
        ))?;
        Ok(formats
            .into_iter()
            .map(|f| ImageFormat {
                image_channel_order: f.image_channel_order,
                image_channel_data_type: f.image_channel_data_type,
            })
            .collect())
    } }

    fn create_command_queue(
        &self,
        context: NativeHandle,
        device: NativeHandle,
        props: cl_command_queue_properties,
    ) -> RtResult<NativeHandle> { unsafe {
        let mut ret_code = cl_sys::CL_SUCCESS;
        let q = clCreateCommandQueue(context.as_ptr(), device.as_ptr(), props, &mut ret_code);
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(q))
    } }

    fn create_command_queue_with_properties(
        &self,
        context: NativeHandle,
        device: NativeHandle,
        props: &[cl_queue_properties],
    ) -> RtResult<NativeHandle> { unsafe {
        let props_ptr = if props.is_empty() { null() } else { props.as_ptr() };
        let mut ret_code = cl_sys::CL_SUCCESS;
        let q = clCreateCommandQueueWithProperties(
            context.as_ptr(),
            device.as_ptr(),
            props_ptr,
            &mut ret_code,
        );
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(q))
    } }

    fn flush(&self, queue: NativeHandle) -> RtResult<()> {
        check(unsafe { clFlush(queue.as_ptr()) })
    }

    fn finish(&self, queue: NativeHandle) -> RtResult<()> {
        check(unsafe { clFinish(queue.as_ptr()) })
    }

    fn enqueue_marker(&self, queue: NativeHandle, wait: &[NativeHandle]) -> RtResult<NativeHandle> { unsafe {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueMarkerWithWaitList(queue.as_ptr(), n, list, &mut event))?;
        Ok(NativeHandle::from_ptr(event))
    } }

    fn enqueue_barrier(&self, queue: NativeHandle, wait: &[NativeHandle]) -> RtResult<NativeHandle> { unsafe {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueBarrierWithWaitList(queue.as_ptr(), n, list, &mut event))?;
        Ok(NativeHandle::from_ptr(event))
    } }

    unsafe fn create_buffer(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        size: usize,
        host_ptr: *mut c_void,
    ) -> RtResult<NativeHandle> {
        let mut ret_code = cl_sys::CL_SUCCESS;
        let mem = clCreateBuffer(context.as_ptr(), flags, size, host_ptr, &mut ret_code);
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(mem))
    }

    fn create_sub_buffer(
        &self,
        buffer: NativeHandle,
        flags: cl_mem_flags,
        origin: usize,
        size: usize,
    ) -> RtResult<NativeHandle> { unsafe {
        let region = cl_buffer_region { origin, size };
        let mut ret_code = cl_sys::CL_SUCCESS;
        let mem = clCreateSubBuffer(
            buffer.as_ptr(),
            flags,
            CL_BUFFER_CREATE_TYPE_REGION,
            (&region as *const cl_buffer_region).cast(),
            &mut ret_code,
        );
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(mem))
    } }

    unsafe fn create_image(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        format: &ImageFormat,
        desc: &ImageDesc,
        host_ptr: *mut c_void,
    ) -> RtResult<NativeHandle> {
        let fmt = native_format(format);
        let native_desc = cl_image_desc {
            image_type: desc.image_type,
            image_width: desc.width,
            image_height: desc.height,
            image_depth: desc.depth,
            image_array_size: desc.array_size,
            image_row_pitch: desc.row_pitch,
            image_slice_pitch: desc.slice_pitch,
            num_mip_levels: 0,
            num_samples: 0,
            buffer: desc.buffer.as_ptr(),
        };
        let mut ret_code = cl_sys::CL_SUCCESS;
        let mem = clCreateImage(context.as_ptr(), flags, &fmt, &native_desc, host_ptr, &mut ret_code);
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(mem))
    }

    unsafe fn create_image_2d(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        format: &ImageFormat,
        desc: &ImageDesc,
        host_ptr: *mut c_void,
    ) -> RtResult<NativeHandle> {
        let mut fmt = native_format(format);
        let mut ret_code = cl_sys::CL_SUCCESS;
        let mem = clCreateImage2D(
            context.as_ptr(),
            flags,
            &mut fmt,
            desc.width,
            desc.height,
            desc.row_pitch,
            host_ptr,
            &mut ret_code,
        );
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(mem))
    }

    unsafe fn create_image_3d(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        format: &ImageFormat,
        desc: &ImageDesc,
        host_ptr: *mut c_void,
    ) -> RtResult<NativeHandle> {
        let mut fmt = native_format(format);
        let mut ret_code = cl_sys::CL_SUCCESS;
        let mem = clCreateImage3D(
            context.as_ptr(),
            flags,
            &mut fmt,
            desc.width,
            desc.height,
            desc.depth,
            desc.row_pitch,
            desc.slice_pitch,
            host_ptr,
            &mut ret_code,
        );
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(mem))
    }

    unsafe fn enqueue_read_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        blocking: bool,
        offset: usize,
        size: usize,
        ptr: *mut c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueReadBuffer(
            queue.as_ptr(),
            buffer.as_ptr(),
            blocking as cl_bool,
            offset,
            size,
            ptr,
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    }

    unsafe fn enqueue_write_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        blocking: bool,
        offset: usize,
        size: usize,
        ptr: *const c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueWriteBuffer(
            queue.as_ptr(),
            buffer.as_ptr(),
            blocking as cl_bool,
            offset,
            size,
            ptr,
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    }

    fn enqueue_copy_buffer(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> { unsafe {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueCopyBuffer(
            queue.as_ptr(),
            src.as_ptr(),
            dst.as_ptr(),
            src_offset,
            dst_offset,
            size,
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    } }

    unsafe fn enqueue_map_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        blocking: bool,
        flags: cl_map_flags,
        offset: usize,
        size: usize,
        wait: &[NativeHandle],
    ) -> RtResult<(*mut c_void, NativeHandle)> {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        let mut ret_code = cl_sys::CL_SUCCESS;
        let mapped = clEnqueueMapBuffer(
            queue.as_ptr(),
            buffer.as_ptr(),
            blocking as cl_bool,
            flags,
            offset,
            size,
            n,
            list,
            &mut event,
            &mut ret_code,
        );
        check(ret_code)?;
        Ok((mapped, NativeHandle::from_ptr(event)))
    }

    unsafe fn enqueue_unmap(
        &self,
        queue: NativeHandle,
        mem: NativeHandle,
        mapped: *mut c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueUnmapMemObject(queue.as_ptr(), mem.as_ptr(), mapped, n, list, &mut event))?;
        Ok(NativeHandle::from_ptr(event))
    }

    fn enqueue_fill_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        pattern: &[u8],
        offset: usize,
        size: usize,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> { unsafe {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueFillBuffer(
            queue.as_ptr(),
            buffer.as_ptr(),
            pattern.as_ptr().cast(),
            pattern.len(),
            offset,
            size,
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    } }

    unsafe fn enqueue_read_buffer_rect(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        blocking: bool,
        rect: &Rect,
        ptr: *mut c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueReadBufferRect(
            queue.as_ptr(),
            buffer.as_ptr(),
            blocking as cl_bool,
            rect.src_origin.as_ptr(),
            rect.dst_origin.as_ptr(),
            rect.region.as_ptr(),
            rect.src_row_pitch,
            rect.src_slice_pitch,
            rect.dst_row_pitch,
            rect.dst_slice_pitch,
            ptr,
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    }

    unsafe fn enqueue_write_buffer_rect(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        blocking: bool,
        rect: &Rect,
        ptr: *const c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        // Buffer side is the destination here.
        check(clEnqueueWriteBufferRect(
            queue.as_ptr(),
            buffer.as_ptr(),
            blocking as cl_bool,
            rect.dst_origin.as_ptr(),
            rect.src_origin.as_ptr(),
            rect.region.as_ptr(),
            rect.dst_row_pitch,
            rect.dst_slice_pitch,
            rect.src_row_pitch,
            rect.src_slice_pitch,
            ptr,
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    }

    fn enqueue_copy_buffer_rect(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        rect: &Rect,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> { unsafe {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueCopyBufferRect(
            queue.as_ptr(),
            src.as_ptr(),
            dst.as_ptr(),
            rect.src_origin.as_ptr(),
            rect.dst_origin.as_ptr(),
            rect.region.as_ptr(),
            rect.src_row_pitch,
            rect.src_slice_pitch,
            rect.dst_row_pitch,
            rect.dst_slice_pitch,
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    } }

    fn enqueue_copy_buffer_to_image(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        src_offset: usize,
        dst_origin: [usize; 3],
        region: [usize; 3],
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> { unsafe {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueCopyBufferToImage(
            queue.as_ptr(),
            src.as_ptr(),
            dst.as_ptr(),
            src_offset,
            dst_origin.as_ptr(),
            region.as_ptr(),
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    } }

    fn enqueue_copy_image_to_buffer(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        src_origin: [usize; 3],
        region: [usize; 3],
        dst_offset: usize,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> { unsafe {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueCopyImageToBuffer(
            queue.as_ptr(),
            src.as_ptr(),
            dst.as_ptr(),
            src_origin.as_ptr(),
            region.as_ptr(),
            dst_offset,
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    } }

    fn enqueue_copy_image(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        src_origin: [usize; 3],
        dst_origin: [usize; 3],
        region: [usize; 3],
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> { unsafe {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueCopyImage(
            queue.as_ptr(),
            src.as_ptr(),
            dst.as_ptr(),
            src_origin.as_ptr(),
            dst_origin.as_ptr(),
            region.as_ptr(),
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    } }

    fn enqueue_fill_image(
        &self,
        queue: NativeHandle,
        image: NativeHandle,
        color: &[u8; 16],
        origin: [usize; 3],
        region: [usize; 3],
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> { unsafe {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueFillImage(
            queue.as_ptr(),
            image.as_ptr(),
            color.as_ptr().cast(),
            origin.as_ptr(),
            region.as_ptr(),
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    } }

    unsafe fn enqueue_map_image(
        &self,
        queue: NativeHandle,
        image: NativeHandle,
        blocking: bool,
        flags: cl_map_flags,
        origin: [usize; 3],
        region: [usize; 3],
        wait: &[NativeHandle],
    ) -> RtResult<(*mut c_void, usize, usize, NativeHandle)> {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        let (mut row_pitch, mut slice_pitch) = (0, 0);
        let mut ret_code = cl_sys::CL_SUCCESS;
        let mapped = clEnqueueMapImage(
            queue.as_ptr(),
            image.as_ptr(),
            blocking as cl_bool,
            flags,
            origin.as_ptr(),
            region.as_ptr(),
            &mut row_pitch,
            &mut slice_pitch,
            n,
            list,
            &mut event,
            &mut ret_code,
        );
        check(ret_code)?;
        Ok((mapped, row_pitch, slice_pitch, NativeHandle::from_ptr(event)))
    }

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
    ) -> RtResult<NativeHandle> {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueReadImage(
            queue.as_ptr(),
            image.as_ptr(),
            blocking as cl_bool,
            origin.as_ptr(),
            region.as_ptr(),
            row_pitch,
            slice_pitch,
            ptr,
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    }

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
    ) -> RtResult<NativeHandle> {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueWriteImage(
            queue.as_ptr(),
            image.as_ptr(),
            blocking as cl_bool,
            origin.as_ptr(),
            region.as_ptr(),
            row_pitch,
            slice_pitch,
            ptr,
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    }

    fn create_sampler(
        &self,
        context: NativeHandle,
        normalized_coords: bool,
        addressing: cl_addressing_mode,
        filter: cl_filter_mode,
    ) -> RtResult<NativeHandle> { unsafe {
        let mut ret_code = cl_sys::CL_SUCCESS;
        let s = clCreateSampler(
            context.as_ptr(),
            normalized_coords as cl_bool,
            addressing,
            filter,
            &mut ret_code,
        );
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(s))
    } }

    fn create_sampler_with_properties(
        &self,
        context: NativeHandle,
        props: &[cl_sampler_properties],
    ) -> RtResult<NativeHandle> { unsafe {
        let props_ptr = if props.is_empty() { null() } else { props.as_ptr() };
        let mut ret_code = cl_sys::CL_SUCCESS;
        let s = clCreateSamplerWithProperties(context.as_ptr(), props_ptr, &mut ret_code);
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(s))
    } }

    fn create_program_with_source(&self, context: NativeHandle, sources: &[&str]) -> RtResult<NativeHandle> { unsafe {
        let ptrs: Vec<*const c_char> = sources.iter().map(|s| s.as_ptr().cast()).collect();
        let lens: Vec<size_t> = sources.iter().map(|s| s.len()).collect();
        let mut ret_code = cl_sys::CL_SUCCESS;
        let prog = clCreateProgramWithSource(
            context.as_ptr(),
            sources.len() as cl_uint,
            ptrs.as_ptr(),
            lens.as_ptr(),
            &mut ret_code,
        );
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(prog))
    } }

    fn create_program_with_binary(
        &self,
        context: NativeHandle,
        devices: &[NativeHandle],
        binaries: &[&[u8]],
    ) -> (RtResult<NativeHandle>, Vec<cl_int>) { unsafe {
        let devs = raw_list(devices);
        let ptrs: Vec<*const u8> = binaries.iter().map(|b| b.as_ptr()).collect();
        let lens: Vec<size_t> = binaries.iter().map(|b| b.len()).collect();
        let mut status = vec![cl_sys::CL_SUCCESS; devices.len()];
        let mut ret_code = cl_sys::CL_SUCCESS;
        let prog = clCreateProgramWithBinary(
            context.as_ptr(),
            devs.len() as cl_uint,
            devs.as_ptr(),
            lens.as_ptr(),
            ptrs.as_ptr(),
            status.as_mut_ptr(),
            &mut ret_code,
        );
        (check(ret_code).map(|()| NativeHandle::from_ptr(prog)), status)
    } }

    fn create_program_with_built_in_kernels(
        &self,
        context: NativeHandle,
        devices: &[NativeHandle],
        names: &str,
    ) -> RtResult<NativeHandle> { unsafe {
        let devs = raw_list(devices);
        let mut names = nul_terminated(names);
        let mut ret_code = cl_sys::CL_SUCCESS;
        let prog = clCreateProgramWithBuiltInKernels(
            context.as_ptr(),
            devs.len() as cl_uint,
            devs.as_ptr(),
            names.as_mut_ptr().cast(),
            &mut ret_code,
        );
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(prog))
    } }

    fn build_program(
        &self,
        program: NativeHandle,
        devices: &[NativeHandle],
        options: &str,
        notify: Option<ProgramCallback>,
    ) -> RtResult<()> { unsafe {
        let devs = raw_list(devices);
        let devs_ptr = if devs.is_empty() { null() } else { devs.as_ptr() };
        let opts = nul_terminated(options);
        let (pfn, user_data) = program_notify(notify);
        let ret_code = clBuildProgram(
            program.as_ptr(),
            devs.len() as cl_uint,
            devs_ptr,
            opts.as_ptr().cast(),
            pfn,
            user_data,
        );
        reclaim_program_notify(ret_code, user_data);
        check(ret_code)
    } }

    fn compile_program(
        &self,
        program: NativeHandle,
        devices: &[NativeHandle],
        options: &str,
        headers: &[(NativeHandle, &str)],
        notify: Option<ProgramCallback>,
    ) -> RtResult<()> { unsafe {
        let devs = raw_list(devices);
        let devs_ptr = if devs.is_empty() { null() } else { devs.as_ptr() };
        let opts = nul_terminated(options);
        let header_progs: Vec<cl_program> = headers.iter().map(|(h, _)| h.as_ptr()).collect();
        let header_names: Vec<Vec<u8>> = headers.iter().map(|(_, n)| nul_terminated(n)).collect();
        let header_name_ptrs: Vec<*const c_char> =
            header_names.iter().map(|n| n.as_ptr().cast()).collect();
        let (hp, hn) = if headers.is_empty() {
            (null(), null())
        } else {
            (header_progs.as_ptr(), header_name_ptrs.as_ptr())
        };
        let (pfn, user_data) = program_notify(notify);
        let ret_code = clCompileProgram(
            program.as_ptr(),
            devs.len() as cl_uint,
            devs_ptr,
            opts.as_ptr().cast(),
            headers.len() as cl_uint,
            hp,
            hn,
            pfn,
            user_data,
        );
        reclaim_program_notify(ret_code, user_data);
        check(ret_code)
    } }

    fn link_program(
        &self,
        context: NativeHandle,
        devices: &[NativeHandle],
        options: &str,
        inputs: &[NativeHandle],
        notify: Option<ProgramCallback>,
    ) -> (RtResult<()>, NativeHandle) { unsafe {
        let devs = raw_list(devices);
        let devs_ptr = if devs.is_empty() { null() } else { devs.as_ptr() };
        let opts = nul_terminated(options);
        let progs = raw_list(inputs);
        let (pfn, user_data) = program_notify(notify);
        let mut ret_code = cl_sys::CL_SUCCESS;
        let prog = clLinkProgram(
            context.as_ptr(),
            devs.len() as cl_uint,
            devs_ptr,
            opts.as_ptr().cast(),
            progs.len() as cl_uint,
            progs.as_ptr(),
            pfn,
            user_data,
            &mut ret_code,
        );
        reclaim_program_notify(ret_code, user_data);
        (check(ret_code), NativeHandle::from_ptr(prog))
    } }

    fn program_binaries(&self, program: NativeHandle, sizes: &[usize]) -> RtResult<Vec<Vec<u8>>> { unsafe {
        let mut binaries: Vec<Vec<u8>> = sizes.iter().map(|&n| vec![0u8; n]).collect();
        let mut ptrs: Vec<*mut u8> = binaries
            .iter_mut()
            .map(|b| if b.is_empty() { null_mut() } else { b.as_mut_ptr() })
            .collect();
        check(clGetProgramInfo(
            program.as_ptr(),
            CL_PROGRAM_BINARIES,
            ptrs.len() * core::mem::size_of::<*mut u8>(),
            ptrs.as_mut_ptr().cast(),
            null_mut(),
        ))?;
        Ok(binaries)
    } }

    fn create_kernel(&self, program: NativeHandle, name: &str) -> RtResult<NativeHandle> { unsafe {
        let name = nul_terminated(name);
        let mut ret_code = cl_sys::CL_SUCCESS;
        let kern = clCreateKernel(program.as_ptr(), name.as_ptr().cast(), &mut ret_code);
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(kern))
    } }

    fn set_kernel_arg(
        &self,
        kernel: NativeHandle,
        index: cl_uint,
        size: usize,
        value: Option<&[u8]>,
    ) -> RtResult<()> { unsafe {
        let value_ptr = match value {
            Some(bytes) => bytes.as_ptr().cast(),
            None => null(),
        };
        check(clSetKernelArg(kernel.as_ptr(), index, size, value_ptr))
    } }

    fn enqueue_ndrange_kernel(
        &self,
        queue: NativeHandle,
        kernel: NativeHandle,
        offset: Option<&[usize]>,
        global: &[usize],
        local: Option<&[usize]>,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> { unsafe {
        let wait = raw_list(wait);
        let (n, list) = wait_args(&wait);
        let mut event = null_mut();
        check(clEnqueueNDRangeKernel(
            queue.as_ptr(),
            kernel.as_ptr(),
            global.len() as cl_uint,
            offset.map_or(null(), |o| o.as_ptr()),
            global.as_ptr(),
            local.map_or(null(), |l| l.as_ptr()),
            n,
            list,
            &mut event,
        ))?;
        Ok(NativeHandle::from_ptr(event))
    } }

    fn wait_for_events(&self, events: &[NativeHandle]) -> RtResult<()> { unsafe {
        let list = raw_list(events);
        check(clWaitForEvents(list.len() as cl_uint, list.as_ptr()))
    } }

    fn set_event_callback(
        &self,
        event: NativeHandle,
        exec_type: cl_int,
        callback: EventCallback,
    ) -> RtResult<()> { unsafe {
        let user_data = Box::into_raw(Box::new(callback)).cast::<c_void>();
        let ret_code = clSetEventCallback(event.as_ptr(), exec_type, Some(event_invoker), user_data);
        if ret_code != cl_sys::CL_SUCCESS {
            drop(Box::from_raw(user_data.cast::<EventCallback>()));
        }
        check(ret_code)
    } }

    fn create_user_event(&self, context: NativeHandle) -> RtResult<NativeHandle> { unsafe {
        let mut ret_code = cl_sys::CL_SUCCESS;
        let ev = clCreateUserEvent(context.as_ptr(), &mut ret_code);
        check(ret_code)?;
        Ok(NativeHandle::from_ptr(ev))
    } }

    fn set_user_event_status(&self, event: NativeHandle, status: cl_int) -> RtResult<()> {
        check(unsafe { clSetUserEventStatus(event.as_ptr(), status) })
    }
}
