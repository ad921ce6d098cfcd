use std::sync::Arc;

use bytemuck::Pod;

use crate::context::Context;
use crate::error::{host_err, ClResultExt, Result};
use crate::event::{self, Event, EventWaitList};
use crate::image::Image;
use crate::memobj::{rect_extent, MemObject};
use crate::queue::Queue;
use crate::raw::*;
use crate::runtime::{self, InfoQuery, Rect, Runtime};
use crate::version::ClVersion;
use crate::wrapper::{fetch_info, wrapper_common, Adopt, InfoEntry, Wrapper, WrapperClass};

pub(crate) struct BufferFields {
    context: Context,
    parent: Option<Buffer>,
}

impl WrapperClass for BufferFields {
    const CLASS: Class = Class::Buffer;
}

/// Linear device memory.
#[derive(Clone)]
pub struct Buffer(pub(crate) Wrapper<BufferFields>);

wrapper_common!(Buffer);

impl Buffer {
    /// Allocates `size` bytes without host backing.
    pub fn new(context: &Context, flags: cl_mem_flags, size: usize) -> Result<Buffer> {
        // SAFETY: no host pointer.
        unsafe { Buffer::with_host_ptr(context, flags, size, core::ptr::null_mut()) }
    }

    /// Allocates a buffer initialised with a copy of `data`.
    pub fn from_slice<T: Pod>(context: &Context, flags: cl_mem_flags, data: &[T]) -> Result<Buffer> {
        let flags = (flags & !CL_MEM_USE_HOST_PTR) | CL_MEM_COPY_HOST_PTR;
        // SAFETY: the runtime copies `data` before returning.
        unsafe { Buffer::with_host_ptr(context, flags, core::mem::size_of_val(data), data.as_ptr() as *mut c_void) }
    }

    /// # Safety
    /// With `CL_MEM_USE_HOST_PTR`, `host_ptr` must point to `size` bytes that
    /// outlive the buffer; with `CL_MEM_COPY_HOST_PTR` they must be readable.
    pub unsafe fn with_host_ptr(
        context: &Context,
        flags: cl_mem_flags,
        size: usize,
        host_ptr: *mut c_void,
    ) -> Result<Buffer> {
        let rt = context.0.rt();
        let handle = rt.create_buffer(context.native(), flags, size, host_ptr).cl_context("clCreateBuffer")?;
        log::debug!("created buffer {:?} of {} bytes", handle, size);
        let context = context.clone();
        Wrapper::wrap(rt, handle, Adopt::Owned, move || BufferFields { context, parent: None }).map(Buffer)
    }

    pub fn from_native(handle: NativeHandle) -> Result<Buffer> {
        Buffer::wrap(&runtime::current()?, handle)
    }

    pub(crate) fn wrap(rt: &Arc<dyn Runtime>, handle: NativeHandle) -> Result<Buffer> {
        let query = |param| fetch_info(&**rt, InfoQuery::Mem, handle, NativeHandle::NULL, param, &[]);
        let context = Context::wrap(rt, query(CL_MEM_CONTEXT)?.handle()?)?;
        let parent = match query(CL_MEM_ASSOCIATED_MEMOBJECT)?.handle()? {
            h if h.is_null() => None,
            h => Some(Buffer::wrap(rt, h)?),
        };
        Wrapper::wrap(rt, handle, Adopt::Borrowed, move || BufferFields { context, parent }).map(Buffer)
    }

    /// Buffer this one is a region of.
    pub fn parent(&self) -> Option<&Buffer> {
        self.0.fields().parent.as_ref()
    }

    /// Region `[origin, origin + size)` of this buffer as a buffer of its own
    /// (OpenCL 1.1).
    pub fn new_sub_buffer(&self, flags: cl_mem_flags, origin: usize, size: usize) -> Result<Buffer> {
        self.context().version()?.require(ClVersion::V1_1, "sub-buffers")?;
        let rt = self.0.rt();
        let handle = rt.create_sub_buffer(self.native(), flags, origin, size).cl_context("clCreateSubBuffer")?;
        let (context, parent) = (self.context().clone(), self.clone());
        Wrapper::wrap(rt, handle, Adopt::Owned, move || BufferFields { context, parent: Some(parent) })
            .map(Buffer)
    }

    /// Reads from byte `offset` into `out`, blocking until done.
    pub fn enqueue_read<'q, T: Pod>(
        &self,
        queue: &'q Queue,
        offset: usize,
        out: &mut [T],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        // SAFETY: the transfer completes before `out` is released.
        unsafe { self.read_raw(queue, true, offset, out, wait) }
    }

    /// Non-blocking [`Buffer::enqueue_read`].
    ///
    /// # Safety
    /// `out` must be neither accessed nor freed before the event completes.
    pub unsafe fn enqueue_read_async<'q, T: Pod>(
        &self,
        queue: &'q Queue,
        offset: usize,
        out: &mut [T],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        self.read_raw(queue, false, offset, out, wait)
    }

    unsafe fn read_raw<'q, T: Pod>(
        &self,
        queue: &'q Queue,
        blocking: bool,
        offset: usize,
        out: &mut [T],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        let size = core::mem::size_of_val(out);
        let ptr = out.as_mut_ptr().cast::<c_void>();
        let result = queue.0.rt().enqueue_read_buffer(
            queue.native(),
            self.native(),
            blocking,
            offset,
            size,
            ptr,
            event::wait_raw(&wait),
        );
        queue.enqueued(result, "clEnqueueReadBuffer", wait)
    }

    /// Writes `data` at byte `offset`, blocking until done.
    pub fn enqueue_write<'q, T: Pod>(
        &self,
        queue: &'q Queue,
        offset: usize,
        data: &[T],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        // SAFETY: the transfer completes before `data` is released.
        unsafe { self.write_raw(queue, true, offset, data, wait) }
    }

    /// Non-blocking [`Buffer::enqueue_write`].
    ///
    /// # Safety
    /// `data` must be neither modified nor freed before the event completes.
    pub unsafe fn enqueue_write_async<'q, T: Pod>(
        &self,
        queue: &'q Queue,
        offset: usize,
        data: &[T],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        self.write_raw(queue, false, offset, data, wait)
    }

    unsafe fn write_raw<'q, T: Pod>(
        &self,
        queue: &'q Queue,
        blocking: bool,
        offset: usize,
        data: &[T],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        let result = queue.0.rt().enqueue_write_buffer(
            queue.native(),
            self.native(),
            blocking,
            offset,
            core::mem::size_of_val(data),
            data.as_ptr().cast(),
            event::wait_raw(&wait),
        );
        queue.enqueued(result, "clEnqueueWriteBuffer", wait)
    }

    /// Copies `size` bytes to `dst`.
    pub fn enqueue_copy<'q>(
        &self,
        queue: &'q Queue,
        dst: &Buffer,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        let result = queue.0.rt().enqueue_copy_buffer(
            queue.native(),
            self.native(),
            dst.native(),
            src_offset,
            dst_offset,
            size,
            event::wait_raw(&wait),
        );
        queue.enqueued(result, "clEnqueueCopyBuffer", wait)
    }

    /// Maps `size` bytes at `offset` into host memory. The mapping is valid
    /// once the event completes and until [`MemObject::enqueue_unmap`].
    pub fn enqueue_map<'q>(
        &self,
        queue: &'q Queue,
        blocking: bool,
        flags: cl_map_flags,
        offset: usize,
        size: usize,
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<(*mut c_void, &'q Event)> {
        // SAFETY: only hands back a pointer; dereferencing it is the caller's
        // business.
        let result = unsafe {
            queue.0.rt().enqueue_map_buffer(
                queue.native(),
                self.native(),
                blocking,
                flags,
                offset,
                size,
                event::wait_raw(&wait),
            )
        };
        let (ptr, handle) = result.cl_context("clEnqueueMapBuffer")?;
        let event = queue.produce_event(handle)?;
        event::wait_done(wait);
        Ok((ptr, event))
    }

    /// Copies from byte `src_offset` into the `region` of `dst` at
    /// `dst_origin`.
    pub fn enqueue_copy_to_image<'q>(
        &self,
        queue: &'q Queue,
        dst: &Image,
        src_offset: usize,
        dst_origin: [usize; 3],
        region: [usize; 3],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        let result = queue.0.rt().enqueue_copy_buffer_to_image(
            queue.native(),
            self.native(),
            dst.native(),
            src_offset,
            dst_origin,
            region,
            event::wait_raw(&wait),
        );
        queue.enqueued(result, "clEnqueueCopyBufferToImage", wait)
    }

    /// Fills `size` bytes at `offset` with copies of `pattern` (OpenCL 1.2).
    pub fn enqueue_fill<'q, T: Pod>(
        &self,
        queue: &'q Queue,
        pattern: &T,
        offset: usize,
        size: usize,
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        self.context().version()?.require(ClVersion::V1_2, "buffer fills")?;
        let result = queue.0.rt().enqueue_fill_buffer(
            queue.native(),
            self.native(),
            bytemuck::bytes_of(pattern),
            offset,
            size,
            event::wait_raw(&wait),
        );
        queue.enqueued(result, "clEnqueueFillBuffer", wait)
    }

    /// Reads a rectangular region into `out`, blocking (OpenCL 1.1). The
    /// buffer side of `rect` is the source.
    pub fn enqueue_read_rect<'q, T: Pod>(
        &self,
        queue: &'q Queue,
        rect: &Rect,
        out: &mut [T],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        self.context().version()?.require(ClVersion::V1_1, "rectangular reads")?;
        let needed = rect_extent(rect.dst_origin, rect.region, rect.dst_row_pitch, rect.dst_slice_pitch);
        check_host_len(needed, core::mem::size_of_val(out))?;
        // SAFETY: blocking, and `out` covers every byte written.
        let result = unsafe {
            queue.0.rt().enqueue_read_buffer_rect(
                queue.native(),
                self.native(),
                true,
                rect,
                out.as_mut_ptr().cast(),
                event::wait_raw(&wait),
            )
        };
        queue.enqueued(result, "clEnqueueReadBufferRect", wait)
    }

    /// Writes a rectangular region from `data`, blocking (OpenCL 1.1). The
    /// buffer side of `rect` is the destination.
    pub fn enqueue_write_rect<'q, T: Pod>(
        &self,
        queue: &'q Queue,
        rect: &Rect,
        data: &[T],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        self.context().version()?.require(ClVersion::V1_1, "rectangular writes")?;
        let needed = rect_extent(rect.src_origin, rect.region, rect.src_row_pitch, rect.src_slice_pitch);
        check_host_len(needed, core::mem::size_of_val(data))?;
        // SAFETY: blocking, and `data` covers every byte read.
        let result = unsafe {
            queue.0.rt().enqueue_write_buffer_rect(
                queue.native(),
                self.native(),
                true,
                rect,
                data.as_ptr().cast(),
                event::wait_raw(&wait),
            )
        };
        queue.enqueued(result, "clEnqueueWriteBufferRect", wait)
    }

    /// Copies a rectangular region to `dst` (OpenCL 1.1).
    pub fn enqueue_copy_rect<'q>(
        &self,
        queue: &'q Queue,
        dst: &Buffer,
        rect: &Rect,
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        self.context().version()?.require(ClVersion::V1_1, "rectangular copies")?;
        let result = queue.0.rt().enqueue_copy_buffer_rect(
            queue.native(),
            self.native(),
            dst.native(),
            rect,
            event::wait_raw(&wait),
        );
        queue.enqueued(result, "clEnqueueCopyBufferRect", wait)
    }
}

fn check_host_len(needed: usize, available: usize) -> Result<()> {
    if needed > available {
        return Err(host_err!(
            InvalidData,
            "rectangular transfer touches {} bytes of host memory, only {} given",
            needed,
            available
        ));
    }
    Ok(())
}

impl MemObject for Buffer {
    fn mem_handle(&self) -> NativeHandle {
        self.native()
    }

    fn context(&self) -> &Context {
        &self.0.fields().context
    }

    fn mem_info(&self, param: cl_uint) -> Result<&InfoEntry> {
        self.0.core().info(InfoQuery::Mem, NativeHandle::NULL, param, &[])
    }
}
