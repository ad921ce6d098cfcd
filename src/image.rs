use std::sync::Arc;

use bytemuck::Pod;

use crate::buffer::Buffer;
use crate::context::Context;
use crate::error::{host_err, ClResultExt, Result};
use crate::event::{self, Event, EventWaitList};
use crate::memobj::{rect_extent, MemObject};
use crate::queue::Queue;
use crate::raw::*;
use crate::runtime::{self, ImageDesc, InfoQuery, Runtime};
use crate::version::ClVersion;
use crate::wrapper::{fetch_info, wrapper_common, Adopt, InfoEntry, Wrapper, WrapperClass};

pub(crate) struct ImageFields {
    context: Context,
}

impl WrapperClass for ImageFields {
    const CLASS: Class = Class::Image;
}

#[derive(Clone)]
pub struct Image(pub(crate) Wrapper<ImageFields>);

wrapper_common!(Image);

impl Image {
    pub fn new(context: &Context, flags: cl_mem_flags, format: &ImageFormat, desc: &ImageDesc) -> Result<Image> {
        // SAFETY: no host pointer.
        unsafe { Image::with_host_ptr(context, flags, format, desc, core::ptr::null_mut()) }
    }

    /// Creates an image of any type on OpenCL 1.2 and later; older
    /// platforms only know 2D and 3D images.
    ///
    /// # Safety
    /// As for [`Buffer::with_host_ptr`], with the size given by `format`
    /// and `desc`.
    pub unsafe fn with_host_ptr(
        context: &Context,
        flags: cl_mem_flags,
        format: &ImageFormat,
        desc: &ImageDesc,
        host_ptr: *mut c_void,
    ) -> Result<Image> {
        let rt = context.0.rt();
        let version = context.version()?;
        let handle = if version >= ClVersion::V1_2 {
            rt.create_image(context.native(), flags, format, desc, host_ptr).cl_context("clCreateImage")?
        } else {
            match desc.image_type {
                CL_MEM_OBJECT_IMAGE2D => rt
                    .create_image_2d(context.native(), flags, format, desc, host_ptr)
                    .cl_context("clCreateImage2D")?,
                CL_MEM_OBJECT_IMAGE3D => rt
                    .create_image_3d(context.native(), flags, format, desc, host_ptr)
                    .cl_context("clCreateImage3D")?,
                other => {
                    return Err(host_err!(
                        UnsupportedRuntimeVersion,
                        "image type {:#x} requires OpenCL 1.2, but the platform only supports {}",
                        other,
                        version
                    ))
                }
            }
        };
        log::debug!("created {}x{}x{} image {:?}", desc.width, desc.height, desc.depth, handle);
        let context = context.clone();
        Wrapper::wrap(rt, handle, Adopt::Owned, move || ImageFields { context }).map(Image)
    }

    pub fn from_native(handle: NativeHandle) -> Result<Image> {
        Image::wrap(&runtime::current()?, handle)
    }

    pub(crate) fn wrap(rt: &Arc<dyn Runtime>, handle: NativeHandle) -> Result<Image> {
        let ctx = fetch_info(&**rt, InfoQuery::Mem, handle, NativeHandle::NULL, CL_MEM_CONTEXT, &[])?;
        let context = Context::wrap(rt, ctx.handle()?)?;
        Wrapper::wrap(rt, handle, Adopt::Borrowed, move || ImageFields { context }).map(Image)
    }

    /// Cached `clGetImageInfo` query.
    pub fn image_info(&self, param: cl_uint) -> Result<&InfoEntry> {
        self.0.core().info(InfoQuery::Image, NativeHandle::NULL, param, &[])
    }

    pub fn format(&self) -> Result<ImageFormat> {
        match self.image_info(CL_IMAGE_FORMAT)?.array::<cl_uint>()?[..] {
            [order, data_type] => Ok(ImageFormat { image_channel_order: order, image_channel_data_type: data_type }),
            _ => Err(host_err!(InvalidData, "malformed image format")),
        }
    }

    /// Bytes per pixel.
    pub fn element_size(&self) -> Result<usize> {
        self.image_info(CL_IMAGE_ELEMENT_SIZE)?.scalar()
    }

    pub fn width(&self) -> Result<usize> {
        self.image_info(CL_IMAGE_WIDTH)?.scalar()
    }

    pub fn height(&self) -> Result<usize> {
        self.image_info(CL_IMAGE_HEIGHT)?.scalar()
    }

    pub fn depth(&self) -> Result<usize> {
        self.image_info(CL_IMAGE_DEPTH)?.scalar()
    }

    pub fn row_pitch(&self) -> Result<usize> {
        self.image_info(CL_IMAGE_ROW_PITCH)?.scalar()
    }

    /// Host bytes a transfer of `region` with the given pitches touches.
    fn host_extent(&self, region: [usize; 3], row_pitch: usize, slice_pitch: usize) -> Result<usize> {
        let elem = self.element_size()?;
        let row_pitch = if row_pitch == 0 { region[0] * elem } else { row_pitch };
        Ok(rect_extent([0; 3], [region[0] * elem, region[1], region[2]], row_pitch, slice_pitch))
    }

    /// Reads `region` at `origin` (in pixels) into `out`, blocking. Zero
    /// pitches mean tightly packed rows and slices.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_read<'q, T: Pod>(
        &self,
        queue: &'q Queue,
        origin: [usize; 3],
        region: [usize; 3],
        row_pitch: usize,
        slice_pitch: usize,
        out: &mut [T],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        let needed = self.host_extent(region, row_pitch, slice_pitch)?;
        if needed > core::mem::size_of_val(out) {
            return Err(host_err!(InvalidData, "image read needs {} host bytes", needed));
        }
        // SAFETY: blocking, and `out` covers every byte written.
        let result = unsafe {
            queue.0.rt().enqueue_read_image(
                queue.native(),
                self.native(),
                true,
                origin,
                region,
                row_pitch,
                slice_pitch,
                out.as_mut_ptr().cast(),
                event::wait_raw(&wait),
            )
        };
        queue.enqueued(result, "clEnqueueReadImage", wait)
    }

    /// Writes `data` into `region` at `origin`, blocking.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_write<'q, T: Pod>(
        &self,
        queue: &'q Queue,
        origin: [usize; 3],
        region: [usize; 3],
        row_pitch: usize,
        slice_pitch: usize,
        data: &[T],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        let needed = self.host_extent(region, row_pitch, slice_pitch)?;
        if needed > core::mem::size_of_val(data) {
            return Err(host_err!(InvalidData, "image write needs {} host bytes", needed));
        }
        // SAFETY: blocking, and `data` covers every byte read.
        let result = unsafe {
            queue.0.rt().enqueue_write_image(
                queue.native(),
                self.native(),
                true,
                origin,
                region,
                row_pitch,
                slice_pitch,
                data.as_ptr().cast(),
                event::wait_raw(&wait),
            )
        };
        queue.enqueued(result, "clEnqueueWriteImage", wait)
    }

    pub fn enqueue_copy_to_buffer<'q>(
        &self,
        queue: &'q Queue,
        dst: &Buffer,
        src_origin: [usize; 3],
        region: [usize; 3],
        dst_offset: usize,
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        let result = queue.0.rt().enqueue_copy_image_to_buffer(
            queue.native(),
            self.native(),
            dst.native(),
            src_origin,
            region,
            dst_offset,
            event::wait_raw(&wait),
        );
        queue.enqueued(result, "clEnqueueCopyImageToBuffer", wait)
    }

    /// Copies `region` (in pixels) to `dst`. Both images need the same
    /// format.
    pub fn enqueue_copy<'q>(
        &self,
        queue: &'q Queue,
        dst: &Image,
        src_origin: [usize; 3],
        dst_origin: [usize; 3],
        region: [usize; 3],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        let result = queue.0.rt().enqueue_copy_image(
            queue.native(),
            self.native(),
            dst.native(),
            src_origin,
            dst_origin,
            region,
            event::wait_raw(&wait),
        );
        queue.enqueued(result, "clEnqueueCopyImage", wait)
    }

    /// Fills `region` with `color`, given as four `f32` for normalized and
    /// float formats, or four `i32`/`u32` for integer formats (OpenCL 1.2).
    pub fn enqueue_fill<'q, T: Pod>(
        &self,
        queue: &'q Queue,
        color: &[T; 4],
        origin: [usize; 3],
        region: [usize; 3],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        self.context().version()?.require(ClVersion::V1_2, "image fills")?;
        let color: [u8; 16] = bytemuck::cast_slice::<T, u8>(color)
            .try_into()
            .map_err(|_| host_err!(InvalidData, "fill colors have four 32-bit components"))?;
        let result = queue.0.rt().enqueue_fill_image(
            queue.native(),
            self.native(),
            &color,
            origin,
            region,
            event::wait_raw(&wait),
        );
        queue.enqueued(result, "clEnqueueFillImage", wait)
    }

    /// Maps `region` at `origin` into host memory. The mapping is valid once
    /// the event completes and until [`MemObject::enqueue_unmap`].
    pub fn enqueue_map<'q>(
        &self,
        queue: &'q Queue,
        blocking: bool,
        flags: cl_map_flags,
        origin: [usize; 3],
        region: [usize; 3],
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<(MappedImage, &'q Event)> {
        // SAFETY: only hands back a pointer.
        let result = unsafe {
            queue.0.rt().enqueue_map_image(
                queue.native(),
                self.native(),
                blocking,
                flags,
                origin,
                region,
                event::wait_raw(&wait),
            )
        };
        let (ptr, row_pitch, slice_pitch, handle) = result.cl_context("clEnqueueMapImage")?;
        let event = queue.produce_event(handle)?;
        event::wait_done(wait);
        Ok((MappedImage { ptr, row_pitch, slice_pitch }, event))
    }
}

/// Host view of a mapped image region.
#[derive(Debug, Clone, Copy)]
pub struct MappedImage {
    pub ptr: *mut c_void,
    /// Bytes between the starts of consecutive rows.
    pub row_pitch: usize,
    /// Bytes between the starts of consecutive slices; zero for 1D and 2D
    /// images.
    pub slice_pitch: usize,
}

impl MemObject for Image {
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
