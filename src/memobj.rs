//! Behaviour shared by buffers and images.

use crate::context::Context;
use crate::error::Result;
use crate::event::{self, Event, EventWaitList};
use crate::queue::Queue;
use crate::raw::*;
use crate::wrapper::InfoEntry;

/// A buffer or an image.
pub trait MemObject {
    fn mem_handle(&self) -> NativeHandle;

    /// Context the object was created in.
    fn context(&self) -> &Context;

    /// Cached `clGetMemObjectInfo` query.
    fn mem_info(&self, param: cl_uint) -> Result<&InfoEntry>;

    /// Size of the data store in bytes.
    fn size(&self) -> Result<usize> {
        self.mem_info(CL_MEM_SIZE)?.scalar()
    }

    fn flags(&self) -> Result<cl_mem_flags> {
        self.mem_info(CL_MEM_FLAGS)?.scalar()
    }

    fn mem_type(&self) -> Result<cl_mem_object_type> {
        self.mem_info(CL_MEM_TYPE)?.scalar()
    }

    /// Releases a mapping obtained from an enqueued map.
    ///
    /// # Safety
    /// `mapped` must come from mapping this object and must not be used once
    /// the returned event completes.
    unsafe fn enqueue_unmap<'q>(
        &self,
        queue: &'q Queue,
        mapped: *mut c_void,
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        let result = queue.0.rt().enqueue_unmap(queue.native(), self.mem_handle(), mapped, event::wait_raw(&wait));
        queue.enqueued(result, "clEnqueueUnmapMemObject", wait)
    }
}

/// Bytes of host memory touched by a rectangular transfer.
pub(crate) fn rect_extent(origin: [usize; 3], region: [usize; 3], row_pitch: usize, slice_pitch: usize) -> usize {
    if region.contains(&0) {
        return 0;
    }
    let row_pitch = if row_pitch == 0 { region[0] } else { row_pitch };
    let slice_pitch = if slice_pitch == 0 { region[1] * row_pitch } else { slice_pitch };
    origin[0] + (origin[1] + region[1] - 1) * row_pitch + (origin[2] + region[2] - 1) * slice_pitch + region[0]
}
