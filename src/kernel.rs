use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::device::Device;
use crate::error::{host_err, ClResultExt, Result};
use crate::event::{self, Event, EventWaitList};
use crate::kernel_args::{ArgRecord, KernelArg, KernelArgs};
use crate::program::Program;
use crate::queue::Queue;
use crate::raw::*;
use crate::runtime::{self, InfoQuery, Runtime};
use crate::version::ClVersion;
use crate::wrapper::{fetch_info, wrapper_common, Adopt, InfoEntry, Wrapper, WrapperClass};

pub(crate) struct KernelFields {
    context: Context,
    // clSetKernelArg is not thread safe for one kernel object.
    args: Mutex<()>,
}

impl WrapperClass for KernelFields {
    const CLASS: Class = Class::Kernel;
}

#[derive(Clone)]
pub struct Kernel(pub(crate) Wrapper<KernelFields>);

wrapper_common!(Kernel);

/// Work-group limits of a kernel on one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkGroupInfo {
    pub max_work_group_size: usize,
    pub preferred_multiple: usize,
    /// Size from `__attribute__((reqd_work_group_size))`, zeros if none.
    pub compile_work_group_size: [usize; 3],
    pub local_mem_size: cl_ulong,
    pub private_mem_size: cl_ulong,
}

impl Kernel {
    /// Creates a kernel the caller owns. Kernels shared through the
    /// program's table come from [`Program::kernel`].
    pub fn new(program: &Program, name: &str) -> Result<Kernel> {
        let rt = program.0.rt();
        let handle = rt
            .create_kernel(program.native(), name)
            .cl_context(&format!("clCreateKernel({})", name))?;
        log::debug!("created kernel '{}' {:?}", name, handle);
        let context = program.context().clone();
        Wrapper::wrap(rt, handle, Adopt::Owned, move || KernelFields::new(context)).map(Kernel)
    }

    pub fn from_native(handle: NativeHandle) -> Result<Kernel> {
        Kernel::wrap(&runtime::current()?, handle)
    }

    pub(crate) fn wrap(rt: &Arc<dyn Runtime>, handle: NativeHandle) -> Result<Kernel> {
        let ctx = fetch_info(&**rt, InfoQuery::Kernel, handle, NativeHandle::NULL, CL_KERNEL_CONTEXT, &[])?;
        let context = Context::wrap(rt, ctx.handle()?)?;
        Wrapper::wrap(rt, handle, Adopt::Borrowed, move || KernelFields::new(context)).map(Kernel)
    }

    pub fn info(&self, param: cl_uint) -> Result<&InfoEntry> {
        self.0.core().info(InfoQuery::Kernel, NativeHandle::NULL, param, &[])
    }

    pub fn context(&self) -> &Context {
        &self.0.fields().context
    }

    pub fn function_name(&self) -> Result<&str> {
        self.info(CL_KERNEL_FUNCTION_NAME)?.string()
    }

    pub fn num_args(&self) -> Result<cl_uint> {
        self.info(CL_KERNEL_NUM_ARGS)?.scalar()
    }

    pub fn set_arg(&self, index: cl_uint, arg: &impl KernelArg) -> Result<()> {
        let _guard = self.0.fields().args.lock();
        self.set_record(index, &arg.as_arg())
    }

    /// Sets arguments `0..n` from `args`.
    pub fn set_args(&self, args: impl KernelArgs) -> Result<()> {
        let _guard = self.0.fields().args.lock();
        self.set_records(&args.records())
    }

    fn set_records(&self, records: &[ArgRecord]) -> Result<()> {
        for (index, record) in records.iter().enumerate() {
            self.set_record(index as cl_uint, record)?;
        }
        Ok(())
    }

    fn set_record(&self, index: cl_uint, record: &ArgRecord) -> Result<()> {
        self.0
            .rt()
            .set_kernel_arg(self.native(), index, record.size, record.value.as_deref())
            .cl_context(&format!("clSetKernelArg({})", index))
    }

    /// Launches the kernel over `global.len()` dimensions. `offset` and
    /// `local`, when given, must have as many dimensions as `global`.
    pub fn enqueue_ndrange<'q>(
        &self,
        queue: &'q Queue,
        offset: Option<&[usize]>,
        global: &[usize],
        local: Option<&[usize]>,
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        let dims = global.len();
        if !(1..=3).contains(&dims) {
            return Err(host_err!(InvalidData, "kernels run over 1 to 3 dimensions, not {}", dims));
        }
        for (what, sizes) in [("offset", offset), ("local size", local)] {
            if let Some(sizes) = sizes.filter(|s| s.len() != dims) {
                return Err(host_err!(InvalidData, "{} has {} dimensions, global size has {}", what, sizes.len(), dims));
            }
        }
        let result = queue.0.rt().enqueue_ndrange_kernel(
            queue.native(),
            self.native(),
            offset,
            global,
            local,
            event::wait_raw(&wait),
        );
        queue.enqueued(result, "clEnqueueNDRangeKernel", wait)
    }

    /// Sets `args` and launches without another thread's arguments slipping
    /// in between.
    pub fn set_args_and_enqueue_ndrange<'q>(
        &self,
        queue: &'q Queue,
        offset: Option<&[usize]>,
        global: &[usize],
        local: Option<&[usize]>,
        args: impl KernelArgs,
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        let _guard = self.0.fields().args.lock();
        self.set_records(&args.records())?;
        self.enqueue_ndrange(queue, offset, global, local, wait)
    }

    /// Cached `clGetKernelWorkGroupInfo` query.
    pub fn workgroup_param(&self, device: &Device, param: cl_uint) -> Result<&InfoEntry> {
        self.0.core().info(InfoQuery::KernelWorkGroup, device.native(), param, &[])
    }

    pub fn workgroup_info(&self, device: &Device) -> Result<WorkGroupInfo> {
        let max_work_group_size = self.workgroup_param(device, CL_KERNEL_WORK_GROUP_SIZE)?.scalar()?;
        let preferred_multiple = if self.context().version()? >= ClVersion::V1_1 {
            self.workgroup_param(device, CL_KERNEL_PREFERRED_WORK_GROUP_SIZE_MULTIPLE)?.scalar()?
        } else {
            max_work_group_size
        };
        let mut compile_work_group_size = [0; 3];
        let compiled = self.workgroup_param(device, CL_KERNEL_COMPILE_WORK_GROUP_SIZE)?.array::<usize>()?;
        for (slot, size) in compile_work_group_size.iter_mut().zip(compiled) {
            *slot = size;
        }
        Ok(WorkGroupInfo {
            max_work_group_size,
            preferred_multiple,
            compile_work_group_size,
            local_mem_size: self.workgroup_param(device, CL_KERNEL_LOCAL_MEM_SIZE)?.scalar()?,
            private_mem_size: self.workgroup_param(device, CL_KERNEL_PRIVATE_MEM_SIZE)?.scalar()?,
        })
    }

    /// Cached `clGetKernelArgInfo` query. OpenCL 1.2; the program must have
    /// been built with `-cl-kernel-arg-info` on most platforms.
    pub fn arg_info(&self, index: cl_uint, param: cl_uint) -> Result<&InfoEntry> {
        self.context().version()?.require(ClVersion::V1_2, "kernel argument information")?;
        self.0.core().info(InfoQuery::KernelArg, NativeHandle::from_raw(index as usize), param, &[])
    }

    pub fn arg_type_name(&self, index: cl_uint) -> Result<&str> {
        self.arg_info(index, CL_KERNEL_ARG_TYPE_NAME)?.string()
    }

    pub fn arg_name(&self, index: cl_uint) -> Result<&str> {
        self.arg_info(index, CL_KERNEL_ARG_NAME)?.string()
    }

    /// `clGetKernelSubGroupInfo` for a launch with the given local size.
    /// OpenCL 2.1.
    pub fn sub_group_info(&self, device: &Device, param: cl_uint, local: &[usize]) -> Result<usize> {
        self.context().version()?.require(ClVersion::V2_1, "sub-group information")?;
        self.0
            .core()
            .info(InfoQuery::KernelSubGroup, device.native(), param, bytemuck::cast_slice(local))?
            .scalar()
    }

    /// See [`suggest_worksizes`].
    pub fn suggest_worksizes(
        &self,
        device: &Device,
        real: &[usize],
        max_local: Option<&[usize]>,
    ) -> Result<(Vec<usize>, Vec<usize>)> {
        suggest_worksizes(Some(self), device, real, max_local)
    }
}

impl KernelFields {
    fn new(context: Context) -> Self {
        KernelFields { context, args: Mutex::new(()) }
    }
}

/// Suggests `(global, local)` work sizes covering `real` work items.
///
/// Local sizes start from the kernel's preferred work-group multiple (the
/// device's maximum work-group size without a kernel), are capped by the
/// device's per-dimension limits and by the non-zero entries of
/// `max_local`, and shrink until they fit the work-group limit. Global sizes
/// are `real` rounded up to a multiple of the local sizes.
pub fn suggest_worksizes(
    kernel: Option<&Kernel>,
    device: &Device,
    real: &[usize],
    max_local: Option<&[usize]>,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let dims = real.len();
    let max_dims = device.max_work_item_dimensions()? as usize;
    if dims == 0 || dims > max_dims {
        return Err(host_err!(InvalidData, "{} dimensions requested, device supports 1 to {}", dims, max_dims));
    }
    if real.contains(&0) {
        return Err(host_err!(InvalidData, "work sizes must not be zero"));
    }

    let mut max_items = device.max_work_item_sizes()?;
    max_items.resize(dims, 1);
    if let Some(limits) = max_local {
        for (max, &limit) in max_items.iter_mut().zip(limits) {
            if limit > 0 {
                *max = (*max).min(limit);
            }
        }
    }

    let (wg_max, multiple) = match kernel {
        Some(kernel) => {
            let info = kernel.workgroup_info(device)?;
            (info.max_work_group_size, info.preferred_multiple)
        }
        None => {
            let max = device.max_work_group_size()?;
            (max, max)
        }
    };

    let mut local: Vec<usize> = max_items.iter().map(|&max| multiple.min(max).max(1)).collect();
    for (size, &items) in local.iter_mut().zip(real) {
        while *size > items {
            *size /= 2;
        }
    }
    while local.iter().product::<usize>() > wg_max {
        match local.iter_mut().rev().find(|size| **size > 1) {
            Some(size) => *size /= 2,
            None => return Err(host_err!(Other, "no local size fits a work-group limit of {}", wg_max)),
        }
    }

    let global = real.iter().zip(&local).map(|(&items, &size)| items.div_ceil(size) * size).collect();
    Ok((global, local))
}
