use std::sync::Arc;

use crate::error::{ClResultExt, HostError, Result};
use crate::platform::Platform;
use crate::raw::*;
use crate::runtime::{self, InfoQuery, Runtime};
use crate::version::ClVersion;
use crate::wrapper::{fetch_info, wrapper_common, Adopt, InfoEntry, Wrapper, WrapperClass};

pub(crate) struct DeviceFields {
    sub_device: bool,
}

impl WrapperClass for DeviceFields {
    const CLASS: Class = Class::Device;

    // Root devices are owned by their platform.
    fn owns_native(&self) -> bool {
        self.sub_device
    }
}

/// A compute device, or a sub-device obtained by partitioning one.
#[derive(Clone)]
pub struct Device(pub(crate) Wrapper<DeviceFields>);

wrapper_common!(Device);

impl Device {
    /// Wraps a device handle obtained elsewhere.
    pub fn from_native(handle: NativeHandle) -> Result<Device> {
        Device::wrap(&runtime::current()?, handle)
    }

    pub(crate) fn wrap(rt: &Arc<dyn Runtime>, handle: NativeHandle) -> Result<Device> {
        // Sub-devices must be retained while wrapped. Before 1.2 the
        // attribute does not exist and every device is a root device.
        let sub_device = if handle.is_null() {
            false
        } else {
            match fetch_info(&**rt, InfoQuery::Device, handle, NativeHandle::NULL, CL_DEVICE_PARENT_DEVICE, &[]) {
                Ok(parent) => !parent.handle()?.is_null(),
                Err(e) if e.is_host(HostError::InfoUnavailable) => false,
                Err(e) => return Err(e),
            }
        };
        Wrapper::wrap(rt, handle, Adopt::Borrowed, || DeviceFields { sub_device }).map(Device)
    }

    pub fn info(&self, param: cl_uint) -> Result<&InfoEntry> {
        self.0.core().info(InfoQuery::Device, NativeHandle::NULL, param, &[])
    }

    pub fn name(&self) -> Result<&str> {
        self.info(CL_DEVICE_NAME)?.string()
    }

    pub fn vendor(&self) -> Result<&str> {
        self.info(CL_DEVICE_VENDOR)?.string()
    }

    pub fn device_type(&self) -> Result<cl_device_type> {
        self.info(CL_DEVICE_TYPE)?.scalar()
    }

    pub fn version_string(&self) -> Result<&str> {
        self.info(CL_DEVICE_VERSION)?.string()
    }

    pub fn version(&self) -> Result<ClVersion> {
        ClVersion::parse(self.version_string()?)
    }

    pub fn extensions(&self) -> Result<&str> {
        self.info(CL_DEVICE_EXTENSIONS)?.string()
    }

    pub fn platform_native(&self) -> Result<NativeHandle> {
        self.info(CL_DEVICE_PLATFORM)?.handle()
    }

    pub fn platform(&self) -> Result<Platform> {
        Platform::wrap(self.0.rt(), self.platform_native()?)
    }

    pub fn max_compute_units(&self) -> Result<cl_uint> {
        self.info(CL_DEVICE_MAX_COMPUTE_UNITS)?.scalar()
    }

    pub fn max_work_group_size(&self) -> Result<usize> {
        self.info(CL_DEVICE_MAX_WORK_GROUP_SIZE)?.scalar()
    }

    pub fn max_work_item_dimensions(&self) -> Result<cl_uint> {
        self.info(CL_DEVICE_MAX_WORK_ITEM_DIMENSIONS)?.scalar()
    }

    pub fn max_work_item_sizes(&self) -> Result<Vec<usize>> {
        self.info(CL_DEVICE_MAX_WORK_ITEM_SIZES)?.array()
    }

    pub fn global_mem_size(&self) -> Result<cl_ulong> {
        self.info(CL_DEVICE_GLOBAL_MEM_SIZE)?.scalar()
    }

    pub fn local_mem_size(&self) -> Result<cl_ulong> {
        self.info(CL_DEVICE_LOCAL_MEM_SIZE)?.scalar()
    }

    pub fn max_mem_alloc_size(&self) -> Result<cl_ulong> {
        self.info(CL_DEVICE_MAX_MEM_ALLOC_SIZE)?.scalar()
    }

    pub fn available(&self) -> Result<bool> {
        self.info(CL_DEVICE_AVAILABLE)?.boolean()
    }

    pub fn compiler_available(&self) -> Result<bool> {
        self.info(CL_DEVICE_COMPILER_AVAILABLE)?.boolean()
    }

    /// Resolution of the profiling timer, in nanoseconds.
    pub fn profiling_timer_resolution(&self) -> Result<usize> {
        self.info(CL_DEVICE_PROFILING_TIMER_RESOLUTION)?.scalar()
    }

    pub fn is_sub_device(&self) -> bool {
        self.0.fields().sub_device
    }

    /// Partitions the device (OpenCL 1.2). `props` is a partition property
    /// list without the terminating zero, e.g.
    /// `[CL_DEVICE_PARTITION_EQUALLY, 4]`.
    pub fn create_sub_devices(&self, props: &[cl_device_partition_property]) -> Result<Vec<Device>> {
        self.version()?.require(ClVersion::V1_2, "device partitioning")?;
        let mut list = props.to_vec();
        list.push(0);
        let rt = self.0.rt();
        let handles = rt.create_sub_devices(self.native(), &list).cl_context("clCreateSubDevices")?;
        log::debug!("{:?} partitioned into {} sub-devices", self.native(), handles.len());
        handles
            .into_iter()
            .map(|h| Wrapper::wrap(rt, h, Adopt::Owned, || DeviceFields { sub_device: true }).map(Device))
            .collect()
    }
}

/// Human readable device type. With `full` every flag set in `ty` is
/// listed, otherwise only the most significant one.
pub fn device_type_str(ty: cl_device_type, full: bool) -> String {
    const NAMES: [(cl_device_type, &str); 5] = [
        (CL_DEVICE_TYPE_CPU, "CPU"),
        (CL_DEVICE_TYPE_GPU, "GPU"),
        (CL_DEVICE_TYPE_ACCELERATOR, "Accelerator"),
        (CL_DEVICE_TYPE_CUSTOM, "Custom"),
        (CL_DEVICE_TYPE_DEFAULT, "Default"),
    ];
    let mut matched = NAMES.iter().filter(|(bit, _)| ty & bit != 0).map(|(_, name)| *name);
    if full {
        let all: Vec<&str> = matched.collect();
        if all.is_empty() {
            "Unknown".to_string()
        } else {
            all.join(" ")
        }
    } else {
        matched.next().unwrap_or("Unknown").to_string()
    }
}
