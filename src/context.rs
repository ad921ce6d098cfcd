use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::devcontainer::{DeviceCell, DeviceContainer};
use crate::device::Device;
use crate::error::{host_err, ClResultExt, Result};
use crate::platform::Platform;
use crate::raw::*;
use crate::runtime::{self, InfoQuery, Runtime};
use crate::select::{self, Filters};
use crate::version::ClVersion;
use crate::wrapper::{wrapper_common, Adopt, InfoEntry, Wrapper, WrapperClass};

pub(crate) struct ContextFields {
    platform: OnceCell<Platform>,
    devices: DeviceCell,
}

impl WrapperClass for ContextFields {
    const CLASS: Class = Class::Context;
}

#[derive(Clone)]
pub struct Context(pub(crate) Wrapper<ContextFields>);

wrapper_common!(Context);

impl Context {
    /// Creates a context holding `devices`, which must belong to one
    /// platform.
    pub fn new(devices: &[Device]) -> Result<Context> {
        Context::with_properties(&[], devices)
    }

    /// Like [`Context::new`] with explicit context properties, given as
    /// `(name, value)` pairs. Without a `CL_CONTEXT_PLATFORM` entry the
    /// platform of the first device is used.
    pub fn with_properties(
        props: &[(cl_context_properties, cl_context_properties)],
        devices: &[Device],
    ) -> Result<Context> {
        let first = devices
            .first()
            .ok_or_else(|| host_err!(DeviceNotFound, "cannot create a context without devices"))?;
        let rt = first.0.rt().clone();
        let mut list = Vec::with_capacity(props.len() * 2 + 3);
        for &(name, value) in props {
            list.extend([name, value]);
        }
        if !props.iter().any(|&(name, _)| name == CL_CONTEXT_PLATFORM) {
            list.extend([CL_CONTEXT_PLATFORM, first.platform_native()?.to_raw() as cl_context_properties]);
        }
        list.push(0);
        let handles: Vec<NativeHandle> = devices.iter().map(Device::native).collect();
        let handle = rt.create_context(&list, &handles).cl_context("clCreateContext")?;
        log::debug!("created context {:?} with {} devices", handle, devices.len());
        let devices = devices.to_vec();
        Wrapper::wrap(&rt, handle, Adopt::Owned, move || ContextFields {
            platform: OnceCell::new(),
            devices: DeviceCell::with_devices(devices),
        })
        .map(Context)
    }

    /// Creates a context from raw device handles.
    pub fn from_device_handles(handles: &[NativeHandle]) -> Result<Context> {
        let rt = runtime::current()?;
        let devices = handles.iter().map(|&h| Device::wrap(&rt, h)).collect::<Result<Vec<_>>>()?;
        Context::new(&devices)
    }

    /// Creates a context with the devices selected by `filters`.
    pub fn from_filters(filters: &Filters) -> Result<Context> {
        let devices = filters.select()?;
        if devices.is_empty() {
            return Err(host_err!(DeviceNotFound, "no device matched the selection filters"));
        }
        Context::new(&devices)
    }

    /// Creates a context with a device chosen from a menu printed on
    /// stdout. With a valid `index` the menu is skipped.
    pub fn from_menu(index: Option<usize>) -> Result<Context> {
        let mut filters = Filters::new();
        filters.add_dependent(select::menu(index));
        Context::from_filters(&filters)
    }

    /// Creates a context with the devices of type `ty` found on the first
    /// platform that has any.
    pub fn from_type(ty: cl_device_type) -> Result<Context> {
        let mut filters = Filters::new();
        filters.add_independent(select::device_type(ty));
        filters.add_dependent(select::same_platform());
        Context::from_filters(&filters)
    }

    pub fn gpu() -> Result<Context> {
        Context::from_type(CL_DEVICE_TYPE_GPU)
    }

    pub fn cpu() -> Result<Context> {
        Context::from_type(CL_DEVICE_TYPE_CPU)
    }

    pub fn accel() -> Result<Context> {
        Context::from_type(CL_DEVICE_TYPE_ACCELERATOR)
    }

    pub fn any() -> Result<Context> {
        Context::from_type(CL_DEVICE_TYPE_ALL)
    }

    pub fn from_native(handle: NativeHandle) -> Result<Context> {
        Context::wrap(&runtime::current()?, handle)
    }

    pub(crate) fn wrap(rt: &Arc<dyn Runtime>, handle: NativeHandle) -> Result<Context> {
        Wrapper::wrap(rt, handle, Adopt::Borrowed, || ContextFields {
            platform: OnceCell::new(),
            devices: DeviceCell::default(),
        })
        .map(Context)
    }

    pub fn info(&self, param: cl_uint) -> Result<&InfoEntry> {
        self.0.core().info(InfoQuery::Context, NativeHandle::NULL, param, &[])
    }

    /// Platform of the context's devices.
    pub fn platform(&self) -> Result<&Platform> {
        self.0
            .fields()
            .platform
            .get_or_try_init(|| self.device(0)?.platform())
    }

    /// OpenCL revision of the context's platform.
    pub fn version(&self) -> Result<ClVersion> {
        self.platform()?.version()
    }

    pub fn supported_image_formats(
        &self,
        flags: cl_mem_flags,
        image_type: cl_mem_object_type,
    ) -> Result<Vec<ImageFormat>> {
        self.0
            .rt()
            .supported_image_formats(self.native(), flags, image_type)
            .cl_context("clGetSupportedImageFormats")
    }
}

impl DeviceContainer for Context {
    fn devices(&self) -> Result<&[Device]> {
        self.0.fields().devices.get_or_try_init(|| {
            let rt = self.0.rt();
            let handles = self.info(CL_CONTEXT_DEVICES)?.handles()?;
            handles.into_iter().map(|h| Device::wrap(rt, h)).collect()
        })
    }
}
