use std::sync::Arc;

use crate::devcontainer::{DeviceCell, DeviceContainer};
use crate::device::Device;
use crate::error::{host_err, ClResultExt, Result};
use crate::raw::*;
use crate::runtime::{self, InfoQuery, Runtime};
use crate::version::ClVersion;
use crate::wrapper::{wrapper_common, Adopt, InfoEntry, Wrapper, WrapperClass};

pub(crate) struct PlatformFields {
    devices: DeviceCell,
}

impl WrapperClass for PlatformFields {
    const CLASS: Class = Class::Platform;

    // Platforms have no reference count.
    fn owns_native(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct Platform(pub(crate) Wrapper<PlatformFields>);

wrapper_common!(Platform);

impl Platform {
    pub fn from_native(handle: NativeHandle) -> Result<Platform> {
        Platform::wrap(&runtime::current()?, handle)
    }

    pub(crate) fn wrap(rt: &Arc<dyn Runtime>, handle: NativeHandle) -> Result<Platform> {
        Wrapper::wrap(rt, handle, Adopt::Borrowed, || PlatformFields { devices: DeviceCell::default() })
            .map(Platform)
    }

    pub fn info(&self, param: cl_uint) -> Result<&InfoEntry> {
        self.0.core().info(InfoQuery::Platform, NativeHandle::NULL, param, &[])
    }

    pub fn name(&self) -> Result<&str> {
        self.info(CL_PLATFORM_NAME)?.string()
    }

    pub fn vendor(&self) -> Result<&str> {
        self.info(CL_PLATFORM_VENDOR)?.string()
    }

    pub fn version_string(&self) -> Result<&str> {
        self.info(CL_PLATFORM_VERSION)?.string()
    }

    pub fn profile(&self) -> Result<&str> {
        self.info(CL_PLATFORM_PROFILE)?.string()
    }

    pub fn extensions(&self) -> Result<&str> {
        self.info(CL_PLATFORM_EXTENSIONS)?.string()
    }

    pub fn version(&self) -> Result<ClVersion> {
        ClVersion::parse(self.version_string()?)
    }
}

impl DeviceContainer for Platform {
    fn devices(&self) -> Result<&[Device]> {
        self.0.fields().devices.get_or_try_init(|| {
            let rt = self.0.rt();
            let handles = rt
                .device_ids(self.native(), CL_DEVICE_TYPE_ALL)
                .cl_context("clGetDeviceIDs")?;
            handles.into_iter().map(|h| Device::wrap(rt, h)).collect()
        })
    }
}

/// Every platform the runtime knows about. Dropping the set unrefs them.
pub struct Platforms {
    platforms: Vec<Platform>,
}

impl Platforms {
    pub fn new() -> Result<Platforms> {
        let rt = runtime::current()?;
        let handles = rt.platform_ids().cl_context("clGetPlatformIDs")?;
        let platforms = handles
            .into_iter()
            .map(|h| Platform::wrap(&rt, h))
            .collect::<Result<Vec<_>>>()?;
        log::debug!("found {} platforms", platforms.len());
        Ok(Platforms { platforms })
    }

    pub fn count(&self) -> usize {
        self.platforms.len()
    }

    pub fn get(&self, index: usize) -> Result<&Platform> {
        self.platforms.get(index).ok_or_else(|| {
            host_err!(InvalidData, "platform index {} out of range ({} platforms)", index, self.count())
        })
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Platform> {
        self.platforms.iter()
    }

    pub fn destroy(self) {}
}

impl<'a> IntoIterator for &'a Platforms {
    type Item = &'a Platform;
    type IntoIter = core::slice::Iter<'a, Platform>;

    fn into_iter(self) -> Self::IntoIter {
        self.platforms.iter()
    }
}
