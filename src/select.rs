//! Device selection pipelines.
//!
//! A [`Filters`] pipeline starts from every device of every platform and
//! narrows the set down one filter at a time. Independent filters judge one
//! device at a time; dependent filters see the whole surviving set.

use std::io::{self, BufRead, Write};

use crate::devcontainer::DeviceContainer;
use crate::device::Device;
use crate::error::{host_err, Error, Result};
use crate::platform::Platforms;
use crate::raw::*;

/// Keeps a device when it returns `true`.
pub type IndependentFilter = Box<dyn Fn(&Device) -> Result<bool> + Send + Sync>;
/// Replaces the device set.
pub type DependentFilter = Box<dyn Fn(Vec<Device>) -> Result<Vec<Device>> + Send + Sync>;

enum Filter {
    Independent(IndependentFilter),
    Dependent(DependentFilter),
}

/// Ordered device-selection pipeline.
#[derive(Default)]
pub struct Filters {
    filters: Vec<Filter>,
}

impl Filters {
    pub fn new() -> Self {
        Filters::default()
    }

    pub fn add_independent(
        &mut self,
        filter: impl Fn(&Device) -> Result<bool> + Send + Sync + 'static,
    ) -> &mut Self {
        self.filters.push(Filter::Independent(Box::new(filter)));
        self
    }

    pub fn add_dependent(
        &mut self,
        filter: impl Fn(Vec<Device>) -> Result<Vec<Device>> + Send + Sync + 'static,
    ) -> &mut Self {
        self.filters.push(Filter::Dependent(Box::new(filter)));
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs the pipeline over all devices, in platform order and then device
    /// order. An empty result is not an error.
    pub fn select(&self) -> Result<Vec<Device>> {
        let platforms = Platforms::new()?;
        let mut devices = Vec::new();
        for platform in &platforms {
            devices.extend(platform.devices()?.iter().cloned());
        }
        log::trace!("selecting among {} devices with {} filters", devices.len(), self.filters.len());
        for filter in &self.filters {
            devices = match filter {
                Filter::Independent(keep) => {
                    let mut kept = Vec::with_capacity(devices.len());
                    for device in devices {
                        if keep(&device)? {
                            kept.push(device);
                        }
                    }
                    kept
                }
                Filter::Dependent(replace) => replace(devices)?,
            };
            if devices.is_empty() {
                break;
            }
        }
        Ok(devices)
    }
}

/// Devices whose type intersects `mask`.
pub fn device_type(mask: cl_device_type) -> impl Fn(&Device) -> Result<bool> + Send + Sync + 'static {
    move |device: &Device| Ok(device.device_type()? & mask != 0)
}

pub fn type_gpu() -> impl Fn(&Device) -> Result<bool> + Send + Sync + 'static {
    device_type(CL_DEVICE_TYPE_GPU)
}

pub fn type_cpu() -> impl Fn(&Device) -> Result<bool> + Send + Sync + 'static {
    device_type(CL_DEVICE_TYPE_CPU)
}

pub fn type_accel() -> impl Fn(&Device) -> Result<bool> + Send + Sync + 'static {
    device_type(CL_DEVICE_TYPE_ACCELERATOR)
}

pub fn type_all() -> impl Fn(&Device) -> Result<bool> + Send + Sync + 'static {
    device_type(CL_DEVICE_TYPE_ALL)
}

/// Devices whose string attribute `param` contains `needle`, ignoring case.
pub fn string_info(param: cl_uint, needle: &str) -> impl Fn(&Device) -> Result<bool> + Send + Sync + 'static {
    let needle = needle.to_lowercase();
    move |device: &Device| Ok(device.info(param)?.string()?.to_lowercase().contains(&needle))
}

pub fn name(needle: &str) -> impl Fn(&Device) -> Result<bool> + Send + Sync + 'static {
    string_info(CL_DEVICE_NAME, needle)
}

pub fn vendor(needle: &str) -> impl Fn(&Device) -> Result<bool> + Send + Sync + 'static {
    string_info(CL_DEVICE_VENDOR, needle)
}

/// Devices of the platform with the given handle.
pub fn platform(handle: NativeHandle) -> impl Fn(&Device) -> Result<bool> + Send + Sync + 'static {
    move |device: &Device| Ok(device.platform_native()? == handle)
}

/// Devices sharing the platform of the first device in the set.
pub fn same_platform() -> impl Fn(Vec<Device>) -> Result<Vec<Device>> + Send + Sync + 'static {
    |devices: Vec<Device>| {
        let first = match devices.first() {
            Some(device) => device.platform_native()?,
            None => return Ok(devices),
        };
        let mut kept = Vec::with_capacity(devices.len());
        for device in devices {
            if device.platform_native()? == first {
                kept.push(device);
            }
        }
        Ok(kept)
    }
}

/// One device picked from a menu printed on stdout, read from stdin. A
/// valid `index` picks without asking.
pub fn menu(index: Option<usize>) -> impl Fn(Vec<Device>) -> Result<Vec<Device>> + Send + Sync + 'static {
    move |devices: Vec<Device>| menu_with_io(devices, index, io::stdin().lock(), io::stdout().lock())
}

/// [`menu`] over arbitrary streams.
pub fn menu_with_io(
    devices: Vec<Device>,
    index: Option<usize>,
    mut input: impl BufRead,
    mut output: impl Write,
) -> Result<Vec<Device>> {
    if devices.is_empty() {
        return Ok(devices);
    }
    let chosen = match index {
        Some(i) if i < devices.len() => {
            list_devices(&mut output, &devices, Some(i))?;
            i
        }
        other => {
            if let Some(i) = other {
                log::warn!("no device at index {}, asking instead", i);
                writeln!(output, "\n   (!) No device at index {}!", i).map_err(write_error)?;
            }
            query_device(&mut input, &mut output, &devices)?
        }
    };
    Ok(devices.into_iter().nth(chosen).into_iter().collect())
}

fn list_devices(output: &mut impl Write, devices: &[Device], selected: Option<usize>) -> Result<()> {
    writeln!(output, "\n   =========================== Device Selection ============================\n")
        .map_err(write_error)?;
    for (i, device) in devices.iter().enumerate() {
        let mark = if selected == Some(i) { "  [SELECTED]" } else { "            " };
        let platform = device.platform()?;
        writeln!(output, " {} {}. {}\n                 {}", mark, i, device.name()?, platform.name()?)
            .map_err(write_error)?;
    }
    Ok(())
}

fn query_device(input: &mut impl BufRead, output: &mut impl Write, devices: &[Device]) -> Result<usize> {
    list_devices(output, devices, None)?;
    if devices.len() == 1 {
        return Ok(0);
    }
    let last = devices.len() - 1;
    let mut line = String::new();
    loop {
        write!(output, "   (?) Select device (0-{}) > ", last).map_err(write_error)?;
        output.flush().map_err(write_error)?;
        line.clear();
        let read = input
            .read_line(&mut line)
            .map_err(|e| host_err!(Other, "unable to read device choice: {}", e))?;
        if read == 0 {
            return Err(host_err!(Other, "input ended before a device was chosen"));
        }
        match line.trim().parse::<usize>() {
            Ok(i) if i <= last => return Ok(i),
            _ => {
                log::warn!("invalid device choice '{}'", line.trim());
                writeln!(output, "   (!) Invalid choice, please insert a value between 0 and {}.", last)
                    .map_err(write_error)?;
            }
        }
    }
}

fn write_error(e: io::Error) -> Error {
    host_err!(StreamWrite, "unable to print device menu: {}", e)
}
