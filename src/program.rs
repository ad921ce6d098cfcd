//! Programs: sources and binaries, builds, the kernel table and the binary
//! table.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::context::Context;
use crate::devcontainer::{DeviceCell, DeviceContainer};
use crate::device::Device;
use crate::error::{cl_error_name, host_err, ClResultExt, Result};
use crate::event::{Event, EventWaitList};
use crate::kernel::Kernel;
use crate::kernel_args::KernelArgs;
use crate::queue::Queue;
use crate::raw::*;
use crate::runtime::{self, InfoQuery, ProgramCallback, Runtime};
use crate::stash::Stash;
use crate::version::ClVersion;
use crate::wrapper::{fetch_info, wrapper_common, Adopt, Core, InfoEntry, Wrapper, WrapperClass};

pub(crate) struct ProgramFields {
    kernels: Stash<String, Kernel>,
    binaries: OnceCell<HashMap<NativeHandle, ProgramBinary>>,
    devices: DeviceCell,
    context: Context,
}

impl WrapperClass for ProgramFields {
    const CLASS: Class = Class::Program;

    fn release_fields(self, core: &Core) {
        let ProgramFields { kernels, binaries, devices, context } = self;
        log::trace!("program {:?} drops {} kernels", core.handle(), kernels.len());
        drop(kernels);
        drop(binaries);
        drop(devices);
        drop(context);
    }
}

/// Compiled program for one device, as returned by `CL_PROGRAM_BINARIES`.
/// Empty when the program was never built for the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramBinary {
    data: Vec<u8>,
}

impl ProgramBinary {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Clone)]
pub struct Program(pub(crate) Wrapper<ProgramFields>);

wrapper_common!(Program);

impl Program {
    pub fn from_source(context: &Context, source: &str) -> Result<Program> {
        Program::from_sources(context, &[source])
    }

    pub fn from_sources(context: &Context, sources: &[&str]) -> Result<Program> {
        let rt = context.0.rt();
        let handle = rt
            .create_program_with_source(context.native(), sources)
            .cl_context("clCreateProgramWithSource")?;
        log::debug!("created program {:?} from {} sources", handle, sources.len());
        Program::own(rt, handle, context, None)
    }

    pub fn from_source_files<P: AsRef<Path>>(context: &Context, paths: &[P]) -> Result<Program> {
        let sources = paths
            .iter()
            .map(|path| {
                let path = path.as_ref();
                fs::read_to_string(path)
                    .map_err(|e| host_err!(OpenFile, "unable to read source file '{}': {}", path.display(), e))
            })
            .collect::<Result<Vec<String>>>()?;
        let sources: Vec<&str> = sources.iter().map(String::as_str).collect();
        Program::from_sources(context, &sources)
    }

    /// Loads one binary per device. Fails if any binary is rejected; the
    /// error then names the status of each device.
    pub fn from_binaries(context: &Context, binaries: &[(&Device, &[u8])]) -> Result<Program> {
        Program::from_binaries_with_status(context, binaries).0
    }

    /// Like [`Program::from_binaries`], also returning the per-device load
    /// status, which is available whether or not loading succeeded.
    pub fn from_binaries_with_status(
        context: &Context,
        binaries: &[(&Device, &[u8])],
    ) -> (Result<Program>, Vec<cl_int>) {
        let rt = context.0.rt();
        let handles: Vec<NativeHandle> = binaries.iter().map(|(dev, _)| dev.native()).collect();
        let blobs: Vec<&[u8]> = binaries.iter().map(|&(_, bin)| bin).collect();
        let (outcome, status) = rt.create_program_with_binary(context.native(), &handles, &blobs);
        let program = outcome
            .cl_context("clCreateProgramWithBinary")
            .map_err(|err| err.with_detail(&binary_status_report(binaries, &status)))
            .and_then(|handle| {
                log::debug!("created program {:?} from {} binaries", handle, blobs.len());
                let devices = binaries.iter().map(|&(dev, _)| dev.clone()).collect();
                Program::own(rt, handle, context, Some(devices))
            });
        (program, status)
    }

    pub fn from_binary_file(context: &Context, device: &Device, path: impl AsRef<Path>) -> Result<Program> {
        Program::from_binary_files(context, &[(device, path)])
    }

    pub fn from_binary_files<P: AsRef<Path>>(context: &Context, files: &[(&Device, P)]) -> Result<Program> {
        let blobs = files
            .iter()
            .map(|(_, path)| {
                let path = path.as_ref();
                fs::read(path)
                    .map_err(|e| host_err!(OpenFile, "unable to read binary file '{}': {}", path.display(), e))
            })
            .collect::<Result<Vec<Vec<u8>>>>()?;
        let pairs: Vec<(&Device, &[u8])> = files.iter().zip(&blobs).map(|((dev, _), bin)| (*dev, &bin[..])).collect();
        Program::from_binaries(context, &pairs)
    }

    /// Program of the device built-in kernels listed in `names`, separated
    /// by `;`. OpenCL 1.2.
    pub fn from_built_in_kernels(context: &Context, devices: &[Device], names: &str) -> Result<Program> {
        context.version()?.require(ClVersion::V1_2, "built-in kernels")?;
        let rt = context.0.rt();
        let handles: Vec<NativeHandle> = devices.iter().map(Device::native).collect();
        let handle = rt
            .create_program_with_built_in_kernels(context.native(), &handles, names)
            .cl_context("clCreateProgramWithBuiltInKernels")?;
        Program::own(rt, handle, context, Some(devices.to_vec()))
    }

    /// Links compiled programs into an executable. Empty `devices` means all
    /// devices of `context`. OpenCL 1.2.
    pub fn link(
        context: &Context,
        devices: &[Device],
        options: &str,
        inputs: &[&Program],
        callback: Option<ProgramCallback>,
    ) -> Result<Program> {
        context.version()?.require(ClVersion::V1_2, "program linking")?;
        let rt = context.0.rt();
        let handles: Vec<NativeHandle> = devices.iter().map(Device::native).collect();
        let inputs: Vec<NativeHandle> = inputs.iter().map(|p| p.native()).collect();
        let (outcome, handle) = rt.link_program(context.native(), &handles, options, &inputs, callback);
        let devices = (!devices.is_empty()).then(|| devices.to_vec());
        let linked = if handle.is_null() { None } else { Some(Program::own(rt, handle, context, devices)?) };
        match (outcome.cl_context("clLinkProgram"), linked) {
            (Ok(()), Some(program)) => {
                log::debug!("linked {} programs into {:?}", inputs.len(), handle);
                Ok(program)
            }
            (Ok(()), None) => Err(host_err!(Other, "clLinkProgram returned no program")),
            (Err(err), Some(program)) => {
                let log = program.build_log().unwrap_or_default();
                log::debug!("link into {:?} failed:\n{}", handle, log);
                Err(err.with_detail(&log))
            }
            (Err(err), None) => Err(err),
        }
    }

    fn own(
        rt: &Arc<dyn Runtime>,
        handle: NativeHandle,
        context: &Context,
        devices: Option<Vec<Device>>,
    ) -> Result<Program> {
        let context = context.clone();
        Wrapper::wrap(rt, handle, Adopt::Owned, move || ProgramFields::new(context, devices)).map(Program)
    }

    pub fn from_native(handle: NativeHandle) -> Result<Program> {
        Program::wrap(&runtime::current()?, handle)
    }

    pub(crate) fn wrap(rt: &Arc<dyn Runtime>, handle: NativeHandle) -> Result<Program> {
        let ctx = fetch_info(&**rt, InfoQuery::Program, handle, NativeHandle::NULL, CL_PROGRAM_CONTEXT, &[])?;
        let context = Context::wrap(rt, ctx.handle()?)?;
        Wrapper::wrap(rt, handle, Adopt::Borrowed, move || ProgramFields::new(context, None)).map(Program)
    }

    pub fn info(&self, param: cl_uint) -> Result<&InfoEntry> {
        self.0.core().info(InfoQuery::Program, NativeHandle::NULL, param, &[])
    }

    pub fn context(&self) -> &Context {
        &self.0.fields().context
    }

    pub fn source(&self) -> Result<&str> {
        self.info(CL_PROGRAM_SOURCE)?.string()
    }

    /// Builds for every program device.
    pub fn build(&self, options: &str) -> Result<()> {
        self.build_full(&[], options, None)
    }

    /// Builds for `devices` (all program devices when empty). On failure the
    /// error carries the build log of each device that produced one.
    pub fn build_full(&self, devices: &[Device], options: &str, callback: Option<ProgramCallback>) -> Result<()> {
        let handles: Vec<NativeHandle> = devices.iter().map(Device::native).collect();
        let outcome = self
            .0
            .rt()
            .build_program(self.native(), &handles, options, callback)
            .cl_context("clBuildProgram");
        match outcome {
            Ok(()) => {
                log::debug!("built program {:?} with options '{}'", self.native(), options);
                Ok(())
            }
            Err(err) => {
                let log = self.build_log().unwrap_or_default();
                log::debug!("build of program {:?} failed:\n{}", self.native(), log);
                Err(err.with_detail(&log))
            }
        }
    }

    /// Compiles without linking. `headers` pairs each embedded header
    /// program with the include name it is known by. OpenCL 1.2.
    pub fn compile(
        &self,
        devices: &[Device],
        options: &str,
        headers: &[(&Program, &str)],
        callback: Option<ProgramCallback>,
    ) -> Result<()> {
        self.context().version()?.require(ClVersion::V1_2, "separate compilation")?;
        let handles: Vec<NativeHandle> = devices.iter().map(Device::native).collect();
        let headers: Vec<(NativeHandle, &str)> = headers.iter().map(|&(p, name)| (p.native(), name)).collect();
        self.0
            .rt()
            .compile_program(self.native(), &handles, options, &headers, callback)
            .cl_context("clCompileProgram")
            .map_err(|err| err.with_detail(&self.build_log().unwrap_or_default()))
    }

    /// Uncached `clGetProgramBuildInfo` query.
    pub fn build_info(&self, device: &Device, param: cl_uint) -> Result<InfoEntry> {
        self.0.core().info_uncached(InfoQuery::ProgramBuild, device.native(), param)
    }

    pub fn build_status(&self, device: &Device) -> Result<cl_build_status> {
        self.build_info(device, CL_PROGRAM_BUILD_STATUS)?.scalar()
    }

    /// Build logs of all program devices, each headed by the device name.
    /// Devices without a log are skipped.
    pub fn build_log(&self) -> Result<String> {
        let mut out = String::new();
        for device in self.devices()? {
            let entry = self.build_info(device, CL_PROGRAM_BUILD_LOG)?;
            let log = entry.string()?.trim_end();
            if log.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("*** Build log for device '{}' ***\n{}", device.name()?, log));
        }
        Ok(out)
    }

    /// Names of the kernels in the built program. OpenCL 1.2.
    pub fn kernel_names(&self) -> Result<Vec<String>> {
        self.context().version()?.require(ClVersion::V1_2, "kernel name queries")?;
        let names = self.0.core().info_uncached(InfoQuery::Program, NativeHandle::NULL, CL_PROGRAM_KERNEL_NAMES)?;
        Ok(names.string()?.split(';').filter(|n| !n.is_empty()).map(str::to_string).collect())
    }

    /// Kernel `name` from the program's table, created on first use. Every
    /// call for one name returns the same kernel, so callers on different
    /// threads must not set its arguments concurrently; they can create
    /// their own with [`Kernel::new`].
    pub fn kernel(&self, name: &str) -> Result<&Kernel> {
        self.0.fields().kernels.get_or_try_insert_with(name.to_string(), || Kernel::new(self, name))
    }

    /// Sets `args` on table kernel `name` and launches it.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_kernel<'q>(
        &self,
        name: &str,
        queue: &'q Queue,
        offset: Option<&[usize]>,
        global: &[usize],
        local: Option<&[usize]>,
        args: impl KernelArgs,
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&'q Event> {
        self.kernel(name)?.set_args_and_enqueue_ndrange(queue, offset, global, local, args, wait)
    }

    /// Binary for `device`. The table is filled for every program device on
    /// the first call after a build; asking earlier fails and caches nothing.
    pub fn binary(&self, device: &Device) -> Result<&ProgramBinary> {
        let table = self.0.fields().binaries.get_or_try_init(|| self.fetch_binaries())?;
        table
            .get(&device.native())
            .ok_or_else(|| host_err!(DeviceNotFound, "device {:?} is not associated with the program", device.native()))
    }

    fn fetch_binaries(&self) -> Result<HashMap<NativeHandle, ProgramBinary>> {
        let devices = self.devices()?;
        let sizes = self
            .0
            .core()
            .info_uncached(InfoQuery::Program, NativeHandle::NULL, CL_PROGRAM_BINARY_SIZES)?
            .array::<usize>()?;
        if sizes.len() != devices.len() {
            return Err(host_err!(
                InvalidData,
                "program reports {} binary sizes for {} devices",
                sizes.len(),
                devices.len()
            ));
        }
        if sizes.iter().all(|&n| n == 0) {
            return Err(host_err!(InfoUnavailable, "program {:?} has no binaries; build it first", self.native()));
        }
        let blobs = self
            .0
            .rt()
            .program_binaries(self.native(), &sizes)
            .cl_context("clGetProgramInfo(CL_PROGRAM_BINARIES)")?;
        Ok(devices.iter().map(Device::native).zip(blobs.into_iter().map(|data| ProgramBinary { data })).collect())
    }

    pub fn save_binary(&self, device: &Device, path: impl AsRef<Path>) -> Result<()> {
        let binary = self.binary(device)?;
        let path = path.as_ref();
        let mut file = fs::File::create(path)
            .map_err(|e| host_err!(OpenFile, "unable to create '{}': {}", path.display(), e))?;
        file.write_all(binary.data())
            .and_then(|()| file.flush())
            .map_err(|e| host_err!(StreamWrite, "unable to write '{}': {}", path.display(), e))
    }

    /// Saves the binary of every program device to
    /// `{prefix}{device name}_{index:02}{suffix}`, with characters of the
    /// device name outside `[A-Za-z0-9_.]` replaced by `_`. Returns the
    /// paths written.
    pub fn save_all_binaries(&self, prefix: &str, suffix: &str) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for (index, device) in self.devices()?.iter().enumerate() {
            let path = PathBuf::from(format!("{}{}_{:02}{}", prefix, canonical_name(device.name()?), index, suffix));
            self.save_binary(device, &path)?;
            written.push(path);
        }
        Ok(written)
    }
}

impl DeviceContainer for Program {
    fn devices(&self) -> Result<&[Device]> {
        self.0.fields().devices.get_or_try_init(|| {
            let rt = self.0.rt();
            self.info(CL_PROGRAM_DEVICES)?.handles()?.into_iter().map(|h| Device::wrap(rt, h)).collect()
        })
    }
}

impl ProgramFields {
    fn new(context: Context, devices: Option<Vec<Device>>) -> Self {
        ProgramFields {
            kernels: Stash::default(),
            binaries: OnceCell::new(),
            devices: devices.map(DeviceCell::with_devices).unwrap_or_default(),
            context,
        }
    }
}

fn binary_status_report(binaries: &[(&Device, &[u8])], status: &[cl_int]) -> String {
    binaries
        .iter()
        .zip(status)
        .map(|(&(dev, _), &code)| format!("device '{}': {}", dev.name().unwrap_or("?"), cl_error_name(code)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn canonical_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' { c } else { '_' })
        .collect()
}
