//! In-process stand-in for an OpenCL implementation, so the wrapper layer
//! can be exercised without a device.
//!
//! Commands execute synchronously at enqueue time. Every event completes
//! immediately with timestamps taken from a fake nanosecond clock; kernels
//! run only when a Rust body was registered with [`FakeRuntime::on_kernel`].

use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

use crate::raw::*;
use crate::runtime::{
    self, EventCallback, ImageDesc, InfoQuery, ProgramCallback, Rect, RtResult, Runtime,
};

static TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static NEXT_HANDLE: AtomicUsize = AtomicUsize::new(0x1000);

/// Serialises tests that touch the process-wide identity map or runtime.
pub(crate) fn lock() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock()
}

/// Takes the test lock and installs a fresh default fake runtime.
pub(crate) fn setup() -> (MutexGuard<'static, ()>, Arc<FakeRuntime>) {
    setup_with(vec![FakePlatform::default()])
}

pub(crate) fn setup_with(platforms: Vec<FakePlatform>) -> (MutexGuard<'static, ()>, Arc<FakeRuntime>) {
    let guard = lock();
    let fake = FakeRuntime::with_platforms(platforms);
    runtime::install(fake.clone());
    (guard, fake)
}

/// Time every fake command takes, in nanoseconds.
pub(crate) const COMMAND_NS: u64 = 10;

pub(crate) struct FakeDevice {
    pub name: String,
    pub vendor: String,
    pub ty: cl_device_type,
    pub version: String,
    pub compute_units: cl_uint,
}

impl FakeDevice {
    pub fn new(name: &str, ty: cl_device_type) -> Self {
        FakeDevice {
            name: name.to_string(),
            vendor: "Fakes Inc.".to_string(),
            ty,
            version: "OpenCL 2.0 fake".to_string(),
            compute_units: 8,
        }
    }
}

pub(crate) struct FakePlatform {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub devices: Vec<FakeDevice>,
}

impl FakePlatform {
    pub fn new(name: &str, version: &str, devices: Vec<FakeDevice>) -> Self {
        FakePlatform {
            name: name.to_string(),
            vendor: "Fakes Inc.".to_string(),
            version: version.to_string(),
            devices,
        }
    }
}

impl Default for FakePlatform {
    fn default() -> Self {
        FakePlatform::new(
            "Fake Platform",
            "OpenCL 2.0 fake",
            vec![
                FakeDevice::new("Fake GPU", CL_DEVICE_TYPE_GPU),
                FakeDevice::new("Fake CPU", CL_DEVICE_TYPE_CPU),
            ],
        )
    }
}

/// Arguments of a launched kernel, handed to registered kernel bodies.
pub(crate) struct FakeLaunch<'a> {
    state: &'a mut State,
    args: Vec<(usize, Option<Vec<u8>>)>,
    pub global: Vec<usize>,
}

impl FakeLaunch<'_> {
    pub fn scalar<T: bytemuck::Pod>(&self, index: usize) -> T {
        let bytes = self.args[index].1.as_ref().expect("scalar argument");
        bytemuck::pod_read_unaligned(bytes)
    }
    fn mem_arg(&self, index: usize) -> NativeHandle {
        NativeHandle::from_raw(self.scalar::<usize>(index))
    }
    pub fn buffer<T: bytemuck::Pod>(&self, index: usize) -> Vec<T> {
        let (store, offset, size) = self.state.storage(self.mem_arg(index));
        let data = &self.state.mem_data(store)[offset..offset + size];
        bytemuck::pod_collect_to_vec(data)
    }
    pub fn write_buffer<T: bytemuck::Pod>(&mut self, index: usize, values: &[T]) {
        let (store, offset, _) = self.state.storage(self.mem_arg(index));
        let bytes: &[u8] = bytemuck::cast_slice(values);
        self.state.mem_data_mut(store)[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
    pub fn local_size(&self, index: usize) -> usize {
        self.args[index].0
    }
}

type KernelBody = Arc<dyn Fn(&mut FakeLaunch<'_>) + Send + Sync>;

enum Obj {
    Platform { info: HashMap<cl_uint, Vec<u8>>, devices: Vec<NativeHandle> },
    Device { info: HashMap<cl_uint, Vec<u8>>, ty: cl_device_type },
    Context { devices: Vec<NativeHandle>, props: Vec<cl_context_properties> },
    Queue { context: NativeHandle, device: NativeHandle, props: cl_command_queue_properties },
    Mem {
        context: NativeHandle,
        flags: cl_mem_flags,
        size: usize,
        data: Vec<u8>,
        parent: Option<(NativeHandle, usize)>,
        image: Option<(ImageFormat, ImageDesc)>,
    },
    Sampler { context: NativeHandle, normalized: bool, addressing: cl_addressing_mode, filter: cl_filter_mode },
    Program {
        context: NativeHandle,
        devices: Vec<NativeHandle>,
        source: String,
        builds: HashMap<NativeHandle, (cl_build_status, String, String)>,
        kernels: Vec<(String, Vec<(String, String)>)>,
    },
    Kernel { context: NativeHandle, program: NativeHandle, name: String, params: Vec<(String, String)>, args: Vec<(usize, Option<Vec<u8>>)> },
    Event {
        context: NativeHandle,
        queue: NativeHandle,
        command_type: cl_command_type,
        status: cl_int,
        times: [cl_ulong; 4],
        callbacks: Vec<(cl_int, EventCallback)>,
    },
}

#[derive(Default)]
struct State {
    objects: HashMap<NativeHandle, Obj>,
    platforms: Vec<NativeHandle>,
    created: HashSet<NativeHandle>,
    retains: HashMap<NativeHandle, usize>,
    releases: HashMap<NativeHandle, usize>,
    clock: cl_ulong,
    info_calls: usize,
    bodies: HashMap<String, KernelBody>,
}

pub(crate) const BINARY_MAGIC: &[u8] = b"FAKEBIN\0";

fn new_handle() -> NativeHandle {
    NativeHandle::from_raw(NEXT_HANDLE.fetch_add(0x10, Ordering::Relaxed))
}

fn string_bytes(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

fn pod_bytes<T: bytemuck::Pod>(v: T) -> Vec<u8> {
    bytemuck::bytes_of(&v).to_vec()
}

fn slice_bytes<T: bytemuck::Pod>(v: &[T]) -> Vec<u8> {
    bytemuck::cast_slice::<T, u8>(v).to_vec()
}

fn handle_bytes(h: NativeHandle) -> Vec<u8> {
    pod_bytes(h.to_raw())
}

fn handles_bytes(hs: &[NativeHandle]) -> Vec<u8> {
    let raw: Vec<usize> = hs.iter().map(|h| h.to_raw()).collect();
    slice_bytes(&raw)
}

/// Kernel names and parameter lists, from `__kernel void name(params)`.
fn parse_kernels(source: &str) -> Vec<(String, Vec<(String, String)>)> {
    let mut out = Vec::new();
    let mut rest = source;
    while let Some(pos) = rest.find("__kernel") {
        rest = &rest[pos + "__kernel".len()..];
        let open = match rest.find('(') {
            Some(p) => p,
            None => break,
        };
        let close = match rest[open..].find(')') {
            Some(p) => open + p,
            None => break,
        };
        let head = rest[..open].trim();
        let name = head.rsplit(char::is_whitespace).next().unwrap_or("").to_string();
        let params = rest[open + 1..close]
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty() && *p != "void")
            .map(|p| {
                let split = p.rfind(|c: char| c.is_whitespace() || c == '*').unwrap_or(0);
                let pname = p[split..].trim_start_matches(['*', ' ']).to_string();
                let ty = p[..split + 1]
                    .replace("__global", "")
                    .replace("__local", "")
                    .replace("__constant", "")
                    .replace("const", "")
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ");
                (ty.replace(" *", "*"), pname)
            })
            .collect();
        out.push((name, params));
        rest = &rest[close..];
    }
    out
}

fn format_size(f: &ImageFormat) -> usize {
    let channels = match f.image_channel_order {
        CL_RG | CL_RA => 2,
        CL_RGB => 3,
        CL_RGBA | CL_BGRA | CL_ARGB => 4,
        _ => 1,
    };
    let width = match f.image_channel_data_type {
        CL_SNORM_INT16 | CL_UNORM_INT16 | CL_SIGNED_INT16 | CL_UNSIGNED_INT16 | CL_HALF_FLOAT => 2,
        CL_SIGNED_INT32 | CL_UNSIGNED_INT32 | CL_FLOAT => 4,
        _ => 1,
    };
    channels * width
}

/// One pixel of `format` filled with `color`: normalized 8-bit channels
/// are converted from floats, other channel types keep the low bytes of
/// each 32-bit component.
fn fill_pixel(format: &ImageFormat, color: &[u8; 16]) -> Vec<u8> {
    let elem = format_size(format);
    let channels = match format.image_channel_order {
        CL_RG | CL_RA => 2,
        CL_RGB => 3,
        CL_RGBA | CL_BGRA | CL_ARGB => 4,
        _ => 1,
    };
    let width = elem / channels;
    let component = |c: usize| &color[4 * c..4 * c + 4];
    (0..channels)
        .flat_map(|c| {
            if format.image_channel_data_type == CL_UNORM_INT8 {
                let value: f32 = bytemuck::pod_read_unaligned(component(c));
                vec![(value.clamp(0.0, 1.0) * 255.0).round() as u8]
            } else {
                component(c)[..width].to_vec()
            }
        })
        .collect()
}

/// Byte offsets of the rows of a rectangular region.
fn rect_rows(
    origin: [usize; 3],
    region: [usize; 3],
    row_pitch: usize,
    slice_pitch: usize,
) -> Vec<usize> {
    let row_pitch = if row_pitch == 0 { region[0] } else { row_pitch };
    let slice_pitch = if slice_pitch == 0 { region[1] * row_pitch } else { slice_pitch };
    let mut rows = Vec::new();
    for z in 0..region[2] {
        for y in 0..region[1] {
            rows.push(origin[0] + (origin[1] + y) * row_pitch + (origin[2] + z) * slice_pitch);
        }
    }
    rows
}

impl State {
    fn obj(&self, h: NativeHandle) -> RtResult<&Obj> {
        self.objects.get(&h).ok_or(CL_INVALID_VALUE)
    }

    fn insert(&mut self, obj: Obj) -> NativeHandle {
        let h = new_handle();
        self.objects.insert(h, obj);
        self.created.insert(h);
        h
    }

    fn platform_version(&self, platform: NativeHandle) -> String {
        match self.objects.get(&platform) {
            Some(Obj::Platform { info, .. }) => {
                let bytes = info.get(&CL_PLATFORM_VERSION).cloned().unwrap_or_default();
                String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string()
            }
            _ => String::new(),
        }
    }

    /// Backing store, offset and size of a memory object.
    fn storage(&self, mem: NativeHandle) -> (NativeHandle, usize, usize) {
        match self.objects.get(&mem) {
            Some(Obj::Mem { parent: Some((p, origin)), size, .. }) => {
                let (store, base, _) = self.storage(*p);
                (store, base + origin, *size)
            }
            Some(Obj::Mem { size, .. }) => (mem, 0, *size),
            _ => (mem, 0, 0),
        }
    }

    fn mem_data(&self, store: NativeHandle) -> &Vec<u8> {
        match self.objects.get(&store) {
            Some(Obj::Mem { data, .. }) => data,
            _ => panic!("{:?} is not a memory object", store),
        }
    }

    fn mem_data_mut(&mut self, store: NativeHandle) -> &mut Vec<u8> {
        match self.objects.get_mut(&store) {
            Some(Obj::Mem { data, .. }) => data,
            _ => panic!("{:?} is not a memory object", store),
        }
    }

    fn check_mem(&self, mem: NativeHandle, offset: usize, size: usize) -> RtResult<()> {
        match self.objects.get(&mem) {
            Some(Obj::Mem { size: total, .. }) if offset + size <= *total => Ok(()),
            Some(Obj::Mem { .. }) => Err(CL_INVALID_VALUE),
            _ => Err(CL_INVALID_MEM_OBJECT),
        }
    }

    fn queue_context(&self, queue: NativeHandle) -> RtResult<NativeHandle> {
        match self.objects.get(&queue) {
            Some(Obj::Queue { context, .. }) => Ok(*context),
            _ => Err(CL_INVALID_COMMAND_QUEUE),
        }
    }

    fn check_wait(&self, wait: &[NativeHandle]) -> RtResult<()> {
        for ev in wait {
            match self.objects.get(ev) {
                Some(Obj::Event { status, .. }) if *status < 0 => {
                    return Err(CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST)
                }
                Some(Obj::Event { .. }) => (),
                _ => return Err(CL_INVALID_EVENT_WAIT_LIST),
            }
        }
        Ok(())
    }

    /// Records a completed command on `queue`.
    fn event(
        &mut self,
        queue: NativeHandle,
        command_type: cl_command_type,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let context = self.queue_context(queue)?;
        self.check_wait(wait)?;
        let duration = match command_type {
            CL_COMMAND_MARKER | CL_COMMAND_BARRIER => 0,
            _ => COMMAND_NS,
        };
        let queued = self.clock;
        let start = queued + 2;
        let end = start + duration;
        self.clock = end + 1;
        Ok(self.insert(Obj::Event {
            context,
            queue,
            command_type,
            status: CL_COMPLETE,
            times: [queued, queued + 1, start, end],
            callbacks: Vec::new(),
        }))
    }

    fn info(
        &self,
        query: InfoQuery,
        handle: NativeHandle,
        secondary: NativeHandle,
        param: cl_uint,
        input: &[u8],
    ) -> RtResult<Vec<u8>> {
        let obj = self.obj(handle)?;
        let bytes = match (query, obj) {
            (InfoQuery::Platform, Obj::Platform { info, .. }) => info.get(&param).cloned(),
            (InfoQuery::Device, Obj::Device { info, .. }) => info.get(&param).cloned(),
            (InfoQuery::Context, Obj::Context { devices, props }) => match param {
                CL_CONTEXT_DEVICES => Some(handles_bytes(devices)),
                CL_CONTEXT_NUM_DEVICES => Some(pod_bytes(devices.len() as cl_uint)),
                CL_CONTEXT_PROPERTIES => Some(slice_bytes(props)),
                CL_CONTEXT_REFERENCE_COUNT => Some(pod_bytes(1 as cl_uint)),
                _ => None,
            },
            (InfoQuery::Queue, Obj::Queue { context, device, props }) => match param {
                CL_QUEUE_CONTEXT => Some(handle_bytes(*context)),
                CL_QUEUE_DEVICE => Some(handle_bytes(*device)),
                CL_QUEUE_PROPERTIES => Some(pod_bytes(*props)),
                _ => None,
            },
            (InfoQuery::Mem, Obj::Mem { context, flags, size, parent, image, .. }) => match param {
                CL_MEM_TYPE => Some(pod_bytes(match image {
                    Some((_, desc)) => desc.image_type,
                    None => CL_MEM_OBJECT_BUFFER,
                })),
                CL_MEM_FLAGS => Some(pod_bytes(*flags)),
                CL_MEM_SIZE => Some(pod_bytes(*size)),
                CL_MEM_CONTEXT => Some(handle_bytes(*context)),
                CL_MEM_ASSOCIATED_MEMOBJECT => {
                    Some(handle_bytes(parent.map(|p| p.0).unwrap_or(NativeHandle::NULL)))
                }
                CL_MEM_OFFSET => Some(pod_bytes(parent.map(|p| p.1).unwrap_or(0))),
                CL_MEM_MAP_COUNT | CL_MEM_REFERENCE_COUNT => Some(pod_bytes(1 as cl_uint)),
                _ => None,
            },
            (InfoQuery::Image, Obj::Mem { image: Some((format, desc)), .. }) => {
                let elem = format_size(format);
                match param {
                    CL_IMAGE_FORMAT => Some(slice_bytes(&[
                        format.image_channel_order,
                        format.image_channel_data_type,
                    ])),
                    CL_IMAGE_ELEMENT_SIZE => Some(pod_bytes(elem)),
                    CL_IMAGE_ROW_PITCH => Some(pod_bytes(desc.width * elem)),
                    CL_IMAGE_SLICE_PITCH => Some(pod_bytes(desc.width * desc.height.max(1) * elem)),
                    CL_IMAGE_WIDTH => Some(pod_bytes(desc.width)),
                    CL_IMAGE_HEIGHT => Some(pod_bytes(desc.height)),
                    CL_IMAGE_DEPTH => Some(pod_bytes(desc.depth)),
                    _ => None,
                }
            }
            (InfoQuery::Sampler, Obj::Sampler { context, normalized, addressing, filter }) => {
                match param {
                    CL_SAMPLER_CONTEXT => Some(handle_bytes(*context)),
                    CL_SAMPLER_NORMALIZED_COORDS => Some(pod_bytes(*normalized as cl_bool)),
                    CL_SAMPLER_ADDRESSING_MODE => Some(pod_bytes(*addressing)),
                    CL_SAMPLER_FILTER_MODE => Some(pod_bytes(*filter)),
                    CL_SAMPLER_REFERENCE_COUNT => Some(pod_bytes(1 as cl_uint)),
                    _ => None,
                }
            }
            (InfoQuery::Program, Obj::Program { context, devices, source, builds, kernels }) => {
                let built = devices
                    .iter()
                    .any(|d| builds.get(d).map(|b| b.0 == CL_BUILD_SUCCESS).unwrap_or(false));
                match param {
                    CL_PROGRAM_CONTEXT => Some(handle_bytes(*context)),
                    CL_PROGRAM_NUM_DEVICES => Some(pod_bytes(devices.len() as cl_uint)),
                    CL_PROGRAM_DEVICES => Some(handles_bytes(devices)),
                    CL_PROGRAM_SOURCE => Some(string_bytes(source)),
                    CL_PROGRAM_BINARY_SIZES => {
                        let sizes: Vec<usize> = devices
                            .iter()
                            .map(|d| match builds.get(d) {
                                Some((CL_BUILD_SUCCESS, _, _)) => BINARY_MAGIC.len() + source.len(),
                                _ => 0,
                            })
                            .collect();
                        Some(slice_bytes(&sizes))
                    }
                    CL_PROGRAM_NUM_KERNELS if built => Some(pod_bytes(kernels.len())),
                    CL_PROGRAM_KERNEL_NAMES if built => {
                        let names: Vec<&str> = kernels.iter().map(|k| k.0.as_str()).collect();
                        Some(string_bytes(&names.join(";")))
                    }
                    CL_PROGRAM_NUM_KERNELS | CL_PROGRAM_KERNEL_NAMES => {
                        return Err(CL_INVALID_PROGRAM_EXECUTABLE)
                    }
                    CL_PROGRAM_REFERENCE_COUNT => Some(pod_bytes(1 as cl_uint)),
                    _ => None,
                }
            }
            (InfoQuery::ProgramBuild, Obj::Program { devices, builds, .. }) => {
                if !devices.contains(&secondary) {
                    return Err(CL_INVALID_DEVICE);
                }
                let (status, log, options) = builds
                    .get(&secondary)
                    .cloned()
                    .unwrap_or((CL_BUILD_NONE, String::new(), String::new()));
                match param {
                    CL_PROGRAM_BUILD_STATUS => Some(pod_bytes(status)),
                    CL_PROGRAM_BUILD_LOG => Some(string_bytes(&log)),
                    CL_PROGRAM_BUILD_OPTIONS => Some(string_bytes(&options)),
                    _ => None,
                }
            }
            (InfoQuery::Kernel, Obj::Kernel { context, program, name, params, .. }) => match param {
                CL_KERNEL_FUNCTION_NAME => Some(string_bytes(name)),
                CL_KERNEL_NUM_ARGS => Some(pod_bytes(params.len() as cl_uint)),
                CL_KERNEL_CONTEXT => Some(handle_bytes(*context)),
                CL_KERNEL_PROGRAM => Some(handle_bytes(*program)),
                CL_KERNEL_REFERENCE_COUNT => Some(pod_bytes(1 as cl_uint)),
                _ => None,
            },
            (InfoQuery::KernelWorkGroup, Obj::Kernel { .. }) => match param {
                CL_KERNEL_WORK_GROUP_SIZE => Some(pod_bytes(256usize)),
                CL_KERNEL_COMPILE_WORK_GROUP_SIZE => Some(slice_bytes(&[0usize; 3])),
                CL_KERNEL_LOCAL_MEM_SIZE => Some(pod_bytes(0 as cl_ulong)),
                CL_KERNEL_PREFERRED_WORK_GROUP_SIZE_MULTIPLE => Some(pod_bytes(32usize)),
                CL_KERNEL_PRIVATE_MEM_SIZE => Some(pod_bytes(0 as cl_ulong)),
                _ => None,
            },
            (InfoQuery::KernelArg, Obj::Kernel { params, .. }) => {
                let (ty, name) = params.get(secondary.to_raw()).ok_or(CL_INVALID_ARG_INDEX)?;
                match param {
                    CL_KERNEL_ARG_TYPE_NAME => Some(string_bytes(ty)),
                    CL_KERNEL_ARG_NAME => Some(string_bytes(name)),
                    _ => None,
                }
            }
            (InfoQuery::KernelSubGroup, Obj::Kernel { .. }) => {
                let local: Vec<usize> = bytemuck::pod_collect_to_vec(input);
                let items: usize = local.iter().product();
                match param {
                    CL_KERNEL_MAX_SUB_GROUP_SIZE_FOR_NDRANGE => Some(pod_bytes(32usize.min(items))),
                    CL_KERNEL_SUB_GROUP_COUNT_FOR_NDRANGE => Some(pod_bytes(items.div_ceil(32))),
                    _ => None,
                }
            }
            (InfoQuery::Event, Obj::Event { context, queue, command_type, status, .. }) => match param {
                CL_EVENT_COMMAND_QUEUE => Some(handle_bytes(*queue)),
                CL_EVENT_CONTEXT => Some(handle_bytes(*context)),
                CL_EVENT_COMMAND_TYPE => Some(pod_bytes(*command_type)),
                CL_EVENT_COMMAND_EXECUTION_STATUS => Some(pod_bytes(*status)),
                CL_EVENT_REFERENCE_COUNT => Some(pod_bytes(1 as cl_uint)),
                _ => None,
            },
            (InfoQuery::EventProfiling, Obj::Event { queue, times, status, .. }) => {
                let profiling = matches!(
                    self.objects.get(queue),
                    Some(Obj::Queue { props, .. }) if props & CL_QUEUE_PROFILING_ENABLE != 0
                );
                if !profiling || *status != CL_COMPLETE {
                    return Err(CL_PROFILING_INFO_NOT_AVAILABLE);
                }
                match param {
                    CL_PROFILING_COMMAND_QUEUED => Some(pod_bytes(times[0])),
                    CL_PROFILING_COMMAND_SUBMIT => Some(pod_bytes(times[1])),
                    CL_PROFILING_COMMAND_START => Some(pod_bytes(times[2])),
                    CL_PROFILING_COMMAND_END => Some(pod_bytes(times[3])),
                    _ => None,
                }
            }
            _ => return Err(CL_INVALID_VALUE),
        };
        bytes.ok_or(CL_INVALID_VALUE)
    }
}

/// Fake OpenCL implementation. See the module docs.
pub(crate) struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Self::with_platforms(vec![FakePlatform::default()])
    }

    pub fn with_platforms(platforms: Vec<FakePlatform>) -> Arc<Self> {
        let mut state = State::default();
        for p in platforms {
            let mut device_handles = Vec::new();
            let platform = new_handle();
            for d in p.devices {
                let h = new_handle();
                let mut info = HashMap::new();
                info.insert(CL_DEVICE_NAME, string_bytes(&d.name));
                info.insert(CL_DEVICE_VENDOR, string_bytes(&d.vendor));
                info.insert(CL_DEVICE_VERSION, string_bytes(&d.version));
                info.insert(CL_DRIVER_VERSION, string_bytes("1.0"));
                info.insert(CL_DEVICE_OPENCL_C_VERSION, string_bytes("OpenCL C 1.2"));
                info.insert(CL_DEVICE_EXTENSIONS, string_bytes(""));
                info.insert(CL_DEVICE_TYPE, pod_bytes(d.ty));
                info.insert(CL_DEVICE_PLATFORM, handle_bytes(platform));
                info.insert(CL_DEVICE_MAX_COMPUTE_UNITS, pod_bytes(d.compute_units));
                info.insert(CL_DEVICE_MAX_WORK_GROUP_SIZE, pod_bytes(256usize));
                info.insert(CL_DEVICE_MAX_WORK_ITEM_DIMENSIONS, pod_bytes(3 as cl_uint));
                info.insert(
                    CL_DEVICE_MAX_WORK_ITEM_SIZES,
                    slice_bytes(&[256usize, 256, 64]),
                );
                info.insert(CL_DEVICE_GLOBAL_MEM_SIZE, pod_bytes(1u64 << 30));
                info.insert(CL_DEVICE_LOCAL_MEM_SIZE, pod_bytes(32u64 << 10));
                info.insert(CL_DEVICE_MAX_MEM_ALLOC_SIZE, pod_bytes(1u64 << 28));
                info.insert(CL_DEVICE_MAX_CLOCK_FREQUENCY, pod_bytes(1000 as cl_uint));
                info.insert(CL_DEVICE_AVAILABLE, pod_bytes(CL_TRUE));
                info.insert(CL_DEVICE_COMPILER_AVAILABLE, pod_bytes(CL_TRUE));
                info.insert(CL_DEVICE_IMAGE_SUPPORT, pod_bytes(CL_TRUE));
                info.insert(CL_DEVICE_PROFILING_TIMER_RESOLUTION, pod_bytes(1usize));
                info.insert(CL_DEVICE_PARENT_DEVICE, handle_bytes(NativeHandle::NULL));
                state.objects.insert(h, Obj::Device { info, ty: d.ty });
                device_handles.push(h);
            }
            let mut info = HashMap::new();
            info.insert(CL_PLATFORM_NAME, string_bytes(&p.name));
            info.insert(CL_PLATFORM_VENDOR, string_bytes(&p.vendor));
            info.insert(CL_PLATFORM_VERSION, string_bytes(&p.version));
            info.insert(CL_PLATFORM_PROFILE, string_bytes("FULL_PROFILE"));
            info.insert(CL_PLATFORM_EXTENSIONS, string_bytes("cl_khr_fake"));
            state.objects.insert(platform, Obj::Platform { info, devices: device_handles });
            state.platforms.push(platform);
        }
        Arc::new(FakeRuntime { state: Mutex::new(state) })
    }

    pub fn into_dyn(self: Arc<Self>) -> Arc<dyn Runtime> {
        self
    }

    /// A handle no other fake object uses.
    pub fn new_handle(&self) -> NativeHandle {
        let h = new_handle();
        self.state.lock().created.insert(h);
        h
    }

    pub fn platforms(&self) -> Vec<NativeHandle> {
        self.state.lock().platforms.clone()
    }

    pub fn devices(&self) -> Vec<NativeHandle> {
        let state = self.state.lock();
        state
            .platforms
            .iter()
            .flat_map(|p| match state.objects.get(p) {
                Some(Obj::Platform { devices, .. }) => devices.clone(),
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn retains(&self, h: NativeHandle) -> usize {
        self.state.lock().retains.get(&h).copied().unwrap_or(0)
    }

    pub fn releases(&self, h: NativeHandle) -> usize {
        self.state.lock().releases.get(&h).copied().unwrap_or(0)
    }

    /// Objects created by factory calls whose native references were not
    /// all given back.
    pub fn leaked(&self) -> Vec<NativeHandle> {
        let state = self.state.lock();
        let mut leaked: Vec<NativeHandle> = state
            .created
            .iter()
            .copied()
            .filter(|h| {
                let taken = 1 + state.retains.get(h).copied().unwrap_or(0);
                taken != state.releases.get(h).copied().unwrap_or(0)
            })
            .collect();
        leaked.sort();
        leaked
    }

    pub fn info_calls(&self) -> usize {
        self.state.lock().info_calls
    }

    /// Overrides a platform or device attribute.
    pub fn set_info(&self, h: NativeHandle, param: cl_uint, bytes: Vec<u8>) {
        let mut state = self.state.lock();
        match state.objects.get_mut(&h) {
            Some(Obj::Platform { info, .. }) | Some(Obj::Device { info, .. }) => {
                info.insert(param, bytes);
            }
            _ => panic!("{:?} has no attribute table", h),
        }
    }

    /// Overrides the profiling instants of an event.
    pub fn set_event_times(&self, event: NativeHandle, start: cl_ulong, end: cl_ulong) {
        let mut state = self.state.lock();
        match state.objects.get_mut(&event) {
            Some(Obj::Event { times, .. }) => *times = [start, start, start, end],
            _ => panic!("{:?} is not an event", event),
        }
    }

    /// Overrides the execution status of an event.
    pub fn set_event_status(&self, event: NativeHandle, new_status: cl_int) {
        let mut state = self.state.lock();
        match state.objects.get_mut(&event) {
            Some(Obj::Event { status, .. }) => *status = new_status,
            _ => panic!("{:?} is not an event", event),
        }
    }

    pub fn mem_contents(&self, mem: NativeHandle) -> Vec<u8> {
        let state = self.state.lock();
        let (store, offset, size) = state.storage(mem);
        state.mem_data(store)[offset..offset + size].to_vec()
    }

    /// Registers a Rust body executed when kernel `name` is enqueued.
    pub fn on_kernel(&self, name: &str, body: impl Fn(&mut FakeLaunch<'_>) + Send + Sync + 'static) {
        self.state.lock().bodies.insert(name.to_string(), Arc::new(body));
    }

    pub fn kernel_args(&self, kernel: NativeHandle) -> Vec<(usize, Option<Vec<u8>>)> {
        match self.state.lock().objects.get(&kernel) {
            Some(Obj::Kernel { args, .. }) => args.clone(),
            _ => panic!("{:?} is not a kernel", kernel),
        }
    }

    fn create_mem(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        size: usize,
        host_ptr: *mut c_void,
        image: Option<(ImageFormat, ImageDesc)>,
    ) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        match state.objects.get(&context) {
            Some(Obj::Context { .. }) => (),
            _ => return Err(CL_INVALID_CONTEXT),
        }
        if size == 0 {
            return Err(CL_INVALID_BUFFER_SIZE);
        }
        let copies = flags & (CL_MEM_COPY_HOST_PTR | CL_MEM_USE_HOST_PTR) != 0;
        if copies == host_ptr.is_null() {
            return Err(CL_INVALID_HOST_PTR);
        }
        let mut data = vec![0u8; size];
        if copies {
            // SAFETY: the caller vouches for `size` readable bytes.
            unsafe { core::ptr::copy_nonoverlapping(host_ptr as *const u8, data.as_mut_ptr(), size) };
        }
        Ok(state.insert(Obj::Mem { context, flags, size, data, parent: None, image }))
    }

    fn image_geometry(&self, image: NativeHandle) -> RtResult<(usize, usize, usize)> {
        match self.state.lock().objects.get(&image) {
            Some(Obj::Mem { image: Some((format, desc)), .. }) => {
                let elem = format_size(format);
                Ok((elem, desc.width * elem, desc.width * desc.height.max(1) * elem))
            }
            _ => Err(CL_INVALID_MEM_OBJECT),
        }
    }

    fn build(
        &self,
        program: NativeHandle,
        devices: &[NativeHandle],
        options: &str,
        failure: cl_int,
    ) -> RtResult<()> {
        let mut state = self.state.lock();
        let (targets, source) = match state.objects.get(&program) {
            Some(Obj::Program { devices: all, source, .. }) => {
                let targets = if devices.is_empty() { all.clone() } else { devices.to_vec() };
                if targets.iter().any(|d| !all.contains(d)) {
                    return Err(CL_INVALID_DEVICE);
                }
                (targets, source.clone())
            }
            _ => return Err(CL_INVALID_PROGRAM),
        };
        let error_line = source.lines().find(|l| l.trim_start().starts_with("#error"));
        let ok = error_line.is_none();
        if let Some(Obj::Program { builds, kernels, .. }) = state.objects.get_mut(&program) {
            for d in targets {
                let log = match error_line {
                    Some(line) => format!("<source>:1: error: {}", line.trim()),
                    None => String::new(),
                };
                let status = if ok { CL_BUILD_SUCCESS } else { CL_BUILD_ERROR };
                builds.insert(d, (status, log, options.to_string()));
            }
            if ok {
                *kernels = parse_kernels(&source);
            }
        }
        if ok {
            Ok(())
        } else {
            Err(failure)
        }
    }

    fn fire_callbacks(&self, event: NativeHandle) {
        let (status, ready) = {
            let mut state = self.state.lock();
            match state.objects.get_mut(&event) {
                Some(Obj::Event { status, callbacks, .. }) => {
                    let status = *status;
                    let (ready, waiting): (Vec<_>, Vec<_>) =
                        callbacks.drain(..).partition(|(on, _)| status <= *on);
                    *callbacks = waiting;
                    (status, ready)
                }
                _ => return,
            }
        };
        for (_, cb) in ready {
            cb(event, status);
        }
    }
}

impl Runtime for FakeRuntime {
    fn platform_ids(&self) -> RtResult<Vec<NativeHandle>> {
        Ok(self.platforms())
    }

    fn device_ids(&self, platform: NativeHandle, ty: cl_device_type) -> RtResult<Vec<NativeHandle>> {
        let state = self.state.lock();
        let devices = match state.objects.get(&platform) {
            Some(Obj::Platform { devices, .. }) => devices,
            _ => return Err(CL_INVALID_PLATFORM),
        };
        let mut out: Vec<NativeHandle> = devices
            .iter()
            .copied()
            .filter(|d| match state.objects.get(d) {
                Some(Obj::Device { ty: dty, .. }) => dty & ty != 0,
                _ => false,
            })
            .collect();
        if ty == CL_DEVICE_TYPE_DEFAULT && out.is_empty() {
            out.extend(devices.first().copied());
        }
        Ok(out)
    }

    fn info(
        &self,
        query: InfoQuery,
        handle: NativeHandle,
        secondary: NativeHandle,
        param: cl_uint,
        input: &[u8],
        out: Option<&mut [u8]>,
    ) -> RtResult<usize> {
        let mut state = self.state.lock();
        state.info_calls += 1;
        let bytes = state.info(query, handle, secondary, param, input)?;
        if let Some(out) = out {
            if out.len() < bytes.len() {
                return Err(CL_INVALID_VALUE);
            }
            out[..bytes.len()].copy_from_slice(&bytes);
        }
        Ok(bytes.len())
    }

    fn retain(&self, _class: Class, handle: NativeHandle) -> RtResult<()> {
        *self.state.lock().retains.entry(handle).or_insert(0) += 1;
        Ok(())
    }

    fn release(&self, _class: Class, handle: NativeHandle) -> RtResult<()> {
        *self.state.lock().releases.entry(handle).or_insert(0) += 1;
        Ok(())
    }

    fn create_sub_devices(
        &self,
        device: NativeHandle,
        props: &[cl_device_partition_property],
    ) -> RtResult<Vec<NativeHandle>> {
        let mut state = self.state.lock();
        let (info, ty) = match state.objects.get(&device) {
            Some(Obj::Device { info, ty }) => (info.clone(), *ty),
            _ => return Err(CL_INVALID_DEVICE),
        };
        let units = bytemuck::pod_read_unaligned::<cl_uint>(&info[&CL_DEVICE_MAX_COMPUTE_UNITS]) as isize;
        let counts: Vec<isize> = match props {
            [CL_DEVICE_PARTITION_EQUALLY, n, 0] if *n > 0 => vec![*n; (units / n) as usize],
            [CL_DEVICE_PARTITION_BY_COUNTS, rest @ ..] => rest
                .iter()
                .copied()
                .take_while(|&c| c != CL_DEVICE_PARTITION_BY_COUNTS_LIST_END)
                .collect(),
            _ => return Err(CL_INVALID_VALUE),
        };
        if counts.is_empty() || counts.iter().sum::<isize>() > units {
            return Err(CL_DEVICE_PARTITION_FAILED);
        }
        let mut out = Vec::new();
        for c in counts {
            let mut sub = info.clone();
            sub.insert(CL_DEVICE_MAX_COMPUTE_UNITS, pod_bytes(c as cl_uint));
            sub.insert(CL_DEVICE_PARENT_DEVICE, handle_bytes(device));
            out.push(state.insert(Obj::Device { info: sub, ty }));
        }
        Ok(out)
    }

    fn create_context(
        &self,
        props: &[cl_context_properties],
        devices: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        if devices.is_empty() {
            return Err(CL_INVALID_VALUE);
        }
        if devices.iter().any(|d| !matches!(state.objects.get(d), Some(Obj::Device { .. }))) {
            return Err(CL_INVALID_DEVICE);
        }
        let props = props.iter().copied().take_while(|&p| p != 0).collect::<Vec<_>>();
        let mut stored = props;
        if !stored.is_empty() {
            stored.push(0);
        }
        Ok(state.insert(Obj::Context { devices: devices.to_vec(), props: stored }))
    }

    fn supported_image_formats(
        &self,
        context: NativeHandle,
        _flags: cl_mem_flags,
        _image_type: cl_mem_object_type,
    ) -> RtResult<Vec<ImageFormat>> {
        match self.state.lock().objects.get(&context) {
            Some(Obj::Context { .. }) => Ok(vec![
                ImageFormat { image_channel_order: CL_RGBA, image_channel_data_type: CL_UNORM_INT8 },
                ImageFormat { image_channel_order: CL_R, image_channel_data_type: CL_FLOAT },
            ]),
            _ => Err(CL_INVALID_CONTEXT),
        }
    }

    fn create_command_queue(
        &self,
        context: NativeHandle,
        device: NativeHandle,
        props: cl_command_queue_properties,
    ) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        match state.objects.get(&context) {
            Some(Obj::Context { devices, .. }) if devices.contains(&device) => (),
            Some(Obj::Context { .. }) => return Err(CL_INVALID_DEVICE),
            _ => return Err(CL_INVALID_CONTEXT),
        }
        Ok(state.insert(Obj::Queue { context, device, props }))
    }

    fn create_command_queue_with_properties(
        &self,
        context: NativeHandle,
        device: NativeHandle,
        props: &[cl_queue_properties],
    ) -> RtResult<NativeHandle> {
        let mut flags = 0;
        for pair in props.chunks(2) {
            match pair {
                [name, value] if *name == CL_QUEUE_PROPERTIES as cl_queue_properties => flags = *value,
                [0] | [] => break,
                [name, _] if *name == CL_QUEUE_SIZE as cl_queue_properties => (),
                _ => return Err(CL_INVALID_VALUE),
            }
        }
        self.create_command_queue(context, device, flags)
    }

    fn flush(&self, queue: NativeHandle) -> RtResult<()> {
        self.state.lock().queue_context(queue).map(|_| ())
    }

    fn finish(&self, queue: NativeHandle) -> RtResult<()> {
        self.state.lock().queue_context(queue).map(|_| ())
    }

    fn enqueue_marker(&self, queue: NativeHandle, wait: &[NativeHandle]) -> RtResult<NativeHandle> {
        self.state.lock().event(queue, CL_COMMAND_MARKER, wait)
    }

    fn enqueue_barrier(&self, queue: NativeHandle, wait: &[NativeHandle]) -> RtResult<NativeHandle> {
        self.state.lock().event(queue, CL_COMMAND_BARRIER, wait)
    }

    unsafe fn create_buffer(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        size: usize,
        host_ptr: *mut c_void,
    ) -> RtResult<NativeHandle> {
        self.create_mem(context, flags, size, host_ptr, None)
    }

    fn create_sub_buffer(
        &self,
        buffer: NativeHandle,
        flags: cl_mem_flags,
        origin: usize,
        size: usize,
    ) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        let context = match state.objects.get(&buffer) {
            Some(Obj::Mem { context, size: total, parent: None, image: None, .. }) => {
                if origin + size > *total || size == 0 {
                    return Err(CL_INVALID_VALUE);
                }
                *context
            }
            _ => return Err(CL_INVALID_MEM_OBJECT),
        };
        Ok(state.insert(Obj::Mem {
            context,
            flags,
            size,
            data: Vec::new(),
            parent: Some((buffer, origin)),
            image: None,
        }))
    }

    unsafe fn create_image(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        format: &ImageFormat,
        desc: &ImageDesc,
        host_ptr: *mut c_void,
    ) -> RtResult<NativeHandle> {
        let size = format_size(format) * desc.width * desc.height.max(1) * desc.depth.max(1);
        self.create_mem(context, flags, size, host_ptr, Some((*format, *desc)))
    }

    unsafe fn create_image_2d(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        format: &ImageFormat,
        desc: &ImageDesc,
        host_ptr: *mut c_void,
    ) -> RtResult<NativeHandle> {
        let desc = ImageDesc { image_type: CL_MEM_OBJECT_IMAGE2D, depth: 1, ..*desc };
        self.create_image(context, flags, format, &desc, host_ptr)
    }

    unsafe fn create_image_3d(
        &self,
        context: NativeHandle,
        flags: cl_mem_flags,
        format: &ImageFormat,
        desc: &ImageDesc,
        host_ptr: *mut c_void,
    ) -> RtResult<NativeHandle> {
        let desc = ImageDesc { image_type: CL_MEM_OBJECT_IMAGE3D, ..*desc };
        self.create_image(context, flags, format, &desc, host_ptr)
    }

    unsafe fn enqueue_read_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        _blocking: bool,
        offset: usize,
        size: usize,
        ptr: *mut c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        state.check_mem(buffer, offset, size)?;
        let ev = state.event(queue, CL_COMMAND_READ_BUFFER, wait)?;
        let (store, base, _) = state.storage(buffer);
        let src = &state.mem_data(store)[base + offset..base + offset + size];
        core::ptr::copy_nonoverlapping(src.as_ptr(), ptr.cast::<u8>(), size);
        Ok(ev)
    }

    unsafe fn enqueue_write_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        _blocking: bool,
        offset: usize,
        size: usize,
        ptr: *const c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        state.check_mem(buffer, offset, size)?;
        let ev = state.event(queue, CL_COMMAND_WRITE_BUFFER, wait)?;
        let (store, base, _) = state.storage(buffer);
        let src = core::slice::from_raw_parts(ptr.cast::<u8>(), size);
        state.mem_data_mut(store)[base + offset..base + offset + size].copy_from_slice(src);
        Ok(ev)
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
    ) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        state.check_mem(src, src_offset, size)?;
        state.check_mem(dst, dst_offset, size)?;
        let ev = state.event(queue, CL_COMMAND_COPY_BUFFER, wait)?;
        let (s_store, s_base, _) = state.storage(src);
        let bytes = state.mem_data(s_store)[s_base + src_offset..s_base + src_offset + size].to_vec();
        let (d_store, d_base, _) = state.storage(dst);
        state.mem_data_mut(d_store)[d_base + dst_offset..d_base + dst_offset + size]
            .copy_from_slice(&bytes);
        Ok(ev)
    }

    unsafe fn enqueue_map_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        _blocking: bool,
        _flags: cl_map_flags,
        offset: usize,
        size: usize,
        wait: &[NativeHandle],
    ) -> RtResult<(*mut c_void, NativeHandle)> {
        let mut state = self.state.lock();
        state.check_mem(buffer, offset, size)?;
        let ev = state.event(queue, CL_COMMAND_MAP_BUFFER, wait)?;
        let (store, base, _) = state.storage(buffer);
        let ptr = state.mem_data_mut(store).as_mut_ptr().add(base + offset);
        Ok((ptr.cast(), ev))
    }

    unsafe fn enqueue_unmap(
        &self,
        queue: NativeHandle,
        mem: NativeHandle,
        _mapped: *mut c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        state.check_mem(mem, 0, 0)?;
        state.event(queue, CL_COMMAND_UNMAP_MEM_OBJECT, wait)
    }

    fn enqueue_fill_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        pattern: &[u8],
        offset: usize,
        size: usize,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        if pattern.is_empty() || size % pattern.len() != 0 || offset % pattern.len() != 0 {
            return Err(CL_INVALID_VALUE);
        }
        state.check_mem(buffer, offset, size)?;
        let ev = state.event(queue, CL_COMMAND_FILL_BUFFER, wait)?;
        let (store, base, _) = state.storage(buffer);
        for chunk in state.mem_data_mut(store)[base + offset..base + offset + size]
            .chunks_mut(pattern.len())
        {
            chunk.copy_from_slice(pattern);
        }
        Ok(ev)
    }

    unsafe fn enqueue_read_buffer_rect(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        _blocking: bool,
        rect: &Rect,
        ptr: *mut c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        let ev = state.event(queue, CL_COMMAND_READ_BUFFER_RECT, wait)?;
        let (store, base, size) = state.storage(buffer);
        let src_rows = rect_rows(rect.src_origin, rect.region, rect.src_row_pitch, rect.src_slice_pitch);
        let dst_rows = rect_rows(rect.dst_origin, rect.region, rect.dst_row_pitch, rect.dst_slice_pitch);
        let data = state.mem_data(store);
        for (s, d) in src_rows.into_iter().zip(dst_rows) {
            if s + rect.region[0] > size {
                return Err(CL_INVALID_VALUE);
            }
            let row = &data[base + s..base + s + rect.region[0]];
            core::ptr::copy_nonoverlapping(row.as_ptr(), ptr.cast::<u8>().add(d), rect.region[0]);
        }
        Ok(ev)
    }

    unsafe fn enqueue_write_buffer_rect(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        _blocking: bool,
        rect: &Rect,
        ptr: *const c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        let ev = state.event(queue, CL_COMMAND_WRITE_BUFFER_RECT, wait)?;
        let (store, base, size) = state.storage(buffer);
        let src_rows = rect_rows(rect.src_origin, rect.region, rect.src_row_pitch, rect.src_slice_pitch);
        let dst_rows = rect_rows(rect.dst_origin, rect.region, rect.dst_row_pitch, rect.dst_slice_pitch);
        let data = state.mem_data_mut(store);
        for (s, d) in src_rows.into_iter().zip(dst_rows) {
            if d + rect.region[0] > size {
                return Err(CL_INVALID_VALUE);
            }
            let row = core::slice::from_raw_parts(ptr.cast::<u8>().add(s), rect.region[0]);
            data[base + d..base + d + rect.region[0]].copy_from_slice(row);
        }
        Ok(ev)
    }

    fn enqueue_copy_buffer_rect(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        rect: &Rect,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        let ev = state.event(queue, CL_COMMAND_COPY_BUFFER_RECT, wait)?;
        let (s_store, s_base, _) = state.storage(src);
        let (d_store, d_base, _) = state.storage(dst);
        let src_rows = rect_rows(rect.src_origin, rect.region, rect.src_row_pitch, rect.src_slice_pitch);
        let dst_rows = rect_rows(rect.dst_origin, rect.region, rect.dst_row_pitch, rect.dst_slice_pitch);
        for (s, d) in src_rows.into_iter().zip(dst_rows) {
            let row = state.mem_data(s_store)[s_base + s..s_base + s + rect.region[0]].to_vec();
            state.mem_data_mut(d_store)[d_base + d..d_base + d + rect.region[0]].copy_from_slice(&row);
        }
        Ok(ev)
    }

    fn enqueue_copy_buffer_to_image(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        src_offset: usize,
        dst_origin: [usize; 3],
        region: [usize; 3],
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let (elem, row_pitch, slice_pitch) = self.image_geometry(dst)?;
        let mut state = self.state.lock();
        let ev = state.event(queue, CL_COMMAND_COPY_BUFFER_TO_IMAGE, wait)?;
        let (s_store, s_base, _) = state.storage(src);
        let row_len = region[0] * elem;
        let origin = [dst_origin[0] * elem, dst_origin[1], dst_origin[2]];
        let rows = rect_rows(origin, [row_len, region[1], region[2]], row_pitch, slice_pitch);
        for (i, d) in rows.into_iter().enumerate() {
            let s = s_base + src_offset + i * row_len;
            let row = state.mem_data(s_store)[s..s + row_len].to_vec();
            state.mem_data_mut(dst)[d..d + row_len].copy_from_slice(&row);
        }
        Ok(ev)
    }

    fn enqueue_copy_image_to_buffer(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        src_origin: [usize; 3],
        region: [usize; 3],
        dst_offset: usize,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let (elem, row_pitch, slice_pitch) = self.image_geometry(src)?;
        let mut state = self.state.lock();
        let ev = state.event(queue, CL_COMMAND_COPY_IMAGE_TO_BUFFER, wait)?;
        let (d_store, d_base, _) = state.storage(dst);
        let row_len = region[0] * elem;
        let origin = [src_origin[0] * elem, src_origin[1], src_origin[2]];
        let rows = rect_rows(origin, [row_len, region[1], region[2]], row_pitch, slice_pitch);
        for (i, s) in rows.into_iter().enumerate() {
            let row = state.mem_data(src)[s..s + row_len].to_vec();
            let d = d_base + dst_offset + i * row_len;
            state.mem_data_mut(d_store)[d..d + row_len].copy_from_slice(&row);
        }
        Ok(ev)
    }

    fn enqueue_copy_image(
        &self,
        queue: NativeHandle,
        src: NativeHandle,
        dst: NativeHandle,
        src_origin: [usize; 3],
        dst_origin: [usize; 3],
        region: [usize; 3],
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let (elem, s_row, s_slice) = self.image_geometry(src)?;
        let (d_elem, d_row, d_slice) = self.image_geometry(dst)?;
        if elem != d_elem {
            return Err(CL_IMAGE_FORMAT_MISMATCH);
        }
        let mut state = self.state.lock();
        let ev = state.event(queue, CL_COMMAND_COPY_IMAGE, wait)?;
        let row_len = region[0] * elem;
        let extent = [row_len, region[1], region[2]];
        let src_rows = rect_rows([src_origin[0] * elem, src_origin[1], src_origin[2]], extent, s_row, s_slice);
        let dst_rows = rect_rows([dst_origin[0] * elem, dst_origin[1], dst_origin[2]], extent, d_row, d_slice);
        for (s, d) in src_rows.into_iter().zip(dst_rows) {
            let row = state.mem_data(src)[s..s + row_len].to_vec();
            state.mem_data_mut(dst)[d..d + row_len].copy_from_slice(&row);
        }
        Ok(ev)
    }

    fn enqueue_fill_image(
        &self,
        queue: NativeHandle,
        image: NativeHandle,
        color: &[u8; 16],
        origin: [usize; 3],
        region: [usize; 3],
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let (elem, row_pitch, slice_pitch) = self.image_geometry(image)?;
        let mut state = self.state.lock();
        let format = match state.objects.get(&image) {
            Some(Obj::Mem { image: Some((format, _)), .. }) => *format,
            _ => return Err(CL_INVALID_MEM_OBJECT),
        };
        let pixel = fill_pixel(&format, color);
        let ev = state.event(queue, CL_COMMAND_FILL_IMAGE, wait)?;
        let row_len = region[0] * elem;
        let rows = rect_rows([origin[0] * elem, origin[1], origin[2]], [row_len, region[1], region[2]], row_pitch, slice_pitch);
        let data = state.mem_data_mut(image);
        for d in rows {
            for chunk in data[d..d + row_len].chunks_mut(elem) {
                chunk.copy_from_slice(&pixel);
            }
        }
        Ok(ev)
    }

    unsafe fn enqueue_map_image(
        &self,
        queue: NativeHandle,
        image: NativeHandle,
        _blocking: bool,
        _flags: cl_map_flags,
        origin: [usize; 3],
        _region: [usize; 3],
        wait: &[NativeHandle],
    ) -> RtResult<(*mut c_void, usize, usize, NativeHandle)> {
        let (elem, row_pitch, slice_pitch) = self.image_geometry(image)?;
        let mut state = self.state.lock();
        let ev = state.event(queue, CL_COMMAND_MAP_IMAGE, wait)?;
        let offset = origin[0] * elem + origin[1] * row_pitch + origin[2] * slice_pitch;
        let ptr = state.mem_data_mut(image).as_mut_ptr().add(offset);
        Ok((ptr.cast(), row_pitch, slice_pitch, ev))
    }

    unsafe fn enqueue_read_image(
        &self,
        queue: NativeHandle,
        image: NativeHandle,
        _blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        row_pitch: usize,
        slice_pitch: usize,
        ptr: *mut c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let (elem, img_row, img_slice) = self.image_geometry(image)?;
        let mut state = self.state.lock();
        let ev = state.event(queue, CL_COMMAND_READ_IMAGE, wait)?;
        let row_len = region[0] * elem;
        let src_rows = rect_rows([origin[0] * elem, origin[1], origin[2]], [row_len, region[1], region[2]], img_row, img_slice);
        let dst_rows = rect_rows([0; 3], [row_len, region[1], region[2]], row_pitch, slice_pitch);
        let data = state.mem_data(image);
        for (s, d) in src_rows.into_iter().zip(dst_rows) {
            core::ptr::copy_nonoverlapping(data[s..s + row_len].as_ptr(), ptr.cast::<u8>().add(d), row_len);
        }
        Ok(ev)
    }

    unsafe fn enqueue_write_image(
        &self,
        queue: NativeHandle,
        image: NativeHandle,
        _blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        row_pitch: usize,
        slice_pitch: usize,
        ptr: *const c_void,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        let (elem, img_row, img_slice) = self.image_geometry(image)?;
        let mut state = self.state.lock();
        let ev = state.event(queue, CL_COMMAND_WRITE_IMAGE, wait)?;
        let row_len = region[0] * elem;
        let dst_rows = rect_rows([origin[0] * elem, origin[1], origin[2]], [row_len, region[1], region[2]], img_row, img_slice);
        let src_rows = rect_rows([0; 3], [row_len, region[1], region[2]], row_pitch, slice_pitch);
        let data = state.mem_data_mut(image);
        for (s, d) in src_rows.into_iter().zip(dst_rows) {
            let row = core::slice::from_raw_parts(ptr.cast::<u8>().add(s), row_len);
            data[d..d + row_len].copy_from_slice(row);
        }
        Ok(ev)
    }

    fn create_sampler(
        &self,
        context: NativeHandle,
        normalized_coords: bool,
        addressing: cl_addressing_mode,
        filter: cl_filter_mode,
    ) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        match state.objects.get(&context) {
            Some(Obj::Context { .. }) => (),
            _ => return Err(CL_INVALID_CONTEXT),
        }
        Ok(state.insert(Obj::Sampler { context, normalized: normalized_coords, addressing, filter }))
    }

    fn create_sampler_with_properties(
        &self,
        context: NativeHandle,
        props: &[cl_sampler_properties],
    ) -> RtResult<NativeHandle> {
        let (mut normalized, mut addressing, mut filter) = (true, CL_ADDRESS_CLAMP, CL_FILTER_NEAREST);
        for pair in props.chunks(2) {
            match pair {
                [0] | [] => break,
                [name, value] if *name == CL_SAMPLER_NORMALIZED_COORDS as cl_sampler_properties => {
                    normalized = *value != 0
                }
                [name, value] if *name == CL_SAMPLER_ADDRESSING_MODE as cl_sampler_properties => {
                    addressing = *value as cl_addressing_mode
                }
                [name, value] if *name == CL_SAMPLER_FILTER_MODE as cl_sampler_properties => {
                    filter = *value as cl_filter_mode
                }
                _ => return Err(CL_INVALID_VALUE),
            }
        }
        self.create_sampler(context, normalized, addressing, filter)
    }

    fn create_program_with_source(&self, context: NativeHandle, sources: &[&str]) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        let devices = match state.objects.get(&context) {
            Some(Obj::Context { devices, .. }) => devices.clone(),
            _ => return Err(CL_INVALID_CONTEXT),
        };
        if sources.is_empty() {
            return Err(CL_INVALID_VALUE);
        }
        Ok(state.insert(Obj::Program {
            context,
            devices,
            source: sources.concat(),
            builds: HashMap::new(),
            kernels: Vec::new(),
        }))
    }

    fn create_program_with_binary(
        &self,
        context: NativeHandle,
        devices: &[NativeHandle],
        binaries: &[&[u8]],
    ) -> (RtResult<NativeHandle>, Vec<cl_int>) {
        let mut state = self.state.lock();
        match state.objects.get(&context) {
            Some(Obj::Context { devices: all, .. }) => {
                if devices.iter().any(|d| !all.contains(d)) {
                    return (Err(CL_INVALID_DEVICE), Vec::new());
                }
            }
            _ => return (Err(CL_INVALID_CONTEXT), Vec::new()),
        }
        if devices.is_empty() || devices.len() != binaries.len() {
            return (Err(CL_INVALID_VALUE), Vec::new());
        }
        let status: Vec<cl_int> = binaries
            .iter()
            .map(|b| if b.starts_with(BINARY_MAGIC) { CL_SUCCESS } else { CL_INVALID_BINARY })
            .collect();
        if status.iter().any(|s| *s != CL_SUCCESS) {
            return (Err(CL_INVALID_BINARY), status);
        }
        let source = String::from_utf8_lossy(&binaries[0][BINARY_MAGIC.len()..]).into_owned();
        let h = state.insert(Obj::Program {
            context,
            devices: devices.to_vec(),
            source,
            builds: HashMap::new(),
            kernels: Vec::new(),
        });
        (Ok(h), status)
    }

    fn create_program_with_built_in_kernels(
        &self,
        context: NativeHandle,
        devices: &[NativeHandle],
        names: &str,
    ) -> RtResult<NativeHandle> {
        let source: String = names
            .split(';')
            .filter(|n| !n.is_empty())
            .map(|n| format!("__kernel void {}() {{}}\n", n.trim()))
            .collect();
        let h = self.create_program_with_source(context, &[&source])?;
        let mut state = self.state.lock();
        if let Some(Obj::Program { devices: pd, .. }) = state.objects.get_mut(&h) {
            *pd = devices.to_vec();
        }
        Ok(h)
    }

    fn build_program(
        &self,
        program: NativeHandle,
        devices: &[NativeHandle],
        options: &str,
        notify: Option<ProgramCallback>,
    ) -> RtResult<()> {
        let outcome = self.build(program, devices, options, CL_BUILD_PROGRAM_FAILURE);
        if let Some(cb) = notify {
            cb(program);
        }
        outcome
    }

    fn compile_program(
        &self,
        program: NativeHandle,
        devices: &[NativeHandle],
        options: &str,
        headers: &[(NativeHandle, &str)],
        notify: Option<ProgramCallback>,
    ) -> RtResult<()> {
        {
            let state = self.state.lock();
            for (h, _) in headers {
                if !matches!(state.objects.get(h), Some(Obj::Program { .. })) {
                    return Err(CL_INVALID_OPERATION);
                }
            }
        }
        let outcome = self.build(program, devices, options, CL_COMPILE_PROGRAM_FAILURE);
        if let Some(cb) = notify {
            cb(program);
        }
        outcome
    }

    fn link_program(
        &self,
        context: NativeHandle,
        devices: &[NativeHandle],
        options: &str,
        inputs: &[NativeHandle],
        notify: Option<ProgramCallback>,
    ) -> (RtResult<()>, NativeHandle) {
        let mut sources = Vec::new();
        {
            let state = self.state.lock();
            for h in inputs {
                match state.objects.get(h) {
                    Some(Obj::Program { source, .. }) => sources.push(source.clone()),
                    _ => return (Err(CL_INVALID_PROGRAM), NativeHandle::NULL),
                }
            }
        }
        let refs: Vec<&str> = sources.iter().map(String::as_str).collect();
        let h = match self.create_program_with_source(context, &refs) {
            Ok(h) => h,
            Err(code) => return (Err(code), NativeHandle::NULL),
        };
        if !devices.is_empty() {
            if let Some(Obj::Program { devices: pd, .. }) = self.state.lock().objects.get_mut(&h) {
                *pd = devices.to_vec();
            }
        }
        let outcome = self.build(h, devices, options, CL_LINK_PROGRAM_FAILURE);
        if let Some(cb) = notify {
            cb(h);
        }
        (outcome, h)
    }

    fn program_binaries(&self, program: NativeHandle, sizes: &[usize]) -> RtResult<Vec<Vec<u8>>> {
        let state = self.state.lock();
        match state.objects.get(&program) {
            Some(Obj::Program { source, devices, .. }) => {
                if sizes.len() != devices.len() {
                    return Err(CL_INVALID_VALUE);
                }
                Ok(sizes
                    .iter()
                    .map(|&n| {
                        if n == 0 {
                            Vec::new()
                        } else {
                            let mut b = BINARY_MAGIC.to_vec();
                            b.extend_from_slice(source.as_bytes());
                            b
                        }
                    })
                    .collect())
            }
            _ => Err(CL_INVALID_PROGRAM),
        }
    }

    fn create_kernel(&self, program: NativeHandle, name: &str) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        let (context, params) = match state.objects.get(&program) {
            Some(Obj::Program { context, builds, kernels, .. }) => {
                if !builds.values().any(|b| b.0 == CL_BUILD_SUCCESS) {
                    return Err(CL_INVALID_PROGRAM_EXECUTABLE);
                }
                match kernels.iter().find(|k| k.0 == name) {
                    Some(k) => (*context, k.1.clone()),
                    None => return Err(CL_INVALID_KERNEL_NAME),
                }
            }
            _ => return Err(CL_INVALID_PROGRAM),
        };
        let args = vec![(0, None); params.len()];
        Ok(state.insert(Obj::Kernel { context, program, name: name.to_string(), params, args }))
    }

    fn set_kernel_arg(
        &self,
        kernel: NativeHandle,
        index: cl_uint,
        size: usize,
        value: Option<&[u8]>,
    ) -> RtResult<()> {
        let mut state = self.state.lock();
        match state.objects.get_mut(&kernel) {
            Some(Obj::Kernel { args, .. }) => {
                let slot = args.get_mut(index as usize).ok_or(CL_INVALID_ARG_INDEX)?;
                if let Some(v) = value {
                    if v.len() != size {
                        return Err(CL_INVALID_ARG_SIZE);
                    }
                }
                *slot = (size, value.map(<[u8]>::to_vec));
                Ok(())
            }
            _ => Err(CL_INVALID_KERNEL),
        }
    }

    fn enqueue_ndrange_kernel(
        &self,
        queue: NativeHandle,
        kernel: NativeHandle,
        offset: Option<&[usize]>,
        global: &[usize],
        local: Option<&[usize]>,
        wait: &[NativeHandle],
    ) -> RtResult<NativeHandle> {
        if global.is_empty() || global.len() > 3 {
            return Err(CL_INVALID_WORK_DIMENSION);
        }
        if offset.map_or(false, |o| o.len() != global.len()) {
            return Err(CL_INVALID_GLOBAL_OFFSET);
        }
        if let Some(local) = local {
            if local.len() != global.len() || global.iter().zip(local).any(|(g, l)| *l == 0 || g % l != 0) {
                return Err(CL_INVALID_WORK_GROUP_SIZE);
            }
        }
        let mut state = self.state.lock();
        let (name, args) = match state.objects.get(&kernel) {
            Some(Obj::Kernel { name, args, .. }) => (name.clone(), args.clone()),
            _ => return Err(CL_INVALID_KERNEL),
        };
        if args.iter().any(|a| a.0 == 0) {
            return Err(CL_INVALID_KERNEL_ARGS);
        }
        let ev = state.event(queue, CL_COMMAND_NDRANGE_KERNEL, wait)?;
        if let Some(body) = state.bodies.get(&name).cloned() {
            let mut launch = FakeLaunch { state: &mut *state, args, global: global.to_vec() };
            body(&mut launch);
        }
        Ok(ev)
    }

    fn wait_for_events(&self, events: &[NativeHandle]) -> RtResult<()> {
        if events.is_empty() {
            return Err(CL_INVALID_VALUE);
        }
        self.state.lock().check_wait(events)
    }

    fn set_event_callback(
        &self,
        event: NativeHandle,
        exec_type: cl_int,
        callback: EventCallback,
    ) -> RtResult<()> {
        {
            let mut state = self.state.lock();
            match state.objects.get_mut(&event) {
                Some(Obj::Event { callbacks, .. }) => callbacks.push((exec_type, callback)),
                _ => return Err(CL_INVALID_EVENT),
            }
        }
        self.fire_callbacks(event);
        Ok(())
    }

    fn create_user_event(&self, context: NativeHandle) -> RtResult<NativeHandle> {
        let mut state = self.state.lock();
        match state.objects.get(&context) {
            Some(Obj::Context { .. }) => (),
            _ => return Err(CL_INVALID_CONTEXT),
        }
        Ok(state.insert(Obj::Event {
            context,
            queue: NativeHandle::NULL,
            command_type: CL_COMMAND_USER,
            status: CL_SUBMITTED,
            times: [0; 4],
            callbacks: Vec::new(),
        }))
    }

    fn set_user_event_status(&self, event: NativeHandle, status: cl_int) -> RtResult<()> {
        {
            let mut state = self.state.lock();
            match state.objects.get_mut(&event) {
                Some(Obj::Event { command_type: CL_COMMAND_USER, status: s, .. }) => {
                    if *s != CL_SUBMITTED || status > CL_COMPLETE {
                        return Err(CL_INVALID_OPERATION);
                    }
                    *s = status;
                }
                _ => return Err(CL_INVALID_EVENT),
            }
        }
        self.fire_callbacks(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_signatures_parse() {
        let k = parse_kernels(
            "__kernel void vadd(__global const float* a, __global float *b, uint n) {}\n\
             __kernel void empty(void) {}",
        );
        assert_eq!(k.len(), 2);
        assert_eq!(k[0].0, "vadd");
        assert_eq!(k[0].1[0], ("float*".to_string(), "a".to_string()));
        assert_eq!(k[0].1[1], ("float*".to_string(), "b".to_string()));
        assert_eq!(k[0].1[2], ("uint".to_string(), "n".to_string()));
        assert_eq!(k[1].0, "empty");
        assert!(k[1].1.is_empty());
    }
}
