//! Reference-counted, object-oriented wrappers over OpenCL.
//!
//! Every OpenCL object is represented by at most one wrapper node per
//! process; cloning a wrapper adds a reference and dropping the last one
//! releases the native object. Information queries are cached per wrapper.
//! Events produced by enqueue operations belong to their queue and are
//! handed out by reference.
//!
//! All native calls go through a [`runtime::Runtime`]. Enable the `opencl`
//! feature to link the system ICD loader, or install another implementation
//! with [`runtime::install`].

mod buffer;
#[cfg(feature = "opencl")]
mod cl_runtime;
mod context;
mod devcontainer;
mod device;
mod error;
mod event;
mod image;
mod kernel;
mod kernel_args;
mod memobj;
mod platform;
mod profiler;
mod program;
mod queue;
pub mod raw;
pub mod runtime;
mod sampler;
pub mod select;
mod stash;
#[cfg(test)]
mod testing;
mod version;
mod wrapper;

pub use buffer::Buffer;
#[cfg(feature = "opencl")]
pub use cl_runtime::ClRuntime;
pub use context::Context;
pub use devcontainer::DeviceContainer;
pub use device::{device_type_str, Device};
pub use error::{cl_error_name, Error, ErrorDomain, ErrorKind, HostError, Result};
pub use event::{Event, EventWaitList, UserEvent};
pub use image::{Image, MappedImage};
pub use kernel::{suggest_worksizes, Kernel, WorkGroupInfo};
pub use kernel_args::{ArgRecord, KernelArg, KernelArgs, LocalMem};
pub use memobj::MemObject;
pub use platform::{Platform, Platforms};
pub use profiler::{
    AggSort, ExportOptions, InfoSort, OverlapSort, ProfAgg, ProfInfo, ProfOverlap, Profiler, SortOrder,
};
pub use program::{Program, ProgramBinary};
pub use queue::{Queue, QueueProperties};
pub use runtime::{ImageDesc, Rect};
pub use sampler::Sampler;
pub use select::Filters;
pub use version::ClVersion;
pub use wrapper::{memcheck, InfoEntry};
