//! Reference-counted wrapper substrate.
//!
//! Every OpenCL object is represented by exactly one shared node, found
//! through a process-wide identity map keyed by class and native handle.
//! Public wrapper types are owning handles over such a node: cloning one
//! takes a reference, dropping one gives it back. When the last reference
//! goes, the node leaves the map, its fields are released (unreffing the
//! wrappers it composes), and the native object is released.

use core::any::Any;
use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{cl_error_name, host_err, Error, Result};
use crate::raw::*;
use crate::runtime::{InfoQuery, Runtime};
use crate::stash::Stash;

type IdentityMap = HashMap<(Class, NativeHandle), Weak<dyn Any + Send + Sync>>;

static IDENTITY: Lazy<Mutex<IdentityMap>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// True when no wrapper is alive.
pub fn memcheck() -> bool {
    let map = IDENTITY.lock();
    if !map.is_empty() {
        for (class, handle) in map.keys() {
            log::debug!("memcheck: {} {:?} still wrapped", class.name(), handle);
        }
    }
    map.is_empty()
}

/// Raw value of an information query, as returned by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoEntry {
    bytes: Vec<u8>,
}

impl InfoEntry {
    pub fn new(bytes: Vec<u8>) -> Self {
        InfoEntry { bytes }
    }
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
    /// The value as a single scalar; the size must match exactly.
    pub fn scalar<T: bytemuck::Pod>(&self) -> Result<T> {
        bytemuck::try_pod_read_unaligned(&self.bytes).map_err(|_| {
            host_err!(
                InvalidData,
                "info value has {} bytes, expected {}",
                self.bytes.len(),
                core::mem::size_of::<T>()
            )
        })
    }
    pub fn boolean(&self) -> Result<bool> {
        Ok(self.scalar::<cl_bool>()? != CL_FALSE)
    }
    /// The value as text, without the trailing NUL.
    pub fn string(&self) -> Result<&str> {
        let end = self.bytes.iter().position(|&b| b == 0).unwrap_or(self.bytes.len());
        core::str::from_utf8(&self.bytes[..end])
            .map_err(|e| host_err!(InvalidData, "info value is not valid UTF-8: {}", e))
    }
    pub fn array<T: bytemuck::Pod>(&self) -> Result<Vec<T>> {
        let width = core::mem::size_of::<T>();
        if width == 0 || self.bytes.len() % width != 0 {
            return Err(host_err!(
                InvalidData,
                "info value of {} bytes is not an array of {}-byte items",
                self.bytes.len(),
                width
            ));
        }
        Ok(bytemuck::pod_collect_to_vec(&self.bytes))
    }
    pub fn handles(&self) -> Result<Vec<NativeHandle>> {
        Ok(self.array::<usize>()?.into_iter().map(NativeHandle::from_raw).collect())
    }
    pub fn handle(&self) -> Result<NativeHandle> {
        Ok(NativeHandle::from_raw(self.scalar::<usize>()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InfoKey {
    query: InfoQuery,
    secondary: NativeHandle,
    param: cl_uint,
    input: Vec<u8>,
}

fn query_name(query: InfoQuery) -> &'static str {
    match query {
        InfoQuery::Platform => "clGetPlatformInfo",
        InfoQuery::Device => "clGetDeviceInfo",
        InfoQuery::Context => "clGetContextInfo",
        InfoQuery::Queue => "clGetCommandQueueInfo",
        InfoQuery::Mem => "clGetMemObjectInfo",
        InfoQuery::Image => "clGetImageInfo",
        InfoQuery::Sampler => "clGetSamplerInfo",
        InfoQuery::Program => "clGetProgramInfo",
        InfoQuery::ProgramBuild => "clGetProgramBuildInfo",
        InfoQuery::Kernel => "clGetKernelInfo",
        InfoQuery::KernelWorkGroup => "clGetKernelWorkGroupInfo",
        InfoQuery::KernelArg => "clGetKernelArgInfo",
        InfoQuery::KernelSubGroup => "clGetKernelSubGroupInfo",
        InfoQuery::Event => "clGetEventInfo",
        InfoQuery::EventProfiling => "clGetEventProfilingInfo",
    }
}

/// Runs the two-call protocol: size first, then the value.
pub(crate) fn fetch_info(
    rt: &dyn Runtime,
    query: InfoQuery,
    handle: NativeHandle,
    secondary: NativeHandle,
    param: cl_uint,
    input: &[u8],
) -> Result<InfoEntry> {
    let unavailable = || {
        host_err!(
            InfoUnavailable,
            "{}: parameter {:#x} not available for {:?}",
            query_name(query),
            param,
            handle
        )
    };
    let to_error = |code: cl_int| -> Error {
        if code == CL_INVALID_VALUE {
            unavailable()
        } else {
            Error::runtime(code, format!("{} ({:#x})", query_name(query), param))
        }
    };
    let size = rt.info(query, handle, secondary, param, input, None).map_err(to_error)?;
    if size == 0 {
        return Err(unavailable());
    }
    let mut bytes = vec![0u8; size];
    let written = rt
        .info(query, handle, secondary, param, input, Some(&mut bytes))
        .map_err(to_error)?;
    bytes.truncate(written.min(size));
    Ok(InfoEntry::new(bytes))
}

/// State shared by all wrapper classes.
pub(crate) struct Core {
    handle: NativeHandle,
    refs: AtomicUsize,
    cache: Stash<InfoKey, InfoEntry>,
    rt: Arc<dyn Runtime>,
}

impl Core {
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    /// Cached information query. The same key always yields the same entry.
    pub fn info(
        &self,
        query: InfoQuery,
        secondary: NativeHandle,
        param: cl_uint,
        input: &[u8],
    ) -> Result<&InfoEntry> {
        let key = InfoKey { query, secondary, param, input: input.to_vec() };
        self.cache.get_or_try_insert_with(key, || {
            fetch_info(&*self.rt, query, self.handle, secondary, param, input)
        })
    }

    /// Information query for values that change over time.
    pub fn info_uncached(
        &self,
        query: InfoQuery,
        secondary: NativeHandle,
        param: cl_uint,
    ) -> Result<InfoEntry> {
        fetch_info(&*self.rt, query, self.handle, secondary, param, &[])
    }
}

/// Class-specific part of a wrapper.
pub(crate) trait WrapperClass: Sized + Send + Sync + 'static {
    const CLASS: Class;

    /// Whether this wrapper holds a native reference that must be taken on
    /// adoption and given back on release.
    fn owns_native(&self) -> bool {
        true
    }

    /// Release hook, run once the last reference is gone and before the
    /// native release. Dropping the fields unrefs composed wrappers.
    fn release_fields(self, _core: &Core) {}
}

pub(crate) struct Node<F> {
    core: Core,
    fields: F,
}

/// How a native handle came into our hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Adopt {
    /// Fresh from a factory call; its native reference is ours.
    Owned,
    /// Borrowed from the caller or an information query; a new wrapper
    /// retains it.
    Borrowed,
}

/// One reference to a wrapper node.
pub(crate) struct Wrapper<F: WrapperClass> {
    node: ManuallyDrop<Arc<Node<F>>>,
}

impl<F: WrapperClass> Wrapper<F> {
    /// Returns the wrapper of `handle`, creating it with `init` if none
    /// exists. `init` runs under the identity-map lock and must not wrap.
    pub fn wrap(
        rt: &Arc<dyn Runtime>,
        handle: NativeHandle,
        adopt: Adopt,
        init: impl FnOnce() -> F,
    ) -> Result<Self> {
        if handle.is_null() {
            return Err(host_err!(InvalidData, "cannot wrap a null {} handle", F::CLASS.name()));
        }
        let key = (F::CLASS, handle);
        let mut map = IDENTITY.lock();
        let existing = map
            .get(&key)
            .and_then(Weak::upgrade)
            .and_then(|any| any.downcast::<Node<F>>().ok());
        if let Some(node) = existing {
            node.core.refs.fetch_add(1, Ordering::AcqRel);
            drop(map);
            log::trace!("ref {} {:?}", F::CLASS.name(), handle);
            return Ok(Wrapper { node: ManuallyDrop::new(node) });
        }
        let fields = init();
        if adopt == Adopt::Borrowed && fields.owns_native() {
            if let Err(code) = rt.retain(F::CLASS, handle) {
                // Fields may hold wrappers whose drop takes the map lock.
                drop(map);
                drop(fields);
                return Err(Error::runtime(code, "retain"));
            }
        }
        let node = Arc::new(Node {
            core: Core {
                handle,
                refs: AtomicUsize::new(1),
                cache: Stash::default(),
                rt: rt.clone(),
            },
            fields,
        });
        let any: Arc<dyn Any + Send + Sync> = node.clone();
        map.insert(key, Arc::downgrade(&any));
        drop(map);
        log::trace!("wrap {} {:?}", F::CLASS.name(), handle);
        Ok(Wrapper { node: ManuallyDrop::new(node) })
    }

    pub fn core(&self) -> &Core {
        &self.node.core
    }

    pub fn fields(&self) -> &F {
        &self.node.fields
    }

    pub fn handle(&self) -> NativeHandle {
        self.node.core.handle
    }

    pub fn rt(&self) -> &Arc<dyn Runtime> {
        &self.node.core.rt
    }

    pub fn ref_count(&self) -> usize {
        self.node.core.refs.load(Ordering::Acquire)
    }

    pub fn same_node(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Runs `f` if this is the only reference to the node. The identity map
    /// stays locked meanwhile, so no new reference can appear.
    pub fn with_exclusive<R>(&mut self, f: impl FnOnce(&F) -> R) -> Option<R> {
        let _map = IDENTITY.lock();
        if self.node.core.refs.load(Ordering::Acquire) != 1 {
            return None;
        }
        Some(f(&self.node.fields))
    }
}

impl<F: WrapperClass> Clone for Wrapper<F> {
    fn clone(&self) -> Self {
        self.node.core.refs.fetch_add(1, Ordering::AcqRel);
        Wrapper { node: ManuallyDrop::new(Arc::clone(&self.node)) }
    }
}

impl<F: WrapperClass> Drop for Wrapper<F> {
    fn drop(&mut self) {
        // SAFETY: `node` is never touched again.
        let node = unsafe { ManuallyDrop::take(&mut self.node) };
        let handle = node.core.handle;
        let last = {
            let mut map = IDENTITY.lock();
            let last = node.core.refs.fetch_sub(1, Ordering::AcqRel) == 1;
            if last {
                map.remove(&(F::CLASS, handle));
            }
            last
        };
        if !last {
            return;
        }
        let Node { core, fields } = match Arc::try_unwrap(node) {
            Ok(node) => node,
            Err(_) => {
                log::warn!("{} {:?} released while still shared", F::CLASS.name(), handle);
                return;
            }
        };
        let owns_native = fields.owns_native();
        fields.release_fields(&core);
        if owns_native {
            if let Err(code) = core.rt.release(F::CLASS, handle) {
                log::warn!(
                    "releasing {} {:?} failed: {} ({})",
                    F::CLASS.name(),
                    handle,
                    code,
                    cl_error_name(code)
                );
            }
        }
        log::trace!("release {} {:?}", F::CLASS.name(), handle);
    }
}

/// Methods shared by every public wrapper type.
macro_rules! wrapper_common {
    ($ty:ident) => {
        impl $ty {
            /// The wrapped native handle.
            pub fn native(&self) -> $crate::raw::NativeHandle {
                self.0.handle()
            }
            /// Number of live references to this wrapper.
            pub fn ref_count(&self) -> usize {
                self.0.ref_count()
            }
            /// Gives back this reference. Same as dropping it.
            pub fn destroy(self) {}
        }

        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                self.0.same_node(&other.0)
            }
        }
        impl Eq for $ty {}

        impl core::hash::Hash for $ty {
            fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
                self.0.handle().hash(state)
            }
        }

        impl core::fmt::Debug for $ty {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({:?})", stringify!($ty), self.0.handle())
            }
        }
    };
}
pub(crate) use wrapper_common;
