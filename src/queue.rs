use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::Context;
use crate::device::Device;
use crate::error::{ClResultExt, Result};
use crate::event::{self, Event, EventWaitList};
use crate::raw::*;
use crate::runtime::{self, InfoQuery, RtResult, Runtime};
use crate::stash::Stash;
use crate::version::ClVersion;
use crate::wrapper::{fetch_info, wrapper_common, Adopt, Core, InfoEntry, Wrapper, WrapperClass};

pub(crate) struct QueueFields {
    context: Context,
    device: Device,
    events: Stash<NativeHandle, Event>,
    name: RwLock<Option<String>>,
}

impl WrapperClass for QueueFields {
    const CLASS: Class = Class::Queue;

    fn release_fields(self, core: &Core) {
        let QueueFields { context, device, events, .. } = self;
        log::trace!("queue {:?} drops {} events", core.handle(), events.len());
        // Events go before the objects they were produced against.
        drop(events);
        drop(device);
        drop(context);
    }
}

/// Knobs of [`Queue::with_properties`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueProperties {
    pub out_of_order: bool,
    pub profiling: bool,
    /// Device queue size (OpenCL 2.0).
    pub size: Option<u32>,
}

impl QueueProperties {
    pub fn bits(&self) -> cl_command_queue_properties {
        let mut bits = 0;
        if self.out_of_order {
            bits |= CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE;
        }
        if self.profiling {
            bits |= CL_QUEUE_PROFILING_ENABLE;
        }
        bits
    }
}

/// Command queue. Owns every event produced by an enqueue on it.
#[derive(Clone)]
pub struct Queue(pub(crate) Wrapper<QueueFields>);

wrapper_common!(Queue);

impl Queue {
    /// Creates a queue on `device`, which must belong to `context`.
    /// `props` is a `CL_QUEUE_*` bit set.
    pub fn new(context: &Context, device: &Device, props: cl_command_queue_properties) -> Result<Queue> {
        Queue::create(context, device, props, None)
    }

    pub fn with_properties(context: &Context, device: &Device, props: &QueueProperties) -> Result<Queue> {
        Queue::create(context, device, props.bits(), props.size)
    }

    fn create(
        context: &Context,
        device: &Device,
        props: cl_command_queue_properties,
        size: Option<u32>,
    ) -> Result<Queue> {
        let rt = context.0.rt();
        let version = context.version()?;
        let handle = if version >= ClVersion::V2_0 {
            let mut list = vec![CL_QUEUE_PROPERTIES as cl_queue_properties, props];
            if let Some(size) = size {
                list.extend([CL_QUEUE_SIZE as cl_queue_properties, size as cl_queue_properties]);
            }
            list.push(0);
            rt.create_command_queue_with_properties(context.native(), device.native(), &list)
                .cl_context("clCreateCommandQueueWithProperties")?
        } else {
            if size.is_some() {
                version.require(ClVersion::V2_0, "queue size")?;
            }
            rt.create_command_queue(context.native(), device.native(), props)
                .cl_context("clCreateCommandQueue")?
        };
        log::debug!("created queue {:?} on device {:?}", handle, device.native());
        let (context, device) = (context.clone(), device.clone());
        Wrapper::wrap(rt, handle, Adopt::Owned, move || QueueFields::new(context, device)).map(Queue)
    }

    pub fn from_native(handle: NativeHandle) -> Result<Queue> {
        Queue::wrap(&runtime::current()?, handle)
    }

    pub(crate) fn wrap(rt: &Arc<dyn Runtime>, handle: NativeHandle) -> Result<Queue> {
        let query = |param| fetch_info(&**rt, InfoQuery::Queue, handle, NativeHandle::NULL, param, &[]);
        let context = Context::wrap(rt, query(CL_QUEUE_CONTEXT)?.handle()?)?;
        let device = Device::wrap(rt, query(CL_QUEUE_DEVICE)?.handle()?)?;
        Wrapper::wrap(rt, handle, Adopt::Borrowed, move || QueueFields::new(context, device)).map(Queue)
    }

    pub fn info(&self, param: cl_uint) -> Result<&InfoEntry> {
        self.0.core().info(InfoQuery::Queue, NativeHandle::NULL, param, &[])
    }

    pub fn context(&self) -> &Context {
        &self.0.fields().context
    }

    pub fn device(&self) -> &Device {
        &self.0.fields().device
    }

    pub fn properties(&self) -> Result<cl_command_queue_properties> {
        self.info(CL_QUEUE_PROPERTIES)?.scalar()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.0.fields().name.write() = Some(name.into());
    }

    pub fn name(&self) -> Option<String> {
        self.0.fields().name.read().clone()
    }

    /// Takes ownership of an event just returned by an enqueue call on this
    /// queue. The reference stays valid until the queue is dropped or
    /// collected with [`Queue::gc`].
    pub(crate) fn produce_event(&self, handle: NativeHandle) -> Result<&Event> {
        let event = Event::wrap(self.0.rt(), handle, Adopt::Owned)?;
        Ok(self.0.fields().events.insert(handle, event))
    }

    pub fn flush(&self) -> Result<()> {
        self.0.rt().flush(self.native()).cl_context("clFlush")
    }

    /// Blocks until every command on the queue has completed.
    pub fn finish(&self) -> Result<()> {
        self.0.rt().finish(self.native()).cl_context("clFinish")
    }

    /// Turns the outcome of an enqueue call on this queue into the event it
    /// produced, clearing `wait` on success.
    pub(crate) fn enqueued(
        &self,
        result: RtResult<NativeHandle>,
        call: &str,
        wait: Option<&mut EventWaitList<'_>>,
    ) -> Result<&Event> {
        let event = self.produce_event(result.cl_context(call)?)?;
        event::wait_done(wait);
        Ok(event)
    }

    /// Marker completing once `wait` (or, without one, everything enqueued
    /// before it) has completed. OpenCL 1.2.
    pub fn enqueue_marker(&self, wait: Option<&mut EventWaitList<'_>>) -> Result<&Event> {
        self.context().version()?.require(ClVersion::V1_2, "markers")?;
        let result = self.0.rt().enqueue_marker(self.native(), event::wait_raw(&wait));
        self.enqueued(result, "clEnqueueMarkerWithWaitList", wait)
    }

    /// Like [`Queue::enqueue_marker`], but later commands also wait for it.
    pub fn enqueue_barrier(&self, wait: Option<&mut EventWaitList<'_>>) -> Result<&Event> {
        self.context().version()?.require(ClVersion::V1_2, "barriers")?;
        let result = self.0.rt().enqueue_barrier(self.native(), event::wait_raw(&wait));
        self.enqueued(result, "clEnqueueBarrierWithWaitList", wait)
    }

    /// Snapshot of the events this queue owns, in no particular order.
    pub fn events(&self) -> Vec<Event> {
        self.0.fields().events.values().into_iter().cloned().collect()
    }

    pub fn num_events(&self) -> usize {
        self.0.fields().events.len()
    }

    /// Drops the owned events that have completed or failed and returns how
    /// many went. Clones handed out earlier stay valid. Does nothing while
    /// other references to the queue exist.
    pub fn gc(&mut self) -> usize {
        let finished: HashSet<NativeHandle> = self
            .0
            .fields()
            .events
            .values()
            .into_iter()
            .filter(|e| matches!(e.status(), Ok(status) if status <= CL_COMPLETE))
            .map(Event::native)
            .collect();
        if finished.is_empty() {
            return 0;
        }
        // SAFETY: `&mut self` on the only reference to the queue means no
        // borrowed `&Event` into the table is alive.
        let removed = self
            .0
            .with_exclusive(|f| unsafe { f.events.drain_where(|e| finished.contains(&e.native())) });
        match removed {
            Some(removed) => {
                log::trace!("queue {:?} collected {} events", self.native(), removed.len());
                removed.len()
            }
            None => {
                log::debug!("queue {:?} is shared, not collecting events", self.native());
                0
            }
        }
    }
}

impl QueueFields {
    fn new(context: Context, device: Device) -> Self {
        QueueFields { context, device, events: Stash::default(), name: RwLock::new(None) }
    }
}
