//! Events, user events and event wait lists.

use core::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::Context;
use crate::error::{ClResultExt, Result};
use crate::raw::*;
use crate::runtime::{self, InfoQuery, Runtime};
use crate::version::ClVersion;
use crate::wrapper::{wrapper_common, Adopt, InfoEntry, Wrapper, WrapperClass};

pub(crate) struct EventFields {
    name: RwLock<Option<String>>,
}

impl WrapperClass for EventFields {
    const CLASS: Class = Class::Event;
}

/// Completion handle of an enqueued command.
///
/// Events produced by enqueue operations belong to the queue that produced
/// them and are handed out by reference; clone one to keep it past the
/// queue's garbage collection.
#[derive(Clone)]
pub struct Event(pub(crate) Wrapper<EventFields>);

wrapper_common!(Event);

impl Event {
    pub fn from_native(handle: NativeHandle) -> Result<Event> {
        Event::wrap(&runtime::current()?, handle, Adopt::Borrowed)
    }

    pub(crate) fn wrap(rt: &Arc<dyn Runtime>, handle: NativeHandle, adopt: Adopt) -> Result<Event> {
        Wrapper::wrap(rt, handle, adopt, || EventFields { name: RwLock::new(None) }).map(Event)
    }

    pub fn info(&self, param: cl_uint) -> Result<&InfoEntry> {
        self.0.core().info(InfoQuery::Event, NativeHandle::NULL, param, &[])
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.0.fields().name.write() = Some(name.into());
    }

    pub fn name(&self) -> Option<String> {
        self.0.fields().name.read().clone()
    }

    /// The event's name, or the name of its command type when unnamed.
    pub fn final_name(&self) -> Result<String> {
        match self.name() {
            Some(name) => Ok(name),
            None => Ok(command_type_name(self.command_type()?).to_string()),
        }
    }

    pub fn command_type(&self) -> Result<cl_command_type> {
        self.info(CL_EVENT_COMMAND_TYPE)?.scalar()
    }

    /// Current execution status: one of `CL_QUEUED`, `CL_SUBMITTED`,
    /// `CL_RUNNING`, `CL_COMPLETE`, or a negative error code.
    pub fn status(&self) -> Result<cl_int> {
        self.0
            .core()
            .info_uncached(InfoQuery::Event, NativeHandle::NULL, CL_EVENT_COMMAND_EXECUTION_STATUS)?
            .scalar()
    }

    pub fn queue_native(&self) -> Result<NativeHandle> {
        self.info(CL_EVENT_COMMAND_QUEUE)?.handle()
    }

    pub fn context(&self) -> Result<Context> {
        Context::wrap(self.0.rt(), self.info(CL_EVENT_CONTEXT)?.handle()?)
    }

    /// OpenCL revision of the event's context.
    pub fn version(&self) -> Result<ClVersion> {
        self.context()?.version()
    }

    /// One of the `CL_PROFILING_COMMAND_*` instants, in nanoseconds. The
    /// producing queue must have profiling enabled.
    pub fn profiling_time(&self, param: cl_uint) -> Result<cl_ulong> {
        self.0.core().info(InfoQuery::EventProfiling, NativeHandle::NULL, param, &[])?.scalar()
    }

    /// Blocks until the event completes.
    pub fn wait(&self) -> Result<()> {
        self.0.rt().wait_for_events(&[self.native()]).cl_context("clWaitForEvents")
    }

    /// Runs `callback` with the event's status once it reaches
    /// `exec_type` (OpenCL 1.1). Only `CL_COMPLETE` is portable.
    pub fn set_callback(
        &self,
        exec_type: cl_int,
        callback: impl FnOnce(cl_int) + Send + 'static,
    ) -> Result<()> {
        self.version()?.require(ClVersion::V1_1, "event callbacks")?;
        self.0
            .rt()
            .set_event_callback(self.native(), exec_type, Box::new(move |_, status| callback(status)))
            .cl_context("clSetEventCallback")
    }

    /// Waits for every event in `list` and clears it.
    pub fn wait_all(list: &mut EventWaitList<'_>) -> Result<()> {
        if let (Some(rt), false) = (&list.rt, list.events.is_empty()) {
            rt.wait_for_events(&list.events).cl_context("clWaitForEvents")?;
        }
        list.clear();
        Ok(())
    }
}

/// Event whose completion is driven by the host (OpenCL 1.1).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct UserEvent(Event);

impl UserEvent {
    pub fn new(context: &Context) -> Result<UserEvent> {
        context.version()?.require(ClVersion::V1_1, "user events")?;
        let rt = context.0.rt();
        let handle = rt.create_user_event(context.native()).cl_context("clCreateUserEvent")?;
        Event::wrap(rt, handle, Adopt::Owned).map(UserEvent)
    }

    /// Moves the event to `CL_COMPLETE` or to a negative error status.
    pub fn set_status(&self, status: cl_int) -> Result<()> {
        self.0.0
            .rt()
            .set_user_event_status(self.0.native(), status)
            .cl_context("clSetUserEventStatus")
    }

    pub fn event(&self) -> &Event {
        &self.0
    }
}

impl core::ops::Deref for UserEvent {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.0
    }
}

/// Events an enqueue operation must wait for.
///
/// Borrows the events it lists. Enqueue operations clear the list when they
/// succeed and leave it untouched when they fail.
#[derive(Default)]
pub struct EventWaitList<'e> {
    events: Vec<NativeHandle>,
    rt: Option<Arc<dyn Runtime>>,
    _events: PhantomData<&'e Event>,
}

impl<'e> EventWaitList<'e> {
    pub fn new() -> Self {
        EventWaitList::default()
    }

    pub fn push(&mut self, event: &'e Event) -> &mut Self {
        if self.rt.is_none() {
            self.rt = Some(event.0.rt().clone());
        }
        self.events.push(event.native());
        self
    }

    pub fn append(&mut self, events: &[&'e Event]) -> &mut Self {
        for &event in events {
            self.push(event);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn as_raw(&self) -> &[NativeHandle] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl<'e> From<&[&'e Event]> for EventWaitList<'e> {
    fn from(events: &[&'e Event]) -> Self {
        let mut list = EventWaitList::new();
        list.append(events);
        list
    }
}

/// Raw handles of an optional wait list.
pub(crate) fn wait_raw<'w>(wait: &'w Option<&mut EventWaitList<'_>>) -> &'w [NativeHandle] {
    wait.as_deref().map_or(&[][..], |list| list.as_raw())
}

/// Clears an optional wait list after a successful enqueue.
pub(crate) fn wait_done(wait: Option<&mut EventWaitList<'_>>) {
    if let Some(list) = wait {
        list.clear();
    }
}
