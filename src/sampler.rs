use std::sync::Arc;

use crate::context::Context;
use crate::error::{host_err, ClResultExt, Result};
use crate::raw::*;
use crate::runtime::{self, InfoQuery, Runtime};
use crate::version::ClVersion;
use crate::wrapper::{fetch_info, wrapper_common, Adopt, InfoEntry, Wrapper, WrapperClass};

pub(crate) struct SamplerFields {
    context: Context,
}

impl WrapperClass for SamplerFields {
    const CLASS: Class = Class::Sampler;
}

#[derive(Clone)]
pub struct Sampler(pub(crate) Wrapper<SamplerFields>);

wrapper_common!(Sampler);

impl Sampler {
    pub fn new(
        context: &Context,
        normalized_coords: bool,
        addressing: cl_addressing_mode,
        filter: cl_filter_mode,
    ) -> Result<Sampler> {
        Sampler::new_with_properties(
            context,
            &[
                (CL_SAMPLER_NORMALIZED_COORDS as cl_sampler_properties, normalized_coords as cl_sampler_properties),
                (CL_SAMPLER_ADDRESSING_MODE as cl_sampler_properties, addressing as cl_sampler_properties),
                (CL_SAMPLER_FILTER_MODE as cl_sampler_properties, filter as cl_sampler_properties),
            ],
        )
    }

    /// Creates a sampler from `(name, value)` property pairs. Missing
    /// properties default to normalized coordinates, `CL_ADDRESS_CLAMP` and
    /// `CL_FILTER_NEAREST`.
    pub fn new_with_properties(
        context: &Context,
        props: &[(cl_sampler_properties, cl_sampler_properties)],
    ) -> Result<Sampler> {
        let rt = context.0.rt();
        let handle = if context.version()? >= ClVersion::V2_0 {
            let mut list: Vec<cl_sampler_properties> = props.iter().flat_map(|&(name, value)| [name, value]).collect();
            list.push(0);
            rt.create_sampler_with_properties(context.native(), &list)
                .cl_context("clCreateSamplerWithProperties")?
        } else {
            let (mut normalized, mut addressing, mut filter) = (true, CL_ADDRESS_CLAMP, CL_FILTER_NEAREST);
            for &(name, value) in props {
                match cl_uint::try_from(name) {
                    Ok(CL_SAMPLER_NORMALIZED_COORDS) => normalized = value != 0,
                    Ok(CL_SAMPLER_ADDRESSING_MODE) => addressing = value as cl_addressing_mode,
                    Ok(CL_SAMPLER_FILTER_MODE) => filter = value as cl_filter_mode,
                    _ => return Err(host_err!(InvalidData, "unknown sampler property {:#x}", name)),
                }
            }
            rt.create_sampler(context.native(), normalized, addressing, filter)
                .cl_context("clCreateSampler")?
        };
        let context = context.clone();
        Wrapper::wrap(rt, handle, Adopt::Owned, move || SamplerFields { context }).map(Sampler)
    }

    pub fn from_native(handle: NativeHandle) -> Result<Sampler> {
        Sampler::wrap(&runtime::current()?, handle)
    }

    pub(crate) fn wrap(rt: &Arc<dyn Runtime>, handle: NativeHandle) -> Result<Sampler> {
        let ctx = fetch_info(&**rt, InfoQuery::Sampler, handle, NativeHandle::NULL, CL_SAMPLER_CONTEXT, &[])?;
        let context = Context::wrap(rt, ctx.handle()?)?;
        Wrapper::wrap(rt, handle, Adopt::Borrowed, move || SamplerFields { context }).map(Sampler)
    }

    pub fn info(&self, param: cl_uint) -> Result<&InfoEntry> {
        self.0.core().info(InfoQuery::Sampler, NativeHandle::NULL, param, &[])
    }

    pub fn context(&self) -> &Context {
        &self.0.fields().context
    }

    pub fn normalized_coords(&self) -> Result<bool> {
        self.info(CL_SAMPLER_NORMALIZED_COORDS)?.boolean()
    }

    pub fn addressing_mode(&self) -> Result<cl_addressing_mode> {
        self.info(CL_SAMPLER_ADDRESSING_MODE)?.scalar()
    }

    pub fn filter_mode(&self) -> Result<cl_filter_mode> {
        self.info(CL_SAMPLER_FILTER_MODE)?.scalar()
    }
}
