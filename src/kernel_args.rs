//! Type-erased kernel arguments.
//!
//! Every argument is lowered to an [`ArgRecord`] holding its size and, for
//! anything but local memory, its bytes. Argument lists are either slices of
//! records or tuples of [`KernelArg`] values.

use bytemuck::Pod;

use crate::buffer::Buffer;
use crate::image::Image;
use crate::raw::NativeHandle;
use crate::sampler::Sampler;

/// One argument as handed to `clSetKernelArg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgRecord {
    pub size: usize,
    /// `None` passes a null pointer, which reserves `size` bytes of local
    /// memory.
    pub value: Option<Vec<u8>>,
}

impl ArgRecord {
    pub fn scalar<T: Pod>(value: &T) -> Self {
        ArgRecord::bytes(bytemuck::bytes_of(value))
    }

    pub fn bytes(bytes: &[u8]) -> Self {
        ArgRecord { size: bytes.len(), value: Some(bytes.to_vec()) }
    }

    pub fn local(size: usize) -> Self {
        ArgRecord { size, value: None }
    }

    /// Memory objects and samplers are passed by handle.
    pub fn handle(handle: NativeHandle) -> Self {
        ArgRecord::scalar(&handle.to_raw())
    }
}

/// `__local` memory of the given size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMem(pub usize);

pub trait KernelArg {
    fn as_arg(&self) -> ArgRecord;
}

macro_rules! autoimpl {
    ($($scalar:ty),+) => {
        $(
            impl KernelArg for $scalar {
                fn as_arg(&self) -> ArgRecord {
                    ArgRecord::scalar(self)
                }
            }
        )+
    };
}

autoimpl!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// OpenCL vector types such as `float4`.
impl<T: Pod, const N: usize> KernelArg for [T; N] {
    fn as_arg(&self) -> ArgRecord {
        ArgRecord::bytes(bytemuck::cast_slice(&self[..]))
    }
}

impl KernelArg for Buffer {
    fn as_arg(&self) -> ArgRecord {
        ArgRecord::handle(self.native())
    }
}

impl KernelArg for Image {
    fn as_arg(&self) -> ArgRecord {
        ArgRecord::handle(self.native())
    }
}

impl KernelArg for Sampler {
    fn as_arg(&self) -> ArgRecord {
        ArgRecord::handle(self.native())
    }
}

impl KernelArg for LocalMem {
    fn as_arg(&self) -> ArgRecord {
        ArgRecord::local(self.0)
    }
}

impl KernelArg for ArgRecord {
    fn as_arg(&self) -> ArgRecord {
        self.clone()
    }
}

impl<A: KernelArg + ?Sized> KernelArg for &A {
    fn as_arg(&self) -> ArgRecord {
        (**self).as_arg()
    }
}

/// An ordered argument list; argument `i` goes to kernel parameter `i`.
pub trait KernelArgs {
    fn records(&self) -> Vec<ArgRecord>;
}

impl KernelArgs for () {
    fn records(&self) -> Vec<ArgRecord> {
        Vec::new()
    }
}

impl KernelArgs for [ArgRecord] {
    fn records(&self) -> Vec<ArgRecord> {
        self.to_vec()
    }
}

impl<const N: usize> KernelArgs for [ArgRecord; N] {
    fn records(&self) -> Vec<ArgRecord> {
        self.to_vec()
    }
}

impl KernelArgs for Vec<ArgRecord> {
    fn records(&self) -> Vec<ArgRecord> {
        self.clone()
    }
}

impl<A: KernelArgs + ?Sized> KernelArgs for &A {
    fn records(&self) -> Vec<ArgRecord> {
        (**self).records()
    }
}

macro_rules! tuple_args {
    ($($name:ident $ix:tt),+) => {
        impl<$($name: KernelArg),+> KernelArgs for ($($name,)+) {
            fn records(&self) -> Vec<ArgRecord> {
                vec![$(self.$ix.as_arg()),+]
            }
        }
    };
}

tuple_args!(A0 0);
tuple_args!(A0 0, A1 1);
tuple_args!(A0 0, A1 1, A2 2);
tuple_args!(A0 0, A1 1, A2 2, A3 3);
tuple_args!(A0 0, A1 1, A2 2, A3 3, A4 4);
tuple_args!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5);
tuple_args!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6);
tuple_args!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7);
tuple_args!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7, A8 8);
tuple_args!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7, A8 8, A9 9);
tuple_args!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7, A8 8, A9 9, A10 10);
tuple_args!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7, A8 8, A9 9, A10 10, A11 11);
tuple_args!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7, A8 8, A9 9, A10 10, A11 11, A12 12);
tuple_args!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7, A8 8, A9 9, A10 10, A11 11, A12 12, A13 13);
tuple_args!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7, A8 8, A9 9, A10 10, A11 11, A12 12, A13 13, A14 14);
tuple_args!(
    A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7, A8 8, A9 9, A10 10, A11 11, A12 12, A13 13, A14 14, A15 15
);
