use std::{
    any::{Any, TypeId},
    error::Error,
    fmt::Debug,
    sync::Arc,
};

use casey::snake;

use super::DispatchError;
use crate::loom::tensor::TensorUntyped;

/// A kernel signature that can be stored in a [`DispatchEntry`].
///
/// Implemented for `fn(&T0, ..) -> Result<(), E>` with up to 4 arguments. Kernels only get
/// shared references; outputs are written through the interior mutability of tensor buffers.
pub trait DispatchFn: Copy + Send + Sync + 'static {
    const ARITY: usize;

    /// Downcasts `args` to the argument types and calls the function.
    fn call_erased(self, args: &[&dyn Any]) -> Result<(), DispatchError>;
}

/// Recovers the static type of a dispatch argument.
///
/// Besides exact matches, an untyped tensor is accepted where a `Tensor<U>` is expected if its
/// element type is `U`.
fn downcast_arg<'a, T: 'static>(arg: &'a dyn Any, index: usize) -> Result<&'a T, DispatchError> {
    if let Some(arg) = arg.downcast_ref::<T>() {
        return Ok(arg);
    }
    if let Some(tensor) = arg.downcast_ref::<TensorUntyped>() {
        if tensor.dtype().tensor_type_id() == TypeId::of::<T>() {
            let ptr = tensor as *const TensorUntyped as *const T;
            // SAFETY: `T` is `Tensor<U>` with `U` the element type of `tensor`, and `Tensor<U>`
            // is a `repr(transparent)` wrapper of `TensorUntyped`.
            return Ok(unsafe { &*ptr });
        }
    }
    Err(DispatchError::ArgType {
        index,
        expected: std::any::type_name::<T>(),
    })
}

macro_rules! impl_dispatch_fn {
    ($($t:ident $index:tt),+) => {
        impl<$($t: 'static,)+ E> DispatchFn for fn($(&$t),+) -> Result<(), E>
        where
            E: Error + Send + Sync + 'static,
        {
            const ARITY: usize = [$(stringify!($t)),+].len();

            fn call_erased(self, args: &[&dyn Any]) -> Result<(), DispatchError> {
                let &[$(snake!($t)),+] = args else {
                    return Err(DispatchError::Arity {
                        expected: Self::ARITY,
                        actual: args.len(),
                    });
                };
                $(let snake!($t) = downcast_arg::<$t>(snake!($t), $index)?;)+
                self($(snake!($t)),+).map_err(|err| DispatchError::Kernel(Box::new(err)))
            }
        }
    };
}

impl_dispatch_fn!(T0 0);
impl_dispatch_fn!(T0 0, T1 1);
impl_dispatch_fn!(T0 0, T1 1, T2 2);
impl_dispatch_fn!(T0 0, T1 1, T2 2, T3 3);

type Caller = fn(&(dyn Any + Send + Sync), &[&dyn Any]) -> Result<(), DispatchError>;

fn trampoline<F: DispatchFn>(
    func: &(dyn Any + Send + Sync),
    args: &[&dyn Any],
) -> Result<(), DispatchError> {
    match func.downcast_ref::<F>() {
        Some(&f) => f.call_erased(args),
        None => unreachable!("dispatch entry built with a different function type"),
    }
}

/// A type-erased kernel together with the trampoline that restores its argument types.
#[derive(Clone)]
pub struct DispatchEntry {
    func: Arc<dyn Any + Send + Sync>,
    caller: Caller,
    arity: usize,
    name: &'static str,
}

impl Debug for DispatchEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEntry")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

impl DispatchEntry {
    pub fn new<F: DispatchFn>(f: F) -> Self {
        Self {
            func: Arc::new(f),
            caller: trampoline::<F>,
            arity: F::ARITY,
            name: std::any::type_name::<F>(),
        }
    }

    #[inline]
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Returns the stored function if it is an `F`.
    #[inline]
    pub fn function<F: DispatchFn>(&self) -> Option<F> {
        self.func.downcast_ref::<F>().copied()
    }

    /// Calls the kernel. Every argument is checked against the kernel signature first.
    #[inline]
    pub fn call(&self, args: &[&dyn Any]) -> Result<(), DispatchError> {
        (self.caller)(self.func.as_ref(), args)
    }
}
