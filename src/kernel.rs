//! Trait-based software routines run by CPU fallback workers.
//!
//! The numeric kernels themselves live outside this crate; callers register
//! one routine per primitive and the scheduler spawns it when no device can
//! take a request.

use crate::primitive::{Primitive, PrimitiveParams, TaskDescriptor};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Object-safe software routine.
pub trait SoftwareKernelDyn: Send + Sync {
    fn init_state(&self, params: &PrimitiveParams) -> Box<dyn Any + Send>;
    fn execute(&self, state: &mut dyn Any, task: &TaskDescriptor) -> Result<(), &'static str>;
}

/// Generic software routine; implement this for your CPU kernels.
pub trait SoftwareKernel: Send + Sync + 'static {
    type State: Send + 'static;
    fn init_state(&self, params: &PrimitiveParams) -> Self::State;
    fn execute(&self, state: &mut Self::State, task: &TaskDescriptor) -> Result<(), &'static str>;
}

impl<T: SoftwareKernel> SoftwareKernelDyn for T {
    fn init_state(&self, params: &PrimitiveParams) -> Box<dyn Any + Send> {
        Box::new(<T as SoftwareKernel>::init_state(self, params))
    }

    fn execute(&self, state: &mut dyn Any, task: &TaskDescriptor) -> Result<(), &'static str> {
        if let Some(typed) = state.downcast_mut::<<T as SoftwareKernel>::State>() {
            <T as SoftwareKernel>::execute(self, typed, task)
        } else {
            Err("State type mismatch in software kernel - worker state was built by another kernel")
        }
    }
}

/// Software routines by primitive.
#[derive(Clone, Default)]
pub struct SoftwareRegistry {
    routines: HashMap<Primitive, Arc<dyn SoftwareKernelDyn>>,
}

impl SoftwareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kernel` as the CPU routine for `primitive`.
    pub fn register<K: SoftwareKernel>(&mut self, primitive: Primitive, kernel: K) {
        self.routines.insert(primitive, Arc::new(kernel));
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<K: SoftwareKernel>(mut self, primitive: Primitive, kernel: K) -> Self {
        self.register(primitive, kernel);
        self
    }

    pub fn get(&self, primitive: Primitive) -> Option<Arc<dyn SoftwareKernelDyn>> {
        self.routines.get(&primitive).cloned()
    }
}

impl fmt::Debug for SoftwareRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.routines.keys().collect();
        keys.sort();
        f.debug_struct("SoftwareRegistry").field("routines", &keys).finish()
    }
}
