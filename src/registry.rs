//! Capability registry: how composite primitives decompose.

#![forbid(unsafe_code)]

use crate::primitive::Primitive;
use std::collections::HashMap;

/// Decomposition of one primitive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapabilityDef {
    /// True when the primitive may be realised as a pipeline of components.
    pub composable: bool,
    /// Components in pipeline order.
    pub component_list: Vec<Primitive>,
    /// Indices of components that run in inverse direction.
    pub inverse_stages: Vec<usize>,
}

impl CapabilityDef {
    /// A primitive with only monolithic implementations.
    pub fn monolithic() -> Self {
        Self::default()
    }

    /// A pipeline of `components`.
    pub fn pipeline(components: &[Primitive]) -> Self {
        Self {
            composable: true,
            component_list: components.to_vec(),
            inverse_stages: Vec::new(),
        }
    }

    /// Mark component `index` as an inverse stage.
    pub fn with_inverse(mut self, index: usize) -> Self {
        self.inverse_stages.push(index);
        self
    }

    pub fn is_inverse(&self, index: usize) -> bool {
        self.inverse_stages.contains(&index)
    }
}

/// Read-only table from primitive to capability definition.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    defs: HashMap<Primitive, CapabilityDef>,
}

impl CapabilityRegistry {
    /// Registry with no composable primitives.
    pub fn empty() -> Self {
        Self {
            defs: HashMap::new(),
        }
    }

    /// Override or add the definition for `primitive`.
    pub fn with_capability(mut self, primitive: Primitive, def: CapabilityDef) -> Self {
        self.defs.insert(primitive, def);
        self
    }

    /// Definition for `primitive`; unknown primitives are monolithic.
    pub fn get(&self, primitive: Primitive) -> CapabilityDef {
        self.defs.get(&primitive).cloned().unwrap_or_default()
    }

    pub fn is_composable(&self, primitive: Primitive) -> bool {
        self.defs
            .get(&primitive)
            .map(|d| d.composable && !d.component_list.is_empty())
            .unwrap_or(false)
    }
}

impl Default for CapabilityRegistry {
    /// The built-in table: FFI is FFT → FIR → inverse FFT.
    fn default() -> Self {
        Self::empty().with_capability(
            Primitive::AudioFfi,
            CapabilityDef::pipeline(&[Primitive::AudioFft, Primitive::AudioFir, Primitive::AudioFft])
                .with_inverse(2),
        )
    }
}
