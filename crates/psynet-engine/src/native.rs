//! Native module hosting
//!
//! Native modules are user-supplied nodes whose behaviour is a Rust callback
//! instead of a selector-driven node function. They declare how many elements
//! they occupy; the engine snapshots their slot activations before the
//! dispatch phase and calls `node_function` after it, with mutable access to
//! the node's gate activations.

use crate::error::{EngineError, Result};
use crate::types::nodetype;
use std::fmt;

/// State and behaviour of one native module instance
pub trait NativeModule: Send + Sync + fmt::Debug {
    /// Run the module for this tick
    fn node_function(&mut self, ctx: &mut NativeModuleContext<'_>);
}

/// Per-tick view handed to a native module
pub struct NativeModuleContext<'a> {
    /// Current tick
    pub step: i32,
    /// Slot activations captured before the dispatch phase
    pub slots: &'a [f32],
    /// Live gate activations of the node's elements
    pub gates: &'a mut [f32],
}

/// Factory producing fresh instances of one native module type
pub type NativeModuleFactory = Box<dyn Fn() -> Box<dyn NativeModule> + Send + Sync>;

/// Declared shape of a registered native module type
pub struct NativeModuleType {
    /// Type name, unique within the registry
    pub name: String,
    /// Elements (= slots = gates) each instance occupies
    pub elements: usize,
    factory: NativeModuleFactory,
}

impl fmt::Debug for NativeModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModuleType")
            .field("name", &self.name)
            .field("elements", &self.elements)
            .finish()
    }
}

/// Registry of native module types known to a net
///
/// Numeric type ids are handed out above `MAX_STD_NODETYPE` in registration
/// order, which makes them stable across save/load as long as the host
/// registers the same types in the same order.
#[derive(Debug, Default)]
pub struct NodeTypeRegistry {
    types: Vec<NativeModuleType>,
}

impl NodeTypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native module type; returns its numeric node type
    pub fn register(
        &mut self,
        name: impl Into<String>,
        elements: usize,
        factory: NativeModuleFactory,
    ) -> i32 {
        self.types.push(NativeModuleType {
            name: name.into(),
            elements,
            factory,
        });
        nodetype::MAX_STD_NODETYPE + self.types.len() as i32
    }

    /// Element count of a native type, if registered
    pub fn elements_for(&self, numeric_type: i32) -> Option<usize> {
        self.entry(numeric_type).map(|t| t.elements)
    }

    /// Numeric type of a registered name
    pub fn type_by_name(&self, name: &str) -> Option<i32> {
        self.types
            .iter()
            .position(|t| t.name == name)
            .map(|idx| nodetype::MAX_STD_NODETYPE + idx as i32 + 1)
    }

    /// Instantiate a module of the given numeric type
    pub fn instantiate(&self, numeric_type: i32) -> Result<Box<dyn NativeModule>> {
        let entry = self
            .entry(numeric_type)
            .ok_or(EngineError::InvalidType {
                type_id: numeric_type,
            })?;
        Ok((entry.factory)())
    }

    /// All registered element counts, keyed by numeric type
    pub fn element_table(&self) -> Vec<(i32, usize)> {
        self.types
            .iter()
            .enumerate()
            .map(|(idx, t)| (nodetype::MAX_STD_NODETYPE + idx as i32 + 1, t.elements))
            .collect()
    }

    fn entry(&self, numeric_type: i32) -> Option<&NativeModuleType> {
        let idx = numeric_type - nodetype::MAX_STD_NODETYPE - 1;
        if idx < 0 {
            return None;
        }
        self.types.get(idx as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Doubler;

    impl NativeModule for Doubler {
        fn node_function(&mut self, ctx: &mut NativeModuleContext<'_>) {
            for (gate, &slot) in ctx.gates.iter_mut().zip(ctx.slots.iter()) {
                *gate = slot * 2.0;
            }
        }
    }

    #[test]
    fn test_registry() {
        let mut registry = NodeTypeRegistry::new();
        let doubler = registry.register("Doubler", 2, Box::new(|| Box::new(Doubler)));
        assert_eq!(doubler, nodetype::MAX_STD_NODETYPE + 1);
        assert_eq!(registry.elements_for(doubler), Some(2));
        assert_eq!(registry.type_by_name("Doubler"), Some(doubler));
        assert_eq!(registry.type_by_name("Nope"), None);
        assert!(registry.instantiate(doubler).is_ok());
        assert!(registry.instantiate(nodetype::REGISTER).is_err());
    }

    #[test]
    fn test_module_runs() {
        let mut module = Doubler;
        let slots = [1.0, 2.5];
        let mut gates = [0.0, 0.0];
        let mut ctx = NativeModuleContext {
            step: 0,
            slots: &slots,
            gates: &mut gates,
        };
        module.node_function(&mut ctx);
        assert_eq!(gates, [2.0, 5.0]);
    }
}
