//! Boundary to host-implemented functions.
//!
//! A function declared without a body dispatches to the machine's
//! [`NativeInterop`]. Arguments and results cross the boundary as typed
//! values; converting them to host representations is the interop layer's
//! business.

use std::collections::HashMap;

use realmvm_foundation::{Error, Result, TypedValue};

/// Host side of native function calls.
pub trait NativeInterop {
    /// Calls `pkg_path.name` with the given arguments (receiver first for
    /// methods).
    ///
    /// # Errors
    ///
    /// A `Runtime` error becomes a guest panic; anything else aborts the
    /// transaction.
    fn call(&mut self, pkg_path: &str, name: &str, args: Vec<TypedValue>) -> Result<Vec<TypedValue>>;

    /// New contents for map arguments of the last call, as
    /// `(argument index, key/value pairs)`.
    ///
    /// The machine writes them back through its tracked map writes, so
    /// realm maps stay consistent.
    fn take_map_updates(&mut self) -> Vec<(usize, Vec<(TypedValue, TypedValue)>)> {
        Vec::new()
    }
}

/// Signature of a registered host function.
pub type NativeFn = Box<dyn FnMut(Vec<TypedValue>) -> Result<Vec<TypedValue>>>;

/// Table of host functions keyed by package path and name.
#[derive(Default)]
pub struct NativeRegistry {
    funcs: HashMap<(String, String), NativeFn>,
}

impl NativeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function, replacing any previous one.
    pub fn register(
        &mut self,
        pkg_path: &str,
        name: &str,
        f: impl FnMut(Vec<TypedValue>) -> Result<Vec<TypedValue>> + 'static,
    ) {
        self.funcs
            .insert((pkg_path.to_string(), name.to_string()), Box::new(f));
    }

    /// Builder form of [`NativeRegistry::register`].
    #[must_use]
    pub fn with(
        mut self,
        pkg_path: &str,
        name: &str,
        f: impl FnMut(Vec<TypedValue>) -> Result<Vec<TypedValue>> + 'static,
    ) -> Self {
        self.register(pkg_path, name, f);
        self
    }

    /// Number of registered functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    /// True if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

impl NativeInterop for NativeRegistry {
    fn call(&mut self, pkg_path: &str, name: &str, args: Vec<TypedValue>) -> Result<Vec<TypedValue>> {
        let f = self
            .funcs
            .get_mut(&(pkg_path.to_string(), name.to_string()))
            .ok_or_else(|| Error::internal(format!("no native function {pkg_path}.{name}")))?;
        f(args)
    }
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("funcs", &self.funcs.len())
            .finish()
    }
}
