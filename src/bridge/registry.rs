//! Named-function registry
//!
//! Maps operator names to wrapped packed functions. Entries are created on
//! first lookup and never evicted, so a returned reference stays valid for
//! the registry's lifetime and C callers may cache the pointer.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use md5::{Digest, Md5};

use crate::abi::PackedFunc;
use crate::error::BridgeResult;

/// Process-wide interned packed functions
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    // Boxed so entries keep their address when the map grows
    functions: Mutex<HashMap<String, Box<PackedFunc>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the function registered under `name`, building it with
    /// `create` on first use
    ///
    /// The lock is held while `create` runs, so concurrent first callers
    /// build one function. A failing `create` inserts nothing.
    pub fn get_or_create<F>(&self, name: &str, create: F) -> BridgeResult<&PackedFunc>
    where
        F: FnOnce() -> BridgeResult<PackedFunc>,
    {
        let mut functions = self.functions.lock()?;
        if let Some(func) = functions.get(name) {
            let stable: *const PackedFunc = &**func;
            // SAFETY: boxed entries are never removed or replaced.
            return Ok(unsafe { &*stable });
        }

        let func = Box::new(create()?);
        let stable: *const PackedFunc = &*func;
        functions.insert(name.to_string(), func);
        tracing::debug!(name, "registered wrapped function");
        // SAFETY: as above; the box now lives in the map.
        Ok(unsafe { &*stable })
    }

    pub fn get(&self, name: &str) -> BridgeResult<Option<&PackedFunc>> {
        let functions = self.functions.lock()?;
        Ok(functions.get(name).map(|func| {
            let stable: *const PackedFunc = &**func;
            // SAFETY: boxed entries are never removed or replaced.
            unsafe { &*stable }
        }))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions
            .lock()
            .map(|functions| functions.contains_key(name))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.functions.lock().map(|functions| functions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static REGISTRY: Lazy<FunctionRegistry> = Lazy::new(FunctionRegistry::new);

/// Registry used by `GetMXNetFunc`
pub fn global() -> &'static FunctionRegistry {
    &REGISTRY
}

/// Identity of one kernel specialisation: `name:t1,t2,...`
pub fn function_idcode(name: &str, arg_types: &[&str]) -> String {
    format!("{}:{}", name, arg_types.join(","))
}

/// Short registry name for an idcode: `name_` plus the first eight hex
/// digits of the MD5 of everything after the first `:`
///
/// Matches the names the kernel loader registers, so a specialisation built
/// there can be looked up here.
pub fn idcode_hash(idcode: &str) -> String {
    let (name, types) = idcode.split_once(':').unwrap_or((idcode, ""));
    let digest = Md5::digest(types.as_bytes());
    let suffix: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}_{}", name, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn constant(value: i64) -> PackedFunc {
        PackedFunc::new(move |_args, ret| {
            ret.value = crate::abi::PackedValue::from_i64(value);
            Ok(())
        })
    }

    #[test]
    fn test_repeated_lookup_returns_same_function() {
        let registry = FunctionRegistry::new();
        let first = registry.get_or_create("conv_fwd", || Ok(constant(1))).unwrap() as *const _;
        let second = registry.get_or_create("conv_fwd", || Ok(constant(2))).unwrap() as *const _;
        assert_eq!(first, second);

        let func = registry.get("conv_fwd").unwrap().unwrap();
        let ret = func.invoke(&[], &[]).unwrap();
        assert_eq!(unsafe { ret.value.v_int64 }, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_create_inserts_nothing() {
        let registry = FunctionRegistry::new();
        let result = registry.get_or_create("broken", || {
            Err(crate::error::BridgeError::Internal("no body".to_string()))
        });
        assert!(result.is_err());
        assert!(!registry.contains("broken"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_entries_survive_growth() {
        let registry = FunctionRegistry::new();
        let first = registry.get_or_create("op_0", || Ok(constant(0))).unwrap() as *const _;
        for i in 1..256 {
            registry
                .get_or_create(&format!("op_{}", i), || Ok(constant(i)))
                .unwrap();
        }
        let again = registry.get("op_0").unwrap().unwrap() as *const _;
        assert_eq!(first, again);
    }

    #[test]
    fn test_concurrent_first_lookup_builds_once() {
        let registry = Arc::new(FunctionRegistry::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let builds = Arc::clone(&builds);
                std::thread::spawn(move || {
                    let func = registry
                        .get_or_create("shared", || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            Ok(constant(9))
                        })
                        .unwrap();
                    func as *const PackedFunc as usize
                })
            })
            .collect();

        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_idcode() {
        let idcode = function_idcode("im2col", &["float32", "int64"]);
        assert_eq!(idcode, "im2col:float32,int64");

        let hashed = idcode_hash(&idcode);
        assert!(hashed.starts_with("im2col_"));
        assert_eq!(hashed.len(), "im2col_".len() + 8);
        assert_eq!(hashed, idcode_hash(&idcode));
        assert_ne!(hashed, idcode_hash("im2col:float16,int64"));
    }

    #[test]
    fn test_idcode_hash_matches_loader_names() {
        assert_eq!(idcode_hash("im2col:float*,int"), "im2col_4d6bded3");
        // only the part after the first ':' is hashed
        let types = "float*,int";
        let hex: String = Md5::digest(types.as_bytes())
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        assert_eq!(idcode_hash("other:float*,int"), format!("other_{}", &hex[..8]));
    }
}
