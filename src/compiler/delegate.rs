//! Environment assembly and the delegate-signature cache.
//!
//! The signature cache interns `FnSig` values process-wide so function
//! types compare cheaply and identical signatures share one allocation.
//! Init on first use, never invalidated; serialized by a single mutex.

use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::emit::CompiledMethod;
use crate::runtime::{CompiledLambda, ConstantsRecord, Environment};
use crate::tree::{FnSig, Type};

static SIGNATURES: Lazy<Mutex<FxHashMap<FnSig, Arc<FnSig>>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

/// Intern a function signature.
pub(crate) fn signature(params: Vec<Type>, ret: Type) -> Arc<FnSig> {
    let sig = FnSig { params, ret };
    let mut cache = SIGNATURES.lock().unwrap();
    if let Some(interned) = cache.get(&sig) {
        return interned.clone();
    }
    let interned = Arc::new(sig.clone());
    cache.insert(sig, interned.clone());
    interned
}

#[cfg(test)]
pub(crate) fn cached_signature_count() -> usize {
    SIGNATURES.lock().unwrap().len()
}

/// Wrap a baked top-level method with its live constants. The top-level
/// call receives no enclosing locals; the environment is attached only
/// when the function actually reads it.
pub(crate) fn build(
    method: Arc<CompiledMethod>,
    constants: Arc<ConstantsRecord>,
) -> Arc<CompiledLambda> {
    let env = if constants.is_empty() {
        None
    } else {
        Some(Arc::new(Environment {
            constants,
            locals: None,
        }))
    };
    CompiledLambda::new(method, env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures_intern_to_one_allocation() {
        let a = signature(vec![Type::Int, Type::Bool], Type::Str);
        let b = signature(vec![Type::Int, Type::Bool], Type::Str);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_distinct_signatures_distinct() {
        let a = signature(vec![Type::Int], Type::Str);
        let b = signature(vec![Type::Int], Type::Int);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_cache_grows_monotonically() {
        let before = cached_signature_count();
        let _ = signature(vec![Type::Float, Type::Float, Type::Float], Type::Tree);
        assert!(cached_signature_count() >= before);
    }
}
