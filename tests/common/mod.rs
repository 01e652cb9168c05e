//! A mock host runtime for driving the core in tests: in-memory metadata
//! tables, trace-id slots, and an upcall log.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crs_core::error::UpstreamError;
use crs_core::{ClassRef, LoaderRef, MethodRef, RuntimeEnv, UpcallArg};

#[derive(Clone)]
struct ClassInfo {
    name: Vec<u8>,
    source: Option<Vec<u8>>,
    loader: LoaderRef,
}

#[derive(Clone)]
struct MethodInfo {
    name: Vec<u8>,
    signature: Vec<u8>,
    holder: ClassRef,
}

#[derive(Default)]
pub struct MockRuntime {
    classes: Mutex<HashMap<u64, ClassInfo>>,
    methods: Mutex<HashMap<u64, MethodInfo>>,
    class_ids: Mutex<HashMap<u64, u32>>,
    loader_ids: Mutex<HashMap<u64, u32>>,
    /// Every upstream invocation, in delivery order.
    pub upcalls: Mutex<Vec<(String, Vec<UpcallArg>)>>,
    pub fail_agent: AtomicBool,
    pub fail_upcalls: AtomicBool,
    pub safepoints: Mutex<u32>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn define_class(
        &self,
        token: u64,
        name: &str,
        source: Option<&str>,
        loader: LoaderRef,
    ) -> ClassRef {
        self.classes.lock().insert(
            token,
            ClassInfo {
                name: name.as_bytes().to_vec(),
                source: source.map(|s| s.as_bytes().to_vec()),
                loader,
            },
        );
        ClassRef(token)
    }

    pub fn define_method(
        &self,
        token: u64,
        holder: ClassRef,
        name: &str,
        signature: &str,
    ) -> MethodRef {
        self.methods.lock().insert(
            token,
            MethodInfo {
                name: name.as_bytes().to_vec(),
                signature: signature.as_bytes().to_vec(),
                holder,
            },
        );
        MethodRef(token)
    }

    pub fn upcall_methods(&self) -> Vec<String> {
        self.upcalls.lock().iter().map(|(m, _)| m.clone()).collect()
    }
}

impl RuntimeEnv for MockRuntime {
    fn class_name(&self, class: ClassRef) -> Option<Vec<u8>> {
        self.classes.lock().get(&class.0).map(|c| c.name.clone())
    }

    fn class_source(&self, class: ClassRef) -> Option<Vec<u8>> {
        self.classes.lock().get(&class.0).and_then(|c| c.source.clone())
    }

    fn class_loader(&self, class: ClassRef) -> LoaderRef {
        self.classes
            .lock()
            .get(&class.0)
            .map(|c| c.loader)
            .unwrap_or(LoaderRef(0))
    }

    fn method_name(&self, method: MethodRef) -> Option<Vec<u8>> {
        self.methods.lock().get(&method.0).map(|m| m.name.clone())
    }

    fn method_signature(&self, method: MethodRef) -> Option<Vec<u8>> {
        self.methods.lock().get(&method.0).map(|m| m.signature.clone())
    }

    fn method_holder(&self, method: MethodRef) -> ClassRef {
        self.methods
            .lock()
            .get(&method.0)
            .map(|m| m.holder)
            .unwrap_or(ClassRef(0))
    }

    fn class_trace_id(&self, class: ClassRef) -> u32 {
        self.class_ids.lock().get(&class.0).copied().unwrap_or(0)
    }

    fn set_class_trace_id(&self, class: ClassRef, id: u32) {
        self.class_ids.lock().insert(class.0, id);
    }

    fn loader_trace_id(&self, loader: LoaderRef) -> u32 {
        self.loader_ids.lock().get(&loader.0).copied().unwrap_or(0)
    }

    fn set_loader_trace_id(&self, loader: LoaderRef, id: u32) {
        self.loader_ids.lock().insert(loader.0, id);
    }

    fn start_agent(&self) -> Result<(), UpstreamError> {
        if self.fail_agent.load(Ordering::Relaxed) {
            Err(UpstreamError::new("startAgent", "ClassNotFoundException"))
        } else {
            Ok(())
        }
    }

    fn invoke_upstream(
        &self,
        method: &str,
        _signature: &str,
        args: &[UpcallArg],
    ) -> Result<(), UpstreamError> {
        if self.fail_upcalls.load(Ordering::Relaxed) {
            return Err(UpstreamError::new(method, "agent threw"));
        }
        self.upcalls.lock().push((method.to_string(), args.to_vec()));
        Ok(())
    }

    fn run_at_safepoint(&self, op: &mut dyn FnMut()) {
        *self.safepoints.lock() += 1;
        op();
    }
}
