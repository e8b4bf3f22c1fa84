//! Async wrapper
//!
//! [`AsyncWrapper`] closes over a user packed function and its const
//! argument positions. Each dispatch marshals the call into an
//! [`InvocationFunctor`], derives the dependency sets and pushes a task on
//! the host engine. The engine then owns the parameter block: it calls
//! [`sync_func_trampoline`] to run it and [`deleter_trampoline`] to drop
//! it, on threads of its choosing.

use std::ffi::{c_void, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use crate::abi::{Context, PackedArgs, PackedFunc, RunContext};
use crate::bridge::functor::InvocationFunctor;
use crate::bridge::stream::set_stream_func;
use crate::config::{BridgeConfig, ConstLocPolicy};
use crate::error::{self, BridgeError, BridgeResult};
use crate::host::{EngineTask, HostBinding};
use crate::{internal_error, stats};

/// Parameter block handed to the engine
struct SyncFuncParams {
    ctx: Context,
    functor: InvocationFunctor,
}

/// Packed function that schedules its body on the host engine
#[derive(Debug, Clone)]
pub struct AsyncWrapper {
    host: HostBinding,
    func: PackedFunc,
    set_stream: PackedFunc,
    const_loc: Arc<[usize]>,
    config: BridgeConfig,
    name: Option<CString>,
}

impl AsyncWrapper {
    /// Wrap `func`, treating the tensors at `const_loc` as read-only
    ///
    /// Positions are sorted here. Under [`ConstLocPolicy::Strict`] negative
    /// or repeated positions are rejected; under `Lenient` they are dropped.
    pub fn new(
        host: HostBinding,
        func: PackedFunc,
        const_loc: &[i32],
        config: &BridgeConfig,
    ) -> BridgeResult<Self> {
        let const_loc = normalize_const_loc(const_loc, config.const_loc_policy)?;
        Ok(AsyncWrapper {
            host,
            func,
            set_stream: set_stream_func(),
            const_loc: const_loc.into(),
            config: config.clone(),
            name: None,
        })
    }

    /// Replace the default thread-local stream-setter
    pub fn with_stream_setter(mut self, set_stream: PackedFunc) -> Self {
        self.set_stream = set_stream;
        self
    }

    /// Name forwarded to the engine when `tag_engine_ops` is set
    pub fn with_name(mut self, name: CString) -> Self {
        self.name = Some(name);
        self
    }

    pub fn const_locations(&self) -> &[usize] {
        &self.const_loc
    }

    /// Marshal `args` and enqueue the call; returns once the engine accepted it
    pub fn dispatch(&self, args: PackedArgs<'_>) -> BridgeResult<()> {
        let host = self.host.resolve()?;
        stats::global().record_call();

        let (functor, mut deps) = InvocationFunctor::init(
            Arc::clone(&host),
            self.func.clone(),
            self.set_stream.clone(),
            args,
            &self.const_loc,
            self.config.const_loc_policy,
        )?;
        deps.deduplicate();

        let ctx = functor.context();
        let param = Box::into_raw(Box::new(SyncFuncParams { ctx, functor }));
        let name = if self.config.tag_engine_ops {
            self.name.as_deref()
        } else {
            None
        };
        let task = EngineTask {
            run: sync_func_trampoline,
            param: param.cast(),
            deleter: deleter_trampoline,
            // SAFETY: `param` was just allocated and is not yet shared.
            ctx: unsafe { ptr::addr_of!((*param).ctx) },
            const_handles: &deps.reads,
            mutable_handles: &deps.writes,
            priority: self.config.engine_priority,
            name,
        };

        tracing::debug!(
            %ctx,
            reads = deps.reads.len(),
            writes = deps.writes.len(),
            priority = self.config.engine_priority,
            "pushing async task"
        );
        match host.push_sync(task) {
            Ok(()) => {
                stats::global().record_push();
                Ok(())
            }
            Err(e) => {
                // SAFETY: the engine rejected the task and never took `param`.
                drop(unsafe { Box::from_raw(param) });
                Err(e)
            }
        }
    }

    /// Expose the wrapper as a packed function
    pub fn into_packed_func(self) -> PackedFunc {
        PackedFunc::new(move |args, _ret| self.dispatch(args))
    }
}

/// Sort the const positions and apply the configured validation
fn normalize_const_loc(const_loc: &[i32], policy: ConstLocPolicy) -> BridgeResult<Vec<usize>> {
    let mut positions = Vec::with_capacity(const_loc.len());
    for &pos in const_loc {
        match usize::try_from(pos) {
            Ok(pos) => positions.push(pos),
            Err(_) if policy == ConstLocPolicy::Lenient => {
                tracing::warn!(pos, "ignoring negative const position");
            }
            Err(_) => {
                return Err(BridgeError::InvalidConstLocation(format!(
                    "position {} is negative",
                    pos
                )))
            }
        }
    }
    positions.sort_unstable();

    let before = positions.len();
    positions.dedup();
    if positions.len() != before && policy == ConstLocPolicy::Strict {
        return Err(BridgeError::InvalidConstLocation(format!(
            "repeated positions in {:?}",
            const_loc
        )));
    }
    Ok(positions)
}

/// Engine entry point running one task
///
/// # Safety
///
/// `rctx` must point at the engine's run context and `param` at a block
/// pushed by [`AsyncWrapper::dispatch`] that has not been released.
pub unsafe extern "C" fn sync_func_trampoline(rctx: *mut c_void, param: *mut c_void) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> BridgeResult<()> {
        let rctx = unsafe { rctx.cast::<RunContext>().as_ref() }
            .ok_or_else(|| internal_error!("engine passed a null run context"))?;
        let params = unsafe { param.cast::<SyncFuncParams>().as_mut() }
            .ok_or_else(|| internal_error!("engine passed a null parameter block"))?;
        tracing::trace!(ctx = %params.ctx, engine_ctx = %rctx.ctx, "running async task");
        params.functor.run(rctx)
    }));
    stats::global().record_run();
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error::fatal(&err),
        Err(payload) => error::fatal(&error::from_panic("async task", payload)),
    }
}

/// Engine entry point releasing a parameter block
///
/// # Safety
///
/// `param` must be a block pushed by [`AsyncWrapper::dispatch`], released
/// exactly once.
pub unsafe extern "C" fn deleter_trampoline(param: *mut c_void) {
    if param.is_null() {
        error::fatal(&internal_error!("engine released a null parameter block"));
    }
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        drop(unsafe { Box::from_raw(param.cast::<SyncFuncParams>()) });
    }));
    stats::global().record_param_release();
    if let Err(payload) = outcome {
        error::fatal(&error::from_panic("parameter release", payload));
    }
}
