//! C entry point tests
//!
//! These drive the exported symbols end to end through the mock host in
//! `common`. The host slot, registry and counters are process-wide, so
//! every test is serial and uses its own operator names.

mod common;

use std::ffi::{c_void, CString};
use std::os::raw::c_int;
use std::sync::Mutex;

use common::{register_capi_host, PackedCall, CAPI_HOST};
use once_cell::sync::Lazy;
use serial_test::serial;
use mxtvm_bridge::abi::{type_code, PackedFunc, PackedValue};
use mxtvm_bridge::capi::{GetMXNetFunc, MXBridgeFuncCall, MXBridgeGetStream};
use mxtvm_bridge::{config, host, stats, BridgeConfig, Context, RunContext};

#[derive(Debug, Clone, PartialEq)]
struct UserCall {
    marker: i32,
    type_codes: Vec<c_int>,
    stream: usize,
}

static CALLS: Lazy<Mutex<Vec<UserCall>>> = Lazy::new(|| Mutex::new(Vec::new()));

unsafe fn record(marker: i32, type_codes: *mut c_int, num_args: c_int) {
    let codes = if num_args > 0 {
        std::slice::from_raw_parts(type_codes, num_args as usize).to_vec()
    } else {
        Vec::new()
    };
    let mut dev_id: c_int = -1;
    let mut stream: *mut c_void = std::ptr::null_mut();
    MXBridgeGetStream(&mut dev_id, &mut stream);
    CALLS.lock().unwrap().push(UserCall {
        marker,
        type_codes: codes,
        stream: stream as usize,
    });
}

unsafe extern "C" fn user_f1(
    _args: *mut PackedValue,
    type_codes: *mut c_int,
    num_args: c_int,
    _ret: *mut c_void,
    _resource: *mut c_void,
) -> c_int {
    record(1, type_codes, num_args);
    0
}

unsafe extern "C" fn user_f2(
    _args: *mut PackedValue,
    type_codes: *mut c_int,
    num_args: c_int,
    _ret: *mut c_void,
    _resource: *mut c_void,
) -> c_int {
    record(2, type_codes, num_args);
    0
}

fn take_calls() -> Vec<UserCall> {
    std::mem::take(&mut *CALLS.lock().unwrap())
}

fn get_func(name: &str, func: mxtvm_bridge::abi::PackedCFunc, const_loc: &[c_int]) -> *const PackedFunc {
    let cname = CString::new(name).unwrap();
    unsafe {
        GetMXNetFunc(
            cname.as_ptr(),
            Some(func),
            const_loc.len() as c_int,
            const_loc.as_ptr(),
        )
    }
}

fn call(func: *const PackedFunc, call: &mut PackedCall) -> c_int {
    unsafe {
        MXBridgeFuncCall(
            func,
            call.values.as_mut_ptr(),
            call.type_codes.as_mut_ptr(),
            call.values.len() as c_int,
        )
    }
}

#[test]
#[serial]
fn test_register_installs_host() {
    register_capi_host();
    assert!(host::is_registered());
}

#[test]
#[serial]
fn test_repeated_lookup_returns_first_wrapping() {
    register_capi_host();
    take_calls();

    let first = get_func("conv_fwd", user_f1, &[0]);
    let second = get_func("conv_fwd", user_f2, &[]);
    assert!(!first.is_null());
    assert_eq!(first, second);

    let h0 = CAPI_HOST.tensor(Context::cpu(0));
    let h1 = CAPI_HOST.tensor(Context::cpu(0));
    let pushes_before = CAPI_HOST.pushes().len();
    let mut args = PackedCall::new().tensor(h0).tensor(h1);
    assert_eq!(call(second, &mut args), 0);

    let pushes = CAPI_HOST.pushes();
    assert_eq!(pushes.len(), pushes_before + 1);
    let push = pushes.last().unwrap();
    assert_eq!(push.reads, vec![h0]);
    assert_eq!(push.writes, vec![h1]);
    assert_eq!(push.name, None);

    assert_eq!(CAPI_HOST.run_all(&RunContext::cpu(0)), 1);
    let calls = take_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].marker, 1, "second registration must be ignored");
    assert_eq!(calls[0].type_codes, vec![type_code::ARRAY_HANDLE; 2]);
    assert_eq!(calls[0].stream, 0);
}

#[test]
#[serial]
fn test_gpu_task_sees_engine_stream() {
    register_capi_host();
    take_calls();

    let func = get_func("gpu_kernel", user_f2, &[]);
    let h0 = CAPI_HOST.tensor(Context::gpu(0));
    let mut args = PackedCall::new().tensor(h0).int(3);
    assert_eq!(call(func, &mut args), 0);

    let mut stream = 0x9900usize as *mut c_void;
    assert_eq!(CAPI_HOST.run_all_on_thread(RunContext::gpu(0, &mut stream)), 1);

    let calls = take_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].marker, 2);
    assert_eq!(calls[0].type_codes, vec![type_code::ARRAY_HANDLE, type_code::INT]);
    assert_eq!(calls[0].stream, 0x9900);
}

#[test]
#[serial]
fn test_global_config_tags_engine_ops() {
    register_capi_host();
    config::set_global(
        BridgeConfig::new()
            .with_tag_engine_ops(true)
            .with_engine_priority(2),
    )
    .unwrap();

    let func = get_func("tagged_op", user_f1, &[]);
    config::set_global(BridgeConfig::default()).unwrap();

    let h0 = CAPI_HOST.tensor(Context::cpu(0));
    let mut args = PackedCall::new().tensor(h0);
    assert_eq!(call(func, &mut args), 0);

    let pushes = CAPI_HOST.pushes();
    let push = pushes.last().unwrap();
    assert_eq!(push.name.as_deref(), Some("tagged_op"));
    assert_eq!(push.priority, 2);

    CAPI_HOST.run_all(&RunContext::cpu(0));
    take_calls();
}

#[test]
#[serial]
fn test_counters_balance_after_round_trip() {
    register_capi_host();
    take_calls();
    let before = stats::global().snapshot();

    let func = get_func("counted_op", user_f1, &[0]);
    let h0 = CAPI_HOST.tensor(Context::cpu(0));
    let h1 = CAPI_HOST.tensor(Context::cpu(0));
    let mut args = PackedCall::new().tensor(h0).tensor(h1).float(1.5);
    assert_eq!(call(func, &mut args), 0);

    let queued = stats::global().snapshot();
    assert_eq!(queued.tasks_pushed, before.tasks_pushed + 1);
    assert_eq!(queued.live_shallow_copies(), before.live_shallow_copies() + 2);

    CAPI_HOST.run_all(&RunContext::cpu(0));
    let after = stats::global().snapshot();
    assert_eq!(after.calls_wrapped, before.calls_wrapped + 1);
    assert_eq!(after.tasks_run, before.tasks_run + 1);
    assert_eq!(after.params_released, before.params_released + 1);
    assert_eq!(after.shallow_frees, before.shallow_frees + 2);
    assert_eq!(after.managed_created, before.managed_created + 2);
    assert_eq!(after.managed_released, before.managed_released + 2);
    assert_eq!(after.live_shallow_copies(), before.live_shallow_copies());
    assert!(after.to_json().unwrap().contains("\"tasks_run\""));
    let text = stats::global().export().unwrap();
    assert!(text.contains(&format!("mxbridge_tasks_run_total {}", after.tasks_run)));
    take_calls();
}
