//! Host functions imported by tenant scripts from the `nimbus` module.
//!
//! All pointers and lengths are `i32` offsets into the guest's exported
//! `memory`. Functions that hand data to the guest copy at most `cap`
//! bytes to `out` and return the full length, or `-1` when the value is
//! absent. Out-of-bounds pointers and storage failures trap.

use wasmtime::{Caller, Extern, Linker, Memory};

use crate::host::HostState;

/// Import module name.
pub const MODULE: &str = "nimbus";

/// Returned to the guest for absent values.
const ABSENT: i32 = -1;

/// Longest log line forwarded from a script.
const MAX_LOG_LINE: usize = 1024;

fn guest_memory(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("guest does not export `memory`"))
}

fn offset(value: i32) -> wasmtime::Result<usize> {
    usize::try_from(value).map_err(|_| wasmtime::Error::msg("negative guest pointer or length"))
}

/// Copy `len` bytes at `ptr` out of guest memory.
fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let start = offset(ptr)?;
    let end = start
        .checked_add(offset(len)?)
        .ok_or_else(|| wasmtime::Error::msg("guest range overflows"))?;
    memory
        .data(&*caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| wasmtime::Error::msg("guest range out of bounds"))
}

fn read_guest_str(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<String> {
    String::from_utf8(read_guest(caller, ptr, len)?)
        .map_err(|_| wasmtime::Error::msg("guest string is not utf-8"))
}

/// Copy up to `cap` bytes of `bytes` into guest memory at `out`.
fn write_guest(
    caller: &mut Caller<'_, HostState>,
    out: i32,
    cap: i32,
    bytes: &[u8],
) -> wasmtime::Result<i32> {
    let memory = guest_memory(caller)?;
    let n = bytes.len().min(offset(cap)?);
    memory
        .write(&mut *caller, offset(out)?, &bytes[..n])
        .map_err(|_| wasmtime::Error::msg("guest range out of bounds"))?;
    i32::try_from(bytes.len()).map_err(|_| wasmtime::Error::msg("value too large for guest"))
}

fn write_optional(
    caller: &mut Caller<'_, HostState>,
    out: i32,
    cap: i32,
    bytes: Option<&[u8]>,
) -> wasmtime::Result<i32> {
    match bytes {
        Some(bytes) => write_guest(caller, out, cap, bytes),
        None => Ok(ABSENT),
    }
}

/// Register every `nimbus.*` import on the linker.
pub fn add_to_linker(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    // ── Request view ───────────────────────────────────────────────

    linker.func_wrap(
        MODULE,
        "request_method",
        |mut caller: Caller<'_, HostState>, out: i32, cap: i32| -> wasmtime::Result<i32> {
            let value = caller.data().request.method.clone();
            write_guest(&mut caller, out, cap, value.as_bytes())
        },
    )?;

    linker.func_wrap(
        MODULE,
        "request_path",
        |mut caller: Caller<'_, HostState>, out: i32, cap: i32| -> wasmtime::Result<i32> {
            let value = caller.data().request.path.clone();
            write_guest(&mut caller, out, cap, value.as_bytes())
        },
    )?;

    linker.func_wrap(
        MODULE,
        "request_query",
        |mut caller: Caller<'_, HostState>, out: i32, cap: i32| -> wasmtime::Result<i32> {
            let value = caller.data().request.query.clone();
            write_guest(&mut caller, out, cap, value.as_bytes())
        },
    )?;

    linker.func_wrap(
        MODULE,
        "request_header",
        |mut caller: Caller<'_, HostState>, name: i32, name_len: i32, out: i32, cap: i32| -> wasmtime::Result<i32> {
            let name = read_guest_str(&mut caller, name, name_len)?;
            let value = caller.data().request.header(&name);
            write_optional(&mut caller, out, cap, value.as_deref().map(str::as_bytes))
        },
    )?;

    linker.func_wrap(
        MODULE,
        "request_body",
        |mut caller: Caller<'_, HostState>, out: i32, cap: i32| -> wasmtime::Result<i32> {
            let body = caller.data().request.body.clone();
            write_guest(&mut caller, out, cap, &body)
        },
    )?;

    // ── Response builder ───────────────────────────────────────────

    linker.func_wrap(
        MODULE,
        "response_status",
        |mut caller: Caller<'_, HostState>, code: i32| {
            if let Ok(code) = u16::try_from(code) {
                caller.data_mut().response.set_status(code);
            }
        },
    )?;

    linker.func_wrap(
        MODULE,
        "response_header",
        |mut caller: Caller<'_, HostState>, name: i32, name_len: i32, value: i32, value_len: i32| -> wasmtime::Result<()> {
            let name = read_guest_str(&mut caller, name, name_len)?;
            let value = read_guest_str(&mut caller, value, value_len)?;
            caller.data_mut().response.add_header(name, value);
            Ok(())
        },
    )?;

    linker.func_wrap(
        MODULE,
        "response_write",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            caller
                .data_mut()
                .response
                .write(&bytes)
                .map_err(|_| wasmtime::Error::msg("response body too large"))
        },
    )?;

    linker.func_wrap(
        MODULE,
        "response_send",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            caller
                .data_mut()
                .response
                .send(&bytes)
                .map_err(|_| wasmtime::Error::msg("response body too large"))
        },
    )?;

    // ── Scoped key-value ───────────────────────────────────────────

    linker.func_wrap(
        MODULE,
        "kv_get",
        |mut caller: Caller<'_, HostState>, key: i32, key_len: i32, out: i32, cap: i32| -> wasmtime::Result<i32> {
            let key = read_guest(&mut caller, key, key_len)?;
            let value = caller
                .data()
                .kv
                .get(&key)
                .map_err(|e| wasmtime::Error::msg(format!("kv get failed: {e}")))?;
            write_optional(&mut caller, out, cap, value.as_deref())
        },
    )?;

    linker.func_wrap(
        MODULE,
        "kv_set",
        |mut caller: Caller<'_, HostState>, key: i32, key_len: i32, value: i32, value_len: i32| -> wasmtime::Result<i32> {
            let key = read_guest(&mut caller, key, key_len)?;
            let value = read_guest(&mut caller, value, value_len)?;
            caller
                .data()
                .kv
                .set(&key, &value)
                .map_err(|e| wasmtime::Error::msg(format!("kv set failed: {e}")))?;
            Ok(0i32)
        },
    )?;

    linker.func_wrap(
        MODULE,
        "kv_increment",
        |mut caller: Caller<'_, HostState>, key: i32, key_len: i32, delta: i64| -> wasmtime::Result<i64> {
            let key = read_guest(&mut caller, key, key_len)?;
            caller
                .data()
                .kv
                .increment(&key, delta)
                .map_err(|e| wasmtime::Error::msg(format!("kv increment failed: {e}")))
        },
    )?;

    // ── Scoped secrets ─────────────────────────────────────────────

    linker.func_wrap(
        MODULE,
        "env_get",
        |mut caller: Caller<'_, HostState>, name: i32, name_len: i32, out: i32, cap: i32| -> wasmtime::Result<i32> {
            let name = read_guest_str(&mut caller, name, name_len)?;
            // The error text comes from the store and never carries values.
            let value = caller
                .data()
                .env
                .get(&name)
                .map_err(|e| wasmtime::Error::msg(format!("secret lookup failed: {e}")))?;
            write_optional(
                &mut caller,
                out,
                cap,
                value.as_ref().map(|v| v.expose().as_bytes()),
            )
        },
    )?;

    // ── Diagnostics ────────────────────────────────────────────────

    linker.func_wrap(
        MODULE,
        "log",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let len = len.min(MAX_LOG_LINE as i32);
            let bytes = read_guest(&mut caller, ptr, len)?;
            let line = String::from_utf8_lossy(&bytes);
            tracing::debug!(target: "nimbus::script", site = %caller.data().site, "{line}");
            Ok(())
        },
    )?;

    Ok(())
}
