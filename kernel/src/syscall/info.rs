//! Hello/diagnostic syscalls.

use alloc::sync::Arc;

use log::info;

use super::{copyout, SyscallResult};
use crate::error::KernelError;
use crate::process::{self, Process};

pub fn sys_hello_number(n: i32) -> SyscallResult {
    info!("Hello, xv6! Your number is {}", n);
    Ok(n as isize * 2)
}

/// Fill the caller's `procinfo` buffer for `pid` (≤ 0 means the caller).
pub fn sys_get_procinfo(proc: &Arc<Process>, pid: i32, out: u32) -> SyscallResult {
    let target = if pid <= 0 {
        proc.clone()
    } else {
        process::find(pid).ok_or(KernelError::ProcessNotFound { pid })?
    };
    let info = target.info();
    let mut bytes = [0u8; 32];
    bytes[0..4].copy_from_slice(&info.pid.to_le_bytes());
    bytes[4..8].copy_from_slice(&info.ppid.to_le_bytes());
    bytes[8..12].copy_from_slice(&info.state.to_le_bytes());
    bytes[12..16].copy_from_slice(&info.sz.to_le_bytes());
    bytes[16..32].copy_from_slice(&info.name);
    copyout(proc, out, &bytes)?;
    Ok(0)
}
