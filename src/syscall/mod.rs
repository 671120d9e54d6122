//! 系统调用的实现
//!
//! 每当用户空间想要使用`ecall`指令执行系统调用时，都会调用[`syscall()`]这个所有系统调用的唯一入口点。
//! 在这种情况下，处理器引发一个'用户模式异常的执行环境调用(Environment call from U-mode)'，
//! 该异常作为[`crate::trap::handle_trap`]中的一种情况被处理。
//!
//! 为了清楚可见，每个系统调用都用自己的函数来实现，命名为`sys_`后跟系统调用的名称。
//!
//! 用户程序传入的非法指针和内存耗尽不会导致内核panic：它们以[`SyscallError`]的形式返回，
//! 陷入处理随后终止这个用户程序。

pub const SYSCALL_READ: usize = 63;
pub const SYSCALL_WRITE: usize = 64;
pub const SYSCALL_EXIT: usize = 93;
pub const SYSCALL_YIELD: usize = 124;
pub const SYSCALL_SET_PRIORITY: usize = 140;
pub const SYSCALL_GET_TIME: usize = 169;
pub const SYSCALL_GETPID: usize = 172;
pub const SYSCALL_SBRK: usize = 214;
pub const SYSCALL_MUNMAP: usize = 215;
pub const SYSCALL_FORK: usize = 220;
pub const SYSCALL_EXEC: usize = 221;
pub const SYSCALL_MMAP: usize = 222;
pub const SYSCALL_WAITPID: usize = 260;
pub const SYSCALL_SPAWN: usize = 400;
pub const SYSCALL_TASK_INFO: usize = 410;

mod fs;
mod process;

use crate::config::{EXIT_CODE_ILLEGAL, EXIT_CODE_PAGE_FAULT};
use crate::mm::MemoryError;
use crate::task::current_task;
use core::fmt::{self, Display, Formatter};
use fs::*;
use process::*;

pub use process::{TaskInfo, TimeVal};

/// 使系统调用无法在这次陷入中完成的情况
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// 访问用户内存失败或物理内存耗尽，终止调用者
    Memory(MemoryError),
    /// 无法识别的系统调用号，终止调用者
    Unsupported(usize),
    /// 暂时无法完成，调用者让出处理器，之后重新执行这条`ecall`
    Restart,
}

impl SyscallError {
    /// 调用者被终止时的退出码
    pub fn exit_code(&self) -> i32 {
        match self {
            SyscallError::Memory(_) => EXIT_CODE_PAGE_FAULT,
            SyscallError::Unsupported(_) => EXIT_CODE_ILLEGAL,
            SyscallError::Restart => unreachable!("a restarted syscall does not end the caller"),
        }
    }
}

impl From<MemoryError> for SyscallError {
    fn from(err: MemoryError) -> Self {
        SyscallError::Memory(err)
    }
}

impl Display for SyscallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SyscallError::Memory(err) => write!(f, "{}", err),
            SyscallError::Unsupported(id) => write!(f, "unsupported syscall_id {}", id),
            SyscallError::Restart => write!(f, "syscall must be restarted"),
        }
    }
}

/// 使用`syscall_id`和其他参数处理系统调用异常
pub fn syscall(syscall_id: usize, args: [usize; 3]) -> Result<isize, SyscallError> {
    if let Some(task) = current_task() {
        task.inner_exclusive_access().record_syscall(syscall_id);
    }
    match syscall_id {
        SYSCALL_READ => sys_read(args[0], args[1] as *const u8, args[2]),
        SYSCALL_WRITE => sys_write(args[0], args[1] as *const u8, args[2]),
        SYSCALL_EXIT => Ok(sys_exit(args[0] as i32)),
        SYSCALL_YIELD => Ok(sys_yield()),
        SYSCALL_SET_PRIORITY => Ok(sys_set_priority(args[0] as isize)),
        SYSCALL_GET_TIME => sys_get_time(args[0] as *mut TimeVal, args[1]),
        SYSCALL_GETPID => Ok(sys_getpid()),
        SYSCALL_SBRK => sys_sbrk(args[0] as i32),
        SYSCALL_MUNMAP => Ok(sys_munmap(args[0], args[1])),
        SYSCALL_FORK => sys_fork(),
        SYSCALL_EXEC => sys_exec(args[0] as *const u8),
        SYSCALL_MMAP => sys_mmap(args[0], args[1], args[2]),
        SYSCALL_WAITPID => sys_waitpid(args[0] as isize, args[1] as *mut i32),
        SYSCALL_SPAWN => sys_spawn(args[0] as *const u8),
        SYSCALL_TASK_INFO => sys_task_info(args[0] as *mut TaskInfo),
        _ => Err(SyscallError::Unsupported(syscall_id)),
    }
}
