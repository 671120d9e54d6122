//! 进程管理系统调用

use super::SyscallError;
use crate::config::MAX_SYSCALL_NUM;
use crate::loader::get_app_data_by_name;
use crate::mm::{copy_to_user, translated_byte_buffer, translated_str, MapPermission, MemoryError, UserBuffer};
use crate::task::{
    add_task, current_task, current_user_token, exit_current_and_run_next,
    suspend_current_and_run_next, TaskStatus, WaitError,
};
use crate::timer::{get_time_ms, get_time_us};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TimeVal {
    pub sec: usize,
    pub usec: usize,
}

/// 任务信息
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TaskInfo {
    /// 任务状态，查询者自己总是处于运行状态
    pub status: TaskStatus,
    /// 各个系统调用被调用的次数
    pub syscall_times: [u32; MAX_SYSCALL_NUM],
    /// 从第一次被调度到现在经过的时间，单位为毫秒
    pub time: usize,
}

/// 内存耗尽时终止调用者，其他内存错误作为失败返回
fn fail_unless_exhausted(err: MemoryError) -> Result<isize, SyscallError> {
    match err {
        MemoryError::OutOfMemory => Err(SyscallError::Memory(err)),
        _ => Ok(-1),
    }
}

/// 任务退出并呈现退出代码
pub fn sys_exit(exit_code: i32) -> isize {
    info!("[kernel] Application exited with code {}", exit_code);
    exit_current_and_run_next(exit_code);
    // 只有在主机模型上才会回到这里
    0
}

/// 当前任务为其他任务放弃资源
pub fn sys_yield() -> isize {
    suspend_current_and_run_next();
    0
}

/// 获取带秒数和微秒数的时间
pub fn sys_get_time(ts: *mut TimeVal, _tz: usize) -> Result<isize, SyscallError> {
    let us = get_time_us();
    let time = TimeVal {
        sec: us / 1_000_000,
        usec: us % 1_000_000,
    };
    copy_to_user(current_user_token(), ts, &time)?;
    Ok(0)
}

pub fn sys_getpid() -> isize {
    current_task().expect("no task is running").getpid() as isize
}

/// 设置当前任务的优先级，优先级至少为2
pub fn sys_set_priority(prio: isize) -> isize {
    if prio < 2 {
        return -1;
    }
    current_task()
        .expect("no task is running")
        .set_priority(prio as usize);
    prio
}

/// 获取当前任务的状态、系统调用次数和运行时间
pub fn sys_task_info(ti: *mut TaskInfo) -> Result<isize, SyscallError> {
    let task = current_task().expect("no task is running");
    let inner = task.inner_exclusive_access();
    let now = get_time_ms();
    let mut info = TaskInfo {
        status: inner.task_status,
        syscall_times: [0; MAX_SYSCALL_NUM],
        time: now - inner.first_run_time.unwrap_or(now),
    };
    info.syscall_times.copy_from_slice(&inner.syscall_times);
    let token = inner.get_user_token();
    drop(inner);
    copy_to_user(token, ti, &info)?;
    Ok(0)
}

/// 调整堆的大小，返回原来的堆顶
pub fn sys_sbrk(size: i32) -> Result<isize, SyscallError> {
    trace!("[kernel] sys_sbrk {}", size);
    match current_task()
        .expect("no task is running")
        .change_program_brk(size)
    {
        Ok(old_brk) => Ok(old_brk as isize),
        Err(err) => fail_unless_exhausted(err),
    }
}

/// 申请内存，`port`的低三位依次是读、写、执行权限
pub fn sys_mmap(start: usize, len: usize, port: usize) -> Result<isize, SyscallError> {
    trace!("[kernel] sys_mmap [{:#x}, {:#x})", start, start.wrapping_add(len));
    if (port & !0x7 != 0) || (port & 0x7 == 0) {
        return Ok(-1);
    }
    let mut permission = MapPermission::U;
    if (port & 0x1) != 0 {
        permission |= MapPermission::R;
    }
    if (port & 0x2) != 0 {
        permission |= MapPermission::W;
    }
    if (port & 0x4) != 0 {
        permission |= MapPermission::X;
    }
    let task = current_task().expect("no task is running");
    let mut inner = task.inner_exclusive_access();
    match inner.memory_set.mmap(start, len, permission) {
        Ok(()) => Ok(0),
        Err(err) => {
            debug!("[kernel] sys_mmap failed: {}", err);
            fail_unless_exhausted(err)
        }
    }
}

/// 释放内存
pub fn sys_munmap(start: usize, len: usize) -> isize {
    trace!("[kernel] sys_munmap [{:#x}, {:#x})", start, start.wrapping_add(len));
    let task = current_task().expect("no task is running");
    let mut inner = task.inner_exclusive_access();
    match inner.memory_set.munmap(start, len) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// 系统调用Fork，它对子进程返回0，对父进程返回子进程的pid
pub fn sys_fork() -> Result<isize, SyscallError> {
    let current_task = current_task().expect("no task is running");
    match current_task.fork() {
        Ok(new_task) => {
            let new_pid = new_task.getpid();
            // 将新进程添加到调度器中
            add_task(new_task);
            Ok(new_pid as isize)
        }
        Err(err) => {
            warn!("[kernel] fork failed: {}", err);
            fail_unless_exhausted(err)
        }
    }
}

/// 用名为`path`的应用替换当前进程的地址空间
pub fn sys_exec(path: *const u8) -> Result<isize, SyscallError> {
    let token = current_user_token();
    let path = translated_str(token, path)?;
    let Some(data) = get_app_data_by_name(path.as_str()) else {
        return Ok(-1);
    };
    let task = current_task().expect("no task is running");
    match task.exec(data) {
        Ok(()) => Ok(0),
        Err(err) => {
            warn!("[kernel] exec {} failed: {}", path, err);
            fail_unless_exhausted(err)
        }
    }
}

/// 如果不存在与输入pid相同的子进程，则返回-1。
/// 如果存在pid相同但仍在运行的子进程，则返回-2。
///
/// 退出码的写入位置在回收子进程之前检查，非法的指针不会让退出码丢失。
pub fn sys_waitpid(pid: isize, exit_code_ptr: *mut i32) -> Result<isize, SyscallError> {
    let task = current_task().expect("no task is running");
    let target = if pid == -1 { None } else { Some(pid as usize) };
    let exit_code_buffer = if exit_code_ptr.is_null() {
        None
    } else {
        let token = task.inner_exclusive_access().get_user_token();
        Some(UserBuffer::new(translated_byte_buffer(
            token,
            exit_code_ptr as *const u8,
            core::mem::size_of::<i32>(),
        )?))
    };
    match task.wait_child(target) {
        Ok((found_pid, exit_code)) => {
            if let Some(mut buffer) = exit_code_buffer {
                buffer.write(&exit_code.to_ne_bytes());
            }
            Ok(found_pid as isize)
        }
        Err(WaitError::NoSuchChild) => Ok(-1),
        Err(WaitError::WouldBlock) => Ok(-2),
    }
}

/// 创建一个执行名为`path`的应用的子进程
pub fn sys_spawn(path: *const u8) -> Result<isize, SyscallError> {
    let token = current_user_token();
    let path = translated_str(token, path)?;
    let Some(data) = get_app_data_by_name(path.as_str()) else {
        return Ok(-1);
    };
    let current_task = current_task().expect("no task is running");
    match current_task.spawn(data) {
        Ok(new_task) => {
            let new_pid = new_task.getpid();
            add_task(new_task);
            Ok(new_pid as isize)
        }
        Err(err) => {
            warn!("[kernel] spawn {} failed: {}", path, err);
            fail_unless_exhausted(err)
        }
    }
}
