//! 进程管理机制的实现
//!
//! 这里是进程调度的入口，它被其他模块(比如syscall或clock interrupt)所需要。
//! 挂起或退出当前进程时，你可以修改进程状态、通过TASK_MANAGER管理进程队列以及
//! 通过PROCESSOR切换控制流。
//!
//! 看到[`__switch`]时要小心。围绕此函数的控制流可能不是你所期望的。

mod context;
mod manager;
mod pid;
mod processor;
mod switch;
#[allow(clippy::module_inception)]
mod task;

use crate::arch::shutdown;
use crate::config::INITPROC_NAME;
use crate::loader::get_app_data_by_name;
use alloc::sync::Arc;
use lazy_static::*;
use processor::set_exited_stack;
#[cfg(test)]
pub(crate) use processor::release_exited_stack;
use switch::__switch;
pub use task::{TaskControlBlock, TaskControlBlockInner, TaskStatus, WaitError};

pub use context::TaskContext;
pub use manager::{add_task, fetch_task, set_sched_policy, SchedPolicy, TaskManager, TASK_MANAGER};
pub use pid::{kernel_stack_position, pid_alloc, KernelStack, PidHandle, RecycleAllocator};
pub use processor::{
    current_task, current_trap_cx, current_user_token, dispatch_next, run_tasks, schedule,
    take_current_task, Processor, PROCESSOR,
};

/// 暂停当前的任务并切换到下一个任务
pub fn suspend_current_and_run_next() {
    // 必须已有应用程序在运行
    let task = take_current_task().expect("no task is running");

    // ---- 独占访问当前任务控制块
    let mut task_inner = task.inner_exclusive_access();
    let task_cx_ptr = &mut task_inner.task_cx as *mut TaskContext;
    // 将状态改变为Ready
    task_inner.task_status = TaskStatus::Ready;
    drop(task_inner);
    // ---- 释放当前任务控制块访问

    // 将任务压入准备队列中
    add_task(task);
    // 跳转到调度周期
    schedule(task_cx_ptr);
}

/// 退出当前任务，回收进程资源并切换到下一个任务。
///
/// 初始进程退出时关机，退出码非0表示失败。
pub fn exit_current_and_run_next(exit_code: i32) {
    // 从处理器中取出
    let task = take_current_task().expect("no task is running");
    if Arc::ptr_eq(&task, &INITPROC) {
        info!(
            "[kernel] initproc exited with exit_code {}, shutting down...",
            exit_code
        );
        shutdown(exit_code != 0);
    }
    // 子进程移交给initproc，内核栈要等离开它之后再释放
    let kernel_stack = task.exit(exit_code, &INITPROC);
    // 手动释放任务来保证rc正确
    drop(task);
    set_exited_stack(kernel_stack);
    // 我们无需去保存任务上下文
    let mut _unused = TaskContext::zero_init();
    schedule(&mut _unused as *mut _);
}

lazy_static! {
    /// 初始进程，所有孤儿进程的父进程
    pub static ref INITPROC: Arc<TaskControlBlock> = Arc::new(
        get_app_data_by_name(INITPROC_NAME)
            .ok_or("initproc is not registered")
            .and_then(|elf| TaskControlBlock::new(elf).map_err(|_| "cannot load initproc"))
            .unwrap_or_else(|err| panic!("[kernel] {}", err))
    );
}

/// 把初始进程加入准备队列
pub fn add_initproc() {
    add_task(INITPROC.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{VirtAddr, KERNEL_SPACE};
    use crate::test_support;
    use alloc::vec::Vec;

    fn spawn_children(n: usize) -> Vec<Arc<TaskControlBlock>> {
        let elf = test_support::sample_elf();
        (0..n).map(|_| INITPROC.spawn(&elf).unwrap()).collect()
    }

    fn current_pid() -> Option<usize> {
        current_task().map(|task| task.getpid())
    }

    #[test]
    fn yield_rotates_through_the_ready_queue() {
        let _guard = test_support::boot();
        let tasks = spawn_children(3);
        let pids: Vec<usize> = tasks.iter().map(|t| t.getpid()).collect();
        for task in tasks.iter() {
            add_task(task.clone());
        }
        let mut order = Vec::new();
        for _ in 0..6 {
            assert!(dispatch_next());
            let pid = current_pid().unwrap();
            let task = current_task().unwrap();
            assert_eq!(task.inner_exclusive_access().task_status, TaskStatus::Running);
            drop(task);
            order.push(pid);
            suspend_current_and_run_next();
            assert!(current_pid().is_none());
        }
        assert_eq!(order, [pids[0], pids[1], pids[2], pids[0], pids[1], pids[2]]);
        assert!(tasks
            .iter()
            .all(|t| t.inner_exclusive_access().task_status == TaskStatus::Ready));
    }

    #[test]
    fn stride_scheduling_is_opt_in_and_follows_priorities() {
        let _guard = test_support::boot();
        let tasks = spawn_children(2);
        tasks[0].set_priority(2);
        tasks[1].set_priority(4);
        for task in tasks.iter() {
            add_task(task.clone());
        }
        set_sched_policy(SchedPolicy::Stride);
        let mut picks = [0usize; 2];
        let mut first_run = None;
        for _ in 0..30 {
            assert!(dispatch_next());
            let pid = current_pid().unwrap();
            picks[(pid == tasks[1].getpid()) as usize] += 1;
            if first_run.is_none() {
                first_run = tasks[0].inner_exclusive_access().first_run_time;
            }
            suspend_current_and_run_next();
        }
        set_sched_policy(SchedPolicy::Fifo);
        assert_eq!(picks, [10, 20]);
        // 第一次被调度的时间之后不再改变
        assert!(first_run.is_some());
        assert_eq!(tasks[0].inner_exclusive_access().first_run_time, first_run);
    }

    #[test]
    fn idle_loop_reports_an_empty_queue() {
        let _guard = test_support::boot();
        assert!(!dispatch_next());
        assert!(current_task().is_none());
    }

    #[test]
    fn exited_task_is_not_rescheduled_and_its_stack_is_released_later() {
        let _guard = test_support::boot();
        let tasks = spawn_children(2);
        let (a, b) = (tasks[0].clone(), tasks[1].clone());
        drop(tasks);
        let stack_bottom = VirtAddr::from(kernel_stack_position(a.getpid()).0).floor();
        add_task(a.clone());
        add_task(b.clone());
        assert!(dispatch_next());
        assert_eq!(current_pid(), Some(a.getpid()));
        exit_current_and_run_next(7);
        assert!(a.inner_exclusive_access().is_zombie());
        // 退出的任务仍在它的内核栈上，栈在下一次调度时才释放
        assert!(KERNEL_SPACE.exclusive_access().translate(stack_bottom).is_some());
        assert!(dispatch_next());
        assert!(KERNEL_SPACE.exclusive_access().translate(stack_bottom).is_none());
        assert_eq!(current_pid(), Some(b.getpid()));
        suspend_current_and_run_next();
        assert!(dispatch_next());
        assert_eq!(current_pid(), Some(b.getpid()));

        let pid = a.getpid();
        drop(a);
        assert_eq!(INITPROC.wait_child(Some(pid)), Ok((pid, 7)));
        assert_eq!(INITPROC.wait_child(Some(pid)), Err(WaitError::NoSuchChild));
    }

    #[test]
    fn orphans_are_adopted_by_initproc() {
        let _guard = test_support::boot();
        let parent = spawn_children(1).pop().unwrap();
        let orphan = parent.fork().unwrap();
        add_task(parent.clone());
        assert!(dispatch_next());
        exit_current_and_run_next(1);
        let adopted = orphan
            .inner_exclusive_access()
            .parent
            .as_ref()
            .and_then(|p| p.upgrade())
            .unwrap();
        assert!(Arc::ptr_eq(&adopted, &INITPROC));
        drop(adopted);
        assert!(INITPROC
            .inner_exclusive_access()
            .children
            .iter()
            .any(|c| Arc::ptr_eq(c, &orphan)));
    }

    #[test]
    #[should_panic(expected = "shutdown requested (failure = true)")]
    fn initproc_exit_shuts_the_machine_down() {
        let _guard = test_support::boot();
        add_initproc();
        assert!(dispatch_next());
        assert_eq!(current_pid(), Some(INITPROC.getpid()));
        exit_current_and_run_next(1);
    }
}
