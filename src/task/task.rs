//! 任务管理相关的类型

use super::TaskContext;
use super::{kernel_stack_position, pid_alloc, KernelStack, PidHandle};
use crate::config::{BIG_STRIDE, DEFAULT_PRIORITY, MAX_SYSCALL_NUM, TRAP_CONTEXT};
use crate::mm::{kernel_token, MemoryError, MemorySet, PhysPageNum, VirtAddr};
use crate::sync::{UPIntrFreeCell, UPIntrRefMut};
use crate::trap::{trap_handler, TrapContext};
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;

/// 任务控制块结构体
///
/// 直接存储在运行时不会变化的元数据
pub struct TaskControlBlock {
    // 不变的
    /// 进程标识符
    pub pid: PidHandle,
    // 可变的
    inner: UPIntrFreeCell<TaskControlBlockInner>,
}

/// 包含更多进程元数据的结构体
///
/// 存储会在运行时变化的元数据，并通过UPIntrFreeCell包装来提供可变引用
pub struct TaskControlBlockInner {
    /// trap上下文所在的物理页帧的物理页号
    pub trap_cx_ppn: PhysPageNum,
    /// 将暂停的任务的任务上下文保存在此
    pub task_cx: TaskContext,
    /// 维护当前进程的执行状态
    pub task_status: TaskStatus,
    /// 应用地址空间
    pub memory_set: MemorySet,
    /// 当前进程的父进程。Weak智能指针不会影响父进程的引用计数
    pub parent: Option<Weak<TaskControlBlock>>,
    /// 当前进程包含所有子进程的任务控制块的向量
    pub children: Vec<Arc<TaskControlBlock>>,
    /// 当主动退出或执行出错由内核终止时被赋值
    pub exit_code: i32,
    /// 堆的起始地址
    pub heap_bottom: usize,
    /// 当前的堆顶
    pub program_brk: usize,
    /// PID对应的内核栈，进程退出后交给处理器在离开这个栈之后释放
    pub kernel_stack: Option<KernelStack>,
    /// 各个系统调用被调用的次数，下标为系统调用号
    pub syscall_times: Vec<u32>,
    /// 第一次被调度时的时间，单位为毫秒
    pub first_run_time: Option<usize>,
    /// stride调度的优先级，不小于2
    pub priority: usize,
    /// stride调度中已经走过的行程
    pub pass: u64,
}

impl TaskControlBlockInner {
    pub fn get_trap_cx(&self) -> &'static mut TrapContext {
        self.trap_cx_ppn.get_mut()
    }
    pub fn get_user_token(&self) -> usize {
        self.memory_set.token()
    }
    fn get_status(&self) -> TaskStatus {
        self.task_status
    }
    pub fn is_zombie(&self) -> bool {
        self.get_status() == TaskStatus::Zombie
    }
    /// 记一次系统调用，超出统计范围的调用号被忽略
    pub fn record_syscall(&mut self, syscall_id: usize) {
        if let Some(times) = self.syscall_times.get_mut(syscall_id) {
            *times += 1;
        }
    }
    /// 每次被调度时行程增加的步长
    pub fn stride(&self) -> u64 {
        BIG_STRIDE / self.priority as u64
    }
}

/// 等待子进程失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// 没有符合条件的子进程
    NoSuchChild,
    /// 符合条件的子进程都还没有退出
    WouldBlock,
}

/// 陷入上下文所在的物理页
fn trap_cx_ppn_of(memory_set: &MemorySet) -> Result<PhysPageNum, MemoryError> {
    memory_set
        .translate(VirtAddr::from(TRAP_CONTEXT).into())
        .map(|pte| pte.ppn())
        .ok_or(MemoryError::NotMapped)
}

impl TaskControlBlock {
    /// 获取TaskControlBlockInner的可变引用
    pub fn inner_exclusive_access(&self) -> UPIntrRefMut<'_, TaskControlBlockInner> {
        self.inner.exclusive_access()
    }

    /// 由ELF镜像创建一个新进程，父进程为`parent`
    fn from_elf(elf_data: &[u8], parent: Option<Weak<TaskControlBlock>>) -> Result<Self, MemoryError> {
        // 地址空间包括elf应用头、跳板、陷入上下文、用户栈
        let (memory_set, user_sp, entry_point) = MemorySet::from_elf(elf_data)?;
        let trap_cx_ppn = trap_cx_ppn_of(&memory_set)?;
        // 分配一个pid和一个在内核空间的内核栈
        let pid_handle = pid_alloc();
        let kernel_stack = KernelStack::new(&pid_handle)?;
        let kernel_stack_top = kernel_stack.get_top();
        // 压入任务上下文，使第一次任务切换到它的时候可以跳转到trap_return并进入用户态开始执行
        let task_control_block = Self {
            pid: pid_handle,
            inner: unsafe {
                UPIntrFreeCell::new(TaskControlBlockInner {
                    trap_cx_ppn,
                    task_cx: TaskContext::goto_trap_return(kernel_stack_top),
                    task_status: TaskStatus::Ready,
                    memory_set,
                    parent,
                    children: Vec::new(),
                    exit_code: 0,
                    heap_bottom: user_sp,
                    program_brk: user_sp,
                    kernel_stack: Some(kernel_stack),
                    syscall_times: vec![0; MAX_SYSCALL_NUM],
                    first_run_time: None,
                    priority: DEFAULT_PRIORITY,
                    pass: 0,
                })
            },
        };
        // 准备在用户空间的陷入上下文
        let trap_cx = task_control_block.inner_exclusive_access().get_trap_cx();
        *trap_cx = TrapContext::app_init_context(
            entry_point,
            user_sp,
            kernel_token(),
            kernel_stack_top,
            trap_handler as usize,
        );
        Ok(task_control_block)
    }

    /// 创建一个没有父进程的新进程
    ///
    /// 现在，它只用于初始进程initproc的创建
    pub fn new(elf_data: &[u8]) -> Result<Self, MemoryError> {
        Self::from_elf(elf_data, None)
    }

    /// 加载一个新的elf文件，替换原有的应用地址空间中的内容并开始执行。
    ///
    /// 新的地址空间构造失败时原有的地址空间保持不变。
    pub fn exec(&self, elf_data: &[u8]) -> Result<(), MemoryError> {
        let (memory_set, user_sp, entry_point) = MemorySet::from_elf(elf_data)?;
        let trap_cx_ppn = trap_cx_ppn_of(&memory_set)?;

        // ---- 独占访问内部数据
        let mut inner = self.inner_exclusive_access();
        // 替换地址空间
        inner.memory_set = memory_set;
        // 更新陷入上下文的物理页号
        inner.trap_cx_ppn = trap_cx_ppn;
        inner.heap_bottom = user_sp;
        inner.program_brk = user_sp;
        // 初始化陷入上下文
        let trap_cx = inner.get_trap_cx();
        *trap_cx = TrapContext::app_init_context(
            entry_point,
            user_sp,
            kernel_token(),
            kernel_stack_position(self.pid.0).1,
            trap_handler as usize,
        );
        Ok(())
        // ---- 自动释放内部数据的访问
    }

    /// 从父进程派生子进程
    pub fn fork(self: &Arc<TaskControlBlock>) -> Result<Arc<TaskControlBlock>, MemoryError> {
        // ---- 独占访问父进程的任务控制块
        let mut parent_inner = self.inner_exclusive_access();
        // 拷贝用户空间(包括陷入上下文)
        let memory_set = MemorySet::from_existing(&parent_inner.memory_set)?;
        let trap_cx_ppn = trap_cx_ppn_of(&memory_set)?;
        // 分配一个pid和一个在内核空间的内核栈
        let pid_handle = pid_alloc();
        let kernel_stack = KernelStack::new(&pid_handle)?;
        let kernel_stack_top = kernel_stack.get_top();
        let task_control_block = Arc::new(TaskControlBlock {
            pid: pid_handle,
            inner: unsafe {
                UPIntrFreeCell::new(TaskControlBlockInner {
                    trap_cx_ppn,
                    task_cx: TaskContext::goto_trap_return(kernel_stack_top),
                    task_status: TaskStatus::Ready,
                    memory_set,
                    parent: Some(Arc::downgrade(self)),
                    children: Vec::new(),
                    exit_code: 0,
                    heap_bottom: parent_inner.heap_bottom,
                    program_brk: parent_inner.program_brk,
                    kernel_stack: Some(kernel_stack),
                    syscall_times: vec![0; MAX_SYSCALL_NUM],
                    first_run_time: None,
                    priority: DEFAULT_PRIORITY,
                    pass: 0,
                })
            },
        });
        // 添加子进程
        parent_inner.children.push(task_control_block.clone());
        // ++++ 独占访问子进程的任务管理块
        let trap_cx = task_control_block.inner_exclusive_access().get_trap_cx();
        // 子进程有自己的内核栈，fork在子进程中返回0
        trap_cx.kernel_sp = kernel_stack_top;
        trap_cx.x[10] = 0;
        Ok(task_control_block)
        // ---- 自动释放父进程的任务管理块访问
    }

    /// 创建一个执行新程序的子进程
    pub fn spawn(self: &Arc<TaskControlBlock>, elf_data: &[u8]) -> Result<Arc<TaskControlBlock>, MemoryError> {
        let task_control_block = Arc::new(Self::from_elf(elf_data, Some(Arc::downgrade(self)))?);
        self.inner_exclusive_access()
            .children
            .push(task_control_block.clone());
        Ok(task_control_block)
    }

    /// 把进程变为僵尸进程。
    ///
    /// 子进程被移交给`root`，用户空间的数据页被回收，页表和进程标识符留到父进程回收时释放。
    /// 返回的内核栈可能正在被使用，要等离开这个栈之后才能释放。
    pub fn exit(&self, exit_code: i32, root: &Arc<TaskControlBlock>) -> Option<KernelStack> {
        // ---- 独占访问当前任务控制块
        let mut inner = self.inner_exclusive_access();
        // 将状态改变为Zombie
        inner.task_status = TaskStatus::Zombie;
        // 记录返回码
        inner.exit_code = exit_code;
        // 不要移动到其父级，而是移到root下
        if !core::ptr::eq(self, Arc::as_ptr(root)) {
            // ++++++ 独占访问root的任务控制块
            let mut root_inner = root.inner_exclusive_access();
            for child in inner.children.iter() {
                child.inner_exclusive_access().parent = Some(Arc::downgrade(root));
                root_inner.children.push(child.clone());
            }
            // ++++++ 释放root的任务管理块访问
            inner.children.clear();
        }
        // 释放用户空间
        inner.memory_set.recycle_data_pages();
        inner.kernel_stack.take()
        // ---- 释放当前任务控制块访问
    }

    /// 回收一个已经退出的子进程，`target`为`None`时回收任意一个。
    ///
    /// 返回子进程的进程标识符和退出码，子进程的任务控制块随之释放。
    pub fn wait_child(&self, target: Option<usize>) -> Result<(usize, i32), WaitError> {
        let matches = |p: &Arc<TaskControlBlock>| target.map_or(true, |pid| pid == p.getpid());
        // ---- 独占访问当前任务控制块
        let mut inner = self.inner_exclusive_access();
        if !inner.children.iter().any(matches) {
            return Err(WaitError::NoSuchChild);
        }
        let idx = inner
            .children
            .iter()
            .position(|p| {
                // ++++ 临时独占访问子进程的任务控制块
                p.inner_exclusive_access().is_zombie() && matches(p)
                // ++++ 释放子进程的任务控制块访问
            })
            .ok_or(WaitError::WouldBlock)?;
        let child = inner.children.remove(idx);
        // 其他地方仍持有的引用释放后，子进程的页表和进程标识符才会被回收
        if Arc::strong_count(&child) != 1 {
            warn!(
                "[kernel] reaped child {} is still referenced elsewhere",
                child.getpid()
            );
        }
        let found_pid = child.getpid();
        let exit_code = child.inner_exclusive_access().exit_code;
        Ok((found_pid, exit_code))
        // ---- 自动释放当前任务控制块访问
    }

    /// 调整堆的大小，成功时返回原来的堆顶
    pub fn change_program_brk(&self, size: i32) -> Result<usize, MemoryError> {
        let mut inner = self.inner_exclusive_access();
        let heap_bottom = inner.heap_bottom;
        let old_break = inner.program_brk;
        let new_brk = old_break as isize + size as isize;
        if new_brk < heap_bottom as isize {
            return Err(MemoryError::BadAddress(new_brk as usize));
        }
        if size < 0 {
            inner
                .memory_set
                .shrink_to(VirtAddr(heap_bottom), VirtAddr(new_brk as usize))?;
        } else {
            inner
                .memory_set
                .append_to(VirtAddr(heap_bottom), VirtAddr(new_brk as usize))?;
        }
        inner.program_brk = new_brk as usize;
        Ok(old_break)
    }

    /// 设置stride调度的优先级
    pub fn set_priority(&self, priority: usize) {
        assert!(priority >= 2, "priority {} is too small", priority);
        self.inner_exclusive_access().priority = priority;
    }

    pub fn getpid(&self) -> usize {
        self.pid.0
    }
}

/// 任务状态：准备运行，正在运行，僵尸
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum TaskStatus {
    Ready,
    Running,
    Zombie,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PAGE_SIZE, USER_STACK_SIZE};
    use crate::mm::available_frames;
    use crate::test_support;

    fn task() -> Arc<TaskControlBlock> {
        Arc::new(TaskControlBlock::new(&test_support::sample_elf()).unwrap())
    }

    fn user_byte(task: &TaskControlBlock, va: usize) -> &'static mut u8 {
        let inner = task.inner_exclusive_access();
        let pte = inner.memory_set.translate(VirtAddr::from(va).floor()).unwrap();
        &mut pte.ppn().get_bytes_array()[VirtAddr::from(va).page_offset()]
    }

    #[test]
    fn new_task_starts_at_the_entry_on_its_own_stacks() {
        let _guard = test_support::boot();
        let task = task();
        let inner = task.inner_exclusive_access();
        assert_eq!(inner.task_status, TaskStatus::Ready);
        assert!(inner.parent.is_none());
        let trap_cx = inner.get_trap_cx();
        assert_eq!(trap_cx.sepc, test_support::SAMPLE_ENTRY);
        assert_eq!(trap_cx.x[2], inner.heap_bottom);
        assert_eq!(trap_cx.kernel_satp, kernel_token());
        assert_eq!(trap_cx.kernel_sp, kernel_stack_position(task.getpid()).1);
        assert_eq!(trap_cx.trap_handler, trap_handler as usize);
        assert_eq!(inner.task_cx.sp(), trap_cx.kernel_sp);
    }

    #[test]
    fn forked_child_is_a_private_copy() {
        let _guard = test_support::boot();
        let parent = task();
        *user_byte(&parent, 0x11000) = 0x5a;
        parent.inner_exclusive_access().get_trap_cx().x[10] = 99;
        let child = parent.fork().unwrap();
        assert_ne!(child.getpid(), parent.getpid());
        assert_eq!(*user_byte(&child, 0x11000), 0x5a);
        *user_byte(&child, 0x11000) = 0x33;
        assert_eq!(*user_byte(&parent, 0x11000), 0x5a);
        {
            let child_inner = child.inner_exclusive_access();
            let trap_cx = child_inner.get_trap_cx();
            assert_eq!(trap_cx.x[10], 0);
            assert_eq!(trap_cx.kernel_sp, kernel_stack_position(child.getpid()).1);
            assert_eq!(trap_cx.sepc, test_support::SAMPLE_ENTRY);
            let parent_of_child = child_inner.parent.as_ref().and_then(|p| p.upgrade()).unwrap();
            assert!(Arc::ptr_eq(&parent_of_child, &parent));
        }
        assert_eq!(parent.inner_exclusive_access().get_trap_cx().x[10], 99);
        assert!(Arc::ptr_eq(&parent.inner_exclusive_access().children[0], &child));
    }

    #[test]
    fn failed_exec_keeps_the_old_image() {
        let _guard = test_support::boot();
        let task = task();
        *user_byte(&task, 0x11000) = 0x77;
        let token = task.inner_exclusive_access().get_user_token();
        assert!(task.exec(b"not an elf at all").is_err());
        assert_eq!(task.inner_exclusive_access().get_user_token(), token);
        assert_eq!(*user_byte(&task, 0x11000), 0x77);

        let pid = task.getpid();
        let other = test_support::build_elf(
            0x40000,
            &[test_support::ElfSegment::new(0x40000, test_support::PF_R | test_support::PF_X, &[0x13; 8], 8)],
        );
        task.exec(&other).unwrap();
        assert_eq!(task.getpid(), pid);
        let inner = task.inner_exclusive_access();
        assert_ne!(inner.get_user_token(), token);
        assert!(inner.memory_set.translate(VirtAddr::from(0x11000).floor()).is_none());
        let trap_cx = inner.get_trap_cx();
        assert_eq!(trap_cx.sepc, 0x40000);
        assert_eq!(trap_cx.x[2], 0x42000 + USER_STACK_SIZE);
        assert_eq!(trap_cx.kernel_sp, kernel_stack_position(pid).1);
    }

    #[test]
    fn exit_hands_children_to_the_root_which_reaps_them() {
        let _guard = test_support::boot();
        let root = task();
        let parent = root.fork().unwrap();
        let child = parent.fork().unwrap();
        let child_pid = child.getpid();

        let stack = parent.exit(3, &root);
        assert!(stack.is_some());
        drop(stack);
        {
            let parent_inner = parent.inner_exclusive_access();
            assert!(parent_inner.is_zombie());
            assert!(parent_inner.children.is_empty());
            assert!(parent_inner.memory_set.translate(VirtAddr::from(0x10000).floor()).is_none());
        }
        let new_parent = child.inner_exclusive_access().parent.as_ref().and_then(|p| p.upgrade()).unwrap();
        assert!(Arc::ptr_eq(&new_parent, &root));
        drop(new_parent);

        assert_eq!(root.wait_child(Some(child_pid)), Err(WaitError::WouldBlock));
        drop(child.exit(0, &root));
        drop(child);
        assert_eq!(root.wait_child(Some(child_pid)), Ok((child_pid, 0)));
        let parent_pid = parent.getpid();
        drop(parent);
        assert_eq!(root.wait_child(None), Ok((parent_pid, 3)));
        assert_eq!(root.wait_child(None), Err(WaitError::NoSuchChild));
    }

    #[test]
    fn reaping_returns_every_frame_of_the_child() {
        let _guard = test_support::boot();
        let root = task();
        let before = available_frames();
        let child = root.fork().unwrap();
        let pid = child.getpid();
        drop(child.exit(0, &root));
        drop(child);
        assert_eq!(root.wait_child(Some(pid)), Ok((pid, 0)));
        // 内核栈可能留下了新分配的中间页表
        assert!(available_frames() + 2 >= before);
        assert!(available_frames() <= before);
    }

    #[test]
    fn reaping_a_child_that_is_still_referenced_is_not_fatal() {
        let _guard = test_support::boot();
        let root = task();
        let child = root.fork().unwrap();
        let pid = child.getpid();
        drop(child.exit(4, &root));
        assert_eq!(root.wait_child(Some(pid)), Ok((pid, 4)));
        assert!(root.inner_exclusive_access().children.is_empty());
        // 最后一个引用释放时才回收
        assert!(child.inner_exclusive_access().is_zombie());
    }

    #[test]
    fn syscalls_are_counted_per_task() {
        let _guard = test_support::boot();
        let task = task();
        let child = task.fork().unwrap();
        let mut inner = task.inner_exclusive_access();
        assert_eq!(inner.priority, DEFAULT_PRIORITY);
        assert_eq!(inner.stride(), BIG_STRIDE / DEFAULT_PRIORITY as u64);
        inner.record_syscall(64);
        inner.record_syscall(64);
        inner.record_syscall(MAX_SYSCALL_NUM);
        assert_eq!(inner.syscall_times[64], 2);
        assert_eq!(inner.syscall_times.iter().sum::<u32>(), 2);
        drop(inner);
        assert!(child.inner_exclusive_access().syscall_times.iter().all(|&t| t == 0));
        child.set_priority(4);
        assert_eq!(child.inner_exclusive_access().stride(), BIG_STRIDE / 4);
    }

    #[test]
    fn program_break_moves_within_the_heap() {
        let _guard = test_support::boot();
        let task = task();
        let bottom = task.inner_exclusive_access().heap_bottom;
        assert_eq!(task.change_program_brk(-1), Err(MemoryError::BadAddress(bottom - 1)));
        assert_eq!(task.change_program_brk(0x1800), Ok(bottom));
        *user_byte(&task, bottom + 0x17ff) = 1;
        assert_eq!(task.change_program_brk(-0x1000), Ok(bottom + 0x1800));
        assert_eq!(task.inner_exclusive_access().program_brk, bottom + 0x800);
        let inner = task.inner_exclusive_access();
        assert!(inner.memory_set.translate(VirtAddr::from(bottom).floor()).is_some());
        assert!(inner
            .memory_set
            .translate(VirtAddr::from(bottom + PAGE_SIZE).floor())
            .is_none());
    }
}
