//! [`TaskManager`]的实现
//!
//! 它只用于管理进程和根据准备队列调度进程。
//! 其他关于CPU的进程监控职能都在Processor中。

use super::TaskControlBlock;
use crate::sync::UPIntrFreeCell;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use lazy_static::*;

/// 从准备队列中挑选下一个任务的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// 先进先出
    Fifo,
    /// 选择行程最小的任务，行程相同时先进先出
    Stride,
}

/// 调度器，默认先进先出
pub struct TaskManager {
    ready_queue: VecDeque<Arc<TaskControlBlock>>,
    policy: SchedPolicy,
}

/// 行程`a`是否落后于`b`。
///
/// 行程会回绕，但任意两个任务的行程之差不超过最大步长，用有符号差比较。
fn pass_before(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

impl TaskManager {
    pub fn new() -> Self {
        Self::with_policy(SchedPolicy::Fifo)
    }
    pub fn with_policy(policy: SchedPolicy) -> Self {
        Self {
            ready_queue: VecDeque::new(),
            policy,
        }
    }
    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }
    pub fn set_policy(&mut self, policy: SchedPolicy) {
        self.policy = policy;
    }
    /// 添加进程到准备队列的队尾
    pub fn add(&mut self, task: Arc<TaskControlBlock>) {
        self.ready_queue.push_back(task);
    }
    /// 按调度策略从准备队列中取出一个进程
    pub fn fetch(&mut self) -> Option<Arc<TaskControlBlock>> {
        match self.policy {
            SchedPolicy::Fifo => self.ready_queue.pop_front(),
            SchedPolicy::Stride => {
                let pass_of = |idx: usize| self.ready_queue[idx].inner_exclusive_access().pass;
                let mut min_idx = 0;
                for idx in 1..self.ready_queue.len() {
                    if pass_before(pass_of(idx), pass_of(min_idx)) {
                        min_idx = idx;
                    }
                }
                self.ready_queue.remove(min_idx)
            }
        }
    }
    pub fn len(&self) -> usize {
        self.ready_queue.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ready_queue.is_empty()
    }
}

lazy_static! {
    /// 通过lazy_static!创建TASK_MANAGER实例
    pub static ref TASK_MANAGER: UPIntrFreeCell<TaskManager> =
        unsafe { UPIntrFreeCell::new(TaskManager::new()) };
}

pub fn add_task(task: Arc<TaskControlBlock>) {
    TASK_MANAGER.exclusive_access().add(task);
}

pub fn fetch_task() -> Option<Arc<TaskControlBlock>> {
    TASK_MANAGER.exclusive_access().fetch()
}

/// 切换全局调度器的策略
pub fn set_sched_policy(policy: SchedPolicy) {
    TASK_MANAGER.exclusive_access().set_policy(policy);
}
