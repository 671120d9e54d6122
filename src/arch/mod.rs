//! 与目标平台相关的底层原语
//!
//! 在riscv64裸机目标上，这些原语直接访问CSR或通过`ecall`调用SBI。
//! 在其他目标上（主机单元测试）换成[`host`]中的模型：中断使能位与时钟只是内存中的变量，
//! 控制台输出转到标准输出，页表激活和陷入入口的设置没有效果。

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod riscv64;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use riscv64::*;

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
mod host;
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub use host::*;
