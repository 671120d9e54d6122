//! 文件和文件系统相关的系统调用

use super::SyscallError;
use crate::arch::console_getchar;
use crate::mm::{translated_byte_buffer, UserBuffer};
use crate::task::current_user_token;

const FD_STDIN: usize = 0;
const FD_STDOUT: usize = 1;

/// 向标准输出写入缓冲区中的内容，返回写入的字节数
pub fn sys_write(fd: usize, buf: *const u8, len: usize) -> Result<isize, SyscallError> {
    match fd {
        FD_STDOUT => {
            let buffers = translated_byte_buffer(current_user_token(), buf, len)?;
            for buffer in buffers {
                print!("{}", alloc::string::String::from_utf8_lossy(buffer));
            }
            Ok(len as isize)
        }
        _ => {
            debug!("[kernel] sys_write: unsupported fd {}", fd);
            Ok(-1)
        }
    }
}

/// 从标准输入读取一个字符。
///
/// 没有输入时让出处理器，调用者下次被调度时重新执行这次系统调用。
pub fn sys_read(fd: usize, buf: *const u8, len: usize) -> Result<isize, SyscallError> {
    match fd {
        FD_STDIN => {
            if len == 0 {
                return Ok(0);
            }
            // 先确认缓冲区可写，再取走输入
            let mut buffer =
                UserBuffer::new(translated_byte_buffer(current_user_token(), buf, 1)?);
            match console_getchar() {
                0 => Err(SyscallError::Restart),
                c => {
                    buffer.write(&[c as u8]);
                    Ok(1)
                }
            }
        }
        _ => {
            debug!("[kernel] sys_read: unsupported fd {}", fd);
            Ok(-1)
        }
    }
}
