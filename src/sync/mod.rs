//! 同步与内部可变性原语

mod up;

pub use up::{UPIntrFreeCell, UPIntrRefMut};
