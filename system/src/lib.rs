mod arch;
mod hardware;
mod os;

pub use crate::arch::*;
pub use crate::hardware::*;
pub use crate::os::*;
