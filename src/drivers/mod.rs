//! Device interfaces consumed by the virtual memory manager
//!
//! Drivers live in the host kernel; this crate only names the contracts
//! it needs from them.

pub mod block;
