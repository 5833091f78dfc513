// Copyright (c) 2025 Syncset Contributors
//
// Unbounded lock-free FIFO queues: Michael-Scott with counted pointers,
// and the Doherty-Herlihy-Luchangco-Moir LL/SC emulation that works
// where a pointer and a full-width counter no longer fit in one CAS word.

pub mod llsc;
pub mod ms;

pub use llsc::LlScQueue;
pub use ms::MsQueue;
