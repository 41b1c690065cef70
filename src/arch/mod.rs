//! # Architecture Abstraction Layer
//!
//! Processor ports. The kernel reaches hardware only through
//! [`Port`](crate::context::Port) and the exception handlers defined here.

pub mod cortex_m4;
