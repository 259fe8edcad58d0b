//! Memory policies that can be used for spaces.
//!
//! A policy defines how a range of virtual memory is managed. This crate
//! implements a single policy, the region based layout of garbage-first
//! collectors, in [`region`].

pub mod region;
