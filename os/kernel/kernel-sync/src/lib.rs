//! # Kernel synchronization primitives
//!
//! Bare lock words for structures that manage their own protected data, such
//! as per-frame locks whose ownership moves into a caller-held token.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod raw_spin;

pub use raw_spin::RawSpin;
