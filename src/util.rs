//! Shared utility modules used across Quiver components.

pub mod simd;
