//! Ratewarden - Fixed-Window Request Rate Limiting
//!
//! This crate makes per-request admission decisions for an HTTP service.
//! Counters live in Redis so that every instance enforces the same ceiling;
//! when Redis cannot be reached, each instance falls back to counting in
//! process memory rather than failing the request.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod web;
