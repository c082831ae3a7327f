//! # Utility Modules
//!
//! Supporting utilities for cryptography, compression, logging, and timing.
//!
//! This module provides reusable utilities used throughout the protocol implementation.
//!
//! ## Components
//! - **Crypto**: AES-256 channel cipher with HMAC-authenticated IV
//! - **Compression**: LZMA, VZip, VZstd and gzip containers with size limits
//! - **Backoff**: Exponential retry delays for reconnects and discovery
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Async timeout wrappers and default durations
//! - **Metrics**: Thread-safe observability counters
//!
//! ## Security
//! - Cryptographically secure RNG (OsRng)
//! - Decompression bomb protection (16MB limit)
//! - Memory zeroing for key material (zeroize crate)

pub mod backoff;
pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;
