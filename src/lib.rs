//! Stale-while-revalidate caching middleware for slow, server-rendered HTTP origins.
//!
//! Rendered responses are stored in a pluggable [`cache::CacheStore`], served
//! immediately while fresh, served stale while a background render refreshes them,
//! and rendered at most once per key thanks to lease-based single-flight locks.
//! Rendering itself runs in an isolated worker behind [`render::RendererBridge`].

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
pub mod render;
