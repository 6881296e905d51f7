//! HTTP API: thin transport over the transition engine and the reconciler.

pub mod app;
