// claude-pool: a Claude-compatible chat completions proxy that
// multiplexes requests across a pool of upstream accounts

pub mod account;
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod selector;
pub mod tokens;
pub mod tools;
pub mod web;
