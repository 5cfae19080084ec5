// src/core/mod.rs

pub mod action;
pub mod builtins;
pub mod context;
pub mod executor;
pub mod locks;
pub mod parser;
pub mod paths;
pub mod pipeline;
pub mod scheme;
pub mod session;
pub mod symbol;
