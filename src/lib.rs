// ===============================
// src/lib.rs
// ===============================
pub mod adapter;
pub mod config;
pub mod domain;
pub mod facade;
pub mod listener;
pub mod mailbox;
pub mod market_state;
pub mod market_states;
pub mod metrics;
pub mod overview;
pub mod plugin;
pub mod push;
pub mod recorder;
pub mod store;
pub mod supervisor;
pub mod validator;
