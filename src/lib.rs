pub mod activity;
pub mod api;
pub mod config;
pub mod hub;
pub mod listener;
pub mod lxc;
pub mod port_pool;
pub mod pty;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;
