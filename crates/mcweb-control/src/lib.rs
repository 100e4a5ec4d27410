pub mod api;
pub mod config;
pub mod identity;
pub mod security;
pub mod state;
