#![forbid(unsafe_code)]

pub mod admin;
pub mod auth;
pub mod connection;
pub mod health;
pub mod http;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod session;



#[cfg(test)]
mod router_tests;
