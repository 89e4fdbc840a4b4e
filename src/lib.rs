//! Library crate for button-back: a cache-fronted game timer service with distributed locking,
//! a write-behind click queue and a background sync worker.

pub mod config;
pub mod dao;
pub mod dto;
pub mod error;
pub mod routes;
pub mod services;
pub mod state;
