pub mod broker;
pub mod bundle;
pub mod cluster;
pub mod config;
pub mod dao;
pub mod engine;
pub mod runtime;
