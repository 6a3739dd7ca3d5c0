pub mod config;
pub mod error;
pub mod geo;
pub mod inference;
pub mod observation;
pub mod output;
pub mod schedule;
pub mod service;
