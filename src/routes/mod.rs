//! Route modules for the PDF toolkit server

pub mod health;
pub mod jobs;
pub mod operations;
