pub mod canvas;
pub mod config;
pub mod generator;
pub mod service;
pub mod telemetry;
