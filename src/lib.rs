pub mod algo;
pub mod api;
pub mod batch;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod run;
pub mod strategy;
pub mod transform;
