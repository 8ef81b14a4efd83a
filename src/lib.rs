//! Real-time network intrusion detection pipeline: capture, flow
//! reconstruction, feature extraction, dual-model inference, risk fusion,
//! persistence and live alert delivery.

pub mod broadcaster;
pub mod capture;
pub mod config;
pub mod decision;
pub mod error;
pub mod features;
pub mod flow;
pub mod metrics;
pub mod models;
pub mod persistence;
pub mod pipeline;
pub mod preprocess;
pub mod pubsub;
pub mod reputation;
pub mod types;
