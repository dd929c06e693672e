//! Adaptive-bitrate streaming emulator built around a FastMPC lookup table.
//!
//! A [`session::Session`] serves segment sizes from a [`catalog::SegmentCatalog`]
//! through a [`simulator::StreamSimulator`]; each timed delivery feeds a
//! [`estimator::ThroughputEstimator`], and [`controller::RateController`] turns the
//! estimate, the buffer level and the previous bitrate into the next bitrate using a
//! [`table::QuantizedDecisionTable`].

pub mod catalog;
pub mod config;
pub mod controller;
pub mod estimator;
pub mod playback;
pub mod request;
pub mod session;
pub mod simulator;
pub mod table;
