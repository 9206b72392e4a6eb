//! Multi-tenant SMS campaign dispatch and reliability engine.
//!
//! The library splits into a planning side and a delivery side, joined by a
//! durable delayed queue in SQLite:
//!
//! - [`planner`] decides who may be messaged and when, and enqueues work;
//! - [`dispatch`] drains the queue, resolving identity, template, billing,
//!   and throttle gates at point of send;
//! - [`feedback`] folds carrier delivery callbacks into per-identity
//!   deliverability scores;
//! - [`inbound`] records replies, enforces opt-out keywords, classifies the
//!   text, and optionally answers from the same number.
//!
//! Wallet and spend mutations happen only in [`billing`]; sending-identity
//! selection only in [`numbers`].

pub mod ai;
pub mod billing;
pub mod carrier;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod feedback;
pub mod inbound;
pub mod model;
pub mod numbers;
pub mod planner;
pub mod templates;
