//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into those models.
//!
//! Wallet balance and monthly spend are deliberately absent from the write
//! API here: the only code allowed to mutate them is the atomic debit in
//! `crate::billing`.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{
    CampaignForDispatch, ContactForDispatch, ContactForPlanning, MessageForFeedback, NumberForSend,
    OrgBilling,
};
