//! Core records for the Stakeflow engine

pub mod account;
pub mod stake;
