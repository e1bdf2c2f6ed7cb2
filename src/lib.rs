//! PolyHybrid Library
//!
//! Hybrid market-making and crypto-directional trading engine for
//! Polymarket binary markets

pub mod arbitrage;
pub mod config;
pub mod directional;
pub mod error;
pub mod gateway;
pub mod inventory;
pub mod markets;
pub mod oracle;
pub mod orchestrator;
pub mod persistence;
pub mod pricing;
pub mod quoter;
pub mod risk;
pub mod spot;
pub mod strategy;
pub mod types;
