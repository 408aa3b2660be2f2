//! Utility modules for the Redfire Softphone core

pub mod logger;
