//! SewaHub Backend Library
//!
//! Core of a local-services marketplace: the booking lifecycle, provider
//! availability, and payment reconciliation against the Khalti and eSewa
//! gateways.

pub mod booking;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod notify;
pub mod payment;
pub mod routes;
pub mod state;
