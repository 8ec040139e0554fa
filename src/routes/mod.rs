//! Route definitions for the SewaHub API

mod booking;
mod payment;

pub use booking::booking_routes;
pub use payment::payment_routes;
