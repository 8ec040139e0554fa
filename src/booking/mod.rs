pub mod conflict;
pub mod machine;
pub mod model;
pub mod service;

pub use conflict::{ConflictChecker, ValidationReport};
pub use machine::{Transition, TransitionError};
pub use model::{
    Actor, Booking, BookingDetail, BookingEvent, BookingImage, BookingStatus, ImagePhase, Review,
    ServiceLine,
};
pub use service::{BookingService, SweepOutcome};
