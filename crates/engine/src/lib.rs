//! Admission, routing and policy for notification delivery.

pub mod dedup;
pub mod policy;
pub mod ratelimit;
pub mod router;
pub mod translator;
