//! Pre- and post-upgrade verifications.
//!
//! Every check is a bounded polling loop: a poll ticker does the probing, a
//! notification ticker keeps the operator informed, a deadline turns the
//! check into a failure and a cancellation token aborts it.

pub mod post;
pub mod pre;
