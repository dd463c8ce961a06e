//! Core of an isolation-test driver: interleave SQL steps from concurrent
//! database sessions in deterministic orders ("permutations"), detect when
//! one session blocks on a lock held by another, and emit a byte-stable
//! transcript of what happened.
//!
//! The pieces, leaves first: [`db`] adapts `tokio_postgres` onto the narrow
//! capability this crate needs; [`wait_detector`] answers "is this session
//! blocked on a sibling session's lock?"; [`executor`] drives one step to
//! completion or detected block; [`runner`] is the per-permutation state
//! machine; [`enumerator`] produces the permutations to run; [`driver`]
//! owns the connections and orchestrates a whole run; [`spec`] and
//! [`spec_format`] are the (ambient) in-memory test spec and its on-disk
//! reader.

pub mod db;
pub mod driver;
pub mod enumerator;
pub mod executor;
pub mod runner;
pub mod spec;
pub mod spec_format;
pub mod wait_detector;

pub use driver::Driver;
pub use spec::TestSpec;
