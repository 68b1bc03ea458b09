//! Event worker process: wires the change-event pipeline and runs the
//! broker consumer and the fallback sweeper.

pub mod app;
