//! Settlement worker process: configuration → backends → settlement loop.

pub mod app;
