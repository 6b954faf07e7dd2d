//! Request middleware. Request logging itself comes from
//! `tracing_actix_web::TracingLogger`, wired up in `main.rs`.

pub mod metrics;

pub use metrics::MetricsMiddleware;
