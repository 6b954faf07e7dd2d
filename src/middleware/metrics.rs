//! # Request Metrics Middleware
//!
//! Times every request and records it in [`AppState`] under its route
//! pattern (`GET /api/v1/session`), so paths with parameters or query strings
//! collapse into one entry.
//!
//! ## Rust Concepts:
//! - **Transform**: the factory actix-web calls once per worker to wrap a service
//! - **Service**: the wrapper that runs for every request
//! - **LocalBoxFuture**: actix workers are single-threaded, so the response
//!   future does not need to be `Send`

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::warn;

/// Requests slower than this are logged.
const SLOW_REQUEST_MS: u64 = 1_000;

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsService { service }))
    }
}

pub struct MetricsService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started = Instant::now();
        let route = req.match_pattern().unwrap_or_else(|| req.path().to_string());
        let endpoint = format!("{} {}", req.method(), route);
        let state = req.app_data::<web::Data<AppState>>().cloned();

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => response.status().is_client_error() || response.status().is_server_error(),
                Err(_) => true,
            };

            if let Some(state) = state {
                state.increment_request_count();
                if is_error {
                    state.increment_error_count();
                }
                state.record_endpoint_request(&endpoint, duration_ms, is_error);
            }

            if duration_ms > SLOW_REQUEST_MS {
                warn!(endpoint = %endpoint, duration_ms, "Slow request");
            }

            result
        })
    }
}
