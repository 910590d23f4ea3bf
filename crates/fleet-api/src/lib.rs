//! Client for a paginated network-device inventory and health API.
//!
//! The crate is organised around a single seam, [`Transport`], that performs
//! one HTTP exchange. Everything above it is transport-agnostic:
//!
//! - [`classify`] turns a raw exchange into success / transient / fatal /
//!   auth-required, once, at the boundary
//! - [`ResilientClient`] adds the global concurrency ceiling, per-attempt
//!   timeout, exponential backoff and transparent re-authentication
//! - [`WindowRateLimiter`] enforces a calls-per-window ceiling on issued calls
//! - [`PaginatedFetcher`] walks offset/limit pages into one collection
//! - [`FleetApi`] exposes the concrete endpoints with typed results

pub mod api;
pub mod auth;
pub mod client;
pub mod error;
pub mod models;
pub mod pagination;
pub mod rate_limiter;
pub mod retry;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use api::FleetApi;
pub use auth::{AuthState, LoginTokenProvider, StaticTokenProvider, TokenProvider};
pub use client::{ClientConfig, ClientStats, ResilientClient};
pub use error::{AuthError, FetchError, TransportError, TransportErrorKind};
pub use models::{DeviceCount, DeviceDetail, DeviceRecord, DeviceStatus, HealthEntry, PageRequest};
pub use pagination::{PagedResult, PaginatedFetcher};
pub use rate_limiter::WindowRateLimiter;
pub use retry::RetryPolicy;
pub use transport::{
    ApiRequest, ApiResponse, Classified, Method, ReqwestTransport, Transport, classify,
};
