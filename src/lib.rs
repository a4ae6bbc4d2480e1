//! HTTP observability tap: captures every request/response pair flowing
//! through a host application and streams the records to a collector over a
//! persistent websocket. Records are held in a correlation cache until the
//! collector acknowledges them.
//!
//! ```ignore
//! let tap = apitap::ApiTap::start(apitap::TapConfig::new("collector.example", secret));
//! let app = Router::new()
//!     .route("/users/:id", get(user))
//!     .layer(axum::middleware::from_fn_with_state(tap.state(), apitap::intercept));
//! ```

mod error;

pub mod cache;
pub mod capture;
pub mod config;
pub mod record;
pub mod reporter;
pub mod tap;

#[cfg(feature = "axum")]
pub mod middleware;

pub use cache::CallCache;
pub use capture::{CaptureBody, CapturedBody};
pub use config::TapConfig;
pub use error::{Result, TapError};
pub use record::{ApiCall, RequestSnapshot, ResponseSnapshot};
pub use reporter::Reporter;
pub use tap::{ApiTap, OutboundQueue, TapState};

#[cfg(feature = "axum")]
pub use middleware::{RequestId, intercept};
