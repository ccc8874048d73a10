//! # seisync-client
//!
//! Authenticated, rate-limited client for the SEI API.
//!
//! - [`SessionManager`]: token lifecycle with single-flight login
//! - [`Transport`]: permit pool, 401 re-auth, 429 cooldown, backoff
//! - [`SeiClient`]: typed endpoints returning stored-record types
//! - [`UnitDirectory`]: scope label to unit id resolution

pub mod api;
pub mod config;
pub mod error;
pub mod session;
pub mod stats;
pub mod transport;
pub mod types;
pub mod units;

pub use api::{filename_from_disposition, DownloadedDocument, SeiClient};
pub use config::ClientConfig;
pub use error::{ApiError, ApiResult, ErrorKind};
pub use session::{AuthSession, SessionManager, LOGIN_PATH};
pub use stats::{StatsSnapshot, TransportStats};
pub use transport::{ApiRequest, ApiResponse, RetryPolicy, Transport, TOKEN_HEADER};
pub use types::parse_sei_date;
pub use units::{Unit, UnitDirectory};
