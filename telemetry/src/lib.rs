pub mod config;
pub mod link;
pub mod reporter;
pub mod scale;
pub mod types;

pub use config::{
    Endpoint, IngestConfig, NetworkCredentials, ReporterConfig, API_PATH, DEFAULT_PORT,
};
pub use link::{HostLink, LinkError, LinkResult, NetworkLink};
pub use reporter::{TelemetryError, TelemetryReporter, TelemetryResult, API_KEY_HEADER};
pub use scale::{ReadingFilter, ScaleLineParser};
pub use types::{LinkStatus, Reading};

pub mod prelude {
    pub use crate::config::*;
    pub use crate::link::*;
    pub use crate::reporter::*;
    pub use crate::scale::*;
    pub use crate::types::*;
}
