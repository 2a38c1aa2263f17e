//! Network association capability.
//!
//! The reporter never touches a radio directly; it drives whatever
//! [`NetworkLink`] it was built with. On firmware that is the WiFi driver, on
//! a host it is [`HostLink`], and in tests it is a scripted fake.

use crate::config::NetworkCredentials;
use crate::types::LinkStatus;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Association rejected for network {ssid}: {reason}")]
    Rejected { ssid: String, reason: String },

    #[error("Network interface unavailable: {message}")]
    Unavailable { message: String },
}

pub type LinkResult<T> = Result<T, LinkError>;

#[async_trait]
pub trait NetworkLink: Send + Sync {
    /// Start joining the network. Completion is observed through [`status`].
    ///
    /// [`status`]: NetworkLink::status
    async fn associate(&mut self, credentials: &NetworkCredentials) -> LinkResult<()>;

    async fn status(&self) -> LinkStatus;

    async fn disassociate(&mut self) -> LinkResult<()>;

    fn link_name(&self) -> &'static str;
}

/// Link for hosts whose operating system already owns the network interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostLink;

impl HostLink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkLink for HostLink {
    async fn associate(&mut self, _credentials: &NetworkCredentials) -> LinkResult<()> {
        Ok(())
    }

    async fn status(&self) -> LinkStatus {
        LinkStatus::Connected
    }

    async fn disassociate(&mut self) -> LinkResult<()> {
        Ok(())
    }

    fn link_name(&self) -> &'static str {
        "host"
    }
}
