use serde::{Deserialize, Serialize};

/// One parcel measurement as the receiving server expects it.
///
/// Field order is part of the wire format: `weight`, `volume`, `feeType`, `fee`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub weight: f64,
    pub volume: f64,
    pub fee_type: String,
    pub fee: f64,
}

impl Reading {
    pub fn new(weight: f64, volume: f64, fee_type: impl Into<String>, fee: f64) -> Self {
        Self {
            weight,
            volume,
            fee_type: fee_type.into(),
            fee,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}
