use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::infrastructure::error::{BrokerError, DecodeError};

/// Wire format of record payloads. Producers and consumers of one topic must
/// agree on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Json,
    Bincode,
}

impl Encoding {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, BrokerError> {
        match self {
            Encoding::Json => serde_json::to_vec(value)
                .map_err(|e| BrokerError::SerializationError(e.to_string())),
            Encoding::Bincode => bincode::serialize(value)
                .map_err(|e| BrokerError::SerializationError(e.to_string())),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        match self {
            Encoding::Json => Ok(serde_json::from_slice(payload)?),
            Encoding::Bincode => Ok(bincode::deserialize(payload)?),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Encoding::Json => "application/json",
            Encoding::Bincode => "application/x-bincode",
        }
    }
}

impl std::str::FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "bincode" => Ok(Encoding::Bincode),
            other => Err(other.to_string()),
        }
    }
}
