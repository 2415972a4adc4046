// Signaling module for the SFU
//
// This module defines the negotiation payloads the core accepts from the
// signaling layer: session descriptions and ICE candidates. Payloads are a
// closed set of variants; the JSON adapter below is the only place where
// loosely structured input is turned into them.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, SfuError};

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Provisional answer
    Pranswer,
    /// Final answer
    Answer,
    /// Rollback of a pending offer
    Rollback,
}

impl SdpType {
    /// Wire name of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpType {
    type Err = SfuError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "offer" => Ok(SdpType::Offer),
            "pranswer" => Ok(SdpType::Pranswer),
            "answer" => Ok(SdpType::Answer),
            "rollback" => Ok(SdpType::Rollback),
            other => Err(SfuError::InvalidInput(format!("unknown description type: {}", other))),
        }
    }
}

/// Session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Offer carrying `sdp`
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer carrying `sdp`
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as exchanged with the remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    /// Candidate with only a candidate line
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// Key used to deduplicate buffered candidates
    pub fn signature(&self) -> String {
        format!(
            "{}|{}|{}",
            self.candidate,
            self.sdp_mid.as_deref().unwrap_or_default(),
            self.sdp_mline_index.map(|i| i.to_string()).unwrap_or_default()
        )
    }
}

/// Negotiation payload accepted by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    /// Remote offer; applying it produces a local answer
    Offer(SessionDescription),
    /// Remote answer to a local offer
    Answer(SessionDescription),
    /// Remote ICE candidate
    Candidate(IceCandidateInit),
}

impl SignalPayload {
    /// Classify a typed session description
    ///
    /// Only offers and answers are accepted.
    pub fn from_description(description: SessionDescription) -> Result<Self> {
        match description.sdp_type {
            SdpType::Offer => Ok(SignalPayload::Offer(description)),
            SdpType::Answer => Ok(SignalPayload::Answer(description)),
            other => Err(SfuError::InvalidInput(format!(
                "unsupported description type: {}",
                other
            ))),
        }
    }

    /// Decode a loosely structured payload from the signaling transport
    ///
    /// Objects with a `candidate` field are candidates; everything else must
    /// be `{type: "offer"|"answer", sdp}`.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(fields) = &value else {
            return Err(SfuError::InvalidInput("signal payload is not an object".to_string()));
        };

        if fields.contains_key("candidate") {
            let candidate: IceCandidateInit = serde_json::from_value(value)
                .map_err(|e| SfuError::InvalidInput(format!("undecodable candidate: {}", e)))?;
            return Ok(SignalPayload::Candidate(candidate));
        }

        let kind = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SfuError::InvalidInput("description has no type".to_string()))?;
        let sdp_type: SdpType = kind.parse()?;
        let sdp = fields
            .get("sdp")
            .and_then(Value::as_str)
            .ok_or_else(|| SfuError::InvalidInput("description has no sdp".to_string()))?;

        Self::from_description(SessionDescription {
            sdp_type,
            sdp: sdp.to_string(),
        })
    }

    /// Decode a JSON text payload
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SfuError::InvalidInput(format!("malformed signal payload: {}", e)))?;
        Self::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use testresult::TestResult;

    use super::*;

    #[test]
    fn test_decodes_descriptions() -> TestResult {
        let offer = SignalPayload::from_value(json!({"type": "offer", "sdp": "v=0"}))?;
        assert_eq!(offer, SignalPayload::Offer(SessionDescription::offer("v=0")));

        let answer = SignalPayload::from_json(r#"{"type":"answer","sdp":"v=1"}"#)?;
        assert_eq!(answer, SignalPayload::Answer(SessionDescription::answer("v=1")));
        Ok(())
    }

    #[test]
    fn test_rejects_unknown_or_unsupported_types() {
        for payload in [
            json!({"type": "bogus", "sdp": "v=0"}),
            json!({"type": "pranswer", "sdp": "v=0"}),
            json!({"sdp": "v=0"}),
            json!({"type": "offer"}),
            json!("offer"),
        ] {
            assert!(matches!(
                SignalPayload::from_value(payload),
                Err(SfuError::InvalidInput(_))
            ));
        }
        assert!(SignalPayload::from_json("{not json").is_err());
    }

    #[test]
    fn test_decodes_candidates() -> TestResult {
        let payload = SignalPayload::from_value(json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": "abcd"
        }))?;
        let SignalPayload::Candidate(candidate) = payload else {
            panic!("expected a candidate");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));

        let bad = SignalPayload::from_value(json!({"candidate": 42}));
        assert!(matches!(bad, Err(SfuError::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn test_candidate_serializes_in_browser_shape() -> TestResult {
        let mut candidate = IceCandidateInit::new("candidate:1");
        candidate.sdp_mline_index = Some(1);
        let value = serde_json::to_value(&candidate)?;
        assert_eq!(value, json!({"candidate": "candidate:1", "sdpMLineIndex": 1}));
        Ok(())
    }
}
