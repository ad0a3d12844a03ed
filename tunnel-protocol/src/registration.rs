//! Registration handshake.
//!
//! Wire grammar (spec.md §6): the first control frame on a new connection
//! must have `kind = Unknown` and a `tunnel_id` string holding a
//! pipe-delimited 4- or 5-tuple:
//!
//! ```text
//! subdomain|auth_token|local_addr|public_url[|saved_name]
//! ```
//!
//! [`Registration`] is the structured shape application code works with;
//! [`Registration::parse`]/[`Registration::serialize`] are the only code
//! that ever sees the pipe-delimited string, and
//! [`Registration::into_control_frame`]/[`Registration::from_control_frame`]
//! are the only code that ever sees a raw [`ControlFrame`] for this
//! purpose — everywhere else in the codebase matches on `Frame::Control`
//! only to recognize "this is (or isn't) a registration attempt".

use crate::frame::{ControlFrame, ControlKind};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub subdomain: String,
    pub auth_token: String,
    pub local_addr: String,
    pub public_url: String,
    pub saved_name: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("registration tuple must have 4 or 5 pipe-delimited parts, got {0}")]
    WrongArity(usize),
    #[error("control frame is not a registration frame")]
    NotRegistration,
}

impl Registration {
    pub fn parse(raw: &str) -> Result<Self, RegistrationError> {
        let parts: Vec<&str> = raw.split('|').collect();
        if parts.len() != 4 && parts.len() != 5 {
            return Err(RegistrationError::WrongArity(parts.len()));
        }
        Ok(Registration {
            subdomain: parts[0].to_string(),
            auth_token: parts[1].to_string(),
            local_addr: parts[2].to_string(),
            public_url: parts[3].to_string(),
            saved_name: parts.get(4).map(|s| s.to_string()),
        })
    }

    pub fn serialize(&self) -> String {
        match &self.saved_name {
            Some(name) => format!(
                "{}|{}|{}|{}|{}",
                self.subdomain, self.auth_token, self.local_addr, self.public_url, name
            ),
            None => format!(
                "{}|{}|{}|{}",
                self.subdomain, self.auth_token, self.local_addr, self.public_url
            ),
        }
    }

    pub fn into_control_frame(&self) -> ControlFrame {
        ControlFrame {
            kind: ControlKind::Unknown,
            tunnel_id: self.serialize(),
            metadata: Default::default(),
        }
    }

    pub fn from_control_frame(frame: &ControlFrame) -> Result<Self, RegistrationError> {
        if frame.kind != ControlKind::Unknown {
            return Err(RegistrationError::NotRegistration);
        }
        Registration::parse(&frame.tunnel_id)
    }
}

/// Builds the server's registration-reply control frame: `kind = Unknown`,
/// `tunnel_id` set to the server-assigned tunnel id, `metadata.public_url`
/// carrying the canonical URL (needed because TCP ports are server-assigned).
pub fn reply_frame(tunnel_id: &str, public_url: &str) -> ControlFrame {
    let mut metadata = std::collections::HashMap::new();
    metadata.insert("public_url".to_string(), public_url.to_string());
    ControlFrame {
        kind: ControlKind::Unknown,
        tunnel_id: tunnel_id.to_string(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(saved_name: Option<&str>) -> Registration {
        Registration {
            subdomain: "myapp".into(),
            auth_token: "tok_abc".into(),
            local_addr: "localhost:3000".into(),
            public_url: "https://myapp.example.com".into(),
            saved_name: saved_name.map(|s| s.to_string()),
        }
    }

    #[test]
    fn round_trip_four_parts() {
        let reg = sample(None);
        assert_eq!(Registration::parse(&reg.serialize()).unwrap(), reg);
    }

    #[test]
    fn round_trip_five_parts() {
        let reg = sample(Some("web-dev"));
        assert_eq!(Registration::parse(&reg.serialize()).unwrap(), reg);
    }

    #[test]
    fn rejects_wrong_arity() {
        assert_eq!(
            Registration::parse("a|b|c"),
            Err(RegistrationError::WrongArity(3))
        );
        assert_eq!(
            Registration::parse("a|b|c|d|e|f"),
            Err(RegistrationError::WrongArity(6))
        );
    }

    #[test]
    fn control_frame_round_trip() {
        let reg = sample(Some("web-dev"));
        let frame = reg.into_control_frame();
        assert_eq!(Registration::from_control_frame(&frame).unwrap(), reg);
    }
}
