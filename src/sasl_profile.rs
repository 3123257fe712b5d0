//! SASL profiles for the security layer negotiation.
//!
//! Only PLAIN and ANONYMOUS are spoken. The profile is chosen from the
//! configured credentials and validated against the mechanisms the server
//! advertises.

use bytes::BufMut;
use fe2o3_amqp_types::{
    primitives::{Binary, Symbol},
    sasl::{SaslInit, SaslMechanisms},
};

pub(crate) const ANONYMOUS: &str = "ANONYMOUS";
pub(crate) const PLAIN: &str = "PLAIN";

/// Error during SASL negotiation at the profile level.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server does not offer the mechanism this profile implements
    #[error("Mechanism {0:?} is not offered by the server")]
    MechanismNotOffered(Symbol),

    /// The server sent a frame this profile cannot answer
    #[error("Unexpected SASL frame: {0}")]
    UnexpectedFrame(&'static str),
}

/// SASL profile selected from the connection configuration.
#[derive(Debug, Clone)]
pub enum SaslProfile {
    /// ANONYMOUS mechanism, used when no credentials are configured
    Anonymous,

    /// PLAIN mechanism
    Plain {
        /// Authentication identity
        username: String,
        /// Password
        password: String,
    },
}

impl SaslProfile {
    /// Chooses a profile from optional credentials.
    pub fn from_credentials(username: Option<&str>, password: Option<&str>) -> Self {
        match username {
            Some(username) => Self::Plain {
                username: username.to_string(),
                password: password.unwrap_or_default().to_string(),
            },
            None => Self::Anonymous,
        }
    }

    pub(crate) fn mechanism(&self) -> Symbol {
        match self {
            SaslProfile::Anonymous => Symbol::from(ANONYMOUS),
            SaslProfile::Plain { .. } => Symbol::from(PLAIN),
        }
    }

    fn initial_response(&self) -> Option<Binary> {
        match self {
            SaslProfile::Anonymous => None,
            SaslProfile::Plain { username, password } => {
                let mut buf = Vec::with_capacity(username.len() + password.len() + 2);
                buf.put_u8(0);
                buf.put_slice(username.as_bytes());
                buf.put_u8(0);
                buf.put_slice(password.as_bytes());
                Some(Binary::from(buf))
            }
        }
    }

    /// Builds the sasl-init answering the server's mechanism announcement.
    pub(crate) fn on_mechanisms(
        &self,
        mechanisms: &SaslMechanisms,
        hostname: Option<&str>,
    ) -> Result<SaslInit, Error> {
        let mechanism = self.mechanism();
        if !mechanisms.sasl_server_mechanisms.0.contains(&mechanism) {
            return Err(Error::MechanismNotOffered(mechanism));
        }
        Ok(SaslInit {
            mechanism,
            initial_response: self.initial_response(),
            hostname: hostname.map(Into::into),
        })
    }
}
