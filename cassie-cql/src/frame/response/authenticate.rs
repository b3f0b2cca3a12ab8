use crate::errors::CqlResponseKind;
use crate::frame::frame_errors::CqlResponseParseError;
use crate::frame::types;

// Implements Authenticate message.
#[derive(Debug)]
pub struct Authenticate {
    pub authenticator_name: String,
}

impl Authenticate {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let authenticator_name = types::read_string(buf)
            .map_err(CqlResponseParseError::body(CqlResponseKind::Authenticate))?
            .to_string();

        Ok(Authenticate { authenticator_name })
    }
}

#[derive(Debug)]
pub struct AuthSuccess {
    pub success_message: Option<Vec<u8>>,
}

impl AuthSuccess {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let success_message = types::read_bytes_opt(buf)
            .map_err(CqlResponseParseError::body(CqlResponseKind::AuthSuccess))?
            .map(ToOwned::to_owned);

        Ok(AuthSuccess { success_message })
    }
}

#[derive(Debug)]
pub struct AuthChallenge {
    pub authenticate_message: Option<Vec<u8>>,
}

impl AuthChallenge {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let authenticate_message = types::read_bytes_opt(buf)
            .map_err(CqlResponseParseError::body(CqlResponseKind::AuthChallenge))?
            .map(ToOwned::to_owned);

        Ok(AuthChallenge {
            authenticate_message,
        })
    }
}
