use crate::errors::CqlResponseKind;
use crate::frame::frame_errors::CqlResponseParseError;
use crate::frame::types;
use std::collections::HashMap;

#[derive(Debug)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let options = types::read_string_multimap(buf)
            .map_err(CqlResponseParseError::body(CqlResponseKind::Supported))?;

        Ok(Supported { options })
    }

    /// Whether the server offered the given value for the given option.
    pub fn offers(&self, option: &str, value: &str) -> bool {
        self.options
            .get(option)
            .is_some_and(|values| values.iter().any(|v| v == value))
    }
}
