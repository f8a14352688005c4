//! API key resolution for the main LLM endpoint

use hearth_core::{HearthError, Result};

/// Read the API key from the named environment variable
///
/// Empty values count as missing.
pub fn api_key_from_env(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err(HearthError::MissingApiKey(format!(
            "set {} to the API key of the LLM endpoint",
            var
        ))),
    }
}
