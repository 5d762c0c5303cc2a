//! Webhook endpoints registered with the telephony provider.

use env_file::{EnvFile, EnvFileError};
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_API_PREFIX: &str = "/api/v1";
pub const API_PREFIX_KEY: &str = "API_V1_STR";

pub const VOICE_SUFFIX: &str = "/at/voice";
pub const EVENTS_SUFFIX: &str = "/at/events";
pub const DTMF_SUFFIX: &str = "/at/dtmf";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookUrls {
    pub voice: String,
    pub events: String,
    pub dtmf: String,
}

/// `public_url + api_prefix + suffix` for each endpoint. Both inputs are
/// used verbatim; no slashes are added or removed.
pub fn derive_endpoints(public_url: &str, api_prefix: &str) -> WebhookUrls {
    let base = format!("{}{}", public_url, api_prefix);
    WebhookUrls {
        voice: format!("{}{}", base, VOICE_SUFFIX),
        events: format!("{}{}", base, EVENTS_SUFFIX),
        dtmf: format!("{}{}", base, DTMF_SUFFIX),
    }
}

/// The API prefix configured in the env file, or [`DEFAULT_API_PREFIX`] when
/// the file or the key is absent.
pub fn resolve_api_prefix(env_file: &EnvFile) -> Result<String, EnvFileError> {
    match env_file.get(API_PREFIX_KEY) {
        Ok(Some(prefix)) => Ok(prefix),
        Ok(None) | Err(EnvFileError::Missing { .. }) => {
            debug!(default = DEFAULT_API_PREFIX, "api prefix not configured");
            Ok(DEFAULT_API_PREFIX.to_string())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn given_tunnel_url_and_default_prefix_when_derived_then_three_endpoints() {
        let urls = derive_endpoints("https://abc.trycloudflare.com", "/api/v1");

        assert_eq!(urls.voice, "https://abc.trycloudflare.com/api/v1/at/voice");
        assert_eq!(urls.events, "https://abc.trycloudflare.com/api/v1/at/events");
        assert_eq!(urls.dtmf, "https://abc.trycloudflare.com/api/v1/at/dtmf");
    }

    #[test]
    fn given_same_inputs_when_derived_twice_then_identical() {
        let first = derive_endpoints("https://x.trycloudflare.com", "/v2");
        let second = derive_endpoints("https://x.trycloudflare.com", "/v2");
        assert_eq!(first, second);
    }

    #[test]
    fn given_prefix_without_leading_slash_when_derived_then_used_verbatim() {
        let urls = derive_endpoints("https://x.trycloudflare.com", "api");
        assert_eq!(urls.voice, "https://x.trycloudflare.comapi/at/voice");
    }

    #[test]
    fn given_env_file_with_prefix_when_resolved_then_value_used() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "PROJECT=zeipo\nAPI_V1_STR=/api/v2\n").unwrap();

        let prefix = resolve_api_prefix(&EnvFile::new(&path)).unwrap();
        assert_eq!(prefix, "/api/v2");
    }

    #[test]
    fn given_missing_file_or_key_when_resolved_then_default_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");

        assert_eq!(resolve_api_prefix(&EnvFile::new(&path)).unwrap(), "/api/v1");

        std::fs::write(&path, "PROJECT=zeipo\n").unwrap();
        assert_eq!(resolve_api_prefix(&EnvFile::new(&path)).unwrap(), "/api/v1");
    }
}
