//! HMAC request signing for vendors that authenticate the socket URL itself.
//!
//! The signed origin is the three-line header block
//!
//! ```text
//! host: {host}
//! date: {rfc1123 date}
//! GET {path} HTTP/1.1
//! ```
//!
//! signed with HMAC-SHA256 under the API secret. The resulting authorization
//! string travels base64-encoded in the query, next to `date` and `host`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::Sha256;

use crate::error::{PipelineError, PipelineResult};

type HmacSha256 = Hmac<Sha256>;

/// `Date` header format, always in GMT.
pub fn rfc1123(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Base64 HMAC-SHA256 of `message` under `secret`.
pub fn hmac_sha256_base64(secret: &str, message: &str) -> PipelineResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PipelineError::Config(format!("invalid signing key: {e}")))?;
    mac.update(message.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Credentials and endpoint for one signed socket.
#[derive(Debug, Clone)]
pub struct SignedEndpoint<'a> {
    pub host: &'a str,
    pub path: &'a str,
    pub api_key: &'a str,
    pub api_secret: &'a str,
    pub tls: bool,
}

impl SignedEndpoint<'_> {
    /// Build the signed `ws(s)://` URL for a connection made at `at`.
    pub fn url(&self, at: DateTime<Utc>) -> PipelineResult<Url> {
        let date = rfc1123(at);
        let origin = format!(
            "host: {}\ndate: {date}\nGET {} HTTP/1.1",
            self.host, self.path
        );
        let signature = hmac_sha256_base64(self.api_secret, &origin)?;
        let authorization = format!(
            r#"api_key="{}", algorithm="hmac-sha256", headers="host date request-line", signature="{signature}""#,
            self.api_key
        );

        let scheme = if self.tls { "wss" } else { "ws" };
        Url::parse_with_params(
            &format!("{scheme}://{}{}", self.host, self.path),
            &[
                ("authorization", STANDARD.encode(authorization)),
                ("date", date),
                ("host", self.host.to_string()),
            ],
        )
        .map_err(|e| PipelineError::Config(format!("invalid endpoint {}: {e}", self.host)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rfc1123_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(rfc1123(at), "Tue, 05 Mar 2024 07:08:09 GMT");
    }

    #[test]
    fn hmac_known_vector() {
        let sig = hmac_sha256_base64("key", "The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(sig, "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=");
    }

    #[test]
    fn signed_url_carries_query() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let endpoint = SignedEndpoint {
            host: "iat-api.xfyun.cn",
            path: "/v2/iat",
            api_key: "k123",
            api_secret: "s456",
            tls: true,
        };
        let url = endpoint.url(at).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/v2/iat");

        let query: std::collections::HashMap<String, String> =
            url.query_pairs().into_owned().collect();
        assert_eq!(query["host"], "iat-api.xfyun.cn");
        assert_eq!(query["date"], "Tue, 05 Mar 2024 07:08:09 GMT");

        let auth = String::from_utf8(STANDARD.decode(&query["authorization"]).unwrap()).unwrap();
        assert!(auth.starts_with(r#"api_key="k123", algorithm="hmac-sha256""#));

        let origin = "host: iat-api.xfyun.cn\ndate: Tue, 05 Mar 2024 07:08:09 GMT\nGET /v2/iat HTTP/1.1";
        let expected = hmac_sha256_base64("s456", origin).unwrap();
        assert!(auth.contains(&format!(r#"signature="{expected}""#)));
    }

    #[test]
    fn plain_scheme_for_local_hosts() {
        let endpoint = SignedEndpoint {
            host: "127.0.0.1:9000",
            path: "/v2/tts",
            api_key: "k",
            api_secret: "s",
            tls: false,
        };
        let url = endpoint.url(Utc::now()).unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(9000));
    }
}
