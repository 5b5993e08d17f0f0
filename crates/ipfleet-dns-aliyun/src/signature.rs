//! ACS3-HMAC-SHA256 request signing for Alibaba Cloud OpenAPI (V3 signature).
//!
//! Parameters travel in the query string and the body is empty, so the
//! payload hash is always the SHA-256 of the empty string.

use hmac::{Hmac, Mac};
use ipfleet_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub(crate) const ALGORITHM: &str = "ACS3-HMAC-SHA256";

/// Alidns API version
pub(crate) const API_VERSION: &str = "2015-01-09";

/// Query string and headers of a signed request
#[derive(Debug)]
pub(crate) struct SignedRequest {
    pub query: String,
    pub headers: Vec<(String, String)>,
}

pub(crate) struct Signer<'a> {
    pub access_key_id: &'a str,
    pub access_key_secret: &'a str,
}

impl Signer<'_> {
    /// Sign one call. `date` is `%Y-%m-%dT%H:%M:%SZ` in UTC.
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        action: &str,
        params: &BTreeMap<String, String>,
        date: &str,
        nonce: &str,
    ) -> Result<SignedRequest> {
        let query = canonical_query(params);
        let payload_hash = hex::encode(Sha256::digest(b""));

        let mut headers = BTreeMap::new();
        headers.insert("host", host.to_string());
        headers.insert("x-acs-action", action.to_string());
        headers.insert("x-acs-content-sha256", payload_hash.clone());
        headers.insert("x-acs-date", date.to_string());
        headers.insert("x-acs-signature-nonce", nonce.to_string());
        headers.insert("x-acs-version", API_VERSION.to_string());

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();
        let signed_headers = headers.keys().copied().collect::<Vec<_>>().join(";");

        let canonical_request = format!(
            "{}\n/\n{}\n{}\n{}\n{}",
            method, query, canonical_headers, signed_headers, payload_hash
        );
        let string_to_sign = format!(
            "{}\n{}",
            ALGORITHM,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let mut mac = Hmac::<Sha256>::new_from_slice(self.access_key_secret.as_bytes())
            .map_err(|e| Error::auth(format!("invalid signing key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let authorization = format!(
            "{} Credential={},SignedHeaders={},Signature={}",
            ALGORITHM, self.access_key_id, signed_headers, signature
        );

        // host is sent by the HTTP client itself
        let mut out: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(k, _)| *k != "host")
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        out.push(("authorization".to_string(), authorization));

        Ok(SignedRequest {
            query,
            headers: out,
        })
    }
}

/// Sorted, RFC 3986 encoded `key=value` pairs joined by `&`
pub(crate) fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

pub(crate) fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("DomainName".to_string(), "example.com".to_string());
        params.insert("PageSize".to_string(), "500".to_string());
        params.insert("PageNumber".to_string(), "1".to_string());
        params
    }

    fn signer() -> Signer<'static> {
        Signer {
            access_key_id: "LTAIexample",
            access_key_secret: "secret",
        }
    }

    #[test]
    fn test_percent_encoding() {
        assert_eq!(percent_encode("a b*~"), "a%20b%2A~");
        assert_eq!(percent_encode("proxy.example-1_x"), "proxy.example-1_x");
        assert_eq!(percent_encode("2001:db8::1"), "2001%3Adb8%3A%3A1");
        assert_eq!(percent_encode("中"), "%E4%B8%AD");
    }

    #[test]
    fn test_canonical_query_is_sorted() {
        assert_eq!(
            canonical_query(&params()),
            "DomainName=example.com&PageNumber=1&PageSize=500"
        );
    }

    #[test]
    fn test_authorization_header_shape() {
        let signed = signer()
            .sign(
                "POST",
                "alidns.aliyuncs.com",
                "DescribeDomainRecords",
                &params(),
                "2024-01-01T00:00:00Z",
                "nonce-1",
            )
            .unwrap();

        let auth = signed
            .headers
            .iter()
            .find(|(k, _)| k == "authorization")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(auth.starts_with(
            "ACS3-HMAC-SHA256 Credential=LTAIexample,SignedHeaders=host;x-acs-action;x-acs-content-sha256;x-acs-date;x-acs-signature-nonce;x-acs-version,Signature="
        ));
        let signature = auth.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(!signed.headers.iter().any(|(k, _)| k == "host"));
        assert!(!auth.contains("secret"));
    }

    #[test]
    fn test_signature_depends_on_every_input() {
        let sign = |secret: &str, nonce: &str, action: &str| {
            Signer {
                access_key_id: "LTAIexample",
                access_key_secret: secret,
            }
            .sign(
                "POST",
                "alidns.aliyuncs.com",
                action,
                &params(),
                "2024-01-01T00:00:00Z",
                nonce,
            )
            .unwrap()
            .headers
            .into_iter()
            .find(|(k, _)| k == "authorization")
            .unwrap()
            .1
        };

        let base = sign("secret", "n1", "DescribeDomainRecords");
        assert_eq!(base, sign("secret", "n1", "DescribeDomainRecords"));
        assert_ne!(base, sign("other", "n1", "DescribeDomainRecords"));
        assert_ne!(base, sign("secret", "n2", "DescribeDomainRecords"));
        assert_ne!(base, sign("secret", "n1", "DeleteDomainRecord"));
    }
}
