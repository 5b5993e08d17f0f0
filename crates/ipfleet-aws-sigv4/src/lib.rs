//! AWS Signature Version 4 for `POST /` API calls.
//!
//! Shared by the Lightsail (JSON 1.1) and EC2 (Query) providers. The caller
//! names the headers it sends besides `host` and `x-amz-date`; all of them
//! are signed.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use ipfleet_core::{Error, Result};
use sha2::{Digest, Sha256};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

pub struct Credentials<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
}

/// Headers to send with the signed request
#[derive(Debug, Clone)]
pub struct Signature {
    pub amz_date: String,
    pub authorization: String,
}

/// Where and what a request is signed for
pub struct Scope<'a> {
    pub host: &'a str,
    pub region: &'a str,
    pub service: &'a str,
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| Error::auth(format!("invalid signing key: {}", e)))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// `kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")`
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date)?;
    let k_region = hmac(&k_date, region)?;
    let k_service = hmac(&k_region, service)?;
    hmac(&k_service, "aws4_request")
}

impl Credentials<'_> {
    /// Sign a `POST /` request with an empty query string
    pub fn sign(
        &self,
        now: DateTime<Utc>,
        scope: &Scope<'_>,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<Signature> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut signed: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
            .collect();
        signed.push(("host".to_string(), scope.host.to_string()));
        signed.push(("x-amz-date".to_string(), amz_date.clone()));
        signed.sort();

        let canonical_headers: String = signed
            .iter()
            .map(|(name, value)| format!("{}:{}\n", name, value))
            .collect();
        let signed_headers = signed
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "POST\n/\n\n{}\n{}\n{}",
            canonical_headers,
            signed_headers,
            hex::encode(Sha256::digest(body))
        );

        let credential_scope = format!("{}/{}/{}/aws4_request", date, scope.region, scope.service);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = signing_key(self.secret_access_key, &date, scope.region, scope.service)?;
        let signature = hex::encode(hmac(&key, &string_to_sign)?);

        Ok(Signature {
            authorization: format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                ALGORITHM, self.access_key_id, credential_scope, signed_headers, signature
            ),
            amz_date,
        })
    }
}
