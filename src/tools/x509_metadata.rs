//! Public x509 certificate endpoint
//!
//! `https://www.googleapis.com/service_accounts/v1/metadata/x509/{email}`
//! serves every public key of a service account as a JSON object mapping key
//! ID to a PEM certificate. No credentials are needed.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;

use crate::agents::key_audit::certificate::Certificate;
use crate::agents::key_audit::fetch::CertificateSource;
use crate::agents::key_audit::types::{FetchError, ServiceAccountCerts};

const X509_METADATA_URL: &str = "https://www.googleapis.com/service_accounts/v1/metadata/x509";

pub struct X509MetadataClient {
    http_client: Client,
    base_url: String,
}

impl X509MetadataClient {
    pub fn new(http_client: Client) -> Self {
        Self {
            http_client,
            base_url: X509_METADATA_URL.to_string(),
        }
    }

    pub fn url_for(&self, principal: &str) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(principal))
    }
}

#[async_trait]
impl CertificateSource for X509MetadataClient {
    async fn fetch_certificates(&self, principal: &str) -> Result<ServiceAccountCerts, FetchError> {
        let response = self
            .http_client
            .get(self.url_for(principal))
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound),
            status => return Err(FetchError::BadStatus(status.as_u16())),
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;
        parse_certificate_map(&body)
    }
}

/// Parse the `{keyID: PEM}` response body. One bad certificate fails the
/// whole principal.
pub fn parse_certificate_map(body: &str) -> Result<ServiceAccountCerts, FetchError> {
    let pems: HashMap<String, String> =
        serde_json::from_str(body).map_err(|e| FetchError::InvalidBody(e.to_string()))?;

    pems.into_iter()
        .map(|(key_id, pem)| match Certificate::from_pem(&pem) {
            Ok(cert) => Ok((key_id, cert)),
            Err(source) => Err(FetchError::Certificate { key_id, source }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::key_audit::certificate::test_utils::generate_test_cert_pem;
    use crate::agents::key_audit::certificate::CertificateError;
    use serde_json::json;

    #[test]
    fn test_url_encodes_principal() {
        let client = X509MetadataClient::new(Client::new());
        assert_eq!(
            client.url_for("builder@example-project.iam.gserviceaccount.com"),
            "https://www.googleapis.com/service_accounts/v1/metadata/x509/builder%40example-project.iam.gserviceaccount.com"
        );
    }

    #[test]
    fn test_parse_certificate_map() {
        let body = json!({
            "0123abcd": generate_test_cert_pem("first"),
            "4567ef01": generate_test_cert_pem("second"),
        })
        .to_string();

        let certs = parse_certificate_map(&body).unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs["0123abcd"].subject_cn, "first");
        assert_eq!(certs["4567ef01"].subject_cn, "second");
    }

    #[test]
    fn test_empty_map_is_not_an_error() {
        assert!(parse_certificate_map("{}").unwrap().is_empty());
    }

    #[test]
    fn test_bad_certificate_fails_principal() {
        let body = json!({
            "good": generate_test_cert_pem("good"),
            "bad": "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n",
        })
        .to_string();

        match parse_certificate_map(&body).unwrap_err() {
            FetchError::Certificate { key_id, source } => {
                assert_eq!(key_id, "bad");
                assert!(matches!(source, CertificateError::WrongBlockType(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_non_json_body() {
        assert!(matches!(
            parse_certificate_map("<html>").unwrap_err(),
            FetchError::InvalidBody(_)
        ));
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_unknown_principal_is_not_found() {
        let client = X509MetadataClient::new(Client::new());
        let err = client
            .fetch_certificates("does-not-exist-4f1c@example-project.iam.gserviceaccount.com")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound));
    }
}
