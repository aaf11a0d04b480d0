//! Heuristic signal checks
//!
//! Each check looks at one aspect of a published certificate and votes for
//! the kind of key it most likely belongs to. Checks are pure functions of the
//! principal and the certificate, so they can run on any task in any order.
//!
//! None of the checks is authoritative; [`super::precedence::resolve`] turns
//! the combined votes into a verdict.

use regex::Regex;
use std::sync::LazyLock;

use super::certificate::{Certificate, ExtKeyUsage, KeyUsage, PublicKeyAlgorithm, SignatureAlgorithm};
use super::types::{KeyKind, Signal};

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

/// Internal system-managed keys are valid for exactly 396h15m
pub const SYSTEM_MANAGED_VALIDITY_V1_SECS: i64 = 396 * HOUR + 15 * 60;

/// Newer system-managed keys get a random window strictly between these bounds
pub const SYSTEM_MANAGED_VALIDITY_V2_MIN_SECS: i64 = 365 * 2 * DAY;
pub const SYSTEM_MANAGED_VALIDITY_V2_MAX_SECS: i64 = (365 * 2 + 31) * DAY;

/// Legacy user-managed keys were issued with a 10 year (87600h) window
pub const LEGACY_USER_MANAGED_VALIDITY_SECS: i64 = 87600 * HOUR;

/// 9999-12-31T23:59:59Z, the NotAfter of user-managed keys without expiry
pub const NO_EXPIRY_NOT_AFTER: i64 = 253_402_300_799;

/// Windows allowed by `constraints/iam.serviceAccountKeyExpiryHours`
pub const KEY_EXPIRY_POLICY_SECS: [i64; 8] = [
    HOUR,
    8 * HOUR,
    24 * HOUR,
    168 * HOUR,
    336 * HOUR,
    720 * HOUR,
    1440 * HOUR,
    2160 * HOUR,
];

/// Maximum length of an X.509 common name
const MAX_CN_LEN: usize = 64;

static GAIA_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^1[0-9]{20}$").expect("GAIA ID pattern is valid"));

/// Run every check against one certificate.
///
/// Never returns an empty list: the validity check always votes.
pub fn classify(principal: &str, cert: &Certificate) -> Vec<Signal> {
    let mut signals = Vec::new();
    check_validity_period(cert, &mut signals);
    check_extensions(cert, &mut signals);
    check_names(principal, cert, &mut signals);
    check_crypto(cert, &mut signals);
    signals
}

/// Exactly one branch fires per certificate
pub fn check_validity_period(cert: &Certificate, signals: &mut Vec<Signal>) {
    let window = cert.validity_secs();

    let signal = if cert.not_after.timestamp() == NO_EXPIRY_NOT_AFTER {
        Signal::new(
            KeyKind::GoogleProvidedUserManaged,
            format!("Certificate has a NotAfter date of {}", cert.not_after),
        )
    } else if window == LEGACY_USER_MANAGED_VALIDITY_SECS {
        Signal::new(
            KeyKind::GoogleProvidedUserManaged,
            format!(
                "Certificate has a legacy 10y validity period of {}",
                format_window(window)
            ),
        )
    } else if window == SYSTEM_MANAGED_VALIDITY_V1_SECS {
        Signal::new(
            KeyKind::GoogleProvidedSystemManaged,
            format!(
                "Certificate has standard validity period of {}",
                format_window(window)
            ),
        )
    } else if KEY_EXPIRY_POLICY_SECS.contains(&window) {
        Signal::new(
            KeyKind::GoogleProvidedUserManaged,
            format!(
                "Certificate has a validity period in constraints/iam.serviceAccountKeyExpiryHours of {}",
                format_window(window)
            ),
        )
    } else if window > SYSTEM_MANAGED_VALIDITY_V2_MIN_SECS
        && window < SYSTEM_MANAGED_VALIDITY_V2_MAX_SECS
    {
        Signal::new(
            KeyKind::GoogleProvidedSystemManaged,
            format!(
                "Certificate has a validity period of {} which is between {} and {}",
                format_window(window),
                format_window(SYSTEM_MANAGED_VALIDITY_V2_MIN_SECS),
                format_window(SYSTEM_MANAGED_VALIDITY_V2_MAX_SECS)
            ),
        )
    } else {
        Signal::new(
            KeyKind::UserProvidedUserManaged,
            format!(
                "Certificate does not have a standard GCP validity window: {} ({} to {})",
                format_window(window),
                cert.not_before,
                cert.not_after
            ),
        )
    };

    signals.push(signal);
}

/// Platform keys carry exactly `clientAuth` and `digitalSignature`
pub fn check_extensions(cert: &Certificate, signals: &mut Vec<Signal>) {
    if cert.ext_key_usage != [ExtKeyUsage::ClientAuth] {
        let usages: Vec<String> = cert.ext_key_usage.iter().map(|u| u.to_string()).collect();
        signals.push(Signal::new(
            KeyKind::UserProvidedUserManaged,
            format!(
                "Certificate has unexpected ExtendedKeyUsage: [{}]",
                usages.join(", ")
            ),
        ));
    }

    if cert.key_usage != KeyUsage::DIGITAL_SIGNATURE {
        signals.push(Signal::new(
            KeyKind::UserProvidedUserManaged,
            format!("Certificate has unexpected KeyUsage: {}", cert.key_usage),
        ));
    }
}

/// Compare subject and issuer CN against the names the platform would use
pub fn check_names(principal: &str, cert: &Certificate, signals: &mut Vec<Signal>) {
    let expected_name = principal.replacen('@', ".", 1);
    let truncated_name: String = if expected_name.chars().count() >= MAX_CN_LEN {
        expected_name.chars().take(MAX_CN_LEN).collect()
    } else {
        String::new()
    };

    for (field, value) in [("SubjectCN", &cert.subject_cn), ("IssuerCN", &cert.issuer_cn)] {
        signals.push(check_name(field, value, &expected_name, &truncated_name));
    }
}

fn check_name(field: &str, value: &str, expected_name: &str, truncated_name: &str) -> Signal {
    if GAIA_ID.is_match(value) {
        Signal::new(
            KeyKind::GoogleProvidedUserManaged,
            format!("{} {} is a GAIA_ID", field, value),
        )
    } else if value == expected_name {
        Signal::new(
            KeyKind::GoogleProvidedSystemManaged,
            format!("{} {} matches expected name {}", field, value, expected_name),
        )
    } else if !truncated_name.is_empty() && value == truncated_name {
        Signal::new(
            KeyKind::GoogleProvidedSystemManaged,
            format!(
                "{} {} matches expected truncated name {}",
                field, value, truncated_name
            ),
        )
    } else {
        Signal::new(
            KeyKind::UserProvidedUserManaged,
            format!(
                "{} {} does not match any expected name {}",
                field, value, expected_name
            ),
        )
    }
}

/// Only ever votes against platform provenance.
///
/// Using the same parameters as platform-generated keys proves nothing, so
/// there is no positive `GOOGLE_PROVIDED/SYSTEM_MANAGED` vote here.
pub fn check_crypto(cert: &Certificate, signals: &mut Vec<Signal>) {
    match (&cert.public_key_algorithm, cert.rsa_modulus_bits) {
        (PublicKeyAlgorithm::Rsa, Some(_)) => {}
        // An RSA key without a readable modulus counts as not RSA
        (PublicKeyAlgorithm::Rsa, None) => signals.push(Signal::new(
            KeyKind::UserProvidedUserManaged,
            "RSA public key could not be parsed",
        )),
        (algorithm, _) => signals.push(Signal::new(
            KeyKind::UserProvidedUserManaged,
            format!("Public key algorithm {} is not RSA", algorithm),
        )),
    }

    if cert.signature_algorithm != SignatureAlgorithm::Sha1WithRsa {
        signals.push(Signal::new(
            KeyKind::UserProvidedUserManaged,
            format!(
                "Signature algorithm {} is not SHA1WithRSA",
                cert.signature_algorithm
            ),
        ));
    }

    match cert.rsa_modulus_bits {
        Some(1024) => signals.push(Signal::new(
            KeyKind::GoogleProvidedUserManaged,
            "Public key length is 1024",
        )),
        Some(2048) | None => {}
        Some(bits) => signals.push(Signal::new(
            KeyKind::UserProvidedUserManaged,
            format!("Public key length {} is not 2048 or 1024", bits),
        )),
    }
}

/// Render a window the way durations are usually written, e.g. `396h15m0s`
pub fn format_window(secs: i64) -> String {
    let sign = if secs < 0 { "-" } else { "" };
    let secs = secs.unsigned_abs();
    format!(
        "{}{}h{}m{}s",
        sign,
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

#[cfg(test)]
pub(crate) mod test_utils {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::super::certificate::{
        Certificate, ExtKeyUsage, KeyUsage, PublicKeyAlgorithm, SignatureAlgorithm,
    };

    pub const SA: &str = "builder@example-project.iam.gserviceaccount.com";
    pub const SA_CN: &str = "builder.example-project.iam.gserviceaccount.com";

    pub fn not_before() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    /// A certificate matching every platform parameter for a system-managed key
    pub fn system_managed_cert() -> Certificate {
        Certificate {
            raw: vec![0x30],
            serial_number: "123456789".to_string(),
            not_before: not_before(),
            not_after: not_before() + Duration::seconds(super::SYSTEM_MANAGED_VALIDITY_V1_SECS),
            subject_cn: SA_CN.to_string(),
            issuer_cn: SA_CN.to_string(),
            public_key_algorithm: PublicKeyAlgorithm::Rsa,
            rsa_modulus_bits: Some(2048),
            signature_algorithm: SignatureAlgorithm::Sha1WithRsa,
            key_usage: KeyUsage::DIGITAL_SIGNATURE,
            ext_key_usage: vec![ExtKeyUsage::ClientAuth],
        }
    }

    pub fn with_window(secs: i64) -> Certificate {
        let mut cert = system_managed_cert();
        cert.not_after = cert.not_before + Duration::seconds(secs);
        cert
    }
}
