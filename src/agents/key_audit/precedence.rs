//! Signal precedence resolution
//!
//! Reduces the votes of the signal checks to a single kind. The most
//! suspicious kind wins:
//!
//! 1. `USER_PROVIDED/USER_MANAGED`
//! 2. `GOOGLE_PROVIDED/USER_MANAGED`
//! 3. `GOOGLE_PROVIDED/SYSTEM_MANAGED`
//!
//! (`USER_PROVIDED/SYSTEM_MANAGED` does not exist.)

use super::certificate::Certificate;
use super::signals::classify;
use super::types::{AuditError, KeyKind, KeyRecord, Signal};

/// Resolve a non-empty signal list to the highest-precedence kind it contains.
///
/// An empty list means the validity check did not vote, which is a bug.
pub fn resolve(signals: &[Signal]) -> Result<KeyKind, AuditError> {
    let (first, rest) = signals.split_first().ok_or_else(|| {
        AuditError::InvariantViolation("no signals found for key".to_string())
    })?;

    let mut kind = first.kind;
    for signal in rest {
        if signal.kind.outranks(kind) {
            kind = signal.kind;
        }
    }
    Ok(kind)
}

impl KeyRecord {
    /// Run every check on `cert` and resolve the result
    pub fn from_certificate(
        principal: &str,
        key_id: &str,
        cert: &Certificate,
    ) -> Result<Self, AuditError> {
        let signals = classify(principal, cert);
        let kind = resolve(&signals)?;

        Ok(Self {
            key_id: key_id.to_string(),
            serial_number: cert.serial_number.clone(),
            kind,
            signals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::signals::test_utils::{system_managed_cert, SA};
    use super::*;

    fn signals(kinds: &[KeyKind]) -> Vec<Signal> {
        kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| Signal::new(*kind, format!("signal {}", i)))
            .collect()
    }

    /// Every ordering of a small list, by repeated insertion
    fn permutations(kinds: &[KeyKind]) -> Vec<Vec<KeyKind>> {
        let Some((head, tail)) = kinds.split_first() else {
            return vec![vec![]];
        };
        let mut out = Vec::new();
        for perm in permutations(tail) {
            for i in 0..=perm.len() {
                let mut p = perm.clone();
                p.insert(i, *head);
                out.push(p);
            }
        }
        out
    }

    #[test]
    fn test_empty_signals_is_invariant_violation() {
        let err = resolve(&[]).unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_single_signal() {
        for kind in KeyKind::PRECEDENCE {
            assert_eq!(resolve(&signals(&[kind])).unwrap(), kind);
        }
    }

    #[test]
    fn test_most_suspicious_kind_wins_in_any_order() {
        let mixed = [
            KeyKind::GoogleProvidedSystemManaged,
            KeyKind::GoogleProvidedUserManaged,
            KeyKind::UserProvidedUserManaged,
            KeyKind::GoogleProvidedSystemManaged,
        ];
        for perm in permutations(&mixed) {
            assert_eq!(
                resolve(&signals(&perm)).unwrap(),
                KeyKind::UserProvidedUserManaged,
                "order {:?}",
                perm
            );
        }

        let google_only = [
            KeyKind::GoogleProvidedSystemManaged,
            KeyKind::GoogleProvidedUserManaged,
            KeyKind::GoogleProvidedSystemManaged,
        ];
        for perm in permutations(&google_only) {
            assert_eq!(
                resolve(&signals(&perm)).unwrap(),
                KeyKind::GoogleProvidedUserManaged
            );
        }
    }

    #[test]
    fn test_gaia_subject_resolves_to_user_managed() {
        let mut cert = system_managed_cert();
        cert.subject_cn = "100000000000000000001".to_string();

        let record = KeyRecord::from_certificate(SA, "abc123", &cert).unwrap();
        assert_eq!(record.kind, KeyKind::GoogleProvidedUserManaged);
        assert_eq!(record.key_id, "abc123");
        assert_eq!(record.serial_number, "123456789");
        assert!(record
            .signals
            .iter()
            .any(|s| s.kind == KeyKind::GoogleProvidedSystemManaged));
    }

    #[test]
    fn test_standard_certificate_resolves_to_system_managed() {
        let record = KeyRecord::from_certificate(SA, "k", &system_managed_cert()).unwrap();
        assert_eq!(record.kind, KeyKind::GoogleProvidedSystemManaged);
    }
}
