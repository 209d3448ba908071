//! Identity extraction from the verified peer certificate.
//!
//! The TLS layer has already validated the chain against the configured CA;
//! this interceptor only decides who the caller is. The subject must carry
//! `CN=client` and a `(O, OU, L)` triple of `("Teleport", "workernator",
//! <username>)`; the username must exist in the ACL. Anything else is
//! `Unauthenticated`.

use std::sync::Arc;

use tonic::{Request, Status};
use x509_parser::oid_registry::{
    OID_X509_LOCALITY_NAME, OID_X509_ORGANIZATIONAL_UNIT, OID_X509_ORGANIZATION_NAME,
};
use x509_parser::prelude::*;

use crate::services::jobservice::authz::Acl;

const EXPECTED_COMMON_NAME: &str = "client";
const EXPECTED_ORG: &str = "Teleport";
const EXPECTED_ORG_UNIT: &str = "workernator";

/// The authenticated username, attached to every request that passes the
/// interceptor.
#[derive(Clone, Debug)]
pub struct UserExtension {
    pub username: String,
}

/// Tonic interceptor: extract the username from the client certificate and
/// stash it in the request extensions for the service handlers.
pub fn authenticate(mut req: Request<()>, acl: &Arc<Acl>) -> Result<Request<()>, Status> {
    let certs = req
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("request missing client certificate"))?;
    let der = certs
        .first()
        .ok_or_else(|| Status::unauthenticated("request missing client certificate"))?
        .clone();

    let (rem, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|_| Status::unauthenticated("bad client certificate"))?;
    if !rem.is_empty() {
        return Err(Status::unauthenticated("bad client certificate"));
    }

    let username = username_from_subject(cert.subject())?;
    if !acl.contains_user(&username) {
        return Err(Status::unauthenticated("user not found in ACL"));
    }

    req.extensions_mut().insert(UserExtension { username });
    Ok(req)
}

/// Apply the subject rules and return the username (the locality of the
/// first matching `(O, OU, L)` triple).
pub fn username_from_subject(subject: &X509Name<'_>) -> Result<String, Status> {
    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok());
    if common_name != Some(EXPECTED_COMMON_NAME) {
        return Err(Status::unauthenticated("certificate is not a client certificate"));
    }

    let orgs: Vec<&str> = subject
        .iter_by_oid(&OID_X509_ORGANIZATION_NAME)
        .filter_map(|attr| attr.as_str().ok())
        .collect();
    let units: Vec<&str> = subject
        .iter_by_oid(&OID_X509_ORGANIZATIONAL_UNIT)
        .filter_map(|attr| attr.as_str().ok())
        .collect();
    let localities: Vec<&str> = subject
        .iter_by_oid(&OID_X509_LOCALITY_NAME)
        .filter_map(|attr| attr.as_str().ok())
        .collect();

    for (i, org) in orgs.iter().enumerate() {
        if *org != EXPECTED_ORG {
            continue;
        }
        match (units.get(i), localities.get(i)) {
            (Some(&unit), Some(&locality)) if unit == EXPECTED_ORG_UNIT => {
                return Ok(locality.to_string());
            }
            _ => continue,
        }
    }

    Err(Status::unauthenticated(
        "certificate subject carries no workernator identity",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject_of(der: &'static [u8]) -> Result<String, Status> {
        let (_, cert) = X509Certificate::from_der(der).expect("parse fixture");
        username_from_subject(cert.subject())
    }

    #[test]
    fn username_comes_from_the_matching_locality() {
        let der: &[u8] = include_bytes!("../../tls/data/client_alice.der");
        let (_, cert) = X509Certificate::from_der(der).expect("parse fixture");
        assert_eq!(
            username_from_subject(cert.subject()).expect("extract username"),
            "alice"
        );
    }

    #[test]
    fn non_client_common_name_is_rejected() {
        let err = subject_of(include_bytes!("../../tls/data/client_bad_cn.der"))
            .expect_err("CN=server must be rejected");
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn wrong_organization_is_rejected() {
        let err = subject_of(include_bytes!("../../tls/data/client_wrong_org.der"))
            .expect_err("unknown org must be rejected");
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }
}
