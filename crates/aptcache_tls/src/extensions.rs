//! Hand-built DER for the two X.509 extensions the spec asks for that
//! `rcgen`'s high-level builder doesn't expose: Authority Information Access
//! and CRL Distribution Points (spec.md §4.9 step 4).

use rcgen::CustomExtension;

const OID_AUTHORITY_INFO_ACCESS: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 1];
const OID_CRL_DISTRIBUTION_POINTS: &[u64] = &[2, 5, 29, 31];
const OID_CA_ISSUERS: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 48, 2];

/// `id-ad-caIssuers` pointing at `aia_url`, non-critical (RFC 5280 §4.2.2.1).
pub fn authority_info_access(aia_url: &str) -> CustomExtension {
    let der = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&yasna::models::ObjectIdentifier::from_slice(
                        OID_CA_ISSUERS,
                    ));
                writer
                    .next()
                    .write_tagged_implicit(yasna::Tag::context(6), |writer| {
                        writer.write_ia5_string(aia_url);
                    });
            });
        });
    });
    let mut ext = CustomExtension::from_oid_content(OID_AUTHORITY_INFO_ACCESS, der);
    ext.set_criticality(false);
    ext
}

/// A single CRL distribution point carrying `crl_url` as a `fullName` URI,
/// non-critical (RFC 5280 §4.2.1.13).
pub fn crl_distribution_point(crl_url: &str) -> CustomExtension {
    let der = yasna::construct_der(|writer| {
        // CRLDistributionPoints ::= SEQUENCE SIZE (1..MAX) OF DistributionPoint
        writer.write_sequence(|writer| {
            writer.next().write_sequence(|writer| {
                // distributionPoint [0] DistributionPointName
                writer.next().write_tagged(yasna::Tag::context(0), |writer| {
                    // fullName [0] GeneralNames
                    writer.write_tagged_implicit(yasna::Tag::context(0), |writer| {
                        writer.write_sequence(|writer| {
                            // uniformResourceIdentifier [6] IA5String
                            writer
                                .next()
                                .write_tagged_implicit(yasna::Tag::context(6), |writer| {
                                    writer.write_ia5_string(crl_url);
                                });
                        });
                    });
                });
            });
        });
    });
    let mut ext = CustomExtension::from_oid_content(OID_CRL_DISTRIBUTION_POINTS, der);
    ext.set_criticality(false);
    ext
}
