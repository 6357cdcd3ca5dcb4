//! Chain building over a CVCA, document verifier and terminal hierarchy

use eid_cvc::{
    AccessRight, AccessRole, ChainBuilder, Chat, CvCertificate, CvCertificateBuilder, CvcPublicKey,
    TrustAnchors,
};
use p256::ecdsa::SigningKey;
use time::{Date, macros::date};

const TODAY: Date = date!(2025 - 03 - 15);

struct Hierarchy {
    root_102: CvCertificate,
    root_103: CvCertificate,
    link_103: CvCertificate,
    dv: CvCertificate,
    terminal: CvCertificate,
}

fn key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).unwrap()
}

fn issue(
    car: &str,
    chr: &str,
    role: AccessRole,
    subject: u8,
    issuer: u8,
    validity: (Date, Date),
) -> CvCertificate {
    let rights = [AccessRight::AgeVerification, AccessRight::ReadDg04, AccessRight::ReadDg05];
    CvCertificateBuilder::new(
        car,
        chr,
        Chat::authentication_terminal(role, rights),
        key(subject).verifying_key(),
        validity.0,
        validity.1,
    )
    .sign(&key(issuer))
    .unwrap()
}

fn hierarchy(dv_validity: (Date, Date)) -> Hierarchy {
    let long = (date!(2020 - 01 - 01), date!(2029 - 12 - 31));
    Hierarchy {
        root_102: issue("DECVCAeID00102", "DECVCAeID00102", AccessRole::Cvca, 1, 1, long),
        root_103: issue("DECVCAeID00103", "DECVCAeID00103", AccessRole::Cvca, 2, 2, long),
        link_103: issue("DECVCAeID00102", "DECVCAeID00103", AccessRole::Cvca, 2, 1, long),
        dv: issue("DECVCAeID00103", "DEDVeIDDTR101", AccessRole::DvOfficialDomestic, 3, 2, dv_validity),
        terminal: issue(
            "DEDVeIDDTR101",
            "DEDEMOPAA00001",
            AccessRole::Terminal,
            4,
            3,
            (date!(2025 - 03 - 01), date!(2025 - 03 - 31)),
        ),
    }
}

fn valid_hierarchy() -> Hierarchy {
    hierarchy((date!(2025 - 01 - 01), date!(2025 - 12 - 31)))
}

#[test]
fn build_chain_from_current_root() {
    let certs = valid_hierarchy();
    let anchors = TrustAnchors::new([certs.root_103.clone()]);
    let mut builder =
        ChainBuilder::new([certs.terminal.clone(), certs.dv.clone()], anchors).with_validation_date(TODAY);

    let chain = builder.chain_for("DECVCAeID00103").unwrap();
    let references: Vec<_> = chain.iter().map(|cert| cert.chr().to_owned()).collect();
    assert_eq!(references, ["DEDVeIDDTR101", "DEDEMOPAA00001"]);
    assert_eq!(chain.terminal(), &certs.terminal);
    assert!(chain.is_valid_on(TODAY));

    // every link is signed by its predecessor
    let mut issuer = CvcPublicKey::clone(chain.anchor().public_key());
    for link in chain.iter() {
        link.verify_signature(&issuer).unwrap();
        issuer = link.public_key().clone();
    }
}

#[test]
fn build_chain_through_link_certificate() {
    let certs = valid_hierarchy();
    let anchors = TrustAnchors::new([certs.root_102.clone(), certs.root_103.clone()]);
    let mut builder = ChainBuilder::new(
        [certs.terminal.clone(), certs.dv.clone(), certs.link_103.clone()],
        anchors,
    )
    .with_validation_date(TODAY);

    let chain = builder.chain_for("DECVCAeID00102").unwrap();
    let references: Vec<_> = chain.iter().map(|cert| cert.chr()).collect();
    assert_eq!(references, ["DECVCAeID00103", "DEDVeIDDTR101", "DEDEMOPAA00001"]);

    assert_eq!(builder.chain_for("DECVCAeID00103").map(|chain| chain.len()), Some(2));
}

#[test]
fn expired_middle_link_yields_no_chain() {
    let certs = hierarchy((date!(2024 - 01 - 01), date!(2024 - 12 - 31)));
    let anchors = TrustAnchors::new([certs.root_103]);
    let mut builder = ChainBuilder::new([certs.terminal, certs.dv], anchors).with_validation_date(TODAY);

    assert!(builder.chain_for("DECVCAeID00103").is_none());
}

#[test]
fn renewed_document_verifier_replaces_expired_one() {
    let expired = hierarchy((date!(2024 - 01 - 01), date!(2024 - 12 - 31)));
    let renewed = valid_hierarchy();
    let anchors = TrustAnchors::new([renewed.root_103]);
    let mut builder = ChainBuilder::new([expired.dv, renewed.terminal, renewed.dv.clone()], anchors)
        .with_validation_date(TODAY);

    let chain = builder.chain_for("DECVCAeID00103").unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(&*chain.links()[0], &renewed.dv);
    assert!(chain.is_valid_on(TODAY));
}

#[test]
fn expired_trust_anchor_yields_no_chain() {
    let certs = valid_hierarchy();
    let expired_root = issue(
        "DECVCAeID00103",
        "DECVCAeID00103",
        AccessRole::Cvca,
        2,
        2,
        (date!(2020 - 01 - 01), date!(2024 - 12 - 31)),
    );
    let mut builder = ChainBuilder::new([certs.terminal, certs.dv], TrustAnchors::new([expired_root]))
        .with_validation_date(TODAY);

    assert!(builder.chain_for("DECVCAeID00103").is_none());
}

#[test]
fn not_yet_valid_terminal_yields_no_chain() {
    let certs = valid_hierarchy();
    let anchors = TrustAnchors::new([certs.root_103]);
    let mut builder = ChainBuilder::new([certs.terminal, certs.dv], anchors)
        .with_validation_date(date!(2025 - 02 - 28));

    assert!(builder.chain_for("DECVCAeID00103").is_none());
}

#[test]
fn excluded_terminal_role_yields_no_chain() {
    let certs = valid_hierarchy();
    let anchors = TrustAnchors::new([certs.root_103]);
    let mut builder = ChainBuilder::new([], anchors).with_validation_date(TODAY);

    builder.add_certificates_excluding([certs.dv, certs.terminal], AccessRole::Terminal);
    assert_eq!(builder.certificates().count(), 1);
    assert!(builder.chain_for("DECVCAeID00103").is_none());
}

#[test]
fn terminal_from_first_set_survives_filtering_of_second() {
    let certs = valid_hierarchy();
    let anchors = TrustAnchors::new([certs.root_103]);
    let stray_terminal = issue(
        "DEDVeIDDTR101",
        "DEDEMOPAA00002",
        AccessRole::Terminal,
        5,
        3,
        (date!(2025 - 01 - 01), date!(2025 - 12 - 31)),
    );
    let mut builder = ChainBuilder::new([certs.terminal.clone()], anchors).with_validation_date(TODAY);
    builder.add_certificates_excluding([stray_terminal, certs.dv], AccessRole::Terminal);

    let chain = builder.chain_for("DECVCAeID00103").unwrap();
    assert_eq!(chain.terminal().chr(), "DEDEMOPAA00001");
}

#[test]
fn unknown_authority_yields_no_chain() {
    let certs = valid_hierarchy();
    let anchors = TrustAnchors::new([certs.root_103]);
    let mut builder = ChainBuilder::new([certs.terminal, certs.dv], anchors).with_validation_date(TODAY);

    assert!(builder.chain_for("DECVCAeID00101").is_none());
}

#[test]
fn repeated_builds_are_identical() {
    let build = || {
        let certs = valid_hierarchy();
        let anchors = TrustAnchors::new([certs.root_102, certs.root_103]);
        let mut builder = ChainBuilder::new([certs.link_103, certs.dv, certs.terminal], anchors)
            .with_validation_date(TODAY);
        builder.chain_for("DECVCAeID00102").cloned()
    };

    let first = build().unwrap();
    assert_eq!(build().unwrap(), first);

    let certs = valid_hierarchy();
    let anchors = TrustAnchors::new([certs.root_102, certs.root_103]);
    let mut builder =
        ChainBuilder::new([certs.terminal, certs.link_103, certs.dv], anchors).with_validation_date(TODAY);
    let memoized = builder.chain_for("DECVCAeID00102").cloned();
    assert_eq!(builder.chain_for("DECVCAeID00102").cloned(), memoized);
    assert_eq!(memoized.unwrap(), first);
}

#[test]
fn anchors_accept_only_cvca_certificates() {
    let certs = valid_hierarchy();
    let mut anchors = TrustAnchors::default();
    assert!(anchors.add(certs.root_103.clone()));
    assert!(!anchors.add(certs.root_103));
    assert!(!anchors.add(certs.dv));
    assert_eq!(anchors.len(), 1);
}
