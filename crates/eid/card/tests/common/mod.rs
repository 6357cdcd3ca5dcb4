//! Fixtures shared by the card integration tests
#![allow(dead_code)]

use eid_card::{
    CardCommand, CardConnection, CardReturnCode, CommandOutcome, CommandOutput, PaceOutput, PasswordId, ReaderInfo,
    ReaderKind, SequencerConfig,
    eac::{self, ChipAuthenticationOutput},
    simulator::{ChipHandle, ChipProfile, DemoPki, SimulatedCard},
};
use eid_cvc::{AccessRight, AccessRole, ChainBuilder, Chat, TrustAnchors};
use p256::{NonZeroScalar, PublicKey, elliptic_curve::sec1::ToEncodedPoint};
use time::OffsetDateTime;
use zeroize::Zeroizing;

pub const PIN: &str = "123456";
pub const CAN: &str = "500540";
pub const PUK: &str = "0987654321";
pub const DG04: &[u8] = b"\x64\x07\x0C\x05ERIKA";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn pki() -> DemoPki {
    let today = OffsetDateTime::now_utc().date();
    DemoPki::new(
        today - time::Duration::days(30),
        today + time::Duration::days(30),
        [AccessRight::AgeVerification, AccessRight::ReadDg04],
        "https://service.example",
    )
    .unwrap()
}

pub fn profile(pki: &DemoPki) -> ChipProfile {
    ChipProfile::new(PIN, CAN, PUK)
        .with_trust_anchor(pki.cvca.clone())
        .with_data_group(4, DG04)
}

pub fn open(card: SimulatedCard, reader: &str, kind: ReaderKind) -> (CardConnection, ChipHandle) {
    init_tracing();
    let handle = card.handle();
    let info = ReaderInfo {
        card_present: true,
        ..ReaderInfo::new(reader, kind)
    };
    let connection = CardConnection::open(Box::new(card), info, SequencerConfig::default()).unwrap();
    (connection, handle)
}

pub fn pace(password_id: PasswordId, password: Option<&str>, chat: Option<Chat>) -> CardCommand {
    CardCommand::EstablishPaceChannel {
        password_id,
        password: password.map(|password| Zeroizing::new(password.to_owned())),
        chat,
        certificate_description: None,
    }
}

pub fn requested_chat() -> Chat {
    Chat::authentication_terminal(AccessRole::Terminal, [AccessRight::AgeVerification, AccessRight::ReadDg04])
}

pub fn pace_output(outcome: CommandOutcome) -> PaceOutput {
    match outcome.output {
        CommandOutput::Pace(output) => output,
        output => panic!("expected a PACE output, got {output:?}"),
    }
}

/// Ephemeral key pair of the service provider
pub struct Terminal {
    pub secret: NonZeroScalar,
    pub public_key: Vec<u8>,
}

impl Terminal {
    pub fn new() -> Self {
        let secret = NonZeroScalar::random(&mut rand_v8::thread_rng());
        let public_key = PublicKey::from_secret_scalar(&secret)
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        Self { secret, public_key }
    }
}

/// PACE with a CHAT, terminal and chip authentication
pub async fn authenticate(
    connection: &CardConnection,
    password: Option<&str>,
    pki: &DemoPki,
    terminal: &Terminal,
) -> ChipAuthenticationOutput {
    let outcome = connection
        .execute(pace(PasswordId::Pin, password, Some(requested_chat())))
        .await
        .unwrap();
    assert_eq!(outcome.return_code, CardReturnCode::Ok);
    let output = pace_output(outcome);
    let car = output.car_curr.clone().unwrap();
    assert_eq!(car, DemoPki::CVCA_REFERENCE);

    let mut builder = ChainBuilder::new([pki.dv.clone(), pki.terminal.clone()], TrustAnchors::new([pki.cvca.clone()]));
    let chain = builder.chain_for(&car).cloned().unwrap();
    let challenge = output.challenge.unwrap();
    let message = eac::terminal_signature_input(&output.id_icc, &challenge, &terminal.public_key, None);
    let outcome = connection
        .execute(CardCommand::TerminalAuthentication {
            chain,
            ephemeral_public_key: terminal.public_key.clone(),
            auxiliary_data: None,
            signature: pki.sign(&message),
        })
        .await
        .unwrap();
    assert_eq!(outcome.return_code, CardReturnCode::Ok);

    let outcome = connection
        .execute(CardCommand::ChipAuthentication {
            ephemeral_public_key: terminal.public_key.clone(),
        })
        .await
        .unwrap();
    assert_eq!(outcome.return_code, CardReturnCode::Ok);
    match outcome.output {
        CommandOutput::ChipAuthentication(output) => output,
        output => panic!("expected a chip authentication output, got {output:?}"),
    }
}

/// READ BINARY of data group 4 under the service provider's session
pub async fn read_dg04(connection: &CardConnection, terminal: &Terminal, output: &ChipAuthenticationOutput) -> Vec<u8> {
    let mut session = eac::service_provider_session(terminal.secret, &terminal.public_key, output).unwrap();
    let read = eid_apdu_core::Command::new_with_le(0x00, 0xB0, 0x84, 0x00, eid_apdu_core::Command::LE_MAX_SHORT);
    let protected = session.encrypt(&read).unwrap().to_bytes();
    let outcome = connection
        .execute(CardCommand::Transmit {
            apdus: vec![eid_card::InputApduInfo::new(protected)],
        })
        .await
        .unwrap();
    assert_eq!(outcome.return_code, CardReturnCode::Ok);

    let CommandOutput::Transmit(responses) = outcome.output else {
        panic!("expected response APDUs");
    };
    assert_eq!(responses.len(), 1);
    let response = eid_apdu_core::Response::from_bytes(&responses[0]).unwrap();
    let response = session.decrypt(&response).unwrap();
    assert!(response.is_success());
    response.payload_bytes().to_vec()
}
