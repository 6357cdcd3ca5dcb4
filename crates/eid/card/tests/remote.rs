//! A card served over the IFD protocol by a second device

mod common;

use std::{thread, time::Duration};

use common::{DG04, PIN, Terminal, authenticate, pace, pki, profile, read_dg04};
use eid_card::{
    CardCommand, CardConnection, CardReturnCode, PasswordId, ReaderInfo, ReaderKind, ReaderRegistry,
    SequencerConfig,
    remote::{IfdServer, MemoryChannel, PinRequest, RemoteCard},
    simulator::{ChipHandle, DemoPki, SimulatedCard},
};
use zeroize::Zeroizing;

const SLOT: &str = "Phone NFC";
const NEW_PIN: &str = "654321";

struct Served {
    registry: ReaderRegistry,
    handle: ChipHandle,
    connection: CardConnection,
}

/// Serve a simulated card from a second thread and connect to it remotely
fn serve(pki: &DemoPki, pin_pad_mode: bool) -> Served {
    let card = SimulatedCard::new(profile(pki), ReaderKind::Basic);
    let handle = card.handle();
    let registry = ReaderRegistry::default();
    registry
        .insert_card(Box::new(card), ReaderInfo::new(SLOT, ReaderKind::Nfc))
        .unwrap();

    let (client_end, server_end) = MemoryChannel::pair();
    let server = IfdServer::new(registry.clone(), "Test phone")
        .with_pin_pad_mode(pin_pad_mode)
        .with_password_prompt(Box::new(|request| match request {
            PinRequest::Password(PasswordId::Pin) => Some(Zeroizing::new(PIN.to_owned())),
            PinRequest::NewPin => Some(Zeroizing::new(NEW_PIN.to_owned())),
            PinRequest::Password(_) => None,
        }));
    thread::spawn(move || server.serve(server_end));

    let card = RemoteCard::new(client_end.with_timeout(Duration::from_secs(10)), SLOT);
    let info = ReaderInfo {
        card_present: true,
        ..ReaderInfo::new(SLOT, ReaderKind::Remote)
    };
    let connection = CardConnection::open(Box::new(card), info, SequencerConfig::default()).unwrap();
    Served {
        registry,
        handle,
        connection,
    }
}

async fn released(registry: &ReaderRegistry) -> bool {
    for _ in 0..200 {
        if !registry.is_in_use(SLOT) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn pin_pad_mode_runs_pace_on_the_serving_device() {
    let pki = pki();
    let served = serve(&pki, true);
    assert!(served.registry.is_in_use(SLOT));
    let terminal = Terminal::new();

    // the PIN is typed on the phone
    let output = authenticate(&served.connection, None, &pki, &terminal).await;
    assert_eq!(read_dg04(&served.connection, &terminal, &output).await, DG04);

    served.connection.disconnect();
    assert!(released(&served.registry).await);
}

#[tokio::test]
async fn basic_mode_relays_software_pace() {
    let pki = pki();
    let served = serve(&pki, false);
    let terminal = Terminal::new();

    let outcome = served
        .connection
        .execute(pace(PasswordId::Pin, Some("111111"), None))
        .await
        .unwrap();
    assert_eq!(outcome.return_code, CardReturnCode::InvalidPin);
    assert_eq!(served.connection.reader_info().retry_counter, Some(2));
    assert_eq!(served.handle.retry_counter(), 2);

    // without PIN pad support the password must come from this side
    let outcome = served.connection.execute(pace(PasswordId::Pin, None, None)).await.unwrap();
    assert_eq!(outcome.return_code, CardReturnCode::CommandFailed);

    let output = authenticate(&served.connection, Some(PIN), &pki, &terminal).await;
    assert_eq!(read_dg04(&served.connection, &terminal, &output).await, DG04);
}

#[tokio::test]
async fn pin_change_on_the_serving_device() {
    let pki = pki();
    let served = serve(&pki, true);

    let outcome = served.connection.execute(pace(PasswordId::Pin, None, None)).await.unwrap();
    assert_eq!(outcome.return_code, CardReturnCode::Ok);

    let outcome = served
        .connection
        .execute(CardCommand::SetEidPin {
            new_pin: None,
            timeout_seconds: 30,
        })
        .await
        .unwrap();
    assert_eq!(outcome.return_code, CardReturnCode::Ok);
    assert!(served.handle.pin_matches(NEW_PIN));
}

#[tokio::test]
async fn removed_card_on_the_serving_device() {
    let pki = pki();
    let served = serve(&pki, true);
    let terminal = Terminal::new();
    let output = authenticate(&served.connection, None, &pki, &terminal).await;

    served.handle.remove();
    let outcome = served
        .connection
        .execute(CardCommand::Transmit {
            apdus: vec![eid_card::InputApduInfo::new(vec![0x0C, 0xB0, 0x84, 0x00, 0x00])],
        })
        .await
        .unwrap();
    assert!(!outcome.is_ok());
    assert!(output.ef_card_security.len() > 2);
}
