//! PIN change over a PIN authenticated channel

use std::future::Future;

use eid_card::{CardCommand, CardConnection, CardReturnCode, PasswordId, SequencerError};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::{
    GlobalStatus, StatusCode, Transition, WorkflowConfig,
    interaction::{Prompt, UserInteraction},
};

/// How a PIN change continues after the card answered `code`
pub const fn change_pin_outcome(code: CardReturnCode) -> Transition {
    match code {
        CardReturnCode::Ok => Transition::Continue,
        CardReturnCode::NewPinMismatch => Transition::RetryPassword(PasswordId::Pin),
        _ => Transition::Abort,
    }
}

/// User input bounded by the configured timeout
async fn entry<F>(config: &WorkflowConfig, input: F) -> Result<Zeroizing<String>, GlobalStatus>
where
    F: Future<Output = Option<Zeroizing<String>>>,
{
    match tokio::time::timeout(config.input_timeout, input).await {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(StatusCode::WorkflowCancellationByUser.into()),
        Err(_) => Err(StatusCode::CardInputTimeOut.into()),
    }
}

async fn execute(connection: &CardConnection, command: CardCommand) -> Result<CardReturnCode, GlobalStatus> {
    let outcome = connection.execute(command).await.map_err(|err| match err {
        SequencerError::Disconnected => GlobalStatus::new(StatusCode::WorkflowCardRemoved),
        err => GlobalStatus::with_detail(StatusCode::CardCommunicationError, err.to_string()),
    })?;
    Ok(outcome.return_code)
}

/// Authenticate with the current PIN and set a new one
///
/// On PIN pad readers both PINs are entered on the keypad; a mismatch of
/// the two new PIN entries asks again.
pub async fn change_pin(
    connection: &CardConnection,
    user: &dyn UserInteraction,
    config: &WorkflowConfig,
) -> Result<(), GlobalStatus> {
    let reader = connection.reader_info();
    if reader.pin_deactivated {
        return Err(StatusCode::CardPinDeactivated.into());
    }
    let pin_pad = reader.has_pin_pad();

    let pin = if pin_pad {
        let prompt = Prompt::PinPadEntry {
            reader: reader.name.clone(),
            password_id: PasswordId::Pin,
        };
        if !user.confirm(prompt).await {
            return Err(StatusCode::WorkflowCancellationByUser.into());
        }
        None
    } else {
        Some(entry(config, user.request_password(PasswordId::Pin, reader.retry_counter)).await?)
    };
    let code = execute(
        connection,
        CardCommand::EstablishPaceChannel {
            password_id: PasswordId::Pin,
            password: pin,
            chat: None,
            certificate_description: None,
        },
    )
    .await?;
    if !code.is_ok() {
        warn!(%code, "PIN authentication for the PIN change failed");
        return Err(code.into());
    }

    let timeout_seconds = u8::try_from(config.input_timeout.as_secs()).unwrap_or(u8::MAX);
    loop {
        let new_pin = if pin_pad {
            None
        } else {
            Some(entry(config, user.request_new_pin()).await?)
        };
        let code = execute(
            connection,
            CardCommand::SetEidPin {
                new_pin,
                timeout_seconds,
            },
        )
        .await?;
        match change_pin_outcome(code) {
            Transition::Continue => {
                info!("PIN changed");
                return Ok(());
            }
            Transition::RetryPassword(_) => info!("New PIN entries differ, asking again"),
            _ => {
                warn!(%code, "PIN change failed");
                return Err(code.into());
            }
        }
    }
}
