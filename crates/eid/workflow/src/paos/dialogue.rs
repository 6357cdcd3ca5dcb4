use async_trait::async_trait;
use tracing::{debug, trace};

use super::{Inbound, Outbound, PaosError};
use crate::{NetworkError, StatusCode, TcToken};

/// Failure of one request/response round with the eService
#[derive(Debug, thiserror::Error)]
pub enum DialogueError {
    /// The message did not reach the server or no answer came back
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// The answer could not be read
    #[error(transparent)]
    Paos(#[from] PaosError),
}

impl DialogueError {
    /// Status reported to the user for this failure
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Network(error) => error.status_code(),
            Self::Paos(PaosError::UnknownMessage(_)) => StatusCode::WorkflowUnexpectedMessage,
            Self::Paos(_) => StatusCode::WorkflowMalformedMessage,
        }
    }
}

/// One side of the PAOS conversation: send a response, receive the next request
#[async_trait]
pub trait ServerDialogue: Send + Sync {
    /// Deliver `message` and wait for the server's next request
    async fn exchange(&mut self, message: Outbound) -> Result<Inbound, DialogueError>;
}

/// Opens the dialogue with the eService a TC token names
#[async_trait]
pub trait DialogueConnector: Send + Sync {
    /// Connect to [`TcToken::server_address`], using its PSK if present
    async fn connect(&self, tc_token: &TcToken) -> Result<Box<dyn ServerDialogue>, NetworkError>;
}

/// Moves serialized PAOS messages to the eService and back
#[async_trait]
pub trait PaosTransport: Send + Sync {
    /// POST `body` to the server address and return the response body
    async fn post(&mut self, body: String) -> Result<String, NetworkError>;
}

/// [`ServerDialogue`] speaking XML over a [`PaosTransport`]
#[derive(Debug)]
pub struct PaosDialogue<T> {
    transport: T,
}

impl<T> PaosDialogue<T> {
    /// Wrap a transport
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    /// The wrapped transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Unwrap the transport
    pub fn into_inner(self) -> T {
        self.transport
    }
}

#[async_trait]
impl<T: PaosTransport> ServerDialogue for PaosDialogue<T> {
    async fn exchange(&mut self, message: Outbound) -> Result<Inbound, DialogueError> {
        let body = message.to_xml()?;
        debug!(message = message.message.name(), id = %message.message_id, "Sending PAOS message");
        trace!(%body);

        let response = self.transport.post(body).await?;
        trace!(%response);
        let inbound = Inbound::parse(&response)?;
        debug!(message = inbound.message.name(), "Received PAOS message");
        Ok(inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paos::{InboundMessage, OutboundMessage};

    struct Replay {
        answers: Vec<Result<String, NetworkError>>,
        sent: Vec<String>,
    }

    #[async_trait]
    impl PaosTransport for Replay {
        async fn post(&mut self, body: String) -> Result<String, NetworkError> {
            self.sent.push(body);
            self.answers.remove(0)
        }
    }

    fn dialogue(answers: Vec<Result<String, NetworkError>>) -> PaosDialogue<Replay> {
        PaosDialogue::new(Replay { answers, sent: Vec::new() })
    }

    fn start() -> Outbound {
        Outbound::new(
            OutboundMessage::StartPaos {
                session_identifier: "00".to_owned(),
                user_agent: "test".to_owned(),
            },
            None,
        )
    }

    #[tokio::test]
    async fn exchange_parses_answer() {
        let mut dialogue = dialogue(vec![Ok(
            r#"<InitializeFramework xmlns="urn:iso:std:iso-iec:24727:tech:schema"/>"#.to_owned(),
        )]);
        let inbound = dialogue.exchange(start()).await.unwrap();
        assert_eq!(inbound.message, InboundMessage::InitializeFramework);
        assert!(dialogue.transport().sent[0].contains("<StartPAOS"));
    }

    #[tokio::test]
    async fn failures_map_to_status() {
        let mut dialogue = dialogue(vec![
            Err(NetworkError::TimeOut),
            Ok("<Unexpected/>".to_owned()),
            Ok("<Transmit>".to_owned()),
        ]);
        let codes: Vec<_> = [
            dialogue.exchange(start()).await,
            dialogue.exchange(start()).await,
            dialogue.exchange(start()).await,
        ]
        .into_iter()
        .map(|result| result.unwrap_err().status_code())
        .collect();
        assert_eq!(
            codes,
            [
                StatusCode::NetworkTimeOut,
                StatusCode::WorkflowUnexpectedMessage,
                StatusCode::WorkflowMalformedMessage
            ]
        );
    }
}
