use eid_apdu_core::{
    Command, Response,
    processor::{CommandProcessor, SecurityLevel, error::ProcessorError},
    transport::CardTransport,
};
use tracing::trace;

use super::SecureMessaging;

/// Routes commands through a secure messaging session
#[derive(Debug, Clone)]
pub struct SecureMessagingProcessor {
    session: SecureMessaging,
}

impl SecureMessagingProcessor {
    /// Wrap an established session
    pub const fn new(session: SecureMessaging) -> Self {
        Self { session }
    }

    /// The wrapped session
    pub const fn session(&self) -> &SecureMessaging {
        &self.session
    }
}

impl CommandProcessor for SecureMessagingProcessor {
    fn do_process_command(
        &mut self,
        command: &Command,
        transport: &mut dyn CardTransport,
    ) -> Result<Response, ProcessorError> {
        let protected = self.session.encrypt(command)?;
        trace!(command = ?hex::encode(protected.to_bytes()), "Sending protected command");

        let raw = transport.transmit_raw(&protected.to_bytes())?;
        let response = Response::from_bytes(&raw)?;
        Ok(self.session.decrypt(&response)?)
    }

    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::Encrypted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure_messaging::SymmetricAlgorithm;
    use bytes::Bytes;
    use eid_apdu_core::{CardExecutor, Executor, TransportError};

    /// Card side peer answering every command with a fixed payload
    #[derive(Debug)]
    struct EchoCard {
        session: SecureMessaging,
    }

    impl CardTransport for EchoCard {
        fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
            let command = Command::from_bytes(command).map_err(|err| TransportError::other(err.to_string()))?;
            let plain = self
                .session
                .unwrap_command(&command)
                .map_err(|err| TransportError::other(err.to_string()))?;
            let response = Response::success(Some(Bytes::copy_from_slice(plain.data_bytes())));
            let wrapped = self
                .session
                .wrap_response(&response)
                .map_err(|err| TransportError::other(err.to_string()))?;
            Ok(wrapped.to_bytes())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn reset(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn executor_routes_through_session() {
        let keys = ([0x11; 16], [0x22; 16]);
        let card = EchoCard {
            session: SecureMessaging::for_card(SymmetricAlgorithm::Aes128, &keys.0, &keys.1).unwrap(),
        };
        let mut executor = CardExecutor::new(card);
        executor.add_processor(Box::new(SecureMessagingProcessor::new(
            SecureMessaging::new(SymmetricAlgorithm::Aes128, &keys.0, &keys.1).unwrap(),
        )));
        assert_eq!(executor.security_level(), SecurityLevel::Encrypted);

        let response = executor
            .execute(&Command::new_with_data(0x00, 0x2A, 0x00, 0xBE, b"payload".to_vec()))
            .unwrap();
        assert_eq!(response.payload_bytes(), b"payload");
        assert_eq!(executor.transport().session.send_sequence_counter(), 2);
    }
}
