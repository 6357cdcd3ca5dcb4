//! States of an authentication attempt and the only legal moves between them

use derive_more::Display;
use eid_card::PasswordId;

/// One step of the authentication workflow
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Extract the TC token URL and fetch the TC token
    ParseActivationRequest,
    /// `StartPAOS` and `InitializeFramework`
    EstablishServerDialogue,
    /// Wait for `DIDAuthenticate` with `EAC1InputType` and check its description
    ReceiveEac1Request,
    /// Wait for exactly one usable card
    ChooseCard,
    /// Intersect requested and permitted rights
    PrepareAccessRights,
    /// PACE with CAN, PIN or PUK
    EstablishPaceChannel,
    /// Resolve the terminal chain for the card's trust anchor
    ProcessCertificatesFromEac2,
    /// Verify the chain on the card and authenticate the terminal
    TerminalAuthentication,
    /// Authenticate the chip and derive the service provider session
    ChipAuthentication,
    /// Ask the server for the terminal signature
    OptionalAdditionalInput,
    /// Report the chip authentication result
    SendAuthenticationResponse,
    /// Relay the server's APDUs until it disconnects
    TransmitApplicationApdus,
    /// Close the PACE channel
    DestroyPaceChannel,
    /// Walk the refresh address and check the TLS certificates on the way
    CheckRefreshAddress,
    /// Redirect the caller or show an error page
    RedirectOrReport,
}

/// What happened in a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// The state completed
    Continue,
    /// The state failed, the attempt ends with an error status
    Abort,
    /// PACE failed or needs another password first
    RetryPassword(PasswordId),
    /// The terminal signature is missing
    AwaitAdditionalInput,
    /// The server delivered the terminal signature
    SignatureReceived,
    /// The server sent another `Transmit`
    TransmitAgain,
}

/// A transition the current state does not allow
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Illegal transition {transition:?} in state {state}")]
pub struct IllegalTransition {
    /// Where the workflow was
    pub state: State,
    /// What was attempted
    pub transition: Transition,
}

impl State {
    /// Every state in workflow order
    pub const ALL: [Self; 15] = [
        Self::ParseActivationRequest,
        Self::EstablishServerDialogue,
        Self::ReceiveEac1Request,
        Self::ChooseCard,
        Self::PrepareAccessRights,
        Self::EstablishPaceChannel,
        Self::ProcessCertificatesFromEac2,
        Self::TerminalAuthentication,
        Self::ChipAuthentication,
        Self::OptionalAdditionalInput,
        Self::SendAuthenticationResponse,
        Self::TransmitApplicationApdus,
        Self::DestroyPaceChannel,
        Self::CheckRefreshAddress,
        Self::RedirectOrReport,
    ];

    /// Whether the workflow has ended
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::RedirectOrReport)
    }

    /// The state `transition` leads to
    pub const fn next(self, transition: Transition) -> Result<Self, IllegalTransition> {
        let next = match (self, transition) {
            (Self::RedirectOrReport, _) => None,
            (_, Transition::Abort) => Some(Self::RedirectOrReport),

            (Self::EstablishPaceChannel, Transition::RetryPassword(_)) => Some(Self::EstablishPaceChannel),
            (Self::TerminalAuthentication, Transition::AwaitAdditionalInput) => Some(Self::OptionalAdditionalInput),
            (Self::OptionalAdditionalInput, Transition::SignatureReceived) => Some(Self::TerminalAuthentication),
            (Self::TransmitApplicationApdus, Transition::TransmitAgain) => Some(Self::TransmitApplicationApdus),

            (state, Transition::Continue) => match state {
                Self::ParseActivationRequest => Some(Self::EstablishServerDialogue),
                Self::EstablishServerDialogue => Some(Self::ReceiveEac1Request),
                Self::ReceiveEac1Request => Some(Self::ChooseCard),
                Self::ChooseCard => Some(Self::PrepareAccessRights),
                Self::PrepareAccessRights => Some(Self::EstablishPaceChannel),
                Self::EstablishPaceChannel => Some(Self::ProcessCertificatesFromEac2),
                Self::ProcessCertificatesFromEac2 => Some(Self::TerminalAuthentication),
                Self::TerminalAuthentication => Some(Self::ChipAuthentication),
                Self::ChipAuthentication => Some(Self::OptionalAdditionalInput),
                Self::OptionalAdditionalInput => Some(Self::SendAuthenticationResponse),
                Self::SendAuthenticationResponse => Some(Self::TransmitApplicationApdus),
                Self::TransmitApplicationApdus => Some(Self::DestroyPaceChannel),
                Self::DestroyPaceChannel => Some(Self::CheckRefreshAddress),
                Self::CheckRefreshAddress => Some(Self::RedirectOrReport),
                Self::RedirectOrReport => None,
            },
            _ => None,
        };
        match next {
            Some(next) => Ok(next),
            None => Err(IllegalTransition {
                state: self,
                transition,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continue_walks_every_state_once() {
        let mut visited = vec![State::ParseActivationRequest];
        let mut state = State::ParseActivationRequest;
        while !state.is_terminal() {
            state = state.next(Transition::Continue).unwrap();
            visited.push(state);
        }
        assert_eq!(visited, State::ALL);
    }

    #[test]
    fn abort_reaches_report_from_everywhere() {
        for state in State::ALL.into_iter().filter(|state| !state.is_terminal()) {
            assert_eq!(state.next(Transition::Abort), Ok(State::RedirectOrReport));
        }
        assert!(State::RedirectOrReport.next(Transition::Abort).is_err());
        assert!(State::RedirectOrReport.next(Transition::Continue).is_err());
    }

    #[test]
    fn branches() {
        assert_eq!(
            State::EstablishPaceChannel.next(Transition::RetryPassword(PasswordId::Can)),
            Ok(State::EstablishPaceChannel)
        );
        assert_eq!(
            State::TerminalAuthentication.next(Transition::AwaitAdditionalInput),
            Ok(State::OptionalAdditionalInput)
        );
        assert_eq!(
            State::OptionalAdditionalInput.next(Transition::SignatureReceived),
            Ok(State::TerminalAuthentication)
        );
        assert_eq!(
            State::TransmitApplicationApdus.next(Transition::TransmitAgain),
            Ok(State::TransmitApplicationApdus)
        );
    }

    #[test]
    fn branches_are_local() {
        let err = State::ChooseCard
            .next(Transition::RetryPassword(PasswordId::Pin))
            .unwrap_err();
        assert_eq!(err.state, State::ChooseCard);
        assert!(State::ChipAuthentication.next(Transition::SignatureReceived).is_err());
        assert!(State::EstablishPaceChannel.next(Transition::TransmitAgain).is_err());
        assert!(State::ProcessCertificatesFromEac2.next(Transition::AwaitAdditionalInput).is_err());
    }
}
