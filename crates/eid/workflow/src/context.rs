use std::collections::HashSet;

use eid_card::{CardConnection, PaceOutput, PasswordId, eac::ChipAuthenticationOutput};
use eid_cvc::{ChainBuilder, Chat, CvCertificateChain};
use url::Url;

use crate::{
    GlobalStatus, State, TcToken,
    paos::{Eac1Input, Eac2Input, InboundMessage},
};

/// Everything one authentication attempt learns on its way
///
/// Owned by a single [`AuthWorkflow`](crate::AuthWorkflow); dropping it
/// releases the card connection.
#[derive(Debug, Default)]
pub struct AuthContext {
    pub(crate) history: Vec<State>,
    pub(crate) status: GlobalStatus,

    pub(crate) tc_token_url: Option<Url>,
    pub(crate) tc_token: Option<TcToken>,
    pub(crate) tc_token_not_found: bool,

    pub(crate) last_message_id: Option<String>,
    pub(crate) eac1: Option<Box<Eac1Input>>,
    pub(crate) eac2: Option<Eac2Input>,
    pub(crate) additional_signature: Option<Vec<u8>>,
    pub(crate) pending: Option<InboundMessage>,
    pub(crate) dialogue_closed: bool,

    pub(crate) chain_builder: Option<ChainBuilder>,
    pub(crate) chain: Option<CvCertificateChain>,

    pub(crate) connection: Option<CardConnection>,
    pub(crate) password_id: Option<PasswordId>,
    pub(crate) can_authenticated: bool,
    pub(crate) retry_counter: Option<u8>,
    pub(crate) effective_chat: Option<Chat>,
    pub(crate) pace_output: Option<PaceOutput>,
    pub(crate) chip_authentication: Option<ChipAuthenticationOutput>,

    pub(crate) refresh_url: Option<Url>,
    pub(crate) verified_urls: HashSet<Url>,
}

impl AuthContext {
    /// States entered so far, in order
    pub fn history(&self) -> &[State] {
        &self.history
    }

    /// Current outcome
    pub const fn status(&self) -> &GlobalStatus {
        &self.status
    }

    /// TC token, once retrieved
    pub const fn tc_token(&self) -> Option<&TcToken> {
        self.tc_token.as_ref()
    }

    /// Password of the last PACE attempt
    pub const fn password_id(&self) -> Option<PasswordId> {
        self.password_id
    }

    /// PIN retry counter before the last PACE attempt
    pub const fn retry_counter(&self) -> Option<u8> {
        self.retry_counter
    }

    /// Rights granted to the service provider
    pub const fn effective_chat(&self) -> Option<&Chat> {
        self.effective_chat.as_ref()
    }

    /// Output of the successful PACE run
    pub const fn pace_output(&self) -> Option<&PaceOutput> {
        self.pace_output.as_ref()
    }

    /// Chain presented to the card
    pub const fn chain(&self) -> Option<&CvCertificateChain> {
        self.chain.as_ref()
    }

    /// Output of chip authentication
    pub const fn chip_authentication(&self) -> Option<&ChipAuthenticationOutput> {
        self.chip_authentication.as_ref()
    }

    /// Confirmed refresh address
    pub const fn refresh_url(&self) -> Option<&Url> {
        self.refresh_url.as_ref()
    }

    pub(crate) fn enter(&mut self, state: State) {
        self.history.push(state);
    }

    pub(crate) fn set_status(&mut self, status: GlobalStatus) {
        self.status = status;
    }

    /// Signature for terminal authentication, from EAC2 or additional input
    pub(crate) fn signature(&self) -> Option<&[u8]> {
        self.eac2
            .as_ref()
            .and_then(|eac2| eac2.signature.as_deref())
            .or(self.additional_signature.as_deref())
    }
}
