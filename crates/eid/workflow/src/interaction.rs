use async_trait::async_trait;
use eid_card::{PasswordId, ReaderInfo};
use eid_cvc::Chat;
use zeroize::Zeroizing;

/// Questions the workflow asks with a yes or no answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    /// Grant `rights` to the service provider called `subject`
    AccessRights {
        /// Subject of the certificate description
        subject: String,
        /// Rights that would be transferred
        rights: Chat,
    },
    /// Enter the password on the reader's keypad
    PinPadEntry {
        /// Reader with the keypad
        reader: String,
        /// Which password
        password_id: PasswordId,
    },
}

/// Access rights a service provider asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRightsRequest {
    /// Subject of the certificate description
    pub subject: String,
    /// Rights that cannot be deselected
    pub required: Chat,
    /// Rights the user may deselect
    pub optional: Option<Chat>,
    /// Free text about the transaction
    pub transaction_info: Option<String>,
}

impl AccessRightsRequest {
    /// Everything requested
    pub fn requested(&self) -> Chat {
        self.optional
            .as_ref()
            .map_or_else(|| self.required.clone(), |optional| self.required.union(optional))
    }
}

/// The user in front of the reader
///
/// Every method may take as long as the user needs; `None` or `false` means
/// the user cancelled.
#[async_trait]
pub trait UserInteraction: Send + Sync {
    /// Ask for a password, `retry_counter` tells how many PIN attempts remain
    async fn request_password(&self, password_id: PasswordId, retry_counter: Option<u8>)
    -> Option<Zeroizing<String>>;

    /// Ask for the new PIN of a PIN change, entered twice by the user
    ///
    /// The default declines.
    async fn request_new_pin(&self) -> Option<Zeroizing<String>> {
        None
    }

    /// Pick one of several readers with a card, by name
    async fn choose_card(&self, readers: &[ReaderInfo]) -> Option<String>;

    /// Ask for a card to be inserted, resolves `false` on cancel
    async fn wait_for_card(&self, readers: &[ReaderInfo]) -> bool;

    /// Answer a yes or no question
    async fn confirm(&self, prompt: Prompt) -> bool;

    /// Let the user deselect optional rights, returns the rights granted
    async fn approve_access_rights(&self, request: &AccessRightsRequest) -> Option<Chat> {
        let rights = request.requested();
        self.confirm(Prompt::AccessRights {
            subject: request.subject.clone(),
            rights: rights.clone(),
        })
        .await
        .then_some(rights)
    }
}
