//! Named readers and exclusive access to the cards in them

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    Card, CardError, ReaderInfo,
    sequencer::{CardConnection, SequencerConfig, SequencerError},
};

/// Errors of [`ReaderRegistry`]
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No reader with that name
    #[error("Unknown reader {0}")]
    UnknownReader(String),

    /// The reader holds no card
    #[error("No card in reader {0}")]
    NoCard(String),

    /// Another connection holds the card
    #[error("Card in reader {0} is in use")]
    InUse(String),

    /// Connecting to the card failed
    #[error(transparent)]
    Card(#[from] CardError),

    /// The connection could not be set up
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
}

struct Slot {
    info: ReaderInfo,
    card: Option<Box<dyn Card>>,
    in_use: bool,
}

struct Inner {
    slots: Mutex<BTreeMap<String, Slot>>,
    updates: watch::Sender<Vec<ReaderInfo>>,
    config: SequencerConfig,
}

impl Inner {
    fn notify(&self, slots: &BTreeMap<String, Slot>) {
        self.updates
            .send_replace(slots.values().map(|slot| slot.info.clone()).collect());
    }

    fn release(&self, card: Box<dyn Card>, info: ReaderInfo) {
        let mut slots = self.slots.lock();
        match slots.get_mut(&info.name) {
            Some(slot) => {
                debug!(reader = %info.name, "Card released");
                slot.in_use = false;
                slot.info.retry_counter = info.retry_counter;
                slot.info.pin_deactivated = info.pin_deactivated;
                slot.info.card_present = slot.info.card_present && info.card_present;
                if slot.card.is_none() && slot.info.card_present {
                    slot.card = Some(card);
                }
            }
            None => debug!(reader = %info.name, "Reader vanished while connected"),
        }
        self.notify(&slots);
    }
}

/// Readers known to the application and the cards in them
///
/// Clones share the same readers. Every card is handed to at most one
/// [`CardConnection`] at a time and returns to its reader when that
/// connection closes. Subscribers see a fresh snapshot after every change.
#[derive(Clone)]
pub struct ReaderRegistry {
    inner: Arc<Inner>,
}

impl fmt::Debug for ReaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderRegistry")
            .field("readers", &self.inner.slots.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for ReaderRegistry {
    fn default() -> Self {
        Self::new(SequencerConfig::default())
    }
}

impl ReaderRegistry {
    /// An empty registry whose connections use `config`
    pub fn new(config: SequencerConfig) -> Self {
        let (updates, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(BTreeMap::new()),
                updates,
                config,
            }),
        }
    }

    /// Add an empty reader, keeping it if it is already known
    pub fn add_reader(&self, info: ReaderInfo) {
        let mut slots = self.inner.slots.lock();
        slots.entry(info.name.clone()).or_insert_with(|| {
            info!(reader = %info.name, kind = %info.kind, "Reader added");
            Slot {
                info: ReaderInfo {
                    card_present: false,
                    ..info
                },
                card: None,
                in_use: false,
            }
        });
        self.inner.notify(&slots);
    }

    /// Put `card` into the reader described by `info`
    pub fn insert_card(&self, card: Box<dyn Card>, info: ReaderInfo) -> Result<(), RegistryError> {
        let mut slots = self.inner.slots.lock();
        if slots.get(&info.name).is_some_and(|slot| slot.in_use) {
            return Err(RegistryError::InUse(info.name));
        }
        info!(reader = %info.name, "Card inserted");
        let name = info.name.clone();
        slots.insert(
            name,
            Slot {
                info: ReaderInfo {
                    card_present: true,
                    ..info
                },
                card: Some(card),
                in_use: false,
            },
        );
        self.inner.notify(&slots);
        Ok(())
    }

    /// Take the card out of `reader`
    ///
    /// A card in use stays with its connection and is dropped when released.
    pub fn remove_card(&self, reader: &str) -> Option<Box<dyn Card>> {
        let mut slots = self.inner.slots.lock();
        let slot = slots.get_mut(reader)?;
        info!(reader, "Card removed");
        slot.info.card_present = false;
        slot.info.retry_counter = None;
        slot.info.pin_deactivated = false;
        let card = slot.card.take();
        self.inner.notify(&slots);
        card
    }

    /// Forget `reader` altogether
    pub fn remove_reader(&self, reader: &str) -> bool {
        let mut slots = self.inner.slots.lock();
        let removed = slots.remove(reader).is_some();
        if removed {
            info!(reader, "Reader removed");
            self.inner.notify(&slots);
        }
        removed
    }

    /// Snapshot of every reader
    pub fn reader_infos(&self) -> Vec<ReaderInfo> {
        self.inner.slots.lock().values().map(|slot| slot.info.clone()).collect()
    }

    /// Snapshot of one reader
    pub fn reader_info(&self, reader: &str) -> Option<ReaderInfo> {
        self.inner.slots.lock().get(reader).map(|slot| slot.info.clone())
    }

    /// Whether a connection holds the card in `reader`
    pub fn is_in_use(&self, reader: &str) -> bool {
        self.inner.slots.lock().get(reader).is_some_and(|slot| slot.in_use)
    }

    /// Follow reader and card changes
    pub fn subscribe(&self) -> watch::Receiver<Vec<ReaderInfo>> {
        self.inner.updates.subscribe()
    }

    /// Take exclusive hold of the card in `reader`
    pub fn connect(&self, reader: &str) -> Result<CardConnection, RegistryError> {
        let mut slots = self.inner.slots.lock();
        let slot = slots
            .get_mut(reader)
            .ok_or_else(|| RegistryError::UnknownReader(reader.to_owned()))?;
        if slot.in_use {
            warn!(reader, "Card already connected");
            return Err(RegistryError::InUse(reader.to_owned()));
        }
        let mut card = slot.card.take().ok_or_else(|| RegistryError::NoCard(reader.to_owned()))?;
        if let Err(err) = card.connect() {
            slot.card = Some(card);
            return Err(err.into());
        }

        slot.in_use = true;
        let info = slot.info.clone();
        self.inner.notify(&slots);
        drop(slots);

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let release = Box::new(move |card: Box<dyn Card>, info: ReaderInfo| {
            if let Some(inner) = inner.upgrade() {
                inner.release(card, info);
            }
        });
        match CardConnection::spawn(card, info, self.inner.config.clone(), release) {
            Ok(connection) => Ok(connection),
            Err(err) => {
                let mut slots = self.inner.slots.lock();
                if let Some(slot) = slots.get_mut(reader) {
                    slot.in_use = false;
                }
                self.inner.notify(&slots);
                Err(err.into())
            }
        }
    }
}
