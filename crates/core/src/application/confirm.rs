// Publisher-confirm correlation

use std::collections::BTreeMap;

use crate::error::{BusError, Result};

/// Outstanding confirm-requested publishes, keyed by delivery tag
///
/// Tags are assigned from 1 in publish order, matching the broker's own
/// numbering as long as every publish on the channel goes through `expect`.
#[derive(Debug)]
pub struct ConfirmTracker<C> {
    last_tag: u64,
    pending: BTreeMap<u64, C>,
}

impl<C> Default for ConfirmTracker<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ConfirmTracker<C> {
    pub fn new() -> Self {
        Self {
            last_tag: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Register the next publish and return its delivery tag
    pub fn expect(&mut self, continuation: C) -> u64 {
        self.last_tag += 1;
        self.pending.insert(self.last_tag, continuation);
        self.last_tag
    }

    /// Undo the newest `expect` when its publish never reached the broker
    ///
    /// Only the last assigned tag can be withdrawn; any older tag was already
    /// counted by the broker.
    pub fn cancel(&mut self, delivery_tag: u64) -> Option<C> {
        if delivery_tag != self.last_tag {
            return None;
        }
        let continuation = self.pending.remove(&delivery_tag)?;
        self.last_tag -= 1;
        Some(continuation)
    }

    /// Take the continuations settled by a broker ack, in ascending tag order
    ///
    /// # Errors
    /// `ChannelProtocol` if `delivery_tag` is not outstanding; the channel
    /// numbering can no longer be trusted.
    pub fn resolve(&mut self, delivery_tag: u64, multiple: bool) -> Result<Vec<(u64, C)>> {
        if !self.pending.contains_key(&delivery_tag) {
            return Err(BusError::ChannelProtocol(format!(
                "Got an unexpected publish confirmation ACK for delivery-tag: {}. Was expecting one of: {:?}",
                delivery_tag,
                self.pending.keys().collect::<Vec<_>>()
            )));
        }

        if !multiple {
            let continuation = self.pending.remove(&delivery_tag);
            return Ok(continuation.map(|c| (delivery_tag, c)).into_iter().collect());
        }

        let rest = self.pending.split_off(&(delivery_tag + 1));
        let settled = std::mem::replace(&mut self.pending, rest);
        Ok(settled.into_iter().collect())
    }

    /// Drop every outstanding entry (connection closed or failed)
    pub fn abandon(&mut self) -> Vec<(u64, C)> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    pub fn pending_tags(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }

    pub fn last_tag(&self) -> u64 {
        self.last_tag
    }
}
