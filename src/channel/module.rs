//! Channel modules intercepting envelopes of one kind.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::SessionState;

/// Interceptor for envelopes of kind `T`.
///
/// Returning `Ok(None)` consumes the envelope: later modules and the
/// application never see it. Returning another envelope substitutes it.
#[async_trait]
pub trait ChannelModule<T: Send + 'static>: Send + Sync {
    /// Called for each envelope received by the channel
    async fn on_receiving(&self, envelope: T, _cancel: &CancellationToken) -> Result<Option<T>> {
        Ok(Some(envelope))
    }

    /// Called for each envelope about to be sent by the channel
    async fn on_sending(&self, envelope: T, _cancel: &CancellationToken) -> Result<Option<T>> {
        Ok(Some(envelope))
    }

    /// Called after the session state changes
    fn on_state_changed(&self, _state: SessionState) {}
}

/// Ordered module list for one envelope kind.
pub struct ModulePipeline<T: Send + 'static> {
    modules: RwLock<Vec<Arc<dyn ChannelModule<T>>>>,
}

impl<T: Send + 'static> ModulePipeline<T> {
    pub(crate) fn new() -> Self {
        Self {
            modules: RwLock::new(Vec::new()),
        }
    }

    /// Append a module
    pub fn add(&self, module: Arc<dyn ChannelModule<T>>) {
        self.write().push(module);
    }

    /// Remove a module previously added. Returns false if it was not found.
    pub fn remove(&self, module: &Arc<dyn ChannelModule<T>>) -> bool {
        let mut modules = self.write();
        let before = modules.len();
        modules.retain(|m| !Arc::ptr_eq(m, module));
        modules.len() != before
    }

    /// Number of modules
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Check if no module is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the receiving hooks in registration order
    pub async fn on_receiving(&self, envelope: T, cancel: &CancellationToken) -> Result<Option<T>> {
        let mut current = envelope;
        for module in self.snapshot() {
            match module.on_receiving(current, cancel).await? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Run the sending hooks in registration order
    pub async fn on_sending(&self, envelope: T, cancel: &CancellationToken) -> Result<Option<T>> {
        let mut current = envelope;
        for module in self.snapshot() {
            match module.on_sending(current, cancel).await? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Notify every module of a state change
    pub fn on_state_changed(&self, state: SessionState) {
        for module in self.snapshot() {
            module.on_state_changed(state);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn ChannelModule<T>>> {
        self.modules
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn ChannelModule<T>>>> {
        self.modules
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Upper;

    #[async_trait]
    impl ChannelModule<Message> for Upper {
        async fn on_receiving(
            &self,
            mut message: Message,
            _cancel: &CancellationToken,
        ) -> Result<Option<Message>> {
            if let Some(text) = message.content.as_str() {
                message.content = text.to_uppercase().into();
            }
            Ok(Some(message))
        }
    }

    struct Veto;

    #[async_trait]
    impl ChannelModule<Message> for Veto {
        async fn on_receiving(
            &self,
            _message: Message,
            _cancel: &CancellationToken,
        ) -> Result<Option<Message>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl ChannelModule<Message> for Counter {
        async fn on_receiving(
            &self,
            message: Message,
            _cancel: &CancellationToken,
        ) -> Result<Option<Message>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(message))
        }

        fn on_state_changed(&self, _state: SessionState) {
            self.0.fetch_add(100, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_modules_run_in_order() {
        let pipeline = ModulePipeline::new();
        let counter = Arc::new(Counter::default());
        pipeline.add(Arc::new(Upper));
        pipeline.add(counter.clone());

        let cancel = CancellationToken::new();
        let result = pipeline
            .on_receiving(Message::text("hello"), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.content, "HELLO");
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_veto_short_circuits() {
        let pipeline = ModulePipeline::new();
        let counter = Arc::new(Counter::default());
        pipeline.add(Arc::new(Veto));
        pipeline.add(counter.clone());

        let result = pipeline
            .on_receiving(Message::text("dropped"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        // Sending hooks default to pass-through.
        let sent = pipeline
            .on_sending(Message::text("kept"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(sent.is_some());
    }

    #[test]
    fn test_add_remove_and_state_changes() {
        let pipeline = ModulePipeline::new();
        let counter = Arc::new(Counter::default());
        let module: Arc<dyn ChannelModule<Message>> = counter.clone();
        pipeline.add(module.clone());
        pipeline.on_state_changed(SessionState::Established);
        assert_eq!(counter.0.load(Ordering::SeqCst), 100);

        assert!(pipeline.remove(&module));
        assert!(!pipeline.remove(&module));
        assert!(pipeline.is_empty());
    }
}
