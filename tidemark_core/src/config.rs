//! Subscription configuration.

use std::sync::Arc;

use crate::event::RecordedEvent;

/// Transformation applied to every event before delivery.
///
/// When present, subscribers receive the mapped values in event order instead
/// of the events themselves.
pub type Mapper = Arc<dyn Fn(&RecordedEvent) -> serde_json::Value + Send + Sync>;

/// Options accepted when opening a subscription.
#[derive(Clone)]
pub struct SubscriptionOptions {
    /// Global position to start from when the subscription is first created.
    /// `0` means "from origin". Ignored if the checkpoint row already exists.
    pub start_from_event_number: u64,
    /// Per-stream position to start from when the subscription is first
    /// created. `0` means "from origin". Ignored if the checkpoint row
    /// already exists.
    pub start_from_stream_version: u64,
    /// Optional transformation applied to events before delivery.
    pub mapper: Option<Mapper>,
    /// Maximum number of events buffered while the subscriber is busy.
    /// Beyond this the subscription parks in the max-capacity state until the
    /// buffer drains. Default: 1000.
    pub max_size: usize,
    /// Number of events per batch read from storage during catch-up.
    /// Default: 500.
    pub catch_up_batch_size: u32,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            start_from_event_number: 0,
            start_from_stream_version: 0,
            mapper: None,
            max_size: 1000,
            catch_up_batch_size: 500,
        }
    }
}

impl std::fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("start_from_event_number", &self.start_from_event_number)
            .field("start_from_stream_version", &self.start_from_stream_version)
            .field("mapper", &self.mapper.as_ref().map(|_| "<mapper>"))
            .field("max_size", &self.max_size)
            .field("catch_up_batch_size", &self.catch_up_batch_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = SubscriptionOptions::default();
        assert_eq!(opts.start_from_event_number, 0);
        assert_eq!(opts.start_from_stream_version, 0);
        assert!(opts.mapper.is_none());
        assert_eq!(opts.max_size, 1000);
        assert_eq!(opts.catch_up_batch_size, 500);
    }

    #[test]
    fn debug_output_shows_mapper_presence() {
        let without = SubscriptionOptions::default();
        assert!(format!("{:?}", without).contains("None"));

        let with = SubscriptionOptions {
            mapper: Some(Arc::new(|e| serde_json::json!(e.event_number))),
            ..Default::default()
        };
        assert!(format!("{:?}", with).contains("<mapper>"));
    }
}
