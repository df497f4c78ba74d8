use crate::FeatureApi;

/// Configuration for [`FeatureApi`].
///
/// # Examples
/// ```
/// # use flagbridge::FeatureApiConfig;
/// let api = FeatureApiConfig::new()
///     .with_event_queue_capacity(64)
///     .to_api();
/// ```
// Not implementing `Copy` as the thread name is owned.
#[derive(Debug, Clone)]
pub struct FeatureApiConfig {
    /// Maximum number of events waiting for dispatch. Events emitted while the queue is full are
    /// dropped with a warning.
    ///
    /// Defaults to [`FeatureApiConfig::DEFAULT_EVENT_QUEUE_CAPACITY`].
    pub event_queue_capacity: usize,
    /// Name of the event dispatcher thread.
    ///
    /// Defaults to [`FeatureApiConfig::DEFAULT_DISPATCHER_THREAD_NAME`].
    pub dispatcher_thread_name: String,
}

impl FeatureApiConfig {
    /// Default value for [`FeatureApiConfig::event_queue_capacity`].
    pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;
    /// Default value for [`FeatureApiConfig::dispatcher_thread_name`].
    pub const DEFAULT_DISPATCHER_THREAD_NAME: &'static str = "flagbridge-events";

    /// Create a new `FeatureApiConfig` using default configuration.
    pub fn new() -> FeatureApiConfig {
        FeatureApiConfig::default()
    }

    /// Update event queue capacity. Zero is raised to one.
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> FeatureApiConfig {
        self.event_queue_capacity = capacity.max(1);
        self
    }

    /// Update dispatcher thread name.
    pub fn with_dispatcher_thread_name(mut self, name: impl Into<String>) -> FeatureApiConfig {
        self.dispatcher_thread_name = name.into();
        self
    }

    /// Create a new [`FeatureApi`] using this configuration.
    pub fn to_api(self) -> FeatureApi {
        FeatureApi::with_config(self)
    }
}

impl Default for FeatureApiConfig {
    fn default() -> FeatureApiConfig {
        FeatureApiConfig {
            event_queue_capacity: FeatureApiConfig::DEFAULT_EVENT_QUEUE_CAPACITY,
            dispatcher_thread_name: FeatureApiConfig::DEFAULT_DISPATCHER_THREAD_NAME.to_owned(),
        }
    }
}
