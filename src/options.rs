//! Read and subscription options.

use crate::error::{MessageDbError, Result};
use crate::polling::PollingFactory;

pub(crate) const DEFAULT_BATCH_SIZE: i64 = 1000;

/// Options for reading or subscribing to an individual stream.
///
/// Defaults: read from the beginning in batches of 1000.
#[derive(Clone, Default)]
pub struct GetStreamOptions {
    pub(crate) version: i64,
    pub(crate) batch_size: Option<i64>,
    pub(crate) condition: Option<String>,
    pub(crate) polling: Option<PollingFactory>,
}

impl GetStreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inclusive version from which to read messages.
    pub fn from_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Maximum number of messages returned per read.
    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// SQL condition applied to the read, e.g.
    /// `messages.time::time >= current_time`.
    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Polling strategy for a subscription using these options, overriding
    /// the client default.
    pub fn polling(mut self, factory: PollingFactory) -> Self {
        self.polling = Some(factory);
        self
    }

    pub(crate) fn effective_batch_size(&self) -> i64 {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.version < 0 {
            return Err(MessageDbError::InvalidOptions(
                "stream version cannot be less than 0".into(),
            ));
        }
        if self.effective_batch_size() < 1 {
            return Err(MessageDbError::InvalidOptions(
                "batch size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Options for reading or subscribing to a category.
///
/// Defaults: read from the beginning of the store in batches of 1000, no
/// correlation filter, no consumer group partitioning.
#[derive(Clone, Default)]
pub struct GetCategoryOptions {
    pub(crate) position: i64,
    pub(crate) batch_size: Option<i64>,
    pub(crate) correlation: Option<String>,
    pub(crate) consumer_group: Option<(i64, i64)>,
    pub(crate) condition: Option<String>,
    pub(crate) polling: Option<PollingFactory>,
}

impl GetCategoryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inclusive global position from which to read messages.
    pub fn from_position(mut self, position: i64) -> Self {
        self.position = position;
        self
    }

    /// Maximum number of messages returned per read.
    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Filter messages by their metadata `correlationStreamName` field.
    pub fn correlation(mut self, correlation: impl Into<String>) -> Self {
        self.correlation = Some(correlation.into());
        self
    }

    /// Read as one member of a consumer group. The store hashes stream names
    /// within the category onto `size` slots and returns only the streams
    /// hashing to `member`.
    pub fn consumer_group(mut self, member: i64, size: i64) -> Self {
        self.consumer_group = Some((member, size));
        self
    }

    /// SQL condition applied to the read.
    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Polling strategy for a subscription using these options, overriding
    /// the client default.
    pub fn polling(mut self, factory: PollingFactory) -> Self {
        self.polling = Some(factory);
        self
    }

    pub(crate) fn effective_batch_size(&self) -> i64 {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    /// Consumer group parameters as they travel over the wire: both NULL
    /// when partitioning is disabled.
    pub(crate) fn consumer_group_params(&self) -> (Option<i64>, Option<i64>) {
        match self.consumer_group {
            Some((member, size)) if size > 0 => (Some(member), Some(size)),
            _ => (None, None),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.position < 0 {
            return Err(MessageDbError::InvalidOptions(
                "position cannot be less than 0".into(),
            ));
        }
        if self.effective_batch_size() < 1 {
            return Err(MessageDbError::InvalidOptions(
                "batch size must be greater than 0".into(),
            ));
        }
        if let Some((member, size)) = self.consumer_group {
            if size < 0 {
                return Err(MessageDbError::InvalidOptions(
                    "consumer group size must be 0 or greater (0 disables consumer groups)".into(),
                ));
            }
            if member < 0 || (size > 0 && member >= size) {
                return Err(MessageDbError::InvalidOptions(
                    "consumer group member must be in [0, size)".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_options_defaults() {
        let opts = GetStreamOptions::new();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.version, 0);
        assert_eq!(opts.effective_batch_size(), 1000);
    }

    #[test]
    fn test_stream_options_boundaries() {
        assert!(GetStreamOptions::new().from_version(-1).validate().is_err());
        assert!(GetStreamOptions::new().batch_size(0).validate().is_err());
        assert!(GetStreamOptions::new().batch_size(1).validate().is_ok());
    }

    #[test]
    fn test_category_options_boundaries() {
        assert!(GetCategoryOptions::new()
            .from_position(-1)
            .validate()
            .is_err());
        assert!(GetCategoryOptions::new().batch_size(0).validate().is_err());
        assert!(GetCategoryOptions::new()
            .consumer_group(-1, 2)
            .validate()
            .is_err());
        assert!(GetCategoryOptions::new()
            .consumer_group(2, 2)
            .validate()
            .is_err());
        assert!(GetCategoryOptions::new()
            .consumer_group(1, 2)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_consumer_group_zero_size_travels_as_null() {
        let opts = GetCategoryOptions::new().consumer_group(0, 0);
        assert!(opts.validate().is_ok());
        assert_eq!(opts.consumer_group_params(), (None, None));

        let opts = GetCategoryOptions::new().consumer_group(1, 2);
        assert_eq!(opts.consumer_group_params(), (Some(1), Some(2)));
    }
}
