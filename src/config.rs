use std::time::Duration;

use anyhow::bail;

use crate::apdu::codes::{MaxApduLength, MaxSegments, Segmentation};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Time to wait for the answer to a confirmed request before re-sending it
    pub timeout: Duration,

    /// The number of times a confirmed request is transmitted (the initial transmission
    ///  included) before the request fails with a timeout. A request to an unreachable peer
    ///  therefore fails after `retries * timeout`.
    pub retries: u32,

    /// Time to wait for a Segment-ACK before re-sending the current window. Assembling a
    ///  segmented message that is received waits four times as long for the next segment.
    pub segment_timeout: Duration,

    /// The window size proposed for outgoing segmented messages, and the maximum window size
    ///  granted to peers sending segmented messages
    pub segment_window: u8,

    /// This is advertised to peers in outgoing confirmed requests and limits the size of
    ///  responses they send. It is capped by what the network can transport.
    pub max_apdu_length_accepted: MaxApduLength,
    pub max_segments_accepted: MaxSegments,
    pub segmentation_supported: Segmentation,

    /// Sends that fail with a transient network error are re-attempted after this delay
    pub send_retry_delay: Duration,
    /// ... up to this number of attempts, after which the frame is dropped
    pub max_send_attempts: u32,

    /// the dispatch loop's sleep when there is nothing to do
    pub idle_sleep: Duration,
    /// capacity of the queues feeding the dispatch loop
    pub queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            timeout: Duration::from_millis(6000),
            retries: 3,
            segment_timeout: Duration::from_millis(5000),
            segment_window: 5,
            max_apdu_length_accepted: MaxApduLength::Up1476,
            max_segments_accepted: MaxSegments::Unspecified,
            segmentation_supported: Segmentation::Both,
            send_retry_delay: Duration::from_millis(50),
            max_send_attempts: 5,
            idle_sleep: Duration::from_millis(5),
            queue_capacity: 1024,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout.is_zero() {
            bail!("timeout must be positive");
        }
        if self.retries == 0 {
            bail!("retries must be at least 1");
        }
        if self.segment_timeout.is_zero() {
            bail!("segment timeout must be positive");
        }
        if !(1..=127).contains(&self.segment_window) {
            bail!("segment window must be between 1 and 127, was {}", self.segment_window);
        }
        if self.send_retry_delay.is_zero() {
            bail!("send retry delay must be positive");
        }
        if self.max_send_attempts == 0 {
            bail!("max send attempts must be at least 1");
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be positive");
        }
        Ok(())
    }

    /// The timeout for assembling incoming segmented messages
    pub fn segment_assembly_timeout(&self) -> Duration {
        self.segment_timeout * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(TransportConfig::default().validate().is_ok());
        assert_eq!(TransportConfig::default().segment_assembly_timeout(), Duration::from_secs(20));
    }

    #[rstest]
    #[case::zero_timeout(|c: &mut TransportConfig| c.timeout = Duration::ZERO)]
    #[case::zero_retries(|c: &mut TransportConfig| c.retries = 0)]
    #[case::zero_segment_timeout(|c: &mut TransportConfig| c.segment_timeout = Duration::ZERO)]
    #[case::zero_window(|c: &mut TransportConfig| c.segment_window = 0)]
    #[case::window_too_big(|c: &mut TransportConfig| c.segment_window = 128)]
    #[case::zero_send_retry_delay(|c: &mut TransportConfig| c.send_retry_delay = Duration::ZERO)]
    #[case::zero_send_attempts(|c: &mut TransportConfig| c.max_send_attempts = 0)]
    #[case::zero_queue(|c: &mut TransportConfig| c.queue_capacity = 0)]
    fn test_invalid(#[case] modify: fn(&mut TransportConfig)) {
        let mut config = TransportConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
