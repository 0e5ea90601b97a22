use crate::Device;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Label {
    pub device: String,
}

impl Label {
    pub fn new(device: Device) -> Self {
        Self {
            device: device.to_string(),
        }
    }
}

/// Counters exported for every device.
pub struct Metrics {
    rx_packets: Family<Label, Counter>,
    tx_packets: Family<Label, Counter>,
    rx_bytes: Family<Label, Counter>,
    tx_bytes: Family<Label, Counter>,
    rx_dropped: Family<Label, Counter>,
    tx_errors: Family<Label, Counter>,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            rx_packets: Family::default(),
            tx_packets: Family::default(),
            rx_bytes: Family::default(),
            tx_bytes: Family::default(),
            rx_dropped: Family::default(),
            tx_errors: Family::default(),
        };
        registry.register(
            "rx_packets",
            "Frames delivered to the upper layer",
            metrics.rx_packets.clone(),
        );
        registry.register(
            "tx_packets",
            "Transmissions completed",
            metrics.tx_packets.clone(),
        );
        registry.register(
            "rx_bytes",
            "Bytes delivered to the upper layer",
            metrics.rx_bytes.clone(),
        );
        registry.register(
            "tx_bytes",
            "Bytes of completed transmissions",
            metrics.tx_bytes.clone(),
        );
        registry.register(
            "rx_dropped",
            "Frames dropped because the receive pool was exhausted",
            metrics.rx_dropped.clone(),
        );
        registry.register(
            "tx_errors",
            "Transmissions recovered by the watchdog",
            metrics.tx_errors.clone(),
        );
        metrics
    }

    /// Resolve the counters of a single device.
    pub fn counters(&self, device: Device) -> Counters {
        let label = Label::new(device);
        Counters {
            rx_packets: self.rx_packets.get_or_create(&label).clone(),
            tx_packets: self.tx_packets.get_or_create(&label).clone(),
            rx_bytes: self.rx_bytes.get_or_create(&label).clone(),
            tx_bytes: self.tx_bytes.get_or_create(&label).clone(),
            rx_dropped: self.rx_dropped.get_or_create(&label).clone(),
            tx_errors: self.tx_errors.get_or_create(&label).clone(),
        }
    }
}

/// Exported counters of one device.
#[derive(Clone, Debug, Default)]
pub struct Counters {
    pub rx_packets: Counter,
    pub tx_packets: Counter,
    pub rx_bytes: Counter,
    pub tx_bytes: Counter,
    pub rx_dropped: Counter,
    pub tx_errors: Counter,
}
