use mqbridge_models::core::MessageStatus;

/// One delivery as returned by a driver, before the envelope is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    pub body: Vec<u8>,
    pub status: MessageStatus,
    pub delivery_tag: String,
    /// The backend already considers this delivery complete.
    pub settled: bool,
}

impl RawDelivery {
    pub fn in_flight(body: Vec<u8>, delivery_tag: impl Into<String>) -> Self {
        Self {
            body,
            status: MessageStatus::InFlight,
            delivery_tag: delivery_tag.into(),
            settled: false,
        }
    }

    pub fn mark_settled(mut self) -> Self {
        self.settled = true;
        self
    }
}
