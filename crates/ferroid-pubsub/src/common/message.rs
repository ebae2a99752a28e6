use bytes::Bytes;
use std::collections::HashMap;

/// An outbound (or inbound) pub/sub message: an opaque payload plus string
/// attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub data: Bytes,
    pub attributes: HashMap<String, String>,
}

impl Message {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            attributes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Copies every attribute of `other` onto this message. Values from
    /// `other` overwrite existing keys.
    pub fn merge_attributes(&mut self, other: &HashMap<String, String>) {
        self.attributes
            .extend(other.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// A message delivered by a subscription pull.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Handle used to ack or nack this particular delivery.
    pub ack_id: String,
    /// Broker-assigned id, stable across redeliveries.
    pub message_id: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_attempt: u32,
    pub message: Message,
}

impl ReceivedMessage {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.message.attribute(key)
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.message.attributes
    }

    pub fn data(&self) -> &Bytes {
        &self.message.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overwrites_existing_keys() {
        let mut response = Message::new("out")
            .with_attribute("job_id", "stale")
            .with_attribute("extra", "kept");
        let inbound = Message::new("in")
            .with_attribute("job_id", "j1")
            .with_attribute("host_id", "h1");

        response.merge_attributes(&inbound.attributes);

        assert_eq!(response.attribute("job_id"), Some("j1"));
        assert_eq!(response.attribute("host_id"), Some("h1"));
        assert_eq!(response.attribute("extra"), Some("kept"));
        assert_eq!(response.data, Bytes::from_static(b"out"));
    }
}
