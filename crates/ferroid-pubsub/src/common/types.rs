use core::fmt;
use ferroid::id::ULID;

/// Correlation key linking a request to its response(s).
pub const ATTR_JOB_ID: &str = "job_id";

/// Identity of the client instance that submitted the job. Responses are
/// routed back by filtering on this attribute.
pub const ATTR_HOST_ID: &str = "host_id";

/// Present with [`RESPONSE_TYPE_STREAM`] when the caller expects a stream.
pub const ATTR_RESPONSE_TYPE: &str = "response-type";

/// Position of a streamed chunk (decimal, starting at 0).
pub const ATTR_MESSAGE_ORDER: &str = "message_order";

/// Host identity of the server that produced a streamed chunk.
pub const ATTR_SENDER: &str = "sender";

/// End-of-stream marker attribute.
pub const ATTR_EOS: &str = "eos";

/// The only supported `response-type` value.
pub const RESPONSE_TYPE_STREAM: &str = "stream";

/// The only supported `eos` value.
pub const EOS_MARKER: &str = "eos";

/// Process-unique identity of an RPC endpoint.
///
/// Generated once per endpoint as a ULID and rendered in Crockford base32, so
/// two endpoints started in the same millisecond still differ in their random
/// component.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostId(String);

impl HostId {
    pub fn generate() -> Self {
        Self(ULID::now().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for HostId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Generates a fresh job id for callers that do not supply one.
pub fn new_job_id() -> String {
    ULID::now().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_ids_are_unique() {
        let a = HostId::generate();
        let b = HostId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 26);
    }

    #[test]
    fn job_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| new_job_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
