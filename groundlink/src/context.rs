//! Ambient request context.
//!
//! Services thread a small value-typed carrier through their boundaries
//! instead of relying on task-local state. The carrier identifies the
//! device, the client build, and the emitting service; consumers are the
//! HTTP client (header injection), the event constructor (correlation
//! fields), and tracing spans (attribute enrichment).

/// Outbound header carrying the client version.
pub const CLIENT_VERSION_HEADER: &str = "x-client-version";

/// Outbound header carrying the device id.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Correlation values carried across service boundaries.
///
/// All values are plain strings; an unset value is the empty string and is
/// skipped by every consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    service: String,
    client_version: String,
    device_id: String,
}

impl RequestContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name of the service issuing requests.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Sets the version of the embedding client binary.
    pub fn with_client_version(mut self, client_version: impl Into<String>) -> Self {
        self.client_version = client_version.into();
        self
    }

    /// Sets the stable device identifier.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context_has_empty_values() {
        let ctx = RequestContext::new();
        assert_eq!(ctx.service(), "");
        assert_eq!(ctx.client_version(), "");
        assert_eq!(ctx.device_id(), "");
    }

    #[test]
    fn builder_sets_all_fields() {
        let ctx = RequestContext::new()
            .with_service("UpdateService")
            .with_client_version("1.0.0")
            .with_device_id("device-42");

        assert_eq!(ctx.service(), "UpdateService");
        assert_eq!(ctx.client_version(), "1.0.0");
        assert_eq!(ctx.device_id(), "device-42");
    }
}
