use rollcall_core::reference::{payload_records, FileReferenceSource, ReferenceError, ReferenceSource};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ReferenceLocation;

const EMBEDDINGS_PATH: &str = "/api/get_embeddings";

/// Roster served by the attendance web app.
pub struct HttpReferenceSource {
    url: String,
    agent: ureq::Agent,
}

impl HttpReferenceSource {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let url = format!("{}{EMBEDDINGS_PATH}", base_url.trim_end_matches('/'));
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { url, agent }
    }
}

impl ReferenceSource for HttpReferenceSource {
    fn fetch(&self) -> Result<Vec<Value>, ReferenceError> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .map_err(|e| ReferenceError::Fetch(format!("GET {}: {e}", self.url)))?;

        // Decode straight from the socket; a full roster easily exceeds the
        // size cap ureq puts on `into_string`.
        let document = response.into_json::<Value>().map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => ReferenceError::MalformedPayload(format!("{}: {e}", self.url)),
            _ => ReferenceError::Fetch(format!("reading body from {}: {e}", self.url)),
        })?;

        payload_records(document)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Build the configured source.
pub fn from_location(location: &ReferenceLocation, timeout: Duration) -> Arc<dyn ReferenceSource> {
    match location {
        ReferenceLocation::Http(base) => Arc::new(HttpReferenceSource::new(base, timeout)),
        ReferenceLocation::File(path) => Arc::new(FileReferenceSource::new(path)),
    }
}
