//! Health probe types

use serde::{Deserialize, Serialize};

/// A post-deployment health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub name: Option<String>,
    pub url: String,

    /// Required status code; any 2xx passes when unset
    pub expect_status: Option<u16>,

    /// Substring the response body must contain
    pub contains: Option<String>,
}

impl ProbeSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: None,
            url: url.into(),
            expect_status: None,
            contains: None,
        }
    }

    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.url.clone())
    }

    /// Checks a status code against the expectation
    pub fn status_ok(&self, status: u16) -> bool {
        match self.expect_status {
            Some(expected) => status == expected,
            None => (200..300).contains(&status),
        }
    }
}

/// Outcome of one probe after all attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub probe: String,
    pub url: String,
    pub success: bool,
    pub status: Option<u16>,
    pub attempts: u32,
    pub detail: Option<String>,
}
