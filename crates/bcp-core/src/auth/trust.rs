//! Trust staging and publication.
//!
//! A device nonce read during the signature exchange is staged privately.
//! It becomes visible only when a verdict is published, and only if that
//! verdict is a pass. Staging is emptied by every publication.

use tracing::{debug, info, warn};

use crate::properties::AuthProperties;
use crate::protocol::constants::NONCE_LEN;

/// What a single publication exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publication {
    pub passed: bool,
    pub nonce: Option<[u8; NONCE_LEN]>,
    pub timestamp: Option<i64>,
}

impl Publication {
    pub fn apply(&self, props: &mut AuthProperties) {
        props.auth_passed = Some(self.passed);
        props.nonce = self.nonce;
        if self.timestamp.is_some() {
            props.last_publication = self.timestamp;
        }
    }
}

#[derive(Debug, Default)]
pub struct TrustRecord {
    enabled: bool,
    staged: Option<[u8; NONCE_LEN]>,
}

impl TrustRecord {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            staged: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn stage(&mut self, nonce: [u8; NONCE_LEN]) {
        if !self.enabled {
            debug!("Trusted data path disabled, nonce not staged");
            return;
        }
        self.staged = Some(nonce);
    }

    pub fn has_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Record a verdict, consuming any staged nonce.
    pub fn publish(&mut self, passed: bool, now: i64) -> Option<Publication> {
        if !self.enabled {
            return None;
        }

        let publication = match (passed, self.staged.take()) {
            (true, Some(nonce)) => {
                info!("Auth passed, publishing trusted nonce");
                Publication {
                    passed: true,
                    nonce: Some(nonce),
                    timestamp: Some(now),
                }
            }
            (true, None) => {
                warn!("Auth passed without a staged nonce, publishing failure");
                Publication {
                    passed: false,
                    nonce: None,
                    timestamp: None,
                }
            }
            (false, _) => {
                warn!("Auth failed");
                Publication {
                    passed: false,
                    nonce: None,
                    timestamp: None,
                }
            }
        };
        Some(publication)
    }
}
