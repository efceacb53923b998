use constant_time_eq::constant_time_eq;

use crate::error::DocSweepError;

use super::protocol::{RegisterFrame, RelayRole};

/// Validates registration frames against one static shared secret per connection class
#[derive(Clone)]
pub struct TokenAuthenticator {
    agent_token: String,
    controller_token: String,
}

impl std::fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthenticator").finish_non_exhaustive()
    }
}

impl TokenAuthenticator {
    pub fn new(agent_token: impl Into<String>, controller_token: impl Into<String>) -> Self {
        TokenAuthenticator {
            agent_token: agent_token.into(),
            controller_token: controller_token.into(),
        }
    }

    /// Decide who is connecting. Any error means the socket gets closed.
    pub fn authenticate(&self, frame: &RegisterFrame) -> Result<RelayRole, DocSweepError> {
        let token = frame
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DocSweepError::Authentication("missing token".to_string()))?;

        match frame.client_type.as_str() {
            "agent" => {
                if !token_matches(&self.agent_token, token) {
                    return Err(DocSweepError::Authentication(
                        "invalid agent token".to_string(),
                    ));
                }
                let hostname = frame
                    .hostname
                    .as_deref()
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| {
                        DocSweepError::Authentication("agent registration without hostname".to_string())
                    })?;
                Ok(RelayRole::Agent {
                    hostname: hostname.to_string(),
                })
            }
            "controller" => {
                if !token_matches(&self.controller_token, token) {
                    return Err(DocSweepError::Authentication(
                        "invalid controller token".to_string(),
                    ));
                }
                Ok(RelayRole::Controller)
            }
            other => Err(DocSweepError::Authentication(format!(
                "unknown client_type '{}'",
                other
            ))),
        }
    }
}

/// Constant-time comparison. An empty expected token never matches.
fn token_matches(expected: &str, presented: &str) -> bool {
    !expected.is_empty() && constant_time_eq(expected.as_bytes(), presented.as_bytes())
}
