//! Shared User-Agent string for every outbound HTTP request.
//!
//! Listing APIs throttle or reject generic agents, so the harvester always
//! identifies itself with its name, version, and project URL.

const PROJECT_UA_URL: &str = "https://github.com/fierce/media-harvester";

/// Default User-Agent for listing, provider, and payload requests.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("media-harvester/{version} (archival-tool; +{PROJECT_UA_URL})")
}
